//! Backend reachability tracking.
//!
//! A `ConnectionMonitor` owns the connection state for the lifetime of the
//! application (`init` on start, `dispose` on teardown). Probe failures never
//! propagate; they become state transitions, events and scheduled retries.

use crate::backend::Backend;
use crate::config::MonitorConfig;
use crate::error::PortalError;
use crate::models::{ConnectionEvent, ConnectionState};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 32;

type ProbeFuture = Shared<BoxFuture<'static, bool>>;

/// Delay before the retry with zero-based index `attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

struct Inner<B> {
    backend: Arc<B>,
    config: MonitorConfig,
    state: Mutex<ConnectionState>,
    /// Current probe, tagged so a superseded probe cannot clear its successor.
    in_flight: Mutex<Option<(u64, ProbeFuture)>>,
    probe_seq: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
    disposed: AtomicBool,
}

pub struct ConnectionMonitor<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for ConnectionMonitor<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> ConnectionMonitor<B> {
    pub fn new(backend: Arc<B>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                state: Mutex::new(ConnectionState::default()),
                in_flight: Mutex::new(None),
                probe_seq: AtomicU64::new(0),
                reconnect_task: Mutex::new(None),
                health_task: Mutex::new(None),
                events,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Run the first probe. Must be called inside a tokio runtime.
    pub async fn init(&self) -> bool {
        self.inner.disposed.store(false, Ordering::SeqCst);
        self.test_connection().await
    }

    /// Stop all timers. In-flight probes finish but schedule nothing further.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        self.stop_health_monitor();
        self.inner.in_flight.lock().unwrap().take();
        debug!("Connection monitor disposed");
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().is_connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner
            .reconnect_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Probe the backend. Concurrent callers share one in-flight probe.
    pub async fn test_connection(&self) -> bool {
        let probe = {
            let mut slot = self.inner.in_flight.lock().unwrap();
            match slot.as_ref() {
                Some((_, existing)) => existing.clone(),
                None => {
                    let id = self.inner.probe_seq.fetch_add(1, Ordering::SeqCst);
                    let this = self.clone();
                    let fut = async move { this.run_probe(id).await }.boxed().shared();
                    *slot = Some((id, fut.clone()));
                    fut
                }
            }
        };
        probe.await
    }

    /// Cancel any pending retry, reset the attempt counter and probe now.
    pub async fn force_reconnect(&self) -> bool {
        info!("Manual reconnect requested");
        self.cancel_reconnect();
        self.inner.state.lock().unwrap().consecutive_failures = 0;
        self.test_connection().await
    }

    pub async fn notify_network_online(&self) -> bool {
        info!("Network back online, reconnecting");
        self.force_reconnect().await
    }

    pub async fn notify_visibility_regained(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        debug!("Visibility regained while disconnected, reconnecting");
        self.force_reconnect().await
    }

    /// The platform reports no network: mark disconnected without probing.
    pub fn notify_network_offline(&self) {
        self.cancel_reconnect();
        self.stop_health_monitor();
        let was_connected = {
            let mut state = self.inner.state.lock().unwrap();
            let was = state.is_connected;
            state.is_connected = false;
            state.last_error = Some("Network offline".to_string());
            was
        };
        if was_connected {
            warn!("Network went offline");
            let _ = self.inner.events.send(ConnectionEvent::Disconnected {
                error: "Network offline".to_string(),
            });
        }
    }

    async fn run_probe(&self, id: u64) -> bool {
        let cfg = &self.inner.config;
        let probe = self.inner.backend.probe(&cfg.probe_table);
        let result = match timeout(cfg.probe_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(PortalError::Timeout(cfg.probe_timeout.as_millis() as u64)),
        };

        let connected = match result {
            Ok(()) => {
                self.on_success();
                true
            }
            Err(e) => {
                self.on_failure(e);
                false
            }
        };

        let mut slot = self.inner.in_flight.lock().unwrap();
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            slot.take();
        }
        connected
    }

    fn on_success(&self) {
        let was_connected = {
            let mut state = self.inner.state.lock().unwrap();
            let was = state.is_connected;
            state.is_connected = true;
            state.consecutive_failures = 0;
            state.last_error = None;
            state.last_check = Some(Instant::now());
            was
        };

        self.cancel_reconnect();
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.start_health_monitor();

        if !was_connected {
            info!("Backend connection established");
            let _ = self.inner.events.send(ConnectionEvent::Connected);
        } else {
            debug!("Health check passed");
        }
    }

    fn on_failure(&self, err: PortalError) {
        let (was_connected, failures) = {
            let mut state = self.inner.state.lock().unwrap();
            let was = state.is_connected;
            state.is_connected = false;
            state.consecutive_failures += 1;
            state.last_error = Some(err.to_string());
            state.last_check = Some(Instant::now());
            (was, state.consecutive_failures)
        };

        self.stop_health_monitor();
        warn!(failures, "Backend probe failed: {}", err);

        if was_connected || failures == 1 {
            let _ = self.inner.events.send(ConnectionEvent::Disconnected {
                error: err.to_string(),
            });
        }

        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        if !err.is_transient() {
            warn!("Not retrying automatically: {}", err);
            return;
        }
        self.schedule_reconnect(failures);
    }

    fn schedule_reconnect(&self, failures: u32) {
        let max_retries = self.inner.config.max_retries;
        if failures >= max_retries {
            warn!(
                "Giving up after {} consecutive failures, waiting for manual reconnect",
                failures
            );
            self.cancel_reconnect();
            let _ = self.inner.events.send(ConnectionEvent::GaveUp { failures });
            return;
        }

        let attempt = failures.saturating_sub(1);
        let delay = backoff_delay(self.inner.config.reconnect_base_delay, attempt);
        info!(
            "Reconnect attempt {}/{} in {}ms",
            attempt + 1,
            max_retries,
            delay.as_millis()
        );

        let this = self.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            // Past this point the attempt is a plain in-flight probe.
            this.inner.reconnect_task.lock().unwrap().take();
            this.test_connection().await;
        });

        let previous = self.inner.reconnect_task.lock().unwrap().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = self.inner.reconnect_task.lock().unwrap().take() {
            handle.abort();
            debug!("Cancelled pending reconnect");
        }
    }

    fn start_health_monitor(&self) {
        let mut slot = self.inner.health_task.lock().unwrap();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = self.clone();
        let period = self.inner.config.health_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !this.test_connection().await {
                    break;
                }
            }
        }));
    }

    fn stop_health_monitor(&self) {
        if let Some(handle) = self.inner.health_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
