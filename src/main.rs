mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{Args, Mode, Table};
use indicatif::{ProgressBar, ProgressStyle};
use portal_dl::models::{
    GalleryImage, LinkEntry, NewsArticle, Record, ResourceDocument, ServiceEntry,
};
use portal_dl::{
    AnalyticsSink, ConnectionMonitor, Database, DatabaseAnalytics, DatabaseConfig, DownloadConfig,
    DownloadOptions, DownloadRequest, DownloadTracker, Downloader, ExternalFallback, LogAnalytics,
    MonitorConfig, PortalError, ResourceRef, RestBackend, ServiceConfig, report_error,
};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

fn init_logging(verbose: bool) {
    let default = if verbose {
        "debug,reqwest=info,hyper=info"
    } else {
        "info,reqwest=warn,hyper=warn"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Asks on the terminal, then hands the URL to the system opener.
struct TerminalFallback;

impl ExternalFallback for TerminalFallback {
    fn confirm_open(&self, url: &str, error: &str) -> bool {
        eprint!("Download failed ({}). Open {} in your browser instead? [y/N] ", error, url);
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }

    fn open(&self, url: &str) -> std::io::Result<()> {
        let status = if cfg!(target_os = "windows") {
            Command::new("cmd").args(["/C", "start", "", url]).status()?
        } else if cfg!(target_os = "macos") {
            Command::new("open").arg(url).status()?
        } else {
            Command::new("xdg-open").arg(url).status()?
        };
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("opener exited with {}", status)))
        }
    }
}

fn parse_link_file(path: &str) -> Result<Vec<LinkEntry>> {
    let file = File::open(path).context("Failed to open link file")?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read line")?;

        if idx == 0 && line.starts_with("file_name") {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() >= 2 {
            entries.push(LinkEntry {
                file_name: parts[0].trim().to_string(),
                url: parts[1].trim().to_string(),
            });
        }
    }

    Ok(entries)
}

/// Placeholder or missing settings come back as a `Config` error.
fn connect(args: &Args) -> Result<Database<RestBackend>, PortalError> {
    let config = ServiceConfig::new(args.service_url.as_deref(), args.service_key.as_deref())?;
    let backend = Arc::new(RestBackend::new(config, BACKEND_TIMEOUT)?);
    let monitor = ConnectionMonitor::new(backend, MonitorConfig::default());
    Ok(Database::new(monitor, DatabaseConfig::default()))
}

fn build_downloader(args: &Args) -> Result<Downloader> {
    let config = DownloadConfig {
        proxy: args.proxy.clone(),
        retries: args.retries,
        ..Default::default()
    };
    let downloader = Downloader::new(Path::new(&args.output), config)
        .context("Failed to set up downloader")?;

    Ok(if args.open_on_failure {
        downloader.with_fallback(Arc::new(TerminalFallback))
    } else {
        downloader
    })
}

fn percent_bar(message: String) -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:30} {bar:40} {pos:>3}%")?
            .progress_chars("=>-"),
    );
    pb.set_message(message);
    Ok(pb)
}

async fn run_check(args: &Args) -> Result<()> {
    let db = match connect(args) {
        Ok(db) => db,
        Err(e) => {
            let notice = report_error("Backend unavailable", &e);
            println!("Offline mode: {}", notice.message);
            return Ok(());
        }
    };

    let connected = db.monitor().init().await;
    let state = db.monitor().state();
    db.monitor().dispose();

    if connected {
        println!("Connected to backend");
        Ok(())
    } else {
        let error = state.last_error.unwrap_or_default();
        Err(anyhow!("Backend unreachable: {}", error))
    }
}

async fn download_tracked<A: AnalyticsSink>(
    args: &Args,
    url: &str,
    downloader: Downloader,
    analytics: Arc<A>,
) -> Result<()> {
    let config = downloader.config().clone();
    let tracker = DownloadTracker::new(
        Arc::new(downloader),
        analytics,
        config.success_clear_after,
        config.error_clear_after,
    );

    let options = DownloadOptions {
        filename: args.name.clone(),
        fallback_url: args.fallback.clone(),
        retries: Some(args.retries),
        use_blob: args.blob,
    };
    let filename = Downloader::resolve_filename(url, options.filename.as_deref());
    let resource = args.resource_id.clone().map(|id| ResourceRef {
        id,
        title: filename.clone(),
    });

    let pb = percent_bar(filename)?;
    let mut rx = tracker.subscribe();
    let watcher = {
        let pb = pb.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let progress = rx.borrow_and_update().progress;
                pb.set_position(progress as u64);
            }
        })
    };

    let outcome = tracker.download(url, &options, resource).await;
    watcher.abort();

    if outcome.success {
        pb.finish_with_message("Done");
        println!(
            "Saved {} ({} bytes)",
            outcome.filename.unwrap_or_default(),
            outcome.size.unwrap_or_default()
        );
        Ok(())
    } else if outcome.opened_externally {
        pb.abandon_with_message("Opened in browser");
        Ok(())
    } else {
        pb.abandon_with_message("Failed");
        Err(anyhow!(
            "Download failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}

async fn run_single(args: &Args) -> Result<()> {
    let url = args
        .url
        .clone()
        .ok_or_else(|| anyhow!("--url argument required for single mode"))?;
    let downloader = build_downloader(args)?;

    if args.resource_id.is_some() {
        match connect(args) {
            Ok(db) => {
                let analytics = Arc::new(DatabaseAnalytics::new(db.clone()));
                let result = download_tracked(args, &url, downloader, analytics).await;
                db.monitor().dispose();
                return result;
            }
            Err(e) => {
                warn!("Download events will only be logged: {}", e);
            }
        }
    }

    download_tracked(args, &url, downloader, Arc::new(LogAnalytics)).await
}

async fn run_batch(args: &Args) -> Result<()> {
    let link_file = args
        .link_file
        .clone()
        .unwrap_or_else(|| "links.txt".to_string());

    if !Path::new(&link_file).exists() {
        return Err(anyhow!("Link file not found: {}", link_file));
    }

    let mut entries = parse_link_file(&link_file)?;

    if entries.is_empty() {
        return Err(anyhow!("No entries found in link file"));
    }

    entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    println!("Loaded {} entries from {}", entries.len(), link_file);

    if let Mode::Range = args.mode {
        let start = args
            .start
            .ok_or_else(|| anyhow!("--start argument required for range mode"))?;
        let end = args
            .end
            .ok_or_else(|| anyhow!("--end argument required for range mode"))?;
        if start >= entries.len() || end >= entries.len() || start > end {
            return Err(anyhow!(
                "Invalid range: start={}, end={}, total={}",
                start,
                end,
                entries.len()
            ));
        }
        entries = entries[start..=end].to_vec();
        println!(
            "Downloading files from index {} to {} ({} files)",
            start,
            end,
            entries.len()
        );
    }

    let downloader = build_downloader(args)?;
    let requests: Vec<DownloadRequest> = entries.into_iter().map(DownloadRequest::from).collect();

    let overall = ProgressBar::new(requests.len() as u64);
    overall.set_style(
        ProgressStyle::default_bar()
            .template("{msg} {bar:40} {pos}/{len}")?
            .progress_chars("=>-"),
    );
    overall.set_message("Overall");

    let result = downloader
        .download_multiple(&requests, |done, _total| overall.set_position(done as u64))
        .await;
    overall.finish_with_message("Complete");

    for (request, outcome) in requests.iter().zip(&result.outcomes) {
        if let Some(error) = &outcome.error {
            println!("  {} -> {}", request.url, error);
        }
    }
    println!(
        "\nDone: {} success, {} failed",
        result.succeeded(),
        result.failed()
    );

    if result.failed() > 0 {
        return Err(anyhow!("{} downloads failed", result.failed()));
    }
    Ok(())
}

async fn print_rows<R: Record>(db: &Database<RestBackend>) -> Result<()> {
    let rows = match db.list::<R>().await {
        Ok(rows) => rows,
        Err(e) => {
            let notice = report_error(&format!("Failed to load {}", R::TABLE), &e);
            return Err(anyhow!("{}: {}", notice.title, e));
        }
    };
    info!("Loaded {} rows from {}", rows.len(), R::TABLE);
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn run_list(args: &Args) -> Result<()> {
    let db = connect(args).map_err(|e| {
        let notice = report_error("Backend unavailable", &e);
        anyhow!("{}: {}", notice.title, e)
    })?;

    let result = match args.table {
        Table::News => print_rows::<NewsArticle>(&db).await,
        Table::Resources => print_rows::<ResourceDocument>(&db).await,
        Table::Gallery => print_rows::<GalleryImage>(&db).await,
        Table::Services => print_rows::<ServiceEntry>(&db).await,
    };
    db.monitor().dispose();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.mode {
        Mode::Check => run_check(&args).await,
        Mode::Single => run_single(&args).await,
        Mode::All | Mode::Range => run_batch(&args).await,
        Mode::List => run_list(&args).await,
    }
}
