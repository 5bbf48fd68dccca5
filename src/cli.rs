use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Mode {
    /// Probe the backend and report connection state
    Check,
    Single,
    All,
    Range,
    /// Print rows of a content table as JSON
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Table {
    News,
    Resources,
    Gallery,
    Services,
}

#[derive(Parser, Debug)]
#[command(name = "portal-dl")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Mode
    #[arg(short, long, value_enum, default_value = "check")]
    pub mode: Mode,

    /// Backend service URL
    #[arg(long, env = "SUPABASE_URL", hide_env_values = true)]
    pub service_url: Option<String>,

    /// Backend public (anon) key
    #[arg(long, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    pub service_key: Option<String>,

    /// URL to download (single mode)
    #[arg(short, long)]
    pub url: Option<String>,

    /// Output file name (single mode)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Alternate URL tried when the primary one fails
    #[arg(long)]
    pub fallback: Option<String>,

    /// Buffer the file in memory for measured progress
    #[arg(long)]
    pub blob: bool,

    /// Resource id to record a download event for (single mode)
    #[arg(long)]
    pub resource_id: Option<String>,

    /// Link file path (default: links.txt)
    #[arg(short, long)]
    pub link_file: Option<String>,

    /// Output directory
    #[arg(short, long, default_value = "./downloads")]
    pub output: String,

    /// Start index for range download (inclusive)
    #[arg(long, requires = "end")]
    pub start: Option<usize>,

    /// End index for range download (inclusive)
    #[arg(long, requires = "start")]
    pub end: Option<usize>,

    /// Content table (list mode)
    #[arg(short, long, value_enum, default_value = "news")]
    pub table: Table,

    /// HTTP proxy (e.g., http://127.0.0.1:7890)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Fallback attempts after the primary URL fails
    #[arg(short, long, default_value = "1")]
    pub retries: u32,

    /// Offer to open failed downloads in the system browser
    #[arg(long)]
    pub open_on_failure: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}
