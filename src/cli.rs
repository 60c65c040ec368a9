use clap::Parser;

/// CLI arguments for the watcher daemon
#[derive(Parser, Debug)]
#[command(name = "syncwatchd")]
#[command(about = "File-watcher daemon that reports project changes to a sync control plane", long_about = None)]
pub struct Args {
    /// Base URL of the control plane server
    #[arg(value_name = "URL", default_value = "http://localhost:9090")]
    pub server_url: String,

    /// Path to the external sync command; when absent, changes are delivered
    /// over HTTP POST instead
    #[arg(value_name = "SYNC_COMMAND")]
    pub sync_command_path: Option<String>,
}
