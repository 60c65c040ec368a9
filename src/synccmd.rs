//! External sync-command launcher.
//!
//! When the daemon is started with a sync-command path, file changes are not
//! POSTed to the server; instead the external command (`cwctl project sync`)
//! is invoked and left to detect and communicate the changes itself. This
//! module guarantees that at most one instance of the command runs per
//! project at a time, and that a burst of pokes while one is running queues
//! exactly one follow-up run.
//!
//! For automated testing, the `MOCK_CWCTL_INSTALLER_PATH` environment
//! variable substitutes a mock command invoked as a runnable JAR.

use crate::error::{WatcherError, WatcherResult};
use crate::models::now_millis;
use std::path::Path;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info};

const MOCK_INSTALLER_ENV: &str = "MOCK_CWCTL_INSTALLER_PATH";

enum SyncCmdMsg {
    /// A batch of file changes was flushed; the command should run (again).
    FileChange,
    /// A previously spawned command finished.
    RunComplete(RunOutcome),
}

struct RunOutcome {
    exit_code: i32,
    output: String,
    /// ms timestamp taken immediately before the process was spawned
    spawn_time: i64,
}

/// Handle to one project's sync-command launcher.
#[derive(Clone)]
pub struct SyncCommandState {
    tx: mpsc::Sender<SyncCmdMsg>,
    project_path: String,
}

impl SyncCommandState {
    pub fn new(
        project_id: String,
        installer_path: String,
        project_path: String,
    ) -> WatcherResult<Self> {
        if installer_path.is_empty() {
            return Err(WatcherError::SyncCommand(
                "Installer path is empty".to_string(),
            ));
        }

        let mock_installer_path = std::env::var(MOCK_INSTALLER_ENV)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(read_channel(
            project_id,
            installer_path,
            project_path.clone(),
            mock_installer_path,
            rx,
            tx.clone(),
        ));

        Ok(Self { tx, project_path })
    }

    /// Coalesced "something changed" poke from the batch engine.
    pub async fn on_file_change_event(&self) {
        if self.project_path.trim().is_empty() {
            error!("Project path passed to sync command state is empty, ignoring file change event");
            return;
        }
        let _ = self.tx.send(SyncCmdMsg::FileChange).await;
    }
}

/// Serialize command runs: one in flight, at most one queued behind it.
async fn read_channel(
    project_id: String,
    installer_path: String,
    project_path: String,
    mock_installer_path: String,
    mut rx: mpsc::Receiver<SyncCmdMsg>,
    tx: mpsc::Sender<SyncCmdMsg>,
) {
    let mut process_waiting = false;
    let mut process_active = false;
    let mut last_timestamp: i64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            SyncCmdMsg::RunComplete(outcome) => {
                process_active = false;

                if outcome.exit_code == 0 {
                    // The next run reports changes since this run STARTED, so
                    // nothing that happened mid-run is skipped.
                    last_timestamp = outcome.spawn_time;
                    info!("Updating timestamp to latest: {}", last_timestamp);
                } else {
                    error!("Non-zero error code from sync command: {}", outcome.output);
                }
            }
            SyncCmdMsg::FileChange => {
                process_waiting = true;
            }
        }

        if !process_active && process_waiting {
            process_waiting = false;
            process_active = true;

            tokio::spawn(run_project_command(
                project_id.clone(),
                installer_path.clone(),
                project_path.clone(),
                mock_installer_path.clone(),
                last_timestamp,
                tx.clone(),
            ));
        }
    }
}

async fn run_project_command(
    project_id: String,
    installer_path: String,
    project_path: String,
    mock_installer_path: String,
    last_timestamp: i64,
    tx: mpsc::Sender<SyncCmdMsg>,
) {
    let adjusted_timestamp_ms = now_millis() - last_timestamp;
    let timestamp_arg = adjusted_timestamp_ms.to_string();

    let (program, args, current_install_path) = if mock_installer_path.is_empty() {
        // cwctl project sync -p <path> -i <id> -t <ms-since-last-success>
        (
            installer_path.clone(),
            vec![
                "project",
                "sync",
                "-p",
                project_path.as_str(),
                "-i",
                project_id.as_str(),
                "-t",
                timestamp_arg.as_str(),
            ],
            installer_path.clone(),
        )
    } else {
        (
            "java".to_string(),
            vec![
                "-jar",
                mock_installer_path.as_str(),
                "-p",
                project_path.as_str(),
                "-i",
                project_id.as_str(),
                "-t",
                timestamp_arg.as_str(),
            ],
            mock_installer_path.clone(),
        )
    };

    let debug_str = args
        .iter()
        .map(|a| format!("[ {}] ", a))
        .collect::<String>();
    info!(
        "Calling project sync command with: [{}] {{ {}}}",
        project_id, debug_str
    );

    let installer_pwd = Path::new(&current_install_path)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| Path::new(".").to_path_buf());

    let spawn_time = now_millis();

    let output = Command::new(&program)
        .args(&args)
        .current_dir(&installer_pwd)
        .output()
        .await;

    info!(
        "Sync command call completed, elapsed time: {}",
        now_millis() - spawn_time
    );

    let outcome = match output {
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));

            let exit_code = output.status.code().unwrap_or(-1);

            if exit_code == 0 {
                info!("Successfully ran sync command: {}", debug_str);
            } else {
                error!("Error running 'project sync' command: {}", debug_str);
                error!("Out: {}", combined);
            }

            RunOutcome {
                exit_code,
                output: combined,
                spawn_time,
            }
        }
        Err(e) => {
            error!("Unable to spawn sync command '{}': {}", program, e);
            RunOutcome {
                exit_code: -1,
                output: e.to_string(),
                spawn_time,
            }
        }
    };

    let _ = tx.send(SyncCmdMsg::RunComplete(outcome)).await;
}
