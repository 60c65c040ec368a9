//! Periodic dump of the daemon's internal state.
//!
//! Runs infrequently; the goal is to surface issues that only show up after
//! the daemon has been up for a long time (watchers that were never closed,
//! queues that keep growing).

use crate::queue::HttpPostOutputQueue;
use crate::registry::ProjectRegistry;
use crate::watch::WatchService;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

const DUMP_INTERVAL_SECS: u64 = 30 * 60;

pub struct DebugTimer {
    watch_service: WatchService,
    registry: ProjectRegistry,
    post_queue: HttpPostOutputQueue,
}

impl DebugTimer {
    pub fn new(
        watch_service: WatchService,
        registry: ProjectRegistry,
        post_queue: HttpPostOutputQueue,
    ) -> Self {
        Self {
            watch_service,
            registry,
            post_queue,
        }
    }

    pub fn start(self) {
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(DUMP_INTERVAL_SECS)).await;
                self.output_debug().await;
            }
        });
    }

    async fn output_debug(&self) {
        let mut result = String::new();
        result.push_str(
            "---------------------------------------------------------------------------------------\n\n",
        );

        result.push_str(&format!(
            "WatchService:\n{}\n\n",
            self.watch_service.request_debug_message().await.trim()
        ));

        result.push_str(&format!(
            "Project List:\n{}\n\n",
            self.registry.request_debug_message().await.trim()
        ));

        result.push_str(&format!(
            "HTTP POST output queue:\n{}\n\n",
            self.post_queue.request_debug_message().await.trim()
        ));

        result.push_str(
            "---------------------------------------------------------------------------------------\n",
        );

        for line in result.lines() {
            info!("[status] {}", line);
        }
    }
}
