//! Station status shared with observers.
//!
//! The orchestrator is the only writer. Observers (the console, a status
//! display) subscribe through a `tokio::sync::watch` receiver and only read.
//! The [`InactivityMonitor`] flags `needs_operator` when nobody has touched
//! the station for a while; it never interrupts a measurement.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Snapshot of what the station is doing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StationStatus {
    /// Current step, e.g. `"Linearity"` or `"Soak"`.
    pub stage: String,
    pub axis: Option<usize>,
    pub cycle: Option<usize>,
    pub temp_index: Option<usize>,
    pub needs_operator: bool,
}

/// Writer side of the station status.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    sender: Arc<watch::Sender<StationStatus>>,
    last_interaction: Arc<Mutex<Instant>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(StationStatus::default());
        Self {
            sender: Arc::new(sender),
            last_interaction: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StationStatus> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> StationStatus {
        self.sender.borrow().clone()
    }

    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        self.sender.send_modify(|status| status.stage = stage);
    }

    pub fn set_position(&self, axis: usize, cycle: usize, temp_index: usize) {
        self.sender.send_modify(|status| {
            status.axis = Some(axis);
            status.cycle = Some(cycle);
            status.temp_index = Some(temp_index);
        });
    }

    /// Records operator interaction and clears `needs_operator`.
    pub fn touch(&self) {
        *self
            .last_interaction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
        self.sender.send_if_modified(|status| {
            let was_flagged = status.needs_operator;
            status.needs_operator = false;
            was_flagged
        });
    }

    fn idle_for(&self) -> Duration {
        self.last_interaction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

/// Background task raising `needs_operator` after `limit` without
/// interaction. Stops when dropped.
pub struct InactivityMonitor {
    handle: JoinHandle<()>,
}

impl InactivityMonitor {
    pub fn spawn(board: StatusBoard, limit: Duration, check_every: Duration) -> Self {
        let check_every = check_every.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            info!("Inactivity monitor armed at {:?}", limit);
            loop {
                sleep(check_every).await;
                if board.idle_for() < limit {
                    continue;
                }
                let raised = board.sender.send_if_modified(|status| {
                    if status.needs_operator {
                        false
                    } else {
                        status.needs_operator = true;
                        true
                    }
                });
                if raised {
                    warn!("No operator interaction for {:?}, station needs operator", limit);
                }
            }
        });
        Self { handle }
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_observers_see_updates() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        board.set_stage("Linearity");
        board.set_position(1, 0, 2);
        rx.changed().await.unwrap();
        let status = rx.borrow().clone();
        assert_eq!(status.stage, "Linearity");
        assert_eq!(status.axis, Some(1));
        assert_eq!(status.temp_index, Some(2));
    }

    #[tokio::test]
    async fn test_inactivity_flags_then_touch_clears() {
        let board = StatusBoard::new();
        let _monitor =
            InactivityMonitor::spawn(board.clone(), Duration::from_millis(10), Duration::from_millis(2));
        let mut rx = board.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.needs_operator))
            .await
            .unwrap()
            .unwrap();
        board.touch();
        assert!(!board.current().needs_operator);
    }
}
