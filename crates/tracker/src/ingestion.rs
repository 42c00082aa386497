use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, warn};
use timeline::TimeInterval;
use tokio::sync::mpsc;

use crate::group::lock;
use crate::process_monitor::ProcessEvent;
use crate::redraw::RedrawSignal;
use crate::registry::Registry;

/// What happened to one exit notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Interval appended to the named group
    Recorded { group: String },
    /// The process was never registered, or no group claims it anymore
    Untracked,
    /// Shutdown had begun; nothing was written
    Cancelled,
    /// The notification carried an end before its start
    Rejected,
}

/// Entry point for process lifetime notifications.
///
/// Exit handlers run under the quitting lock, so once [`begin_shutdown`]
/// returns no handler is writing into a group and none will start writing.
///
/// [`begin_shutdown`]: IngestionPort::begin_shutdown
pub struct IngestionPort {
    registry: Arc<Registry>,
    redraw: Arc<RedrawSignal>,
    quitting: Mutex<bool>,
    // pid -> executable name registered at start
    tracked: Mutex<HashMap<u32, String>>,
}

impl IngestionPort {
    pub fn new(registry: Arc<Registry>, redraw: Arc<RedrawSignal>) -> Self {
        Self {
            registry,
            redraw,
            quitting: Mutex::new(false),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an exit wait for `pid` if some group claims `name`.
    ///
    /// Returns whether the process is now tracked.
    pub fn on_process_start(&self, pid: u32, name: &str) -> bool {
        let quitting = lock(&self.quitting);
        if *quitting {
            return false;
        }
        if self.registry.lookup_by_process(name).is_none() {
            return false;
        }
        debug!("Tracking process {} ({})", pid, name);
        lock(&self.tracked).insert(pid, name.to_string());
        true
    }

    /// Records `[start_tick, end_tick]` for the group tracking `pid`.
    ///
    /// The registration for `pid` is always released, including when shutdown
    /// has begun.
    pub fn on_process_exit(&self, pid: u32, start_tick: u64, end_tick: u64) -> ExitOutcome {
        let quitting = lock(&self.quitting);
        let name = lock(&self.tracked).remove(&pid);

        if *quitting {
            debug!("Ignoring exit of {} during shutdown", pid);
            return ExitOutcome::Cancelled;
        }

        let name = match name {
            Some(name) => name,
            None => return ExitOutcome::Untracked,
        };

        let interval = match TimeInterval::try_new(start_tick, end_tick) {
            Ok(interval) => interval,
            Err(err) => {
                warn!("Dropping exit of {} ({}): {}", pid, name, err);
                return ExitOutcome::Rejected;
            }
        };

        // Membership is resolved at exit time; the group may have been edited
        let (group, intervals) = match self.registry.lookup_by_process(&name) {
            Some(found) => found,
            None => {
                debug!("No group claims {} anymore, dropping exit of {}", name, pid);
                return ExitOutcome::Untracked;
            }
        };

        intervals.append(interval);
        if self.registry.is_selected(&group) {
            self.redraw.request_redraw();
        }
        debug!(
            "Recorded {} for group {:?} ({} s)",
            name,
            group,
            interval.duration_seconds()
        );
        ExitOutcome::Recorded { group }
    }

    pub fn handle(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Started { pid, name } => {
                self.on_process_start(pid, &name);
            }
            ProcessEvent::Exited { pid, start, end } => {
                self.on_process_exit(pid, start, end);
            }
        }
    }

    /// Whether `pid` has a pending exit registration
    pub fn is_tracked(&self, pid: u32) -> bool {
        lock(&self.tracked).contains_key(&pid)
    }

    pub fn tracked_count(&self) -> usize {
        lock(&self.tracked).len()
    }

    /// Sets the quitting flag; later notifications leave every group untouched
    pub fn begin_shutdown(&self) {
        *lock(&self.quitting) = true;
        debug!("Ingestion stopped");
    }
}

/// Feeds monitor events to the port until the channel closes
pub async fn run_ingestion(
    port: Arc<IngestionPort>,
    mut receiver: mpsc::Receiver<ProcessEvent>,
) -> Result<()> {
    while let Some(event) = receiver.recv().await {
        port.handle(event);
    }
    debug!("Event channel closed, shutting down ingestion");
    Ok(())
}
