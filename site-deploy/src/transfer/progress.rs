//! Progress reporting for deployment runs.
//!
//! The percentage is split into fixed bands so the observer sees steady
//! movement regardless of how many operations the queue holds:
//!
//! | Band    | Phase                                   |
//! |---------|-----------------------------------------|
//! | 0 – 6   | initialization                          |
//! | 7 – 8   | connect and remote manifest download    |
//! | 8 – 98  | queue operations, linear in the cursor  |
//! | 99 – 100| manifest publish                        |

use super::events::DeployEvent;
use std::time::Duration;

pub const INIT_PROGRESS: u8 = 6;
pub const CONNECTED_PROGRESS: u8 = 7;
pub const MANIFEST_PROGRESS: u8 = 8;
pub const QUEUE_CEILING: u8 = 98;
pub const PUBLISH_PROGRESS: u8 = 99;
pub const DONE_PROGRESS: u8 = 100;

const QUEUE_SPAN: usize = 92;

/// Percentage after `completed` of `total` queue operations.
///
/// `8 + floor(92 * completed / total)`, capped below the publish band.
pub fn queue_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return MANIFEST_PROGRESS;
    }
    let span = QUEUE_SPAN * completed.min(total) / total;
    (MANIFEST_PROGRESS as usize + span).min(QUEUE_CEILING as usize) as u8
}

/// Turns run milestones into progress events; never goes backwards.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    last: u8,
    completed: usize,
    total: usize,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last percentage reported.
    pub fn percent(&self) -> u8 {
        self.last
    }

    pub fn operations(&self) -> (usize, usize) {
        (self.completed, self.total)
    }

    pub fn initializing(&mut self) -> DeployEvent {
        self.report(INIT_PROGRESS, None)
    }

    pub fn connected(&mut self) -> DeployEvent {
        self.report(CONNECTED_PROGRESS, None)
    }

    /// Remote manifest handled and the queue sized.
    pub fn planned(&mut self, total_operations: usize) -> DeployEvent {
        self.total = total_operations;
        self.completed = 0;
        self.report(MANIFEST_PROGRESS, None)
    }

    /// The cursor moved to `completed`, whether the operation succeeded or hard-failed.
    pub fn operation_finished(&mut self, completed: usize) -> DeployEvent {
        self.completed = completed.min(self.total);
        let percent = queue_percent(self.completed, self.total);
        self.report(percent, Some((self.completed, self.total)))
    }

    pub fn publishing(&mut self) -> DeployEvent {
        let operations = (self.completed, self.total);
        self.report(PUBLISH_PROGRESS, Some(operations))
    }

    pub fn published(&mut self) -> DeployEvent {
        self.report(DONE_PROGRESS, None)
    }

    fn report(&mut self, percent: u8, operations: Option<(usize, usize)>) -> DeployEvent {
        self.last = self.last.max(percent.min(DONE_PROGRESS));
        DeployEvent::Progress {
            progress: self.last,
            operations,
        }
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
