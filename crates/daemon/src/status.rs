//! Status tracking for the resident instance
//!
//! Keeps only the latest snapshot of what the queue is doing so the
//! control channel can answer `status` requests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Snapshot of the queue's current activity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Status {
    Idle,
    SinglePass {
        total: usize,
        current: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percentage: Option<f64>,
    },
    FirstPass {
        tries: u32,
        total: usize,
        current: usize,
    },
    SecondPass {
        tries: u32,
        total: usize,
        current: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percentage: Option<f64>,
    },
}

impl Status {
    pub fn is_idle(&self) -> bool {
        matches!(self, Status::Idle)
    }

    pub fn percentage(&self) -> Option<f64> {
        match self {
            Status::SinglePass { percentage, .. } | Status::SecondPass { percentage, .. } => {
                *percentage
            }
            Status::Idle | Status::FirstPass { .. } => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn pct(p: &Option<f64>) -> String {
            p.map(|p| format!(" {:.1}%", p)).unwrap_or_default()
        }

        match self {
            Status::Idle => write!(f, "Idle"),
            Status::SinglePass {
                total,
                current,
                percentage,
            } => write!(f, "[{}/{}] Encoding{}", current, total, pct(percentage)),
            Status::FirstPass {
                tries,
                total,
                current,
            } => write!(f, "[{}/{}] First pass (try {})", current, total, tries),
            Status::SecondPass {
                tries,
                total,
                current,
                percentage,
            } => write!(
                f,
                "[{}/{}] Second pass (try {}){}",
                current,
                total,
                tries,
                pct(percentage)
            ),
        }
    }
}

/// Stage of the encode currently in flight
#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Idle,
    SinglePass { percentage: Option<f64> },
    FirstPass { tries: u32 },
    SecondPass { tries: u32, percentage: Option<f64> },
}

#[derive(Debug)]
struct Inner {
    stage: Stage,
    total: usize,
    current: usize,
}

/// Latest status, shared between the queue, the orchestrator and the
/// control channel server
///
/// The queue keeps the job counters current, the orchestrator moves the
/// stage. Every mutation is O(1).
#[derive(Debug)]
pub struct StatusTracker {
    inner: RwLock<Inner>,
}

/// Shared status state for concurrent access across components
pub type SharedStatus = Arc<StatusTracker>;

/// Creates a new SharedStatus in the idle state
pub fn new_shared_status() -> SharedStatus {
    Arc::new(StatusTracker::default())
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                stage: Stage::Idle,
                total: 0,
                current: 0,
            }),
        }
    }
}

impl StatusTracker {
    fn update<F: FnOnce(&mut Inner)>(&self, f: F) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut inner);
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Status {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let (total, current) = (inner.total, inner.current);

        match inner.stage {
            Stage::Idle => Status::Idle,
            Stage::SinglePass { percentage } => Status::SinglePass {
                total,
                current,
                percentage,
            },
            Stage::FirstPass { tries } => Status::FirstPass {
                tries,
                total,
                current,
            },
            Stage::SecondPass { tries, percentage } => Status::SecondPass {
                tries,
                total,
                current,
                percentage,
            },
        }
    }

    /// Record the queue counters: `current` is the number of jobs taken
    /// off the queue so far, `total` the number ever enqueued
    pub fn set_counts(&self, current: usize, total: usize) {
        self.update(|inner| {
            inner.current = current;
            inner.total = total;
        });
    }

    pub fn set_idle(&self) {
        self.update(|inner| inner.stage = Stage::Idle);
    }

    pub fn set_single_pass(&self, percentage: Option<f64>) {
        self.update(|inner| inner.stage = Stage::SinglePass { percentage });
    }

    pub fn set_first_pass(&self, tries: u32) {
        self.update(|inner| inner.stage = Stage::FirstPass { tries });
    }

    pub fn set_second_pass(&self, tries: u32, percentage: Option<f64>) {
        self.update(|inner| inner.stage = Stage::SecondPass { tries, percentage });
    }
}
