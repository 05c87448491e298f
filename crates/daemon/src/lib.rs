//! pwebm daemon library
//!
//! Everything behind the `pwebm` command: the job model, the size-targeting
//! ffmpeg encoder, the serial queue and the single-instance control channel.

pub mod daemon;
pub mod duration;
pub mod encode;
pub mod ipc;
pub mod job;
pub mod probe;
pub mod queue;
pub mod startup;
pub mod status;

pub use pwebm_config as config;
pub use pwebm_config::Config;

pub use daemon::{Daemon, DaemonError, RunSummary, TermSignal};
pub use duration::deduce_duration;
pub use encode::{EncodeError, EncodeOutcome, Encoder};
pub use ipc::{ClientError, Request, Response, Server, ServerError};
pub use job::{parse_timestamp, Input, Job, Output, ValidationError};
pub use probe::{FfprobeProber, ProbeData, ProbeError, Prober};
pub use queue::{JobQueue, QueueReport};
pub use startup::{run_startup_checks, StartupError};
pub use status::{new_shared_status, SharedStatus, Status, StatusTracker};
