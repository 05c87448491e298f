//! ffmpeg encoding: argument building, progress decoding, subprocess
//! control and the size-targeting retry loop

pub mod command;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod retry;

pub use command::{escape_filter_value, is_size_limited, CommandBuilder, EncodePlan, RateControl};
pub use orchestrator::{generated_file_name, EncodeError, EncodeOutcome, Encoder, Pass};
pub use process::{run_pass, KillSwitch, PassControl, PassExit, PassStop, ProcessSlot};
pub use progress::{ProgressParser, ProgressSample, ProgressState};
pub use retry::{BitrateExhausted, RetryState};
