//! Encode orchestrator
//!
//! Runs one job to completion: resolves the output path, deduces the
//! duration, then drives the size-targeting retry loop over the ffmpeg
//! passes while publishing progress to the status tracker.

use super::command::{is_size_limited, CommandBuilder};
use super::process::{run_pass, KillSwitch, PassControl, PassExit, PassStop, ProcessSlot};
use super::retry::{overflow_percent, RetryState};
use crate::duration::deduce_duration;
use crate::job::{Job, ValidationError};
use crate::probe::{FfprobeProber, ProbeError, Prober};
use crate::status::SharedStatus;
use crate::Config;
use log::{debug, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Stderr lines kept in a pass failure report
const STDERR_TAIL_LINES: usize = 20;

/// Which encoder invocation of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    First,
    Second,
    Single,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::First => write!(f, "First pass"),
            Pass::Second => write!(f, "Second pass"),
            Pass::Single => write!(f, "Single pass"),
        }
    }
}

/// Error type for a job that cannot be encoded
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Failed to run {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The encoder exited non-zero on its own
    #[error("{pass} failed with exit code {}:\n{stderr}", .code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    PassFailed {
        pass: Pass,
        code: Option<i32>,
        stderr: String,
    },

    /// No positive bitrate is left that could meet the limit
    #[error("Could not fit the output into {limit_bytes} bytes after {tries} tries")]
    LimitUnreachable { limit_bytes: u64, tries: u32 },
}

/// How an encode ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    Done {
        output: PathBuf,
        size_bytes: u64,
        tries: u32,
    },
    /// Stopped by a kill request; nothing was kept
    Killed,
}

/// Result of one produce attempt
enum Attempt {
    Done(u64),
    Overflow(f64),
    Killed,
}

/// Serial encoder over ffmpeg
///
/// Owns the process slot so a kill request can reach whatever encode is
/// in flight.
pub struct Encoder {
    ffmpeg_bin: PathBuf,
    prober: Arc<dyn Prober>,
    video_dir: PathBuf,
    status: SharedStatus,
    slot: ProcessSlot,
}

impl Encoder {
    /// Encoder using the configured ffmpeg and ffprobe binaries
    pub fn new(config: &Config, status: SharedStatus) -> Self {
        Self::with_prober(
            config.ffmpeg_bin.clone(),
            Arc::new(FfprobeProber::new(config.ffprobe_bin.clone())),
            config.video_path.clone(),
            status,
        )
    }

    pub fn with_prober(
        ffmpeg_bin: impl Into<PathBuf>,
        prober: Arc<dyn Prober>,
        video_dir: impl Into<PathBuf>,
        status: SharedStatus,
    ) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            prober,
            video_dir: video_dir.into(),
            status,
            slot: ProcessSlot::new(),
        }
    }

    pub fn slot(&self) -> &ProcessSlot {
        &self.slot
    }

    pub fn status(&self) -> &SharedStatus {
        &self.status
    }

    /// Encode `job`, retrying at lower bitrates until the output fits
    ///
    /// `kill` must have been acquired from this encoder's slot.
    pub async fn encode(&self, job: &Job, kill: &KillSwitch<'_>) -> Result<EncodeOutcome, EncodeError> {
        job.validate()?;

        let output = self.resolve_output(job).await?;
        let duration = deduce_duration(job, self.prober.as_ref()).await?;
        debug!("Effective duration of {} is {}s", output.display(), duration);

        // set once ffmpeg may have written to `output`
        let mut touched = false;
        let result = if is_size_limited(&job.encoder) {
            self.encode_two_pass(job, &output, duration, kill, &mut touched).await
        } else {
            if job.size_limit_bytes() > 0 {
                warn!(
                    "Size limit is ignored for {}, only libvpx encoders are size limited",
                    job.encoder
                );
            }
            self.encode_single_pass(job, &output, duration, kill, &mut touched).await
        };

        match &result {
            Ok(EncodeOutcome::Done {
                output,
                size_bytes,
                tries,
            }) => info!(
                "Encoded {} ({:.2} MiB) after {} {}",
                output.display(),
                *size_bytes as f64 / BYTES_PER_MIB,
                tries,
                if *tries == 1 { "try" } else { "tries" }
            ),
            Ok(EncodeOutcome::Killed) => {
                info!("Encode of {} was killed", output.display());
                if touched {
                    remove_partial(&output).await;
                }
            }
            Err(_) if touched => remove_partial(&output).await,
            Err(_) => {}
        }

        result
    }

    async fn encode_two_pass(
        &self,
        job: &Job,
        output: &Path,
        duration: f64,
        kill: &KillSwitch<'_>,
        touched: &mut bool,
    ) -> Result<EncodeOutcome, EncodeError> {
        let limit = job.size_limit_bytes();
        let mut state = RetryState::new();

        loop {
            if kill.is_killed() {
                return Ok(EncodeOutcome::Killed);
            }

            // removed with the directory when this attempt ends
            let pass_dir = tempfile::Builder::new().prefix("pwebm-").tempdir()?;
            let pass_log = pass_dir.path().join("pass");

            let (first, second) = CommandBuilder::new(job, output, &pass_log).two_pass(state.rate_control());

            let tries = state.tries();
            info!("Try {}: first pass of {}", tries, output.display());
            self.status.set_first_pass(tries);

            let exit = self.run(&first, kill, |_| PassControl::Continue).await?;
            if was_killed(&exit, kill) {
                return Ok(EncodeOutcome::Killed);
            }
            check_exit(Pass::First, exit)?;

            info!("Try {}: second pass of {}", tries, output.display());
            self.status.set_second_pass(tries, Some(0.0));

            *touched = true;
            match self.produce(&second, output, limit, duration, tries, kill).await? {
                Attempt::Done(size_bytes) => {
                    return Ok(EncodeOutcome::Done {
                        output: output.to_path_buf(),
                        size_bytes,
                        tries,
                    })
                }
                Attempt::Killed => return Ok(EncodeOutcome::Killed),
                Attempt::Overflow(percent) => {
                    state.mark_failed();
                    warn!(
                        "Try {}: output exceeds the {:.2} MiB limit by {:.2}%",
                        tries,
                        limit as f64 / BYTES_PER_MIB,
                        percent
                    );
                    remove_partial(output).await;

                    let bitrate = state.next_attempt(limit, duration, percent).map_err(|e| {
                        EncodeError::LimitUnreachable {
                            limit_bytes: limit,
                            tries: e.tries,
                        }
                    })?;
                    info!("Retrying at {} bits/s", bitrate);
                }
            }
        }
    }

    /// Second pass with overflow monitoring
    async fn produce(
        &self,
        args: &[String],
        output: &Path,
        limit: u64,
        duration: f64,
        tries: u32,
        kill: &KillSwitch<'_>,
    ) -> Result<Attempt, EncodeError> {
        let mut overflow: Option<f64> = None;

        let exit = self
            .run(args, kill, |sample| {
                self.status.set_second_pass(tries, sample.percentage(duration));

                if limit > 0 && sample.total_size > limit {
                    overflow = Some(overflow_percent(sample.total_size, limit));
                    PassControl::Stop
                } else {
                    PassControl::Continue
                }
            })
            .await?;

        if was_killed(&exit, kill) {
            return Ok(Attempt::Killed);
        }
        if exit.stopped == Some(PassStop::Overflow) {
            return Ok(Attempt::Overflow(overflow.unwrap_or(0.0)));
        }
        check_exit(Pass::Second, exit)?;

        // the stream may have ended before a sample crossed the limit
        let size = tokio::fs::metadata(output).await?.len();
        if limit > 0 && size > limit {
            return Ok(Attempt::Overflow(overflow_percent(size, limit)));
        }
        Ok(Attempt::Done(size))
    }

    async fn encode_single_pass(
        &self,
        job: &Job,
        output: &Path,
        duration: f64,
        kill: &KillSwitch<'_>,
        touched: &mut bool,
    ) -> Result<EncodeOutcome, EncodeError> {
        if kill.is_killed() {
            return Ok(EncodeOutcome::Killed);
        }

        let args = CommandBuilder::new(job, output, Path::new("")).single_pass();

        info!("Single pass of {}", output.display());
        self.status.set_single_pass(Some(0.0));

        *touched = true;
        let exit = self
            .run(&args, kill, |sample| {
                self.status.set_single_pass(sample.percentage(duration));
                PassControl::Continue
            })
            .await?;

        if was_killed(&exit, kill) {
            return Ok(EncodeOutcome::Killed);
        }
        check_exit(Pass::Single, exit)?;

        let size_bytes = tokio::fs::metadata(output).await?.len();
        Ok(EncodeOutcome::Done {
            output: output.to_path_buf(),
            size_bytes,
            tries: 1,
        })
    }

    async fn run<F>(&self, args: &[String], kill: &KillSwitch<'_>, on_sample: F) -> Result<PassExit, EncodeError>
    where
        F: FnMut(&super::progress::ProgressSample) -> PassControl,
    {
        run_pass(&self.ffmpeg_bin, args, kill.token(), on_sample)
            .await
            .map_err(|source| EncodeError::Spawn {
                bin: self.ffmpeg_bin.clone(),
                source,
            })
    }

    /// Explicit output file, or a generated name in the video directory
    async fn resolve_output(&self, job: &Job) -> std::io::Result<PathBuf> {
        let path = match job.output_file() {
            Some(file) => file.to_path_buf(),
            None => {
                let dir = job.video_path.as_deref().unwrap_or(&self.video_dir);
                let extension = if is_size_limited(&job.encoder) { "webm" } else { "mkv" };
                dir.join(generated_file_name(extension))
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }
}

/// `<unix millis><3 random digits>.<extension>`
pub fn generated_file_name(extension: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix = Uuid::new_v4().as_u128() % 1000;
    format!("{}{:03}.{}", millis, suffix, extension)
}

fn was_killed(exit: &PassExit, kill: &KillSwitch<'_>) -> bool {
    exit.stopped == Some(PassStop::Killed) || (kill.is_killed() && !exit.status.success())
}

fn check_exit(pass: Pass, exit: PassExit) -> Result<(), EncodeError> {
    if exit.status.success() {
        return Ok(());
    }
    Err(EncodeError::PassFailed {
        pass,
        code: exit.status.code(),
        stderr: stderr_tail(&exit.stderr),
    })
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!("Removed partial output {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", output.display(), e),
    }
}
