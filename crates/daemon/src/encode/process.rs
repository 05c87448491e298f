//! Encoder subprocess lifecycle
//!
//! At most one encode runs at a time. Whoever starts one acquires the
//! `ProcessSlot`; anyone else can only ask whether it is running or kill it.

use super::progress::{ProgressParser, ProgressSample};
use log::{debug, warn};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Handle on the encode currently in flight, if any
#[derive(Debug, Default)]
pub struct ProcessSlot {
    current: Mutex<Option<CancellationToken>>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a new encode; released when the guard drops
    pub fn acquire(&self) -> KillSwitch<'_> {
        let token = CancellationToken::new();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            warn!("Encode slot acquired while another encode is registered");
        }
        *current = Some(token.clone());
        KillSwitch { slot: self, token }
    }

    /// Terminate the running encode; returns whether there was one
    pub fn kill(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Guard for an acquired `ProcessSlot`
#[derive(Debug)]
pub struct KillSwitch<'a> {
    slot: &'a ProcessSlot,
    token: CancellationToken,
}

impl KillSwitch<'_> {
    pub fn is_killed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for KillSwitch<'_> {
    fn drop(&mut self) {
        let mut current = self.slot.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = None;
    }
}

/// Decision taken after each progress sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassControl {
    Continue,
    /// Terminate the pass, its output is not wanted
    Stop,
}

/// Why a pass was terminated by us rather than finishing on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStop {
    /// The sample callback asked to stop
    Overflow,
    /// An external kill request
    Killed,
}

/// Result of one encoder invocation
#[derive(Debug)]
pub struct PassExit {
    pub status: ExitStatus,
    pub stopped: Option<PassStop>,
    /// Diagnostic output, only worth showing on unexpected failures
    pub stderr: String,
}

/// Run one encoder invocation to completion
///
/// Progress (stdout) is decoded and handed to `on_sample` while the
/// process runs; stderr is collected concurrently. Both streams are fully
/// drained before returning so the child never blocks on a full pipe.
pub async fn run_pass<F>(
    bin: &Path,
    args: &[String],
    cancel: &CancellationToken,
    mut on_sample: F,
) -> std::io::Result<PassExit>
where
    F: FnMut(&ProgressSample) -> PassControl,
{
    debug!("Executing: {} {}", bin.display(), args.join(" "));

    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("encoder stdout was not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("encoder stderr was not captured"))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = stderr.read_to_end(&mut buf).await {
            warn!("Failed to read encoder stderr: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let mut parser = ProgressParser::new();
    let mut chunk = vec![0u8; 8 * 1024];
    let mut stdout_open = true;
    let mut stopped: Option<PassStop> = None;
    let mut kill_sent = false;

    let status = loop {
        tokio::select! {
            read = stdout.read(&mut chunk), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    if stopped.is_none() {
                        for sample in parser.feed(&chunk[..n]) {
                            if on_sample(&sample) == PassControl::Stop {
                                stopped = Some(PassStop::Overflow);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to read encoder progress: {}", e);
                    stdout_open = false;
                }
            },
            _ = cancel.cancelled(), if stopped.is_none() => {
                stopped = Some(PassStop::Killed);
            }
            status = child.wait() => break status?,
        }

        if stopped.is_some() && !kill_sent {
            kill_sent = true;
            if let Err(e) = child.start_kill() {
                debug!("Encoder already gone when killing: {}", e);
            }
        }
    };

    // drain whatever is left so the reader side is done before we report
    if stdout_open {
        let mut rest = Vec::new();
        if let Err(e) = stdout.read_to_end(&mut rest).await {
            debug!("Failed to drain encoder progress: {}", e);
        }
        if stopped.is_none() {
            for sample in parser.feed(&rest) {
                if on_sample(&sample) == PassControl::Stop {
                    stopped = Some(PassStop::Overflow);
                    break;
                }
            }
        }
    }

    let stderr = stderr_task.await.unwrap_or_default();

    Ok(PassExit {
        status,
        stopped,
        stderr,
    })
}
