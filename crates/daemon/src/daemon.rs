//! Resident instance
//!
//! The first launch that finds no running instance becomes this one: it
//! serves the control channel and drains the queue, then exits.

use crate::config::Config;
use crate::encode::Encoder;
use crate::ipc::{Server, ServerError};
use crate::job::Job;
use crate::queue::{JobQueue, QueueReport};
use crate::status::{new_shared_status, SharedStatus};
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),
}

/// Termination signal that stopped the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Interrupt,
    Terminate,
}

impl TermSignal {
    /// Conventional `128 + signo` exit code
    pub fn exit_code(self) -> i32 {
        match self {
            TermSignal::Interrupt => 130,
            TermSignal::Terminate => 143,
        }
    }
}

/// How a `Daemon::run` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub report: QueueReport,
    pub signal: Option<TermSignal>,
}

impl RunSummary {
    /// 0 when everything encoded or a kill request stopped the queue,
    /// 1 when a job failed, the signal's code when one was received
    pub fn exit_code(&self) -> i32 {
        match self.signal {
            Some(signal) => signal.exit_code(),
            None if self.report.failed > 0 => 1,
            None => 0,
        }
    }
}

struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    async fn ctrl_c() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }

    async fn recv(&mut self) -> TermSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = Self::ctrl_c() => TermSignal::Interrupt,
                _ = self.terminate.recv() => TermSignal::Terminate,
            }
        }
        #[cfg(not(unix))]
        {
            Self::ctrl_c().await;
            TermSignal::Interrupt
        }
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Config,
    pub status: SharedStatus,
    pub queue: Arc<JobQueue>,
}

impl Daemon {
    /// Build the queue and encoder from the configuration
    pub fn new(config: Config) -> Self {
        let status = new_shared_status();
        let encoder = Encoder::new(&config, status.clone());
        Self::with_encoder(config, encoder)
    }

    /// Use a preconfigured encoder, e.g. one with a substitute prober
    pub fn with_encoder(config: Config, encoder: Encoder) -> Self {
        let status = encoder.status().clone();
        Self {
            config,
            status,
            queue: Arc::new(JobQueue::new(encoder)),
        }
    }

    /// Serve the control channel and encode until the queue is empty
    ///
    /// The control channel stays up until the queue is closed with nothing
    /// pending, so every accepted job is encoded unless processing was
    /// aborted. A job sent after that is refused.
    pub async fn run(&self, server: Server, first_job: Job) -> Result<RunSummary, DaemonError> {
        let mut signals = Signals::new().map_err(DaemonError::Signal)?;

        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(self.queue.clone(), shutdown.clone()));

        self.queue.push(first_job);

        let mut signal = None;
        let mut report = QueueReport::default();
        loop {
            let drained = {
                let drain = self.queue.process_queue();
                tokio::pin!(drain);
                loop {
                    tokio::select! {
                        drained = &mut drain => break drained.unwrap_or_default(),
                        received = signals.recv(), if signal.is_none() => {
                            warn!("Received {:?}, stopping", received);
                            signal = Some(received);
                            self.queue.request_abort();
                        }
                    }
                }
            };
            report.completed += drained.completed;
            report.failed += drained.failed;
            report.aborted |= drained.aborted;

            if signal.is_some() || report.aborted {
                self.queue.close();
                break;
            }
            if self.queue.close_if_drained() {
                break;
            }
            info!("Encoding {} late jobs", self.queue.pending_count());
        }

        shutdown.cancel();
        match serving.await {
            Ok(result) => result?,
            Err(e) => error!("Control channel task failed: {}", e),
        }

        Ok(RunSummary { report, signal })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let summary = |failed, aborted, signal| RunSummary {
            report: QueueReport {
                completed: 1,
                failed,
                aborted,
            },
            signal,
        };

        assert_eq!(summary(0, false, None).exit_code(), 0);
        assert_eq!(summary(2, false, None).exit_code(), 1);
        // a kill request is a graceful stop
        assert_eq!(summary(0, true, None).exit_code(), 0);
        assert_eq!(summary(0, true, Some(TermSignal::Interrupt)).exit_code(), 130);
        assert_eq!(summary(1, true, Some(TermSignal::Terminate)).exit_code(), 143);
    }

    #[test]
    fn test_daemon_shares_status_with_queue() {
        let daemon = Daemon::new(Config::default());
        assert!(Arc::ptr_eq(&daemon.status, daemon.queue.status()));
        assert_eq!(daemon.queue.total_count(), 0);
    }
}
