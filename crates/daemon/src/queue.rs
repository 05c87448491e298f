//! Serial job queue with cooperative abort
//!
//! Jobs are encoded strictly one at a time in arrival order. The queue
//! state is only touched in short critical sections, so the control
//! channel can push or abort while an encode is in flight.

use crate::encode::{EncodeOutcome, Encoder};
use crate::job::Job;
use crate::status::SharedStatus;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Summary of one `process_queue` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    pub completed: usize,
    pub failed: usize,
    /// Processing was stopped by an abort
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Job>,
    total: usize,
    processing: bool,
    abort: bool,
    /// No further jobs are accepted
    closing: bool,
}

impl QueueState {
    fn processed(&self) -> usize {
        self.total - self.pending.len()
    }
}

/// Ordered queue of pending jobs driving a single `Encoder`
pub struct JobQueue {
    state: Mutex<QueueState>,
    encoder: Encoder,
    processing: watch::Sender<bool>,
}

impl JobQueue {
    pub fn new(encoder: Encoder) -> Self {
        let (processing, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState::default()),
            encoder,
            processing,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> &SharedStatus {
        self.encoder.status()
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Append a job; never blocks on a running encode
    ///
    /// Returns false, leaving the queue untouched, once it is closing.
    pub fn push(&self, job: Job) -> bool {
        let mut state = self.lock();
        if state.closing {
            return false;
        }
        state.pending.push_back(job);
        state.total += 1;
        self.status().set_counts(state.processed(), state.total);
        info!("Queued job #{} ({} pending)", state.total, state.pending.len());
        true
    }

    /// Refuse every later `push`
    pub fn close(&self) {
        self.lock().closing = true;
    }

    /// Close the queue if nothing is pending
    ///
    /// The check and the close happen under one lock, so a job is either
    /// pushed before and seen here, or refused.
    pub fn close_if_drained(&self) -> bool {
        let mut state = self.lock();
        if state.pending.is_empty() {
            state.closing = true;
        }
        state.closing
    }

    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    /// Number of jobs ever pushed
    pub fn total_count(&self) -> usize {
        self.lock().total
    }

    /// Number of jobs taken off the queue, finished or in flight
    pub fn processed_count(&self) -> usize {
        self.lock().processed()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    /// Encode queued jobs until the queue is empty or aborted
    ///
    /// Returns `None` without doing anything when another caller is
    /// already processing. A job that fails is logged and counted, then
    /// the next one starts.
    pub async fn process_queue(&self) -> Option<QueueReport> {
        {
            let mut state = self.lock();
            if state.processing {
                return None;
            }
            state.processing = true;
            state.abort = false;
            self.processing.send_replace(true);
        }

        let mut report = QueueReport::default();

        loop {
            // the slot is claimed under the queue lock so an abort either
            // sees the flag checked here or finds the encode to kill
            let (job, number, kill) = {
                let mut state = self.lock();
                if state.abort {
                    report.aborted = true;
                    break;
                }
                let Some(job) = state.pending.pop_front() else {
                    break;
                };
                let number = state.processed();
                self.status().set_counts(number, state.total);
                (job, number, self.encoder.slot().acquire())
            };

            match self.encoder.encode(&job, &kill).await {
                Ok(EncodeOutcome::Done { .. }) => report.completed += 1,
                Ok(EncodeOutcome::Killed) => {
                    warn!("Job #{} was killed", number);
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    error!("Job #{} failed: {}", number, e);
                    report.failed += 1;
                }
            }
        }

        self.status().set_idle();
        {
            let mut state = self.lock();
            state.processing = false;
            self.processing.send_replace(false);
        }

        info!(
            "Queue stopped: {} completed, {} failed{}",
            report.completed,
            report.failed,
            if report.aborted { ", aborted" } else { "" }
        );
        Some(report)
    }

    /// Stop processing and wait until the in-flight encode has exited
    ///
    /// Jobs still pending stay queued but are not started. Returns at once
    /// when nothing is processing.
    pub async fn abort_processing(&self) {
        let mut processing = self.processing.subscribe();
        if !self.request_abort() {
            return;
        }

        if processing.wait_for(|running| !*running).await.is_err() {
            warn!("Queue processing state channel closed while aborting");
        }
    }

    /// Flag the abort and kill the running encode without waiting
    ///
    /// Returns whether processing was underway.
    pub fn request_abort(&self) -> bool {
        {
            let mut state = self.lock();
            if !state.processing {
                return false;
            }
            state.abort = true;
        }

        if self.encoder.slot().kill() {
            info!("Killing the running encode");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Input;
    use crate::probe::{ProbeData, ProbeError, Prober};
    use crate::status::{new_shared_status, Status};
    use crate::Config;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;

    struct NoProber;

    #[async_trait]
    impl Prober for NoProber {
        async fn probe(&self, path: &Path) -> Result<ProbeData, ProbeError> {
            Err(ProbeError::MissingDuration(path.to_path_buf()))
        }
    }

    fn queue() -> JobQueue {
        let encoder = Encoder::with_prober(
            "/nonexistent/ffmpeg",
            Arc::new(NoProber),
            std::env::temp_dir(),
            new_shared_status(),
        );
        JobQueue::new(encoder)
    }

    fn invalid_job() -> Job {
        Job::from_config(Vec::new(), &Config::default())
    }

    #[test]
    fn test_push_updates_counts() {
        let queue = queue();
        assert_eq!(queue.total_count(), 0);

        for _ in 0..3 {
            queue.push(Job::from_config(vec![Input::new("a.mp4")], &Config::default()));
        }

        assert_eq!(queue.total_count(), 3);
        assert_eq!(queue.pending_count(), 3);
        assert_eq!(queue.processed_count(), 0);
        // counters are kept while idle, only shown once a stage starts
        assert_eq!(queue.status().snapshot(), Status::Idle);
    }

    #[tokio::test]
    async fn test_empty_queue_drains_immediately() {
        let queue = queue();
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report, QueueReport::default());
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn test_failed_jobs_do_not_stop_the_queue() {
        let queue = queue();
        queue.push(invalid_job());
        queue.push(invalid_job());

        let report = queue.process_queue().await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.completed, 0);
        assert!(!report.aborted);
        assert_eq!(queue.processed_count(), 2);
        assert_eq!(queue.total_count(), 2);
        assert_eq!(queue.status().snapshot(), Status::Idle);
    }

    #[tokio::test]
    async fn test_abort_when_idle_returns_immediately() {
        let queue = queue();
        queue.push(invalid_job());

        queue.abort_processing().await;

        // the abort did not stick to a later run
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(!report.aborted);
    }

    #[test]
    fn test_closed_queue_refuses_jobs() {
        let queue = queue();
        assert!(queue.push(invalid_job()));

        queue.close();

        assert!(!queue.push(invalid_job()));
        assert_eq!(queue.total_count(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_close_if_drained_waits_for_pending_jobs() {
        let queue = queue();
        queue.push(invalid_job());

        assert!(!queue.close_if_drained());
        assert!(!queue.is_closing());
        // still open, so a late job is taken
        assert!(queue.push(invalid_job()));

        queue.process_queue().await.unwrap();
        assert!(queue.close_if_drained());
        assert!(!queue.push(invalid_job()));
        assert_eq!(queue.total_count(), 2);
    }
}
