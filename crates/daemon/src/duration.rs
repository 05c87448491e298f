//! Effective encode duration
//!
//! The duration drives both the bitrate math of the retry loop and the
//! progress percentage, so a best-effort estimate is enough.

use crate::job::{parse_timestamp, Job, SeekWindow};
use crate::probe::{ProbeError, Prober};
use log::debug;

/// Filter name whose presence means the inputs are played back to back
const CONCAT_FILTER: &str = "concat";

/// Effective duration in seconds of what the job will produce
///
/// Output-side seeking wins when it bounds the duration on its own.
/// Otherwise every input is probed: with a concatenating filter graph
/// the durations add up, else the longest input dominates.
///
/// A misordered output window yields a negative duration; it is returned
/// as is rather than clamped.
pub async fn deduce_duration(job: &Job, prober: &dyn Prober) -> Result<f64, ProbeError> {
    if let Some(duration) = window_duration(job.output_window()) {
        debug!("Duration {}s taken from output seeking", duration);
        return Ok(duration);
    }

    let mut durations = Vec::with_capacity(job.inputs.len());
    for input in &job.inputs {
        let window = input.window();
        let duration = match window_duration(window) {
            Some(duration) => duration,
            None => {
                let probed = prober.duration(&input.file).await?;
                let start = window.start.and_then(parse_timestamp).unwrap_or(0.0);
                probed - start
            }
        };
        debug!("Input {} contributes {}s", input.file.display(), duration);
        durations.push(duration);
    }

    let concatenated = job
        .lavfi
        .as_deref()
        .is_some_and(|graph| graph.contains(CONCAT_FILTER));

    Ok(if concatenated {
        durations.iter().sum()
    } else {
        durations.into_iter().fold(0.0, f64::max)
    })
}

/// Duration implied by a seek window alone, if it has a stop time
fn window_duration(window: SeekWindow<'_>) -> Option<f64> {
    let stop = window.stop.and_then(parse_timestamp)?;
    match window.start.and_then(parse_timestamp) {
        Some(start) => Some(stop - start),
        None => Some(stop),
    }
}
