//! ffmpeg argument lists for one encode attempt
//!
//! Encoders of the libvpx family are size-targeted and get two passes
//! sharing a pass log file. Any other encoder gets a single constant
//! quality pass that copies every other stream.

use crate::job::Job;
use std::path::Path;

/// Encoder name prefix of the size-targeted codec family
const SIZE_LIMITED_FAMILY: &str = "libvpx";

/// `-crf` used once the encode is capped by bitrate instead of quality
pub const MOST_DETAIL_CRF: u32 = 0;

/// Output container of the two-pass encode
const OUTPUT_FORMAT: &str = "webm";

#[cfg(windows)]
const NULL_SINK: &str = "NUL";
#[cfg(not(windows))]
const NULL_SINK: &str = "/dev/null";

/// How the video bitrate is controlled for an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// Constant quality, unconstrained size
    Quality,
    /// Fixed average bitrate in bits/second
    Bitrate(u64),
}

/// The argument lists for one attempt, program name excluded
#[derive(Debug, Clone, PartialEq)]
pub enum EncodePlan {
    SinglePass(Vec<String>),
    TwoPass {
        first: Vec<String>,
        second: Vec<String>,
    },
}

/// Whether the encoder belongs to the size-targeted family
pub fn is_size_limited(encoder: &str) -> bool {
    encoder.starts_with(SIZE_LIMITED_FAMILY)
}

/// Escape a value for use inside a filter graph option
///
/// The graph is parsed twice by ffmpeg (graph level, then filter
/// option level), which is why quotes and colons get a double escape.
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '[' => escaped.push_str(r"\["),
            ']' => escaped.push_str(r"\]"),
            '\'' => escaped.push_str(r"\\\'"),
            ';' => escaped.push_str(r"\;"),
            ':' => escaped.push_str(r"\\:"),
            ',' => escaped.push_str(r"\,"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn has_flag(params: &[String], flags: &[&str]) -> bool {
    params.iter().any(|p| flags.contains(&p.as_str()))
}

fn push<S: Into<String>>(args: &mut Vec<String>, items: impl IntoIterator<Item = S>) {
    args.extend(items.into_iter().map(Into::into));
}

/// Builds the ffmpeg invocations for a job
pub struct CommandBuilder<'a> {
    job: &'a Job,
    output: &'a Path,
    pass_log: &'a Path,
}

impl<'a> CommandBuilder<'a> {
    /// `pass_log` is the prefix ffmpeg uses for its statistics files; it
    /// is ignored by single-pass plans
    pub fn new(job: &'a Job, output: &'a Path, pass_log: &'a Path) -> Self {
        Self {
            job,
            output,
            pass_log,
        }
    }

    pub fn build(&self, rate: RateControl) -> EncodePlan {
        if is_size_limited(&self.job.encoder) {
            let (first, second) = self.two_pass(rate);
            EncodePlan::TwoPass { first, second }
        } else {
            EncodePlan::SinglePass(self.single_pass())
        }
    }

    /// Global flags, inputs with their seeking, then output seeking
    fn prefix(&self) -> Vec<String> {
        let mut args = Vec::new();
        push(&mut args, ["-hide_banner", "-nostdin", "-y", "-progress", "pipe:1"]);

        for input in &self.job.inputs {
            if let Some(start) = &input.start_time {
                push(&mut args, ["-ss", start.as_str()]);
            }
            if let Some(stop) = &input.stop_time {
                push(&mut args, ["-to", stop.as_str()]);
            }
            args.push("-i".to_string());
            args.push(input.file.to_string_lossy().into_owned());
        }

        let window = self.job.output_window();
        if let Some(start) = window.start {
            push(&mut args, ["-ss", start]);
        }
        if let Some(stop) = window.stop {
            push(&mut args, ["-to", stop]);
        }

        args
    }

    /// Filter graph including the subtitle burn-in, if any
    fn filter_graph(&self) -> Option<String> {
        let subtitles = if self.job.subs {
            self.job.inputs.first().map(|input| {
                format!(
                    "subtitles={}",
                    escape_filter_value(&input.file.to_string_lossy())
                )
            })
        } else {
            None
        };

        match (self.job.lavfi.as_deref(), subtitles) {
            (Some(graph), Some(subs)) => Some(format!("{},{}", graph, subs)),
            (Some(graph), None) => Some(graph.to_string()),
            (None, subs) => subs,
        }
    }

    fn push_filter_graph(&self, args: &mut Vec<String>) {
        if let Some(graph) = self.filter_graph() {
            args.push("-lavfi".to_string());
            args.push(graph);
        }
    }

    /// Constant quality invocation that copies every other stream
    pub fn single_pass(&self) -> Vec<String> {
        let job = self.job;
        let mut args = self.prefix();

        if !has_flag(&job.extra_params, &["-map"]) {
            push(&mut args, ["-map", "0"]);
        }
        push(&mut args, ["-c", "copy", "-c:v", job.encoder.as_str()]);
        push(&mut args, ["-crf".to_string(), job.crf.to_string()]);
        self.push_filter_graph(&mut args);

        args.extend(job.extra_params.iter().cloned());
        args.push(self.output.to_string_lossy().into_owned());
        args
    }

    /// Analysis and produce invocations sharing one pass log
    pub fn two_pass(&self, rate: RateControl) -> (Vec<String>, Vec<String>) {
        let job = self.job;
        let mut common = self.prefix();

        let (crf, bitrate) = match rate {
            RateControl::Quality => (job.crf, 0),
            RateControl::Bitrate(bitrate) => (MOST_DETAIL_CRF, bitrate),
        };

        push(&mut common, ["-c:v", job.encoder.as_str()]);
        push(
            &mut common,
            [
                "-crf".to_string(),
                crf.to_string(),
                "-b:v".to_string(),
                bitrate.to_string(),
                "-deadline".to_string(),
                job.deadline.to_string(),
                "-cpu-used".to_string(),
                job.cpu_used.to_string(),
            ],
        );
        push(&mut common, ["-row-mt", "1"]);
        self.push_filter_graph(&mut common);
        push(&mut common, ["-map_metadata", "-1", "-map_chapters", "-1"]);

        let pass_log = self.pass_log.to_string_lossy().into_owned();

        // analysis-only flags go after the passthrough so nothing re-enables
        // audio or a real output for the first pass
        let mut first = common.clone();
        push(&mut first, ["-pass", "1", "-passlogfile", pass_log.as_str()]);
        first.extend(job.extra_params.iter().cloned());
        push(&mut first, ["-an", "-sn", "-dn", "-f", "null", NULL_SINK]);

        let mut second = common;
        push(&mut second, ["-pass", "2", "-passlogfile", pass_log.as_str()]);
        if !has_flag(&job.extra_params, &["-map"]) {
            if !has_flag(&job.extra_params, &["-c:a", "-codec:a", "-acodec"]) {
                second.push("-an".to_string());
            }
            if !has_flag(&job.extra_params, &["-c:s", "-codec:s", "-scodec"]) {
                second.push("-sn".to_string());
            }
            if !has_flag(&job.extra_params, &["-c:d", "-codec:d", "-dcodec"]) {
                second.push("-dn".to_string());
            }
        }
        push(&mut second, ["-f", OUTPUT_FORMAT]);
        second.extend(job.extra_params.iter().cloned());
        second.push(self.output.to_string_lossy().into_owned());

        (first, second)
    }
}
