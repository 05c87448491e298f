//! Encode job description
//!
//! A `Job` is what one launch of the tool asks for. It travels over the
//! control channel as JSON, so field names follow the wire schema.

use crate::config::{Deadline, MAX_CPU_USED};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Error type for rejected job descriptions
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("At least one input file is required")]
    NoInputs,

    #[error("Input #{0} has an empty file path")]
    EmptyInputPath(usize),

    #[error("Invalid timestamp \"{value}\" for {field}")]
    InvalidTimestamp { field: String, value: String },

    #[error("The size limit must be a non-negative number, got {0}")]
    InvalidSizeLimit(f64),

    #[error("cpu-used must be between 0 and {max} inclusive, got {0}", max = MAX_CPU_USED)]
    InvalidCpuUsed(u8),

    #[error("The encoder name must not be empty")]
    EmptyEncoder,
}

/// One input file with optional input-side seeking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<String>,
}

impl Input {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn window(&self) -> SeekWindow<'_> {
        SeekWindow {
            start: self.start_time.as_deref(),
            stop: self.stop_time.as_deref(),
        }
    }
}

/// Output file and output-side seeking, every part optional
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<String>,
}

impl Output {
    pub fn window(&self) -> SeekWindow<'_> {
        SeekWindow {
            start: self.start_time.as_deref(),
            stop: self.stop_time.as_deref(),
        }
    }
}

/// Borrowed `(start, stop)` pair of timestamps
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SeekWindow<'a> {
    pub start: Option<&'a str>,
    pub stop: Option<&'a str>,
}

/// An encode request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub inputs: Vec<Input>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
    pub encoder: String,
    pub crf: u32,
    pub cpu_used: u8,
    pub deadline: Deadline,
    /// Size limit in MiB, 0 means unlimited
    pub size_limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lavfi: Option<String>,
    #[serde(default)]
    pub subs: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_params: Vec<String>,
    /// Directory for a generated output name when `output.file` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<PathBuf>,
}

impl Job {
    /// Create a job for the given inputs using the configured defaults
    pub fn from_config(inputs: Vec<Input>, config: &crate::Config) -> Self {
        Self {
            inputs,
            output: None,
            encoder: config.encoder.clone(),
            crf: config.crf,
            cpu_used: config.cpu_used,
            deadline: config.deadline,
            size_limit: config.size_limit,
            lavfi: None,
            subs: config.subs,
            extra_params: Vec::new(),
            video_path: Some(config.video_path.clone()),
        }
    }

    /// Size limit converted to bytes, 0 when unlimited
    pub fn size_limit_bytes(&self) -> u64 {
        if self.size_limit.is_finite() && self.size_limit > 0.0 {
            (self.size_limit * BYTES_PER_MIB).floor() as u64
        } else {
            0
        }
    }

    pub fn output_window(&self) -> SeekWindow<'_> {
        self.output
            .as_ref()
            .map(Output::window)
            .unwrap_or_default()
    }

    pub fn output_file(&self) -> Option<&Path> {
        self.output.as_ref().and_then(|o| o.file.as_deref())
    }

    /// Check the job shape before any subprocess is spawned
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.inputs.is_empty() {
            return Err(ValidationError::NoInputs);
        }

        for (index, input) in self.inputs.iter().enumerate() {
            if input.file.as_os_str().is_empty() {
                return Err(ValidationError::EmptyInputPath(index));
            }
            check_timestamp(&format!("input #{} start time", index), input.start_time.as_deref())?;
            check_timestamp(&format!("input #{} stop time", index), input.stop_time.as_deref())?;
        }

        if let Some(output) = &self.output {
            check_timestamp("output start time", output.start_time.as_deref())?;
            check_timestamp("output stop time", output.stop_time.as_deref())?;
        }

        if !self.size_limit.is_finite() || self.size_limit < 0.0 {
            return Err(ValidationError::InvalidSizeLimit(self.size_limit));
        }

        if self.cpu_used > MAX_CPU_USED {
            return Err(ValidationError::InvalidCpuUsed(self.cpu_used));
        }

        if self.encoder.trim().is_empty() {
            return Err(ValidationError::EmptyEncoder);
        }

        Ok(())
    }
}

fn check_timestamp(field: &str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(value) if parse_timestamp(value).is_none() => Err(ValidationError::InvalidTimestamp {
            field: field.to_string(),
            value: value.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Parse `[[HH:]MM:]SS[.frac]` into seconds
///
/// Returns `None` for anything else, including negative values.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() > 3 {
        return None;
    }

    let (whole, last) = parts.split_at(parts.len() - 1);
    let seconds = parse_decimal(last[0])?;

    let mut total = 0.0;
    for part in whole {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        total = total * 60.0 + part.parse::<f64>().ok()?;
    }

    // minutes and seconds fields are two-digit sexagesimal once a larger unit is present
    if !whole.is_empty() && seconds >= 60.0 {
        return None;
    }

    Some(total * 60.0 + seconds)
}

fn parse_decimal(value: &str) -> Option<f64> {
    let (int, frac) = match value.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (value, None),
    };

    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(int) || frac.is_some_and(|f| !digits(f)) {
        return None;
    }

    value.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_job() -> Job {
        Job::from_config(vec![Input::new("a.mp4")], &crate::Config::default())
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("00:00:10"), Some(10.0));
        assert_eq!(parse_timestamp("00:00:02.5"), Some(2.5));
        assert_eq!(parse_timestamp("01:02:03.250"), Some(3723.25));
        assert_eq!(parse_timestamp("02:03"), Some(123.0));
        assert_eq!(parse_timestamp("90"), Some(90.0));
        assert_eq!(parse_timestamp("7.5"), Some(7.5));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        for value in ["", "abc", "1:2:3:4", "-5", "00:61", "00::10", "1.", ".5", "10s", "1:-1"] {
            assert_eq!(parse_timestamp(value), None, "{:?} should be rejected", value);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_timestamp_components_sum(h in 0u32..100, m in 0u32..60, s in 0u32..60, ms in 0u32..1000) {
            let text = format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms);
            let expected = h as f64 * 3600.0 + m as f64 * 60.0 + s as f64 + ms as f64 / 1000.0;
            let parsed = parse_timestamp(&text).unwrap();
            prop_assert!((parsed - expected).abs() < 1e-6, "{} parsed as {}", text, parsed);
        }
    }

    #[test]
    fn test_size_limit_bytes_converts_mebibytes() {
        let mut job = sample_job();
        job.size_limit = 4.0;
        assert_eq!(job.size_limit_bytes(), 4 * 1024 * 1024);

        job.size_limit = 0.5;
        assert_eq!(job.size_limit_bytes(), 512 * 1024);

        job.size_limit = 0.0;
        assert_eq!(job.size_limit_bytes(), 0);
    }

    #[test]
    fn test_validate_accepts_default_job() {
        assert_eq!(sample_job().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut job = sample_job();
        job.inputs.clear();
        assert_eq!(job.validate(), Err(ValidationError::NoInputs));

        let mut job = sample_job();
        job.inputs.push(Input::new(""));
        assert_eq!(job.validate(), Err(ValidationError::EmptyInputPath(1)));

        let mut job = sample_job();
        job.output = Some(Output {
            stop_time: Some("ten".to_string()),
            ..Output::default()
        });
        assert!(matches!(job.validate(), Err(ValidationError::InvalidTimestamp { .. })));

        let mut job = sample_job();
        job.size_limit = -2.0;
        assert_eq!(job.validate(), Err(ValidationError::InvalidSizeLimit(-2.0)));

        let mut job = sample_job();
        job.cpu_used = 8;
        assert_eq!(job.validate(), Err(ValidationError::InvalidCpuUsed(8)));
    }

    #[test]
    fn test_wire_names_are_camel_case() {
        let mut job = sample_job();
        job.inputs[0].start_time = Some("00:00:01".to_string());
        job.extra_params = vec!["-c:a".to_string(), "libopus".to_string()];

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["inputs"][0]["startTime"], "00:00:01");
        assert_eq!(value["cpuUsed"], 0);
        assert_eq!(value["sizeLimit"], 4.0);
        assert_eq!(value["deadline"], "good");
        assert_eq!(value["extraParams"][1], "libopus");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
