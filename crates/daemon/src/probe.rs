//! Media probing through the external `ffprobe` executable
//!
//! Only the handful of fields the encoder needs are decoded; everything
//! else in ffprobe's JSON output is ignored.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probing operations
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be started
    #[error("Failed to run ffprobe for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ffprobe exited with non-zero status
    #[error("ffprobe failed for {path}: {stderr}")]
    Failed { path: PathBuf, stderr: String },

    /// ffprobe output was not the JSON we expected
    #[error("Failed to parse ffprobe output for {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The container reports no usable duration
    #[error("No duration reported for {0}")]
    MissingDuration(PathBuf),
}

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProbeData {
    pub format: ProbeFormat,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

/// Container-level metadata
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProbeFormat {
    pub format_name: String,
    #[serde(default)]
    pub format_long_name: Option<String>,
    /// Container duration in seconds
    #[serde(default, deserialize_with = "numeric_string")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "numeric_string")]
    pub size: Option<f64>,
    #[serde(default)]
    pub start_time: Option<String>,
}

/// Stream-level metadata, discriminated by `codec_type`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "codec_type", rename_all = "lowercase")]
pub enum ProbeStream {
    Video {
        index: u32,
        codec_name: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        pix_fmt: Option<String>,
    },
    Audio {
        index: u32,
        codec_name: Option<String>,
    },
    Subtitle {
        index: u32,
        codec_name: Option<String>,
    },
    Attachment {
        index: u32,
        #[serde(default)]
        codec_name: Option<String>,
    },
    #[serde(other)]
    Other,
}

impl ProbeData {
    pub fn video_streams(&self) -> impl Iterator<Item = &ProbeStream> {
        self.streams
            .iter()
            .filter(|s| matches!(s, ProbeStream::Video { .. }))
    }

    pub fn has_subtitles(&self) -> bool {
        self.streams
            .iter()
            .any(|s| matches!(s, ProbeStream::Subtitle { .. }))
    }
}

/// ffprobe reports numbers as strings (`"60.000000"`), and `"N/A"` when unknown
fn numeric_string<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(s)) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Some(Raw::Number(n)) => Some(n),
        None => None,
    })
}

/// Parse ffprobe's `-print_format json` output
pub fn parse_probe_output(path: &Path, json: &[u8]) -> Result<ProbeData, ProbeError> {
    serde_json::from_slice(json).map_err(|source| ProbeError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Anything that can report a media file's container duration
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeData, ProbeError>;

    /// Container duration in seconds
    async fn duration(&self, path: &Path) -> Result<f64, ProbeError> {
        self.probe(path)
            .await?
            .format
            .duration
            .ok_or_else(|| ProbeError::MissingDuration(path.to_path_buf()))
    }
}

/// `Prober` backed by the ffprobe executable
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    bin: PathBuf,
}

impl FfprobeProber {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<ProbeData, ProbeError> {
        debug!("Probing {} with {}", path.display(), self.bin.display());

        let output = Command::new(&self.bin)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_probe_output(path, &output.stdout)
    }
}
