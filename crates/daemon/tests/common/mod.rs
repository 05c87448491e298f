//! Shared fixtures: shell-script stand-ins for ffmpeg and ffprobe

#![allow(dead_code)]

use async_trait::async_trait;
use pwebm_daemon::encode::Encoder;
use pwebm_daemon::job::{Input, Job, Output};
use pwebm_daemon::probe::{ProbeData, ProbeError, ProbeFormat, Prober};
use pwebm_daemon::status::{new_shared_status, Status};
use pwebm_daemon::Config;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

/// Argument parsing shared by every fake ffmpeg
///
/// Each invocation appends `pass=<n> bitrate=<b:v>` to the log and its
/// `-passlogfile` prefix, if any, to a second log. Bodies can
/// call `emit SIZE MICROS STATE` to print a progress block and
/// `fill BYTES` to write the output file.
const PRELUDE: &str = r#"
pass=""; bitrate=""; passlog=""; prev=""; out=""
for arg in "$@"; do
  case "$prev" in
    -pass) pass="$arg" ;;
    -b:v) bitrate="$arg" ;;
    -passlogfile) passlog="$arg" ;;
  esac
  prev="$arg"
  out="$arg"
done
emit() { printf 'total_size=%s\nout_time_us=%s\nprogress=%s\n' "$1" "$2" "$3"; }
fill() { head -c "$1" /dev/zero > "$out"; }
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

pub struct FakeFfmpeg {
    pub path: PathBuf,
    log: PathBuf,
    pass_log: PathBuf,
}

impl FakeFfmpeg {
    /// `first`, `quality` and `bitrate` are the script bodies for the
    /// analysis pass, quality-mode output passes (single pass included)
    /// and bitrate-mode output passes
    pub fn new(dir: &Path, first: &str, quality: &str, bitrate: &str) -> Self {
        let log = dir.join("ffmpeg.log");
        let pass_log = dir.join("passlog.log");
        let body = format!(
            "{prelude}\necho \"pass=$pass bitrate=$bitrate\" >> '{log}'\n\
             if [ -n \"$passlog\" ]; then echo \"$passlog\" >> '{pass_log}'; fi\n\
             if [ \"$pass\" = \"1\" ]; then\n: > \"$passlog-0.log\"\n{first}\nexit 0\nfi\n\
             if [ -z \"$bitrate\" ] || [ \"$bitrate\" = \"0\" ]; then\n{quality}\nelse\n{bitrate}\nfi\n",
            prelude = PRELUDE,
            log = log.display(),
            pass_log = pass_log.display(),
            first = first,
            quality = quality,
            bitrate = bitrate,
        );
        let path = write_script(dir, "ffmpeg", &body);
        Self { path, log, pass_log }
    }

    /// Every invocation so far, in order
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// `-passlogfile` prefix of every invocation that had one, in order
    pub fn pass_logs(&self) -> Vec<PathBuf> {
        fs::read_to_string(&self.pass_log)
            .map(|log| log.lines().map(PathBuf::from).collect())
            .unwrap_or_default()
    }

    pub fn encoder(&self, dir: &Path, duration: f64) -> Encoder {
        Encoder::with_prober(
            self.path.clone(),
            Arc::new(FixedDuration(duration)),
            dir.join("videos"),
            new_shared_status(),
        )
    }
}

/// Prober reporting the same duration for every file
pub struct FixedDuration(pub f64);

#[async_trait]
impl Prober for FixedDuration {
    async fn probe(&self, _path: &Path) -> Result<ProbeData, ProbeError> {
        Ok(ProbeData {
            format: ProbeFormat {
                format_name: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
                format_long_name: None,
                duration: Some(self.0),
                size: None,
                start_time: None,
            },
            streams: Vec::new(),
        })
    }
}

/// A job for `a.mp4` writing to `<dir>/<name>`
pub fn job(dir: &Path, name: &str, size_limit_mib: f64) -> Job {
    let mut job = Job::from_config(vec![Input::new("a.mp4")], &Config::default());
    job.size_limit = size_limit_mib;
    job.output = Some(Output {
        file: Some(dir.join(name)),
        ..Output::default()
    });
    job
}

/// Poll `status` until `predicate` holds, failing after ten seconds
pub async fn wait_for_status<F>(status: &pwebm_daemon::SharedStatus, predicate: F) -> Status
where
    F: Fn(&Status) -> bool,
{
    let poll = async {
        loop {
            let snapshot = status.snapshot();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("status never reached the expected stage")
}
