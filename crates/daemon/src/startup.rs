//! Startup checks
//!
//! Run before a launch becomes the resident instance: both external
//! tools must be runnable, otherwise every queued job would fail.

use crate::config::Config;
use log::info;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} is not available: {reason}")]
    ToolUnavailable { tool: &'static str, reason: String },
}

/// Extract the version token from `<tool> -version` output
///
/// Handles release builds (`ffmpeg version 7.1 ...`), git builds
/// (`ffmpeg version n7.1-12-gabcdef ...`) and distro suffixes
/// (`ffmpeg version 6.1.1-3ubuntu5 ...`); the leading `n` is dropped.
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool);
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let lower = line.to_lowercase();
    let start = lower.find(&marker)? + marker.len();
    let token = lower[start..].split_whitespace().next()?;

    let token = token.strip_prefix('n').unwrap_or(token);
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Check that `<bin> -version` runs and reports a version
///
/// Returns the version token for logging.
pub fn check_tool_available(tool: &'static str, bin: &Path) -> Result<String, StartupError> {
    let output = Command::new(bin)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool,
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", bin.display(), e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool,
            reason: format!("{} -version exited with {}", bin.display(), output.status),
        });
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let version = parse_tool_version(&version_output, tool).unwrap_or_else(|| "unknown".to_string());
    Ok(version)
}

/// Run all startup checks in order: ffmpeg, then ffprobe
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let ffmpeg = check_tool_available("ffmpeg", &cfg.ffmpeg_bin)?;
    info!("Using ffmpeg {} ({})", ffmpeg, cfg.ffmpeg_bin.display());

    let ffprobe = check_tool_available("ffprobe", &cfg.ffprobe_bin)?;
    info!("Using ffprobe {} ({})", ffprobe, cfg.ffprobe_bin.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_missing_tool_is_reported() {
        let result = check_tool_available("ffmpeg", Path::new("/nonexistent/pwebm-ffmpeg"));
        match result {
            Err(StartupError::ToolUnavailable { tool, reason }) => {
                assert_eq!(tool, "ffmpeg");
                assert!(reason.contains("/nonexistent/pwebm-ffmpeg"));
            }
            other => panic!("expected ToolUnavailable, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_is_reported() {
        let result = check_tool_available("ffprobe", Path::new("false"));
        assert!(matches!(result, Err(StartupError::ToolUnavailable { tool: "ffprobe", .. })));
    }

    #[test]
    fn test_parse_distro_version() {
        let output = "ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023 the FFmpeg developers\nbuilt with gcc 13";
        assert_eq!(parse_tool_version(output, "ffmpeg"), Some("6.1.1-3ubuntu5".to_string()));
        assert_eq!(parse_tool_version(output, "ffprobe"), None);
        assert_eq!(parse_tool_version("", "ffmpeg"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing_standard(
            tool in prop::sample::select(vec!["ffmpeg", "ffprobe"]),
            major in 1u32..20,
            minor in 0u32..10,
        ) {
            let output = format!(
                "{} version {}.{} Copyright (c) 2000-2024 the FFmpeg developers\nconfiguration: --enable-gpl",
                tool, major, minor
            );
            prop_assert_eq!(parse_tool_version(&output, tool), Some(format!("{}.{}", major, minor)));
        }

        #[test]
        fn prop_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let output = format!("ffprobe version n{}.{}-123-g{} Copyright (c) 2007-2024", major, minor, git_hash);
            prop_assert_eq!(
                parse_tool_version(&output, "ffprobe"),
                Some(format!("{}.{}-123-g{}", major, minor, git_hash))
            );
        }
    }
}
