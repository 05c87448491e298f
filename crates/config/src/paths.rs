//! Well-known locations: config directory, log file, default video
//! directory and the control channel address.

use directories::{BaseDirs, UserDirs};
use std::path::{Path, PathBuf};

/// Name used for the config directory, the log file and the socket
pub const APP_NAME: &str = "pwebm";

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOG_FILE_NAME: &str = "pwebm.log";

#[cfg(windows)]
const PIPE_NAME: &str = r"\\.\pipe\pwebm";

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

/// `~/.config/pwebm` on every platform, matching where users of the
/// tool expect to find it
pub fn config_dir() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".config").join(APP_NAME),
        None => std::env::temp_dir().join(APP_NAME),
    }
}

pub fn config_file() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

pub fn log_file() -> PathBuf {
    config_dir().join(LOG_FILE_NAME)
}

/// The platform videos directory (`~/Videos`, `~/Movies` on macOS) with
/// an app subdirectory
pub fn default_video_dir() -> PathBuf {
    let base = UserDirs::new()
        .and_then(|dirs| dirs.video_dir().map(Path::to_path_buf))
        .or_else(|| {
            home_dir().map(|home| {
                if cfg!(target_os = "macos") {
                    home.join("Movies")
                } else {
                    home.join("Videos")
                }
            })
        })
        .unwrap_or_else(std::env::temp_dir);

    base.join(APP_NAME)
}

/// Address the resident instance listens on
///
/// A socket file in the temp directory on Unix, a named pipe on Windows.
pub fn default_socket_path() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(PIPE_NAME)
    }

    #[cfg(not(windows))]
    {
        std::env::temp_dir().join(format!("{}.sock", APP_NAME))
    }
}

/// Expand a leading `~` or `$HOME` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };

    let rest = if let Some(rest) = raw.strip_prefix('~') {
        rest
    } else if let Some(rest) = raw.strip_prefix("$HOME") {
        rest
    } else {
        return path.to_path_buf();
    };

    // `~user` is not supported, leave it alone
    if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\')) {
        return path.to_path_buf();
    }

    match home_dir() {
        Some(home) => {
            let rest = rest.trim_start_matches(['/', '\\']);
            if rest.is_empty() {
                home
            } else {
                home.join(rest)
            }
        }
        None => path.to_path_buf(),
    }
}
