//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::paths::{default_video_dir, expand_home};

/// Highest `-cpu-used` value accepted by libvpx in good/best deadline mode
pub const MAX_CPU_USED: u8 = 5;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its accepted range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// libvpx deadline: `good` is the sensible default, `best` squeezes
/// out more compression at a large time cost
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Deadline {
    #[default]
    Good,
    Best,
}

impl Deadline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deadline::Good => "good",
            Deadline::Best => "best",
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Deadline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(Deadline::Good),
            "best" => Ok(Deadline::Best),
            other => Err(format!(
                "deadline must be either \"good\" or \"best\", got \"{}\"",
                other
            )),
        }
    }
}

fn default_encoder() -> String {
    "libvpx-vp9".to_string()
}

fn default_crf() -> u32 {
    24
}

fn default_size_limit() -> f64 {
    4.0
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

/// Main configuration structure
///
/// Every field has a default so an empty or missing config file is valid.
/// Values here are the defaults for command-line options; flags given on
/// the command line always win.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Video encoder passed to `-c:v`
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// Constant rate factor used while encoding in quality mode
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// libvpx `-cpu-used` (0..=5)
    pub cpu_used: u8,
    pub deadline: Deadline,
    /// Output size limit in MiB, 0 disables the limit
    #[serde(default = "default_size_limit")]
    pub size_limit: f64,
    /// Burn the first input's subtitles into the output
    pub subs: bool,
    /// Directory for outputs when no output file is given
    #[serde(default = "default_video_dir")]
    pub video_path: PathBuf,
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
    /// Overrides the control channel address
    pub socket_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encoder: default_encoder(),
            crf: default_crf(),
            cpu_used: 0,
            deadline: Deadline::default(),
            size_limit: default_size_limit(),
            subs: false,
            video_path: default_video_dir(),
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
            socket_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.video_path = expand_home(&config.video_path);
        config.socket_path = config.socket_path.as_deref().map(expand_home);
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - PWEBM_ENCODER -> encoder
    /// - PWEBM_CRF -> crf
    /// - PWEBM_CPU_USED -> cpu_used
    /// - PWEBM_DEADLINE -> deadline
    /// - PWEBM_SIZE_LIMIT -> size_limit
    /// - PWEBM_VIDEO_PATH -> video_path
    /// - PWEBM_FFMPEG -> ffmpeg_bin
    /// - PWEBM_FFPROBE -> ffprobe_bin
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PWEBM_ENCODER") {
            if !val.trim().is_empty() {
                self.encoder = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("PWEBM_CRF") {
            if let Ok(crf) = val.parse::<u32>() {
                self.crf = crf;
            }
        }

        if let Ok(val) = env::var("PWEBM_CPU_USED") {
            if let Ok(cpu_used) = val.parse::<u8>() {
                self.cpu_used = cpu_used;
            }
        }

        if let Ok(val) = env::var("PWEBM_DEADLINE") {
            if let Ok(deadline) = val.to_lowercase().parse::<Deadline>() {
                self.deadline = deadline;
            }
        }

        if let Ok(val) = env::var("PWEBM_SIZE_LIMIT") {
            if let Ok(limit) = val.parse::<f64>() {
                self.size_limit = limit;
            }
        }

        if let Ok(val) = env::var("PWEBM_VIDEO_PATH") {
            if !val.is_empty() {
                self.video_path = expand_home(Path::new(&val));
            }
        }

        if let Ok(val) = env::var("PWEBM_FFMPEG") {
            if !val.is_empty() {
                self.ffmpeg_bin = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("PWEBM_FFPROBE") {
            if !val.is_empty() {
                self.ffprobe_bin = PathBuf::from(val);
            }
        }
    }

    /// Reject values that parse but can never produce a valid encode
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_used > MAX_CPU_USED {
            return Err(ConfigError::Invalid(format!(
                "cpu_used must be between 0 and {} inclusive, got {}",
                MAX_CPU_USED, self.cpu_used
            )));
        }

        if !self.size_limit.is_finite() || self.size_limit < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "size_limit must be a non-negative number, got {}",
                self.size_limit
            )));
        }

        if self.encoder.trim().is_empty() {
            return Err(ConfigError::Invalid("encoder must not be empty".to_string()));
        }

        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    ///
    /// A missing file is not an error: the defaults are used instead.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for var in [
            "PWEBM_ENCODER",
            "PWEBM_CRF",
            "PWEBM_CPU_USED",
            "PWEBM_DEADLINE",
            "PWEBM_SIZE_LIMIT",
            "PWEBM_VIDEO_PATH",
            "PWEBM_FFMPEG",
            "PWEBM_FFPROBE",
        ] {
            env::remove_var(var);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_fields(
            crf in 0u32..64,
            cpu_used in 0u8..=MAX_CPU_USED,
            best in proptest::bool::ANY,
            size_limit in 0.0f64..64.0,
            subs in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
encoder = "libvpx"
crf = {}
cpu_used = {}
deadline = "{}"
size_limit = {:?}
subs = {}
video_path = "/srv/videos"
"#,
                crf,
                cpu_used,
                if best { "best" } else { "good" },
                size_limit,
                subs,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.encoder.as_str(), "libvpx");
            prop_assert_eq!(config.crf, crf);
            prop_assert_eq!(config.cpu_used, cpu_used);
            prop_assert_eq!(config.deadline, if best { Deadline::Best } else { Deadline::Good });
            prop_assert!((config.size_limit - size_limit).abs() < 1e-9);
            prop_assert_eq!(config.subs, subs);
            prop_assert_eq!(&config.video_path, &PathBuf::from("/srv/videos"));
            prop_assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("empty TOML should parse");
        assert_eq!(config.encoder, "libvpx-vp9");
        assert_eq!(config.crf, 24);
        assert_eq!(config.cpu_used, 0);
        assert_eq!(config.deadline, Deadline::Good);
        assert_eq!(config.size_limit, 4.0);
        assert!(!config.subs);
        assert_eq!(config.ffmpeg_bin, PathBuf::from("ffmpeg"));
        assert_eq!(config.ffprobe_bin, PathBuf::from("ffprobe"));
        assert!(config.socket_path.is_none());
    }

    #[test]
    fn test_unknown_deadline_is_a_parse_error() {
        let result = Config::parse_toml("deadline = \"realtime\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let config = Config {
            cpu_used: 6,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            size_limit: -1.0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            size_limit: f64::NAN,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("config.toml")).unwrap();
        assert_eq!(config.encoder, Config::default().encoder);
        assert_eq!(config.crf, Config::default().crf);
    }

    #[test]
    fn test_load_reads_file_and_applies_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "crf = 30\nsize_limit = 6\n").unwrap();

        env::set_var("PWEBM_CRF", "18");
        env::set_var("PWEBM_DEADLINE", "BEST");
        env::set_var("PWEBM_CPU_USED", "not-a-number");

        let config = Config::load(&path).unwrap();
        clear_env_vars();

        assert_eq!(config.crf, 18);
        assert_eq!(config.deadline, Deadline::Best);
        assert_eq!(config.cpu_used, 0);
        assert_eq!(config.size_limit, 6.0);
    }

    #[test]
    fn test_load_rejects_invalid_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::tempdir().unwrap();
        env::set_var("PWEBM_CPU_USED", "9");
        let result = Config::load(dir.path().join("config.toml"));
        clear_env_vars();

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_reports_broken_toml() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "crf = [").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_deadline_from_str() {
        assert_eq!("good".parse::<Deadline>(), Ok(Deadline::Good));
        assert_eq!("best".parse::<Deadline>(), Ok(Deadline::Best));
        assert!("fast".parse::<Deadline>().is_err());
    }
}
