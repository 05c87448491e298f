//! Command line grammar
//!
//! Mirrors ffmpeg's: options are order sensitive (`-ss`/`-to` bind to the
//! next `-i`, or to the output when no `-i` follows) and multi-character
//! flags use a single dash, so the arguments are parsed by hand.

use pwebm_daemon::config::{Deadline, MAX_CPU_USED};
use pwebm_daemon::{Config, Input, Job, Output};
use std::path::PathBuf;
use thiserror::Error;

/// Error type for rejected command lines
#[derive(Debug, Error, PartialEq)]
pub enum ArgsError {
    #[error("Unrecognized argument: {0}")]
    Unrecognized(String),

    #[error("The {0} flag requires an argument")]
    MissingValue(String),

    #[error("The {flag} flag requires a number. \"{value}\" is not a valid number")]
    InvalidNumber { flag: String, value: String },

    #[error("The {flag} flag requires a number between 0 and {max} inclusive. \"{value}\" is out of that range", max = MAX_CPU_USED)]
    OutOfRange { flag: String, value: String },

    #[error("The {flag} flag requires either \"good\" or \"best\". \"{value}\" is not a valid value")]
    InvalidDeadline { flag: String, value: String },

    #[error("Only one output file is allowed")]
    MultipleOutputs { current: String, new: String },

    #[error("Input file is required")]
    NoInput,
}

impl ArgsError {
    /// Whether the usage text should accompany the message
    pub fn shows_usage(&self) -> bool {
        matches!(self, ArgsError::Unrecognized(_) | ArgsError::NoInput)
    }
}

/// What this launch was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Version,
    Kill,
    Status,
    Encode(EncodeArgs),
}

/// Encode options as given; unset values fall back to the configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeArgs {
    pub inputs: Vec<Input>,
    pub output: Option<Output>,
    pub encoder: Option<String>,
    pub crf: Option<u32>,
    pub cpu_used: Option<u8>,
    pub deadline: Option<Deadline>,
    pub size_limit: Option<f64>,
    pub lavfi: Option<String>,
    pub subs: bool,
    pub extra_params: Vec<String>,
    pub video_path: Option<PathBuf>,
}

impl EncodeArgs {
    pub fn into_job(self, config: &Config) -> Job {
        let mut job = Job::from_config(self.inputs, config);
        job.output = self.output;
        job.lavfi = self.lavfi;
        job.subs = self.subs || config.subs;
        job.extra_params = self.extra_params;

        if let Some(encoder) = self.encoder {
            job.encoder = encoder;
        }
        if let Some(crf) = self.crf {
            job.crf = crf;
        }
        if let Some(cpu_used) = self.cpu_used {
            job.cpu_used = cpu_used;
        }
        if let Some(deadline) = self.deadline {
            job.deadline = deadline;
        }
        if let Some(size_limit) = self.size_limit {
            job.size_limit = size_limit;
        }
        if let Some(video_path) = self.video_path {
            job.video_path = Some(pwebm_daemon::config::expand_home(&video_path));
        }
        job
    }
}

/// A parsed command line
#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub command: Command,
    pub no_log_file: bool,
    pub config: Option<PathBuf>,
}

#[derive(Default)]
struct Seeking {
    start_time: Option<String>,
    stop_time: Option<String>,
}

impl Seeking {
    fn is_empty(&self) -> bool {
        self.start_time.is_none() && self.stop_time.is_none()
    }
}

/// Takes the value following `flag`, refusing another flag in its place
fn value<'a, I>(flag: &str, rest: &mut std::iter::Peekable<I>) -> Result<String, ArgsError>
where
    I: Iterator<Item = &'a String>,
{
    rest.next_if(|next| !next.starts_with('-'))
        .cloned()
        .ok_or_else(|| ArgsError::MissingValue(flag.to_string()))
}

fn number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, ArgsError> {
    raw.trim().parse().map_err(|_| ArgsError::InvalidNumber {
        flag: flag.to_string(),
        value: raw.to_string(),
    })
}

/// Parse the arguments following the program name
///
/// `-h`, `-v`, `-kill` and `-status` take effect as soon as they are
/// reached; whatever follows them is ignored.
pub fn parse(argv: &[String]) -> Result<Cli, ArgsError> {
    let mut encode = EncodeArgs::default();
    let mut seeking = Seeking::default();
    let mut no_log_file = false;
    let mut config = None;

    let mut rest = argv.iter().peekable();
    while let Some(arg) = rest.next() {
        let quick = match arg.as_str() {
            "-h" | "--help" => Some(Command::Help),
            "-v" | "--version" => Some(Command::Version),
            "-kill" => Some(Command::Kill),
            "-status" => Some(Command::Status),
            _ => None,
        };
        if let Some(command) = quick {
            return Ok(Cli {
                command,
                no_log_file,
                config,
            });
        }

        match arg.as_str() {
            "-i" => {
                let file = value(arg, &mut rest)?;
                let seek = std::mem::take(&mut seeking);
                encode.inputs.push(Input {
                    file: PathBuf::from(file),
                    start_time: seek.start_time,
                    stop_time: seek.stop_time,
                });
            }
            "-ss" => seeking.start_time = Some(value(arg, &mut rest)?),
            "-to" => seeking.stop_time = Some(value(arg, &mut rest)?),
            "-lavfi" => encode.lavfi = Some(value(arg, &mut rest)?),
            "-c:v" => encode.encoder = Some(value(arg, &mut rest)?),
            "-crf" => encode.crf = Some(number(arg, &value(arg, &mut rest)?)?),
            "-cpu-used" => {
                let raw = value(arg, &mut rest)?;
                let cpu_used: f64 = number(arg, &raw)?;
                if cpu_used.fract() != 0.0 || !(0.0..=MAX_CPU_USED as f64).contains(&cpu_used) {
                    return Err(ArgsError::OutOfRange {
                        flag: arg.clone(),
                        value: raw,
                    });
                }
                encode.cpu_used = Some(cpu_used as u8);
            }
            "-deadline" => {
                let raw = value(arg, &mut rest)?;
                let deadline = raw.parse().map_err(|_| ArgsError::InvalidDeadline {
                    flag: arg.clone(),
                    value: raw.clone(),
                })?;
                encode.deadline = Some(deadline);
            }
            "-subs" => encode.subs = true,
            "-sl" | "--size-limit" => {
                let raw = value(arg, &mut rest)?;
                let limit: f64 = number(arg, &raw)?;
                if !limit.is_finite() {
                    return Err(ArgsError::InvalidNumber {
                        flag: arg.clone(),
                        value: raw,
                    });
                }
                encode.size_limit = Some(limit);
            }
            "--video-path" => encode.video_path = Some(PathBuf::from(value(arg, &mut rest)?)),
            "--config" => config = Some(PathBuf::from(value(arg, &mut rest)?)),
            "--no-log-file" => no_log_file = true,
            "-ep" | "--extra-params" => {
                if rest.peek().is_none() {
                    return Err(ArgsError::MissingValue(arg.clone()));
                }
                encode.extra_params = rest.by_ref().cloned().collect();
            }
            flag if flag.starts_with('-') => return Err(ArgsError::Unrecognized(flag.to_string())),
            file => {
                let output = encode.output.get_or_insert_with(Output::default);
                if let Some(current) = &output.file {
                    return Err(ArgsError::MultipleOutputs {
                        current: current.display().to_string(),
                        new: file.to_string(),
                    });
                }
                output.file = Some(PathBuf::from(file));
            }
        }
    }

    // seeking not followed by an input applies to the output
    if !seeking.is_empty() {
        let output = encode.output.get_or_insert_with(Output::default);
        output.start_time = seeking.start_time;
        output.stop_time = seeking.stop_time;
    }

    if encode.inputs.is_empty() {
        return Err(ArgsError::NoInput);
    }

    Ok(Cli {
        command: Command::Encode(encode),
        no_log_file,
        config,
    })
}
