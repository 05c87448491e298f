//! pwebm entry point
//!
//! A launch either hands its job to the running main instance over the
//! control channel, or becomes the main instance itself and encodes until
//! the queue is empty.

mod args;

use args::{ArgsError, Cli, Command};
use log::{debug, error, info, warn};
use pwebm_daemon::config::{config_file, default_socket_path, log_file};
use pwebm_daemon::ipc::client;
use pwebm_daemon::{run_startup_checks, ClientError, Config, Daemon, Job, Server, ServerError, SharedStatus};
use std::fs::OpenOptions;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
const REFUSED_RETRIES: u32 = 50;
const REFUSED_RETRY_DELAY: Duration = Duration::from_millis(100);

fn usage(config: &Config) -> String {
    format!(
        "\
Usage: pwebm [options] [[infile options] -i infile]... [output options] [outfile]

Options:
  -h, --help                 Show this help message
  -v, --version              Show the version
  -kill                      Stop the main instance, discarding its queue
  -status                    Print the main instance's status as JSON
  -i <input>                 Input file; repeat for several inputs
  -ss <time>                 Start time of the next input, or of the output
  -to <time>                 Stop time of the next input, or of the output
  -lavfi <filter>            Filter graph applied to the video
  -c:v <encoder>             Video encoder (default: {encoder})
  -deadline <good|best>      libvpx deadline (default: {deadline})
  -crf <value>               Constant rate factor (default: {crf})
  -cpu-used <0-5>            libvpx speed setting (default: {cpu_used})
  -subs                      Burn the input's subtitles in (default: {subs})
  -sl, --size-limit <MiB>    Output size limit, 0 for none (default: {size_limit})
  -ep, --extra-params <...>  Pass every following argument to ffmpeg
  --video-path <dir>         Directory for generated output names (default: {video_path})
  --config <file>            Configuration file (default: {config_file})
  --no-log-file              Log to stderr instead of {log_file}

Examples:
  pwebm -i \"/tmp/Videos/nijinosaki.mkv\" -ss 00:00:02.268 -to 00:00:10.310
  pwebm -i \"/tmp/Videos/nijinosaki.mkv\" --size-limit 6 -subs --extra-params -map 0:a -c:a libopus -b:a 128k",
        encoder = config.encoder,
        deadline = config.deadline,
        crf = config.crf,
        cpu_used = config.cpu_used,
        subs = config.subs,
        size_limit = config.size_limit,
        video_path = config.video_path.display(),
        config_file = config_file().display(),
        log_file = log_file().display(),
    )
}

fn version() -> String {
    format!(
        "pwebm version {}\nLicensed under the {} License",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_LICENSE")
    )
}

/// Log to the log file unless told otherwise; `RUST_LOG` still applies
fn init_logging(no_log_file: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if no_log_file {
        builder.target(env_logger::Target::Stderr).init();
        return;
    }

    let path = log_file();
    let opened = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

    match opened {
        Ok(file) => builder.target(env_logger::Target::Pipe(Box::new(file))).init(),
        Err(e) => {
            builder.target(env_logger::Target::Stderr).init();
            warn!("Cannot open log file {}, logging to stderr: {}", path.display(), e);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, pwebm_daemon::config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load(config_file()),
    }
}

fn socket_path(config: &Config) -> PathBuf {
    config.socket_path.clone().unwrap_or_else(default_socket_path)
}

/// Rewrite the current stderr line with the latest status
async fn show_progress(status: SharedStatus) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let mut last = String::new();
    loop {
        ticker.tick().await;
        let line = status.snapshot().to_string();
        if line != last {
            let mut stderr = std::io::stderr().lock();
            let _ = write!(stderr, "\r\x1b[2K{}", line);
            let _ = stderr.flush();
            last = line;
        }
    }
}

/// What to tell the user when a request to the main instance failed
fn request_failure(e: &ClientError, action: &str) -> String {
    match e {
        ClientError::NoServer => e.to_string(),
        _ => format!("Couldn't {} the main instance", action),
    }
}

async fn kill(config: &Config) -> ExitCode {
    match client::kill(&socket_path(config)).await {
        Ok(()) => {
            println!("Main instance successfully killed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if !matches!(e, ClientError::NoServer) {
                error!("Kill request failed: {}", e);
            }
            eprintln!("{}", request_failure(&e, "kill"));
            ExitCode::FAILURE
        }
    }
}

async fn status(config: &Config) -> ExitCode {
    let status = match client::status(&socket_path(config)).await {
        Ok(status) => status,
        Err(e) => {
            if !matches!(e, ClientError::NoServer) {
                error!("Status request failed: {}", e);
            }
            eprintln!("{}", request_failure(&e, "get the status of"));
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&status) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Couldn't get the status of the main instance: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Send the job, waiting out a main instance that is shutting down
///
/// The job was validated locally, so a refusal means the instance has
/// stopped accepting work; its socket goes away once it is done.
async fn enqueue(path: &Path, job: &Job) -> Result<(), ClientError> {
    let mut refused = 0;
    loop {
        match client::enqueue(path, job.clone()).await {
            Err(ClientError::Rejected(_)) if refused < REFUSED_RETRIES => {
                refused += 1;
                debug!("Main instance refused the job, retrying ({}/{})", refused, REFUSED_RETRIES);
                tokio::time::sleep(REFUSED_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

/// Hand the job to the main instance, or become it
async fn encode(config: Config, job: Job) -> ExitCode {
    let path = socket_path(&config);

    match enqueue(&path, &job).await {
        Ok(()) => {
            info!("Job sent to the main instance");
            println!("Added to the main instance's queue");
            return ExitCode::SUCCESS;
        }
        Err(ClientError::NoServer) => {}
        Err(e) => {
            eprintln!("Couldn't send the job to the main instance: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = run_startup_checks(&config) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let server = match Server::bind(&path).await {
        Ok(server) => server,
        // another launch won the race to become the main instance
        Err(ServerError::AlreadyRunning(_)) => {
            return match enqueue(&path, &job).await {
                Ok(()) => {
                    println!("Added to the main instance's queue");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Couldn't send the job to the main instance: {}", e);
                    ExitCode::FAILURE
                }
            };
        }
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Became the main instance, listening on {}", path.display());
    let daemon = Daemon::new(config);

    let progress = std::io::stderr()
        .is_terminal()
        .then(|| tokio::spawn(show_progress(daemon.status.clone())));

    let result = daemon.run(server, job).await;

    if let Some(progress) = progress {
        progress.abort();
        eprintln!();
    }

    match result {
        Ok(summary) => {
            let code = summary.exit_code();
            if summary.report.failed > 0 {
                eprintln!("{} job(s) failed, see {} for details", summary.report.failed, log_file().display());
            }
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => {
            error!("Main instance stopped: {}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let parsed = args::parse(&argv);

    let config_path = match &parsed {
        Ok(Cli { config, .. }) => config.clone(),
        Err(_) => None,
    };
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cli = match parsed {
        Ok(cli) => cli,
        Err(e) => {
            if e.shows_usage() {
                eprintln!("{}\n", usage(&config));
            }
            eprintln!("{}", e);
            if let ArgsError::MultipleOutputs { current, new } = &e {
                eprintln!("Current: \"{}\", new: \"{}\"", current, new);
            }
            return ExitCode::FAILURE;
        }
    };

    init_logging(cli.no_log_file);

    match cli.command {
        Command::Help => {
            println!("{}", usage(&config));
            ExitCode::SUCCESS
        }
        Command::Version => {
            println!("{}", version());
            ExitCode::SUCCESS
        }
        Command::Kill => kill(&config).await,
        Command::Status => status(&config).await,
        Command::Encode(args) => {
            let job = args.into_job(&config);
            if let Err(e) = job.validate() {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
            encode(config, job).await
        }
    }
}
