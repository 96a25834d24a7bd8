pub mod codec;
pub mod config;
pub mod errors;
pub mod fsm;
pub mod listener;
pub mod logging;
pub mod parser;
pub mod record;
pub mod reporter;
pub mod transport;
pub mod types;

use clap::{error::ErrorKind, Parser, Subcommand};
use codec::Framing;
use config::{load_config, AppConfig, CliOverrides};
use errors::ResultsError;
use listener::{ListenerEvent, RecordingListener};
use logging::{append_run_log, init_run_logger, JsonlLogger};
use parser::ResultParser;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use transport::{replay_file, PeriodicFileReader, StreamReceiver};
use types::ContextHandle;

const TAIL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Parser)]
#[command(name = "proto-results")]
#[command(about = "Replay structured test results from files or a live stream")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long = "log-path", global = true)]
    pub log_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Replay a results file and print the listener calls it produces.
    Replay {
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        subprocess: bool,
        #[arg(long, default_value_t = false)]
        delimited: bool,
    },
    /// Replay the numbered files written by a periodic sink.
    Tail {
        prefix: PathBuf,
        #[arg(long, default_value_t = false)]
        subprocess: bool,
        #[arg(long, default_value_t = false)]
        delimited: bool,
        /// Keep polling for new files until the invocation ends or this many
        /// milliseconds pass.
        #[arg(long = "wait-ms", default_value_t = 0)]
        wait_ms: u64,
    },
    /// Listen for a live stream and print the listener calls it produces.
    Receive {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
        #[arg(long, default_value_t = false)]
        subprocess: bool,
    },
}

pub fn run() -> Result<i32, ResultsError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with_args(&args, &mut out)
}

pub fn run_with_args(args: &[std::ffi::OsString], out: &mut dyn Write) -> Result<i32, ResultsError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write!(out, "{error}").map_err(|e| ResultsError::Io(e.to_string()))?;
                return Ok(0);
            }
            _ => return Err(ResultsError::Cli(error.to_string())),
        },
    };

    let cfg = load_config(&overrides_for(&cli))?;
    if let Some(path) = &cfg.logging.path {
        init_run_logger(JsonlLogger {
            path: path.clone(),
            max_payload_bytes: cfg.logging.max_payload_bytes,
            budget_bytes: cfg.logging.budget_bytes,
        });
    }

    match &cli.command {
        Command::Replay { file, .. } => {
            let mut parser = new_parser(&cfg);
            replay_file(file, cfg.output.framing(), &mut parser)?;
            finish(parser, "replay", out)
        }
        Command::Tail {
            prefix, wait_ms, ..
        } => {
            let mut parser = new_parser(&cfg);
            let mut reader = PeriodicFileReader::new(prefix.clone(), cfg.output.framing());
            let deadline = Instant::now() + Duration::from_millis(*wait_ms);
            loop {
                reader.poll(&mut parser)?;
                if parser.invocation_ended_reported() || Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(TAIL_POLL);
            }
            if reader.next_index() == 0 {
                return Err(ResultsError::Io(format!(
                    "no periodic files found for {}",
                    prefix.display()
                )));
            }
            finish(parser, "tail", out)
        }
        Command::Receive { .. } => {
            let mut receiver = StreamReceiver::start(new_parser(&cfg), &cfg.stream.receiver_options())?;
            writeln!(out, "listening on {}", receiver.port())
                .and_then(|_| out.flush())
                .map_err(|e| ResultsError::Io(e.to_string()))?;
            if !receiver.join_receiver(cfg.stream.join_timeout()) {
                receiver.close();
            }
            let parser = receiver.into_parser()?;
            finish(parser, "receive", out)
        }
    }
}

fn overrides_for(cli: &Cli) -> CliOverrides {
    let mut overrides = CliOverrides {
        config_path: cli.config.clone(),
        log_path: cli.log_path.clone(),
        ..CliOverrides::default()
    };
    match &cli.command {
        Command::Replay {
            subprocess,
            delimited,
            ..
        }
        | Command::Tail {
            subprocess,
            delimited,
            ..
        } => {
            overrides.subprocess = *subprocess;
            overrides.delimited = delimited.then_some(true);
        }
        Command::Receive {
            port,
            timeout_ms,
            subprocess,
        } => {
            overrides.port = *port;
            overrides.join_timeout_ms = *timeout_ms;
            overrides.subprocess = *subprocess;
        }
    }
    overrides
}

fn new_parser(cfg: &AppConfig) -> ResultParser<RecordingListener> {
    ResultParser::new(
        RecordingListener::new(),
        ContextHandle::default(),
        cfg.parser.report_invocation,
    )
}

/// Closes anything the input left open, then prints one JSON line per
/// replayed call. Rejected frames are reported on stderr.
fn finish(
    mut parser: ResultParser<RecordingListener>,
    command: &str,
    out: &mut dyn Write,
) -> Result<i32, ResultsError> {
    let interrupted = !parser.invocation_ended_reported();
    parser.complete_module_events()?;
    let errors = parser.take_errors();
    for err in &errors {
        eprintln!("warning: {err}");
    }

    let events: Vec<ListenerEvent> = parser.listener().events();
    for event in &events {
        let line = serde_json::to_string(event).map_err(|e| ResultsError::Io(e.to_string()))?;
        writeln!(out, "{line}").map_err(|e| ResultsError::Io(e.to_string()))?;
    }
    append_run_log(
        "info",
        "cli.finished",
        json!({
            "command": command,
            "events": events.len(),
            "errors": errors.len(),
            "interrupted": interrupted,
        }),
    );

    if events.is_empty() && !errors.is_empty() {
        return Err(ResultsError::Decode(format!(
            "no records could be replayed ({} rejected)",
            errors.len()
        )));
    }
    Ok(0)
}
