use crate::codec::Framing;
use crate::errors::ResultsError;
use crate::logging::{DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::transport::ReceiverOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub join_timeout_ms: Option<u64>,
    pub subprocess: bool,
    pub delimited: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub output: OutputConfig,
    pub stream: StreamConfig,
    pub parser: ParserConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    /// Results files and socket streams are varint-delimited frames.
    pub delimited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub join_timeout_ms: u64,
    pub frame_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParserConfig {
    pub report_invocation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig { delimited: false },
            stream: StreamConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                join_timeout_ms: 60_000,
                frame_buffer: 32,
            },
            parser: ParserConfig {
                report_invocation: true,
            },
            logging: LoggingConfig {
                path: None,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl OutputConfig {
    pub fn framing(&self) -> Framing {
        if self.delimited {
            Framing::Delimited
        } else {
            Framing::Single
        }
    }
}

impl StreamConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            host: self.host.clone(),
            port: self.port,
            frame_buffer: self.frame_buffer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    output: Option<PartialOutputConfig>,
    stream: Option<PartialStreamConfig>,
    parser: Option<PartialParserConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialOutputConfig {
    delimited: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialStreamConfig {
    host: Option<String>,
    port: Option<u16>,
    join_timeout_ms: Option<u64>,
    frame_buffer: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialParserConfig {
    report_invocation: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

pub fn load_config(overrides: &CliOverrides) -> Result<AppConfig, ResultsError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let partial = read_partial_config(path)?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_partial_config(path: &Path) -> Result<PartialAppConfig, ResultsError> {
    let file_contents = std::fs::read_to_string(path)
        .map_err(|e| ResultsError::Io(format!("{}: {e}", path.display())))?;
    toml::from_str(&file_contents).map_err(|e| ResultsError::ConfigParse(e.to_string()))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(output) = partial.output {
        if let Some(delimited) = output.delimited {
            cfg.output.delimited = delimited;
        }
    }

    if let Some(stream) = partial.stream {
        if let Some(host) = stream.host {
            cfg.stream.host = host;
        }
        if let Some(port) = stream.port {
            cfg.stream.port = port;
        }
        if let Some(value) = stream.join_timeout_ms {
            cfg.stream.join_timeout_ms = value;
        }
        if let Some(value) = stream.frame_buffer {
            cfg.stream.frame_buffer = value;
        }
    }

    if let Some(parser) = partial.parser {
        if let Some(report_invocation) = parser.report_invocation {
            cfg.parser.report_invocation = report_invocation;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.log_path {
        cfg.logging.path = Some(path.clone());
    }
    if let Some(port) = overrides.port {
        cfg.stream.port = port;
    }
    if let Some(timeout) = overrides.join_timeout_ms {
        cfg.stream.join_timeout_ms = timeout;
    }
    if let Some(delimited) = overrides.delimited {
        cfg.output.delimited = delimited;
    }
    if overrides.subprocess {
        cfg.parser.report_invocation = false;
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), ResultsError> {
    if cfg.stream.frame_buffer == 0 {
        return Err(ResultsError::InvalidConfig(
            "stream.frame_buffer must be greater than zero".to_string(),
        ));
    }
    if cfg.stream.host.trim().is_empty() {
        return Err(ResultsError::InvalidConfig(
            "stream.host must not be empty".to_string(),
        ));
    }
    if cfg.stream.join_timeout_ms == 0 {
        return Err(ResultsError::InvalidConfig(
            "stream.join_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.logging.max_payload_bytes == 0 {
        return Err(ResultsError::InvalidConfig(
            "logging.max_payload_bytes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("results.toml");
        std::fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = load_config(&CliOverrides::default()).expect("defaults");
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.output.framing(), Framing::Single);
        assert_eq!(cfg.stream.receiver_options(), ReceiverOptions::default());
    }

    #[test]
    fn file_values_merge_over_defaults_and_cli_wins() {
        let (_dir, path) = write_config(
            r#"
[output]
delimited = true

[stream]
port = 4100
frame_buffer = 8
"#,
        );
        let cfg = load_config(&CliOverrides {
            config_path: Some(path),
            port: Some(4200),
            subprocess: true,
            ..CliOverrides::default()
        })
        .expect("config");

        assert_eq!(cfg.output.framing(), Framing::Delimited);
        assert_eq!(cfg.stream.port, 4200);
        assert_eq!(cfg.stream.frame_buffer, 8);
        assert_eq!(cfg.stream.host, "127.0.0.1");
        assert!(!cfg.parser.report_invocation);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let (_dir, path) = write_config("[stream]\nframe_buffer = 0\n");
        let err = load_config(&CliOverrides {
            config_path: Some(path),
            ..CliOverrides::default()
        })
        .expect_err("zero buffer");
        assert!(matches!(err, ResultsError::InvalidConfig(message) if message.contains("frame_buffer")));

        let (_dir, path) = write_config("[logging]\nmax_payload_bytes = 0\n");
        let err = load_config(&CliOverrides {
            config_path: Some(path),
            ..CliOverrides::default()
        })
        .expect_err("zero payload limit");
        assert!(matches!(err, ResultsError::InvalidConfig(message) if message.contains("max_payload_bytes")));
    }

    #[test]
    fn cli_delimited_flag_overrides_the_file() {
        let (_dir, path) = write_config("[output]\ndelimited = true\n");
        let cfg = load_config(&CliOverrides {
            config_path: Some(path),
            delimited: Some(false),
            ..CliOverrides::default()
        })
        .expect("config");
        assert_eq!(cfg.output.framing(), Framing::Single);
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let (_dir, path) = write_config("[stream]\nbogus = 1\n");
        let err = load_config(&CliOverrides {
            config_path: Some(path),
            ..CliOverrides::default()
        })
        .expect_err("unknown key");
        assert!(matches!(err, ResultsError::ConfigParse(_)));
    }
}
