//! Logging setup driven by environment variables.
//!
//! The broker runs embedded in an editor host, so stderr is not always
//! visible; `BROKER_LOG_FILE` redirects everything to a file and
//! `BROKER_LOG_UNIQUE=true` keys the file name by process id for hosts
//! that run several broker instances.

use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g. "debug", "info", "analysis_broker=trace").
    pub level: String,
    /// Optional log file path. If None, logs go to stderr.
    pub file_path: Option<PathBuf>,
    /// Whether to emit structured JSON lines.
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, `BROKER_LOG_FILE`, `BROKER_LOG_JSON` and
    /// `BROKER_LOG_UNIQUE`.
    pub fn from_env() -> Self {
        let unique = env::var("BROKER_LOG_UNIQUE").unwrap_or_default() == "true";
        Self {
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            file_path: env::var("BROKER_LOG_FILE")
                .ok()
                .map(PathBuf::from)
                .map(|path| if unique { with_pid_suffix(path) } else { path }),
            json_format: env::var("BROKER_LOG_JSON").unwrap_or_default() == "true",
        }
    }

    /// Override values supplied by the embedding host.
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Insert the process id between file stem and extension, so
/// `broker.log` becomes `broker.<pid>.log`.
fn with_pid_suffix(mut path: PathBuf) -> PathBuf {
    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return path;
    };
    let pid = std::process::id();
    let file_name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{stem}.{pid}.{ext}"),
        _ => format!("{stem}.{pid}"),
    };
    path.set_file_name(file_name);
    path
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. Call once, before the first worker is
/// hired.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let registry = tracing_subscriber::registry().with(env_filter);

    // ANSI colour only makes sense on a live stderr.
    let (writer, ansi) = match &config.file_path {
        Some(path) => (BoxMakeWriter::new(open_log_file(path)?), false),
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    if config.json_format {
        let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
        registry.with(layer).init();
    } else {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);
        registry.with(layer).init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
        assert!(!config.json_format);
    }

    #[test]
    fn test_overrides_win() {
        let config = LogConfig::default().with_overrides(
            Some("debug".to_string()),
            Some(PathBuf::from("/tmp/broker.log")),
        );
        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/broker.log")));
    }

    #[test]
    fn test_pid_suffix_lands_between_stem_and_extension() {
        let pid = std::process::id();
        assert_eq!(
            with_pid_suffix(PathBuf::from("/var/log/broker.log")),
            PathBuf::from(format!("/var/log/broker.{pid}.log"))
        );
        assert_eq!(
            with_pid_suffix(PathBuf::from("/var/log/broker")),
            PathBuf::from(format!("/var/log/broker.{pid}"))
        );
    }

    #[test]
    fn test_log_file_opens_in_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
        // A second open of the same file must not fail or truncate.
        open_log_file(&path).unwrap();
    }
}
