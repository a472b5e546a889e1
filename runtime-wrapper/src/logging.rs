//! Tracing setup for the wrapper binary.
//!
//! The wrapper's stdout and stderr belong to containerd, so logs go to a
//! file. Writes are synchronous: the process image is replaced right after
//! the last record, and a background writer would lose the tail.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::WrapperConfig;
use crate::constants::logging::DEFAULT_LEVEL;

/// Where log records ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    Stderr,
}

/// Install the global subscriber. Never fails: a broken log file falls back
/// to stderr, a broken filter falls back to the default level.
pub fn init(config: &WrapperConfig) -> LogTarget {
    let env_filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|e| {
        eprintln!(
            "sgs-runtime-wrapper: invalid log level '{}': {}",
            config.log_level, e
        );
        EnvFilter::new(DEFAULT_LEVEL)
    });

    let (writer, target) = match open_log_file(&config.log_file) {
        Ok(appender) => (
            BoxMakeWriter::new(appender),
            LogTarget::File(config.log_file.clone()),
        ),
        Err(e) => {
            eprintln!(
                "sgs-runtime-wrapper: failed to open log file {}: {}",
                config.log_file.display(),
                e
            );
            (BoxMakeWriter::new(io::stderr), LogTarget::Stderr)
        }
    };

    if let Err(e) = install(env_filter, writer) {
        eprintln!("sgs-runtime-wrapper: failed to install log subscriber: {}", e);
    }

    target
}

/// Set the global fmt subscriber. Fails if one is already set.
fn install(
    env_filter: EnvFilter,
    writer: BoxMakeWriter,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .try_init()
}

/// Open `path` for appending. Created 0600: records carry spec paths and
/// runtime arguments.
pub fn open_log_file(path: &Path) -> io::Result<RollingFileAppender> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name"))?
        .to_string_lossy()
        .into_owned();

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(|e| io::Error::other(e.to_string()))
}
