//! Logging setup and the `plog` severity shim.
//!
//! Output goes to stdout by default, to a file when a path is configured,
//! or to the system syslog when the destination is the literal `:syslog:`.
//! The five overlay-style severities (DEBUG, INFO, NOTICE, WARN, ERROR) map
//! onto the `tracing` macros; NOTICE collapses into `info!` because tracing
//! has no notice level.
//!
//! User-visible output is one line per event of interest, prefixed by the
//! severity and a wall-clock timestamp, which is exactly what the default
//! `tracing_subscriber::fmt` layer produces.

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the logging system. Subsequent calls are no-ops.
///
/// `logfile` selects the destination: `None` for stdout, `Some(":syslog:")`
/// for syslog, any other value for an append-mode log file. An unwritable
/// log file is a fatal error.
///
/// The `RUST_LOG` environment variable overrides the configured level.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(":syslog:") => init_syslog(env_filter)?,
        Some(path) => init_file_logger(path, env_filter)?,
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

fn init_file_logger(path: &str, env_filter: EnvFilter) -> Result<()> {
    let path = Path::new(path);
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("bad log file path: {}", path.display())))?;

    // Fail now rather than at the first log line.
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let appender =
        tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), name);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(appender)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
    Ok(())
}

fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = if Path::new("/dev/log").exists() {
        "/dev/log"
    } else if Path::new("/var/run/syslog").exists() {
        "/var/run/syslog"
    } else {
        return Err(Error::Config("no syslog socket found".to_string()));
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || {
            UnixDatagram::unbound()
                .and_then(|sock| {
                    sock.connect(syslog_path)?;
                    Ok(SyslogWriter { socket: sock })
                })
                .unwrap_or_else(|_| SyslogWriter {
                    socket: UnixDatagram::unbound().unwrap(),
                })
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
    Ok(())
}

struct SyslogWriter {
    socket: UnixDatagram,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = format!("vigil: {}", String::from_utf8_lossy(buf));
        self.socket.send(msg.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Log a message at the given overlay-style severity.
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info | LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// Log a formatted message at the given severity.
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}
