// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// Per-session transport debug log
// One file per session, truncated on every connect

use std::fs::{self, File};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tracing::debug;

use sshtunnel_common::Session;

/// Severity of a transport trace line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// Handle to a session's debug log file; a disabled handle discards everything
#[derive(Clone, Default)]
pub struct SessionLog {
    sink: Option<Arc<LogSink>>,
}

struct LogSink {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl SessionLog {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open the debug log configured on the session, or a disabled handle if none is set
    pub fn for_session(session: &Session) -> io::Result<Self> {
        match &session.debug_log_path {
            Some(dir) if !dir.as_os_str().is_empty() => Self::create(dir, &session.name),
            _ => Ok(Self::disabled()),
        }
    }

    /// Create `<dir>/sshtunnelng-<session>.log`, replacing any previous file
    pub fn create(dir: &Path, session_name: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(log_file_name(session_name));
        let file = File::create(&path)?;
        debug!("Writing transport debug log to {}", path.display());

        Ok(Self {
            sink: Some(Arc::new(LogSink {
                path,
                writer: Mutex::new(LineWriter::new(file)),
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|s| s.path.as_path())
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let Some(sink) = &self.sink else {
            return;
        };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut writer = sink.writer.lock();
        if let Err(e) = writeln!(writer, "{} {}: {}", timestamp, level.as_str(), message.as_ref()) {
            debug!("Failed to write debug log {}: {}", sink.path.display(), e);
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    pub fn fatal(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Fatal, message);
    }
}

fn log_file_name(session_name: &str) -> String {
    let safe: String = session_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    format!("sshtunnelng-{}.log", safe)
}
