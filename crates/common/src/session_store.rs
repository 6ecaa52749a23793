// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Session Store Module
// Reads and writes the sessions file shared by the daemon and its front-ends

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::Session;

/// On-disk layout: a list of `[[session]]` tables
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default, rename = "session")]
    sessions: Vec<Session>,
}

/// Get the default sessions file path: ~/.config/sshtunnel-ng/sessions.toml
pub fn default_sessions_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(config_dir.join("sshtunnel-ng").join("sessions.toml"))
}

/// Load all sessions from a sessions file
///
/// A missing file yields an empty list. Sessions that fail validation are
/// skipped with a warning, as are later duplicates of an already loaded name.
pub fn load_sessions(path: &Path) -> Result<Vec<Session>> {
    if !path.exists() {
        debug!("Sessions file does not exist: {}", path.display());
        return Ok(Vec::new());
    }

    let contents =
        fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    let file: SessionFile =
        toml::from_str(&contents).context(format!("Failed to parse {}", path.display()))?;

    let mut sessions: Vec<Session> = Vec::with_capacity(file.sessions.len());
    for session in file.sessions {
        if let Err(e) = session.validate() {
            warn!("Skipping invalid session: {}", e);
            continue;
        }
        if sessions.iter().any(|s| s.name == session.name) {
            warn!("Skipping duplicate session name: {}", session.name);
            continue;
        }
        debug!("Loaded session: {}", session);
        sessions.push(session);
    }

    Ok(sessions)
}

/// Find a single session by its name
pub fn find_session<'a>(sessions: &'a [Session], name: &str) -> crate::Result<&'a Session> {
    sessions
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| Error::SessionNotFound(name.to_string()))
}

/// Save sessions to disk, rejecting duplicate names
pub fn save_sessions(path: &Path, sessions: &[Session]) -> Result<()> {
    for (idx, session) in sessions.iter().enumerate() {
        session.validate()?;
        if sessions[..idx].iter().any(|s| s.name == session.name) {
            return Err(Error::SessionExists(session.name.clone()).into());
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create sessions directory")?;
    }

    let file = SessionFile {
        sessions: sessions.to_vec(),
    };
    let contents = toml::to_string_pretty(&file).context("Failed to serialize sessions")?;

    fs::write(path, contents)
        .context(format!("Failed to write sessions to {}", path.display()))?;

    // Sessions may carry passwords and passphrases
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set sessions file permissions")?;
    }

    debug!("Saved {} sessions to {}", sessions.len(), path.display());
    Ok(())
}
