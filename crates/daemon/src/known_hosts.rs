// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Known Hosts Module
// Host key verification against an OpenSSH known_hosts file

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    /// Host key is in known_hosts and matches
    Trusted,
    /// Host key is not in known_hosts (first connection)
    Unknown,
    /// Host key is in known_hosts but doesn't match (MITM warning!)
    Mismatch {
        actual_fingerprint: String,
        line_number: usize,
    },
}

/// A single entry in the known_hosts file
#[derive(Debug, Clone)]
struct KnownHostEntry {
    /// Host patterns (e.g., "192.168.1.1", "[example.com]:2222", "a.com,b.com")
    host_patterns: Vec<String>,
    /// Key type (e.g., "ssh-ed25519", "ssh-rsa", "ecdsa-sha2-nistp256")
    key_type: String,
    /// Base64-encoded public key
    key_data: String,
    /// Line number in file (for error reporting)
    line_number: usize,
}

impl KnownHostEntry {
    /// Parse a single line from known_hosts file
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        // Markers (@cert-authority, @revoked) and hashed hosts are not handled here
        if line.starts_with('@') || line.starts_with("|1|") {
            debug!("Skipping unsupported known_hosts entry at line {}", line_number);
            return None;
        }

        // Format: host_patterns key_type key_data [comment]
        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts.len() < 3 {
            warn!("Invalid known_hosts entry at line {}: too few fields", line_number);
            return None;
        }

        Some(KnownHostEntry {
            host_patterns: parts[0].split(',').map(str::to_string).collect(),
            key_type: parts[1].to_string(),
            key_data: parts[2].to_string(),
            line_number,
        })
    }

    /// Check if this entry matches the given host and port
    fn matches(&self, host: &str, port: u16) -> bool {
        let pattern = format_host_pattern(host, port);
        self.host_patterns
            .iter()
            .any(|p| *p == pattern || (port == 22 && p == host))
    }

    /// Verify if the provided key matches this entry
    fn verify_key(&self, key: &PublicKey) -> bool {
        self.key_type == key_type_to_string(key) && self.key_data == key.public_key_base64()
    }
}

/// Read-mostly view of an SSH known_hosts file
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Load known_hosts from the default location
    pub fn load() -> Result<Self> {
        let path = Self::ssh_known_hosts_path()?;
        Self::load_from(&path)
    }

    /// Load known_hosts from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();

        // A missing file is fine; the first accepted key creates it
        if path.exists() {
            let file = fs::File::open(path)
                .context(format!("Failed to open known_hosts file: {}", path.display()))?;
            let reader = BufReader::new(file);

            for (line_idx, line_result) in reader.lines().enumerate() {
                let line = line_result.context("Failed to read line from known_hosts")?;
                if let Some(entry) = KnownHostEntry::parse(&line, line_idx + 1) {
                    entries.push(entry);
                }
            }

            debug!("Loaded {} entries from known_hosts: {}", entries.len(), path.display());
        } else {
            info!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Get the system SSH known_hosts path: ~/.ssh/known_hosts
    pub fn ssh_known_hosts_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home_dir.join(".ssh").join("known_hosts"))
    }

    /// Verify a host key against known_hosts
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        let matching_entries: Vec<&KnownHostEntry> =
            self.entries.iter().filter(|e| e.matches(host, port)).collect();

        if matching_entries.is_empty() {
            return VerifyResult::Unknown;
        }

        if matching_entries.iter().any(|entry| entry.verify_key(key)) {
            return VerifyResult::Trusted;
        }

        VerifyResult::Mismatch {
            actual_fingerprint: calculate_fingerprint(key),
            line_number: matching_entries[0].line_number,
        }
    }

    /// Append a host key to the file, leaving existing lines untouched
    pub fn append(&mut self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create known_hosts directory")?;
        }

        let entry = KnownHostEntry {
            host_patterns: vec![format_host_pattern(host, port)],
            key_type: key_type_to_string(key),
            key_data: key.public_key_base64(),
            line_number: self.line_count()? + 1,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(format!("Failed to open known_hosts file: {}", self.path.display()))?;
        writeln!(file, "{}", entry.format())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, permissions)
                .context("Failed to set known_hosts file permissions")?;
        }

        info!("Added host key for {}:{} to {}", host, port, self.path.display());
        self.entries.push(entry);
        Ok(())
    }

    /// Get the path to the known_hosts file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn line_count(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let contents = fs::read_to_string(&self.path)
            .context(format!("Failed to read known_hosts file: {}", self.path.display()))?;
        Ok(contents.lines().count())
    }
}

impl KnownHostEntry {
    fn format(&self) -> String {
        format!("{} {} {}", self.host_patterns.join(","), self.key_type, self.key_data)
    }
}

/// Format host pattern for known_hosts (e.g., "host" or "[host]:port")
fn format_host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Extract the algorithm name from the key's SSH wire encoding
pub fn key_type_to_string(key: &PublicKey) -> String {
    // First 4 bytes: big-endian length of the algorithm name
    let key_bytes = key.public_key_bytes();
    if key_bytes.len() < 4 {
        return "unknown".to_string();
    }

    let len = u32::from_be_bytes([key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3]]) as usize;
    if key_bytes.len() < 4 + len {
        return "unknown".to_string();
    }

    String::from_utf8_lossy(&key_bytes[4..4 + len]).to_string()
}

/// Calculate SHA256 fingerprint of a public key
pub fn calculate_fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let result = hasher.finalize();

    // OpenSSH prints the digest unpadded
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    format!("SHA256:{}", STANDARD_NO_PAD.encode(result))
}
