// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tamper-evident audit log.
//!
//! One JSON object per line, keys sorted at every depth, each entry carrying
//! `prev_hash` (the previous entry's hash, empty for the first line) and
//! `hash` (SHA-256 over the entry without its own `hash` field). Appends take
//! an exclusive advisory file lock and re-read the last line inside the
//! critical section, so the chain stays intact even when several processes
//! write the same file.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Audit event tags. One entry is written per stage of every governed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEvent {
    /// A tool call was requested, with all inputs.
    Intent,
    /// The kernel denied the call.
    Denied,
    /// The twin executed the call for real.
    Executed,
    /// The twin executed the call in simulation.
    Simulated,
    /// A human-approval task was created.
    ApprovalRequested,
    /// A task was approved.
    Approved,
    /// A task was rejected.
    Rejected,
    /// Waiting for approval timed out.
    Timeout,
    /// Execution failed.
    Error,
    /// A policy was loaded; the `source` field says whether it was signed,
    /// unsigned, or the built-in default.
    PolicyLoaded,
}

impl AuditEvent {
    /// Stable snake_case tag written to the log.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Denied => "denied",
            Self::Executed => "executed",
            Self::Simulated => "simulated",
            Self::ApprovalRequested => "approval_requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::PolicyLoaded => "policy_loaded",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ambient request context folded into every entry.
///
/// Threaded explicitly from the HTTP layer down; never process-global.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    /// Request correlation id.
    pub request_id: Option<String>,
    /// Authenticated subject.
    pub subject: Option<String>,
}

/// Domain fields attached to an audit entry.
#[derive(Debug, Clone, Default)]
pub struct AuditFields(Map<String, Value>);

impl AuditFields {
    /// Start an empty field set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a field. Values failing serialization are silently skipped.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value)
            && !v.is_null()
        {
            self.0.insert(key.into(), v);
        }
        self
    }
}

/// Errors from audit-log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Filesystem failure; the entry is not considered written.
    #[error("audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Entry could not be serialized.
    #[error("audit entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result of a chain verification walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Whether every line checked out.
    pub valid: bool,
    /// 1-based numbers of broken lines (bad link, bad hash, or unparseable).
    pub broken_lines: Vec<usize>,
}

/// Append-only hash-chained JSONL log.
pub struct AuditLog {
    path: PathBuf,
    prev_hash: Mutex<String>,
}

impl AuditLog {
    /// Open (or create) the log at `path`, recovering the last hash if the
    /// file already has entries.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors creating the parent directory or reading
    /// an existing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let prev_hash = if path.exists() {
            last_hash(&path)?
        } else {
            String::new()
        };
        Ok(Self {
            path,
            prev_hash: Mutex::new(prev_hash),
        })
    }

    /// Path of the underlying JSONL file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one hash-chained entry and return its hash.
    ///
    /// The write happens under an exclusive advisory lock; the actual
    /// `prev_hash` is re-read from the file inside the critical section
    /// because another process may have appended since our last write.
    ///
    /// # Errors
    ///
    /// [`AuditError`] on I/O or serialization failure; the entry is then not
    /// considered written and the in-memory chain head is left untouched.
    pub fn append(
        &self,
        event: AuditEvent,
        fields: AuditFields,
        ctx: &AuditContext,
    ) -> Result<String, AuditError> {
        let mut entry = fields.0;
        entry.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
        entry.insert("event".into(), Value::String(event.as_str().into()));
        if let Some(request_id) = &ctx.request_id
            && !entry.contains_key("request_id")
        {
            entry.insert("request_id".into(), Value::String(request_id.clone()));
        }
        if let Some(subject) = &ctx.subject
            && !entry.contains_key("subject")
        {
            entry.insert("subject".into(), Value::String(subject.clone()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = self.append_locked(&mut file, entry);
        let _ = FileExt::unlock(&file);
        let hash = result?;

        let mut prev = self.prev_hash.lock().unwrap_or_else(|e| e.into_inner());
        *prev = hash.clone();
        debug!(event = %event, "audit entry written");
        Ok(hash)
    }

    fn append_locked(
        &self,
        file: &mut File,
        mut entry: Map<String, Value>,
    ) -> Result<String, AuditError> {
        let on_disk = read_last_hash(file)?;
        let prev_hash = if on_disk.is_empty() {
            self.prev_hash
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        } else {
            on_disk
        };
        entry.insert("prev_hash".into(), Value::String(prev_hash));

        let hash = compute_hash(&entry)?;
        entry.insert("hash".into(), Value::String(hash.clone()));

        let line = serde_json::to_string(&Value::Object(entry))?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(hash)
    }

    /// Re-walk the whole file and verify the chain.
    ///
    /// Each line's `prev_hash` must equal the prior line's `hash` and its
    /// stored `hash` must equal the recomputed one. Unparseable lines
    /// (including a truncated final line) are reported as broken but are not
    /// fatal.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors reading the file.
    pub fn verify_chain(&self) -> Result<ChainReport, AuditError> {
        if !self.path.exists() {
            return Ok(ChainReport {
                valid: true,
                broken_lines: Vec::new(),
            });
        }
        let content = fs::read_to_string(&self.path)?;
        let mut broken = Vec::new();
        let mut prev_hash = String::new();
        for (index, line) in content.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(Value::Object(mut entry)) = serde_json::from_str::<Value>(line) else {
                broken.push(line_no);
                continue;
            };
            let link_ok = entry.get("prev_hash").and_then(Value::as_str) == Some(&prev_hash);
            let stored = entry
                .remove("hash")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let recomputed = compute_hash(&entry)?;
            if !link_ok || stored != recomputed {
                broken.push(line_no);
            }
            prev_hash = stored;
        }
        Ok(ChainReport {
            valid: broken.is_empty(),
            broken_lines: broken,
        })
    }
}

/// SHA-256 over the sorted-key JSON rendering of the entry without `hash`.
fn compute_hash(entry: &Map<String, Value>) -> Result<String, AuditError> {
    // serde_json's Map is BTree-backed, so nested objects already serialize
    // with sorted keys.
    let canonical = serde_json::to_string(&Value::Object(entry.clone()))?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{digest:x}"))
}

fn read_last_hash(file: &mut File) -> Result<String, AuditError> {
    file.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(extract_last_hash(&content))
}

fn last_hash(path: &Path) -> Result<String, AuditError> {
    Ok(extract_last_hash(&fs::read_to_string(path)?))
}

fn extract_last_hash(content: &str) -> String {
    content
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<Value>(l).ok())
        .and_then(|v| v.get("hash").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}
