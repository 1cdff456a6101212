//! Hosts-file override management.
//!
//! # Responsibilities
//! - Point registered domains at the local listener by appending marked
//!   lines (`<ip> <domain> # rewroute`) to the hosts file
//! - Keep a full snapshot of the file taken before the first write, and
//!   put it back byte-for-byte on restore
//! - Survive a crash of a previous run: an on-disk backup (or, failing that,
//!   the marker comments) identifies the pristine content
//!
//! # Design Decisions
//! - Snapshot the whole file once per process, never per domain; restore is a
//!   full rewrite, so layering order never matters
//! - One mutex guards every snapshot-and-write sequence
//! - Permission errors are returned, never swallowed

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use crate::routing::Domain;

/// Comment appended to every line this crate writes.
pub const MARKER: &str = "# rewroute";

/// First line of the backup file.
pub const BACKUP_SENTINEL: &str = "# rewroute-backup v1";

#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("permission denied writing {}: elevated privileges are required", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("backup file {} does not start with the expected sentinel", path.display())]
    CorruptBackup { path: PathBuf },
}

impl OverrideError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            OverrideError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            }
        } else {
            OverrideError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, OverrideError::PermissionDenied { .. })
    }
}

/// One active override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRecord {
    pub domain: Domain,
    pub target: IpAddr,
}

#[derive(Debug, Default)]
struct OverrideState {
    /// Pristine file content, taken on the first apply of this process.
    snapshot: Option<Vec<u8>>,
    records: Vec<OverrideRecord>,
}

/// Applies and restores hosts-file overrides.
#[derive(Debug)]
pub struct NameOverrideManager {
    hosts_path: PathBuf,
    backup_path: PathBuf,
    flush_cache: bool,
    state: Mutex<OverrideState>,
}

impl NameOverrideManager {
    pub fn new(hosts_path: impl Into<PathBuf>) -> Self {
        let hosts_path = hosts_path.into();
        let backup_path = backup_path_for(&hosts_path);
        Self {
            hosts_path,
            backup_path,
            flush_cache: false,
            state: Mutex::new(OverrideState::default()),
        }
    }

    /// Ask the OS resolver cache to flush after each write.
    pub fn with_cache_flush(mut self, enabled: bool) -> Self {
        self.flush_cache = enabled;
        self
    }

    pub fn hosts_path(&self) -> &Path {
        &self.hosts_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Redirect `domain` to `target`. Idempotent for the same pair; a new
    /// target for an already applied domain replaces the old one.
    pub fn apply(&self, domain: &Domain, target: IpAddr) -> Result<(), OverrideError> {
        self.apply_many(std::slice::from_ref(domain), target)
    }

    /// Redirect several domains with a single write.
    pub fn apply_many(&self, domains: &[Domain], target: IpAddr) -> Result<(), OverrideError> {
        let mut state = self.lock();

        let pending: Vec<&Domain> = domains
            .iter()
            .filter(|d| {
                !state
                    .records
                    .iter()
                    .any(|r| &r.domain == *d && r.target == target)
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        self.ensure_snapshot(&mut state)?;

        let previous = state.records.clone();
        for domain in pending {
            state.records.retain(|r| &r.domain != domain);
            state.records.push(OverrideRecord {
                domain: domain.clone(),
                target,
            });
        }

        if let Err(e) = self.write_current(&state) {
            state.records = previous;
            return Err(e);
        }

        tracing::info!(
            path = %self.hosts_path.display(),
            domains = ?domains.iter().map(Domain::as_str).collect::<Vec<_>>(),
            target = %target,
            "Hosts overrides applied"
        );
        Ok(())
    }

    /// Drop the override for one domain. Removing the last one restores the
    /// snapshot. Returns false if the domain was not applied.
    pub fn remove(&self, domain: &Domain) -> Result<bool, OverrideError> {
        let mut state = self.lock();
        let before = state.records.len();
        let previous = state.records.clone();
        state.records.retain(|r| &r.domain != domain);
        if state.records.len() == before {
            return Ok(false);
        }

        let result = if state.records.is_empty() {
            self.restore_locked(&mut state)
        } else {
            self.write_current(&state)
        };
        if let Err(e) = result {
            state.records = previous;
            return Err(e);
        }
        tracing::info!(domain = %domain, "Hosts override removed");
        Ok(true)
    }

    /// Put the hosts file back exactly as it was before the first apply.
    /// A no-op when this process never applied anything.
    pub fn restore_all(&self) -> Result<(), OverrideError> {
        let mut state = self.lock();
        self.restore_locked(&mut state)
    }

    /// Overrides currently in effect.
    pub fn active(&self) -> Vec<OverrideRecord> {
        self.lock().records.clone()
    }

    pub fn is_applied(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    /// Undo the leftovers of a run that never restored: rewrite from the
    /// backup if present, otherwise strip marked lines. Returns true if the
    /// file was changed.
    pub fn recover(hosts_path: &Path) -> Result<bool, OverrideError> {
        let backup_path = backup_path_for(hosts_path);
        if let Some(pristine) = read_backup(&backup_path)? {
            fs::write(hosts_path, &pristine).map_err(|e| OverrideError::from_io(hosts_path, e))?;
            remove_backup(&backup_path)?;
            tracing::info!(path = %hosts_path.display(), "Hosts file recovered from backup");
            return Ok(true);
        }

        let current = fs::read(hosts_path).map_err(|e| OverrideError::from_io(hosts_path, e))?;
        if !has_marked_lines(&current) {
            return Ok(false);
        }
        fs::write(hosts_path, strip_marked_lines(&current))
            .map_err(|e| OverrideError::from_io(hosts_path, e))?;
        tracing::info!(path = %hosts_path.display(), "Stale hosts overrides removed");
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, OverrideState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_snapshot(&self, state: &mut OverrideState) -> Result<(), OverrideError> {
        if state.snapshot.is_some() {
            return Ok(());
        }

        // A backup left behind by a crashed run is the real pristine content.
        if let Some(pristine) = read_backup(&self.backup_path)? {
            tracing::warn!(
                backup = %self.backup_path.display(),
                "Found backup from a previous run, using it as the original hosts file"
            );
            state.snapshot = Some(pristine);
            return Ok(());
        }

        let current = fs::read(&self.hosts_path).map_err(|e| OverrideError::from_io(&self.hosts_path, e))?;
        let pristine = if has_marked_lines(&current) {
            tracing::warn!(
                path = %self.hosts_path.display(),
                "Hosts file already carries rewroute entries, treating them as stale"
            );
            strip_marked_lines(&current)
        } else {
            current
        };

        let mut backup = Vec::with_capacity(pristine.len() + BACKUP_SENTINEL.len() + 1);
        backup.extend_from_slice(BACKUP_SENTINEL.as_bytes());
        backup.push(b'\n');
        backup.extend_from_slice(&pristine);
        fs::write(&self.backup_path, backup).map_err(|e| OverrideError::from_io(&self.backup_path, e))?;

        state.snapshot = Some(pristine);
        Ok(())
    }

    fn write_current(&self, state: &OverrideState) -> Result<(), OverrideError> {
        let Some(snapshot) = state.snapshot.as_deref() else {
            return Ok(());
        };
        let content = render(snapshot, &state.records);
        fs::write(&self.hosts_path, content).map_err(|e| OverrideError::from_io(&self.hosts_path, e))?;
        self.flush();
        Ok(())
    }

    fn restore_locked(&self, state: &mut OverrideState) -> Result<(), OverrideError> {
        let Some(snapshot) = state.snapshot.as_deref() else {
            return Ok(());
        };
        fs::write(&self.hosts_path, snapshot).map_err(|e| OverrideError::from_io(&self.hosts_path, e))?;
        remove_backup(&self.backup_path)?;
        state.snapshot = None;
        state.records.clear();
        self.flush();
        tracing::info!(path = %self.hosts_path.display(), "Hosts file restored");
        Ok(())
    }

    fn flush(&self) {
        if self.flush_cache {
            flush_resolver_cache();
        }
    }
}

fn backup_path_for(hosts_path: &Path) -> PathBuf {
    let mut name = hosts_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "hosts".into());
    name.push(".rewroute.bak");
    hosts_path.with_file_name(name)
}

fn read_backup(path: &Path) -> Result<Option<Vec<u8>>, OverrideError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(OverrideError::from_io(path, e)),
    };
    let header_len = BACKUP_SENTINEL.len() + 1;
    if raw.len() < header_len
        || &raw[..BACKUP_SENTINEL.len()] != BACKUP_SENTINEL.as_bytes()
        || raw[BACKUP_SENTINEL.len()] != b'\n'
    {
        return Err(OverrideError::CorruptBackup {
            path: path.to_path_buf(),
        });
    }
    Ok(Some(raw[header_len..].to_vec()))
}

fn remove_backup(path: &Path) -> Result<(), OverrideError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OverrideError::from_io(path, e)),
    }
}

fn is_marked(line: &[u8]) -> bool {
    line.trim_ascii_end().ends_with(MARKER.as_bytes())
}

fn has_marked_lines(content: &[u8]) -> bool {
    content.split(|b| *b == b'\n').any(is_marked)
}

fn strip_marked_lines(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());
    for line in content.split_inclusive(|b| *b == b'\n') {
        if !is_marked(line) {
            out.extend_from_slice(line);
        }
    }
    out
}

/// Snapshot followed by one marked line per record, in the snapshot's line
/// ending style.
fn render(snapshot: &[u8], records: &[OverrideRecord]) -> Vec<u8> {
    let newline: &[u8] = if snapshot.windows(2).any(|w| w == b"\r\n") {
        b"\r\n"
    } else {
        b"\n"
    };

    let mut out = snapshot.to_vec();
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.extend_from_slice(newline);
    }
    for record in records {
        out.extend_from_slice(format!("{} {} {}", record.target, record.domain, MARKER).as_bytes());
        out.extend_from_slice(newline);
    }
    out
}

/// Best effort; failures are logged at debug and ignored.
fn flush_resolver_cache() {
    let commands: &[(&str, &[&str])] = if cfg!(target_os = "macos") {
        &[("dscacheutil", &["-flushcache"]), ("killall", &["-HUP", "mDNSResponder"])]
    } else if cfg!(windows) {
        &[("ipconfig", &["/flushdns"])]
    } else {
        &[("resolvectl", &["flush-caches"])]
    };

    for (program, args) in commands {
        match Command::new(program).args(*args).output() {
            Ok(output) if output.status.success() => {
                tracing::debug!(program, "Resolver cache flushed");
            }
            Ok(output) => {
                tracing::debug!(program, status = %output.status, "Resolver cache flush failed");
            }
            Err(e) => {
                tracing::debug!(program, error = %e, "Resolver cache flush unavailable");
            }
        }
    }
}
