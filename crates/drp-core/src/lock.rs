use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{DrpError, Result};
use crate::ensure_dir;
use crate::record::RUN_PREFIX;

/// Exclusive claims on machine groups, one file per group in a shared
/// directory. The file's existence is the claim.
///
/// A claim is published by writing the payload to a private temporary file
/// and hard-linking it to the group's name; `link(2)` refuses to replace an
/// existing name, so exactly one racing caller can win, on any host sharing
/// the directory.
#[derive(Debug, Clone)]
pub struct LockStore {
    dir: PathBuf,
}

impl LockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Opens the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(dir);
        ensure_dir(&store.dir)?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self, group: &str) -> PathBuf {
        self.dir.join(group)
    }

    /// Returns true iff this call created the claim for `group`.
    pub fn try_acquire(&self, group: &str, payload: &str) -> Result<bool> {
        let mut temp = tempfile::Builder::new()
            .prefix(".claim-")
            .tempfile_in(&self.dir)?;
        temp.write_all(payload.as_bytes())?;
        temp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o644))?;
        }

        // The temporary name is removed when `temp` drops, on every path.
        match fs::hard_link(temp.path(), self.lock_path(group)) {
            Ok(()) => {
                info!(group = %group, "machine group claimed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(group = %group, "machine group already claimed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_held(&self, group: &str) -> bool {
        self.lock_path(group).symlink_metadata().is_ok()
    }

    pub fn read(&self, group: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.lock_path(group)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends one journal line to a held claim.
    pub fn append(&self, group: &str, line: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.lock_path(group))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Moves the claim to `artifact`, freeing the group. An existing
    /// artifact is never overwritten.
    pub fn release(&self, group: &str, artifact: &Path) -> Result<()> {
        let release_err = |source| DrpError::Release {
            group: group.to_string(),
            target: artifact.to_path_buf(),
            source,
        };
        if artifact.symlink_metadata().is_ok() {
            return Err(release_err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "run log already exists",
            )));
        }
        if let Some(parent) = artifact.parent() {
            fs::create_dir_all(parent).map_err(release_err)?;
        }
        fs::rename(self.lock_path(group), artifact).map_err(release_err)?;
        info!(group = %group, artifact = %artifact.display(), "machine group released");
        Ok(())
    }

    /// Names of all current claims, sorted.
    pub fn held(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Group whose claim carries the line `Run: <run_id>`.
    pub fn find_run(&self, run_id: &str) -> Result<Option<String>> {
        let wanted = format!("{} {}", RUN_PREFIX, run_id);
        let mut matches = Vec::new();
        for group in self.held()? {
            let Some(text) = self.read(&group)? else {
                continue;
            };
            if text.lines().any(|line| line == wanted) {
                matches.push(group);
            }
        }
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(DrpError::AmbiguousRun {
                run_id: run_id.to_string(),
                groups: matches,
            }),
        }
    }
}
