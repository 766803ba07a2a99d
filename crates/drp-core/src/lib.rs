pub mod config;
pub mod env;
pub mod error;
pub mod lock;
pub mod record;

pub use config::{architecture_of, DrpConfig, HostSlot, MachineGroup, StageSpec};
pub use env::{Environment, FixedEnvironment, SystemEnvironment};
pub use error::{DrpError, Result};
pub use lock::LockStore;
pub use record::{RunHeader, RunLayout, RunOptions, RunRecord};

use chrono::{DateTime, TimeZone};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Size of the log excerpt attached to failure and status reports.
pub const TAIL_BYTES: u64 = 500;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| DrpError::Io(e.error))?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest over the compact serialization; object keys are already sorted.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("sha256:{}", sha256_bytes(&bytes))
}

/// Last `max` bytes of a file, lossily decoded.
pub fn tail_bytes(path: &Path, max: u64) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max)))?;
    let mut buf = Vec::with_capacity(max.min(len) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Journal line in `asctime` form: `Tue Oct 13 09:05:08 2026 <message>`.
pub fn journal_line<Tz: TimeZone>(at: &DateTime<Tz>, message: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{} {}", at.format("%a %b %e %H:%M:%S %Y"), message)
}

pub fn check_readable(path: &Path) -> Result<()> {
    nix::unistd::access(path, nix::unistd::AccessFlags::R_OK)
        .map_err(|_| DrpError::Unreadable(path.to_path_buf()))
}

pub fn check_writable(path: &Path) -> Result<()> {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK)
        .map_err(|_| DrpError::Unwritable(path.to_path_buf()))
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
pub fn available_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}
