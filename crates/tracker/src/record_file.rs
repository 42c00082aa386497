use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use log::{info, warn};
use thiserror::Error;
use timeline::{IntervalMerger, TimeInterval};

/// File signature
pub const MAGIC: &[u8; 5] = b"DTIME";

/// Layout version written by this build
pub const FORMAT_VERSION: u32 = 0;

// Each interval is two little-endian u64
const INTERVAL_SIZE: usize = 16;

/// Errors raised while reading or writing the record file
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("not a record file (bad magic)")]
    BadMagic,

    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u32),

    #[error("record truncated while reading {0}")]
    Truncated(&'static str),

    #[error("invalid text in {0}")]
    InvalidName(&'static str),

    #[error("invalid interval {start}..{end}")]
    InvalidInterval { start: u64, end: u64 },

    #[error("{0} too large to encode")]
    TooLarge(&'static str),

    #[error("record file is in use, {} is held by another tracker", .0.display())]
    Locked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Persisted state of one group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRecord {
    pub name: String,
    pub process_names: BTreeSet<String>,
    pub merged: IntervalMerger,
}

/// Everything written at shutdown and read back at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub groups: Vec<GroupRecord>,
    pub selected: Option<String>,
}

fn encoded_len(len: usize, what: &'static str) -> Result<u32, RecordError> {
    u32::try_from(len).map_err(|_| RecordError::TooLarge(what))
}

fn read_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, RecordError> {
    if buf.remaining() < 4 {
        return Err(RecordError::Truncated(what));
    }
    Ok(buf.get_u32_le())
}

fn read_narrow_string(buf: &mut &[u8], what: &'static str) -> Result<String, RecordError> {
    let len = read_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(RecordError::Truncated(what));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| RecordError::InvalidName(what))
}

fn read_wide_string(buf: &mut &[u8], what: &'static str) -> Result<String, RecordError> {
    let len = read_u32(buf, what)? as usize;
    if buf.remaining() / 2 < len {
        return Err(RecordError::Truncated(what));
    }
    let units: Vec<u16> = (0..len).map(|_| buf.get_u16_le()).collect();
    String::from_utf16(&units).map_err(|_| RecordError::InvalidName(what))
}

fn put_narrow_string(out: &mut BytesMut, value: &str, what: &'static str) -> Result<(), RecordError> {
    out.put_u32_le(encoded_len(value.len(), what)?);
    out.put_slice(value.as_bytes());
    Ok(())
}

fn put_wide_string(out: &mut BytesMut, value: &str, what: &'static str) -> Result<(), RecordError> {
    let units: Vec<u16> = value.encode_utf16().collect();
    out.put_u32_le(encoded_len(units.len(), what)?);
    for unit in units {
        out.put_u16_le(unit);
    }
    Ok(())
}

impl Record {
    /// Serializes the record to its little-endian binary layout
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let mut out = BytesMut::new();
        out.put_slice(MAGIC);
        out.put_u32_le(FORMAT_VERSION);
        out.put_u32_le(encoded_len(self.groups.len(), "group count")?);

        for group in &self.groups {
            put_narrow_string(&mut out, &group.name, "group name")?;

            out.put_u32_le(encoded_len(group.process_names.len(), "process count")?);
            for process_name in &group.process_names {
                put_wide_string(&mut out, process_name, "process name")?;
            }

            let merged = group.merged.as_slice();
            out.put_u32_le(encoded_len(merged.len(), "interval count")?);
            for interval in merged {
                out.put_u64_le(interval.start);
                out.put_u64_le(interval.end);
            }
        }

        put_narrow_string(
            &mut out,
            self.selected.as_deref().unwrap_or(""),
            "selected group name",
        )?;
        Ok(out.to_vec())
    }

    /// Parses a record, validating every length against the remaining input.
    ///
    /// Stored intervals are folded through [`IntervalMerger`] so the history is
    /// sorted and disjoint even if the file was not.
    pub fn decode(mut buf: &[u8]) -> Result<Self, RecordError> {
        if buf.remaining() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            return Err(RecordError::BadMagic);
        }
        buf.advance(MAGIC.len());

        let version = read_u32(&mut buf, "format version")?;
        if version != FORMAT_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }

        let group_count = read_u32(&mut buf, "group count")?;
        let mut groups = Vec::new();
        for _ in 0..group_count {
            let name = read_narrow_string(&mut buf, "group name")?;

            let process_count = read_u32(&mut buf, "process count")?;
            let mut process_names = BTreeSet::new();
            for _ in 0..process_count {
                let process_name = read_wide_string(&mut buf, "process name")?;
                if !process_name.is_empty() {
                    process_names.insert(process_name.to_lowercase());
                }
            }

            let interval_count = read_u32(&mut buf, "interval count")? as usize;
            if buf.remaining() / INTERVAL_SIZE < interval_count {
                return Err(RecordError::Truncated("intervals"));
            }
            let mut merged = IntervalMerger::new();
            for _ in 0..interval_count {
                let start = buf.get_u64_le();
                let end = buf.get_u64_le();
                let interval = TimeInterval::try_new(start, end)
                    .map_err(|_| RecordError::InvalidInterval { start, end })?;
                merged.insert(interval);
            }

            groups.push(GroupRecord {
                name,
                process_names,
                merged,
            });
        }

        let selected = read_narrow_string(&mut buf, "selected group name")?;
        Ok(Self {
            groups,
            selected: Some(selected).filter(|name| !name.is_empty()),
        })
    }

    /// Reads the record file; `Ok(None)` when it does not exist yet
    pub fn load(path: &Path) -> Result<Option<Self>, RecordError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Self::decode(&data).map(Some)
    }

    /// Writes the record file through a temporary file and a rename
    pub fn save(&self, path: &Path) -> Result<(), RecordError> {
        create_parent_dir(path)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.encode()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn create_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Path of the lock file guarding a record file
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive `flock` on `<record>.lock`, released when dropped.
///
/// `run` holds it for its whole lifetime, group edits while they rewrite the file.
#[derive(Debug)]
pub struct RecordLock {
    _file: File,
}

impl RecordLock {
    pub fn acquire(record_path: &Path) -> Result<Self, RecordError> {
        let path = lock_path(record_path);
        create_parent_dir(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(RecordError::Locked(path));
            }
            return Err(err.into());
        }
        Ok(Self { _file: file })
    }
}

/// Path a corrupt record is moved to
pub fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

/// Loads the record at startup.
///
/// A missing file yields an empty record. A malformed file is moved aside and
/// an empty record is returned so the next save does not destroy it.
pub fn load_or_recover(path: &Path) -> Result<Record> {
    match Record::load(path) {
        Ok(Some(record)) => {
            info!(
                "Loaded {} groups from {}",
                record.groups.len(),
                path.display()
            );
            Ok(record)
        }
        Ok(None) => {
            info!("No record at {}, starting empty", path.display());
            Ok(Record::default())
        }
        Err(RecordError::Io(err)) => {
            Err(err).with_context(|| format!("Failed to read record file {}", path.display()))
        }
        Err(err) => {
            let aside = corrupt_path(path);
            warn!(
                "Record file {} is corrupt ({}), moving it to {} and starting empty",
                path.display(),
                err,
                aside.display()
            );
            fs::rename(path, &aside)
                .with_context(|| format!("Failed to move corrupt record to {}", aside.display()))?;
            Ok(Record::default())
        }
    }
}
