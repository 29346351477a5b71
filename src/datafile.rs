//! Data segment files and the append cursor.
//!
//! A datastore directory holds a set of append-only segment files named
//! `<id>.cask`, where ids increase monotonically. One segment is active
//! and receives appends; once rotated away it is immutable until a merge
//! deletes it. Only writers create or extend segments.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::Result;
use crate::record;

/// File extension of data segments, shared with the hint file.
pub const SEGMENT_EXTENSION: &str = "cask";

/// Segments are readable and writable by their owner only.
const SEGMENT_MODE: u32 = 0o600;

/// Returns the path of the segment with the given id inside `dir`.
pub fn segment_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{file_id}.{SEGMENT_EXTENSION}"))
}

/// Allocates segment ids from a microsecond clock. Allocations within
/// the same microsecond, or after a backwards clock step, bump past the
/// previous id so names never collide during rapid rotation.
#[derive(Debug, Default)]
struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    fn next(&mut self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// An open segment receiving appends.
#[derive(Debug)]
struct Segment {
    file: File,
    id: u64,
    cursor: u64,
}

impl Segment {
    /// Appends raw record bytes and returns the offset they were written
    /// at. The write is flushed before returning, so the on-disk length
    /// always matches the cursor.
    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let mut w = BufWriter::with_capacity(bytes.len(), &self.file);
        w.write_all(bytes)?;
        w.flush()?;
        let pos = self.cursor;
        self.cursor += bytes.len() as u64;
        Ok(pos)
    }
}

/// Owns the active segment of a writable datastore: the file handle, the
/// append cursor, and rotation when a record would push the segment past
/// the size bound.
#[derive(Debug)]
pub struct DataFiles {
    dir: PathBuf,
    max_file_size: u64,
    ids: IdAllocator,
    active: Segment,
}

impl DataFiles {
    /// Opens a fresh active segment in `dir`. Ids resume past any
    /// existing segment so a reopened datastore never reuses a name.
    pub fn create(dir: &Path, max_file_size: u64) -> Result<Self> {
        let mut ids = IdAllocator::default();
        if let Some(&max_id) = list_segments(dir)?.last() {
            ids.last = max_id;
        }
        let active = open_segment(dir, &mut ids)?;
        Ok(Self { dir: dir.to_path_buf(), max_file_size, ids, active })
    }

    pub fn active_id(&self) -> u64 {
        self.active.id
    }

    /// Appends an encoded record to the active segment, rotating first
    /// when the record would push it past the size bound. Returns the id
    /// of the hosting segment and the offset of the value within it.
    pub fn append(&mut self, bytes: &[u8], key_len: usize) -> Result<(u64, u64)> {
        if self.active.cursor > 0 && self.active.cursor + bytes.len() as u64 > self.max_file_size {
            self.rotate()?;
        }
        let start = self.active.append(bytes)?;
        Ok((self.active.id, start + (record::HEADER_SIZE + key_len) as u64))
    }

    /// Closes the active segment and opens a fresh one.
    pub fn rotate(&mut self) -> Result<()> {
        self.active = open_segment(&self.dir, &mut self.ids)?;
        Ok(())
    }

    /// Flushes the active segment to stable storage.
    pub fn sync(&self) -> Result<()> {
        Ok(self.active.file.sync_all()?)
    }

    /// Starts a merge output stream in the same directory, subject to
    /// the same rotation rule as the active segment.
    pub fn begin_merge(&mut self) -> Result<MergeOutput<'_>> {
        let segment = open_segment(&self.dir, &mut self.ids)?;
        let ids = vec![segment.id];
        Ok(MergeOutput { files: self, segment, ids })
    }
}

/// Write stream for the segments produced by a merge.
#[derive(Debug)]
pub struct MergeOutput<'a> {
    files: &'a mut DataFiles,
    segment: Segment,
    ids: Vec<u64>,
}

impl MergeOutput<'_> {
    /// Appends an encoded record, rotating to a new merge segment when
    /// it would push the current one past the size bound. Returns the
    /// hosting segment id and the offset of the value within it.
    pub fn append(&mut self, bytes: &[u8], key_len: usize) -> Result<(u64, u64)> {
        if self.segment.cursor > 0
            && self.segment.cursor + bytes.len() as u64 > self.files.max_file_size
        {
            self.segment = open_segment(&self.files.dir, &mut self.files.ids)?;
            self.ids.push(self.segment.id);
        }
        let start = self.segment.append(bytes)?;
        Ok((self.segment.id, start + (record::HEADER_SIZE + key_len) as u64))
    }

    /// Finishes the stream, returning the ids of every segment written.
    pub fn finish(self) -> Vec<u64> {
        self.ids
    }
}

fn open_segment(dir: &Path, ids: &mut IdAllocator) -> Result<Segment> {
    let id = ids.next();
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(SEGMENT_MODE)
        .open(segment_path(dir, id))?;
    Ok(Segment { file, id, cursor: 0 })
}

/// Reads exactly `len` bytes at `offset` from the segment with the given
/// id, opening it for the duration of the read only. Short reads and
/// open failures surface as I/O errors.
pub fn read_value(dir: &Path, file_id: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
    let mut file = File::open(segment_path(dir, file_id))?;
    let mut value = vec![0; len as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut value)?;
    Ok(value)
}

/// Returns the ids of every data segment in `dir` in ascending order.
/// The hint file and lock sentinels are not segments and are skipped.
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(id) = stem.parse::<u64>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
