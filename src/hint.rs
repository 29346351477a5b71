//! The hint-file codec.
//!
//! The hint file `keydir.cask` is a textual snapshot of the keydir,
//! written on writer close and read back on open to spare a cold start
//! from scanning segments. One line per entry:
//!
//! ```text
//! key file_id value_size value_position timestamp-rfc3339
//! ```
//!
//! Keys are raw bytes and may not contain whitespace; writes enforce
//! this. The file is replaced atomically (write to a temp file, then
//! rename) so a failed rewrite never destroys the previous snapshot. A
//! malformed line rejects the whole file rather than being skipped
//! silently.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::keydir::{KeyDir, KeyDirEntry};

/// Name of the hint file inside the datastore directory.
pub const HINT_FILE: &str = "keydir.cask";

pub fn hint_path(dir: &Path) -> PathBuf {
    dir.join(HINT_FILE)
}

/// Writes the keydir to the hint file, replacing any previous one.
pub fn write(dir: &Path, keydir: &KeyDir) -> Result<()> {
    let tmp = dir.join(format!("{HINT_FILE}.new"));
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        for (key, entry) in keydir.iter() {
            w.write_all(key)?;
            writeln!(
                w,
                " {} {} {} {}",
                entry.file_id,
                entry.value_len,
                entry.value_pos,
                rfc3339(entry.timestamp)
            )?;
        }
        w.flush()?;
    }
    fs::rename(&tmp, hint_path(dir))?;
    Ok(())
}

/// Reads the hint file back into a keydir. Returns `None` when no hint
/// file exists; any malformed line rejects the whole file.
pub fn read(dir: &Path) -> Result<Option<KeyDir>> {
    let file = match File::open(hint_path(dir)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut keydir = KeyDir::new();
    let mut r = BufReader::new(file);
    let mut line = Vec::new();
    let mut lineno = 0;
    loop {
        line.clear();
        lineno += 1;
        if r.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let (key, entry) = parse_line(&line)
            .map_err(|msg| Error::CorruptRecord(format!("hint file line {lineno}: {msg}")))?;
        keydir.upsert(key, entry);
    }
    Ok(Some(keydir))
}

/// Parses one hint line. The key is everything up to the first space and
/// may be arbitrary non-whitespace bytes; the remaining fields are ASCII.
fn parse_line(line: &[u8]) -> std::result::Result<(Vec<u8>, KeyDirEntry), String> {
    let sp = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| "missing fields".to_string())?;
    let key = line[..sp].to_vec();
    if key.is_empty() {
        return Err("empty key".to_string());
    }

    let rest = std::str::from_utf8(&line[sp + 1..]).map_err(|_| "non-ascii metadata".to_string())?;
    let mut fields = rest.split(' ');
    let file_id = parse_field::<u64>(fields.next(), "file id")?;
    let value_len = parse_field::<u32>(fields.next(), "value size")?;
    let value_pos = parse_field::<u64>(fields.next(), "value position")?;
    let timestamp = match fields.next() {
        Some(field) => parse_rfc3339(field)?,
        None => return Err("missing timestamp".to_string()),
    };
    if fields.next().is_some() {
        return Err("trailing fields".to_string());
    }

    Ok((key, KeyDirEntry { file_id, value_len, value_pos, timestamp }))
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
    name: &str,
) -> std::result::Result<T, String> {
    field
        .ok_or_else(|| format!("missing {name}"))?
        .parse()
        .map_err(|_| format!("malformed {name}"))
}

fn rfc3339(timestamp: u32) -> String {
    match DateTime::<Utc>::from_timestamp(i64::from(timestamp), 0) {
        Some(t) => t.to_rfc3339(),
        // Unreachable: every u32 is a representable number of seconds.
        None => String::new(),
    }
}

fn parse_rfc3339(field: &str) -> std::result::Result<u32, String> {
    let t = DateTime::parse_from_rfc3339(field).map_err(|_| "malformed timestamp".to_string())?;
    u32::try_from(t.timestamp()).map_err(|_| "timestamp out of range".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_id: u64, value_len: u32, value_pos: u64, timestamp: u32) -> KeyDirEntry {
        KeyDirEntry { file_id, value_len, value_pos, timestamp }
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        let mut keydir = KeyDir::new();
        keydir.upsert(b"name".to_vec(), entry(1716051797000001, 5, 19, 1716051797));
        keydir.upsert(b"other".to_vec(), entry(1716051797000002, 0, 20, 0));
        keydir.upsert(vec![0xff, 0x01], entry(3, 1, 17, 42));

        write(dir.path(), &keydir).unwrap();
        assert_eq!(read(dir.path()).unwrap(), Some(keydir));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        assert_eq!(read(dir.path()).unwrap(), None);
    }

    #[test]
    fn write_leaves_no_temp_file_behind() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        let mut keydir = KeyDir::new();
        keydir.upsert(b"key".to_vec(), entry(1, 5, 19, 42));

        write(dir.path(), &keydir).unwrap();
        assert!(hint_path(dir.path()).exists());
        assert!(!dir.path().join("keydir.cask.new").exists());
    }

    #[test]
    fn write_replaces_the_previous_snapshot() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        let mut keydir = KeyDir::new();
        keydir.upsert(b"old".to_vec(), entry(1, 5, 19, 42));
        write(dir.path(), &keydir).unwrap();

        let mut keydir = KeyDir::new();
        keydir.upsert(b"new".to_vec(), entry(2, 5, 19, 42));
        write(dir.path(), &keydir).unwrap();

        let read_back = read(dir.path()).unwrap().unwrap();
        assert!(read_back.lookup(b"old").is_none());
        assert!(read_back.lookup(b"new").is_some());
    }

    #[test]
    fn any_malformed_line_rejects_the_whole_file() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        fs::write(
            hint_path(dir.path()),
            "good 1 5 19 1970-01-01T00:00:42+00:00\nbad 1 50 0 3\n",
        )
        .unwrap();
        assert!(matches!(read(dir.path()), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn missing_fields_reject_the_file() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        fs::write(hint_path(dir.path()), "key 1 5\n").unwrap();
        assert!(matches!(read(dir.path()), Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn duplicate_keys_keep_the_last_line() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        fs::write(
            hint_path(dir.path()),
            "key 1 5 19 1970-01-01T00:00:42+00:00\nkey 2 5 19 1970-01-01T00:00:42+00:00\n",
        )
        .unwrap();
        let keydir = read(dir.path()).unwrap().unwrap();
        assert_eq!(keydir.lookup(b"key").unwrap().file_id, 2);
    }
}
