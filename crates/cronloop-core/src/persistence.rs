//! File persistence primitives
//!
//! Two shapes of durable state are used by the loop:
//! - line logs: one JSON document per line, appended or rewritten wholesale
//! - documents: a single JSON/markdown file replaced atomically
//!
//! Line logs tolerate corruption per line. A line that fails to parse is kept
//! aside as raw text and never aborts the read.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::Result;

/// Result of reading a line log
#[derive(Debug, Clone)]
pub struct JsonLines<T> {
    /// Records that parsed successfully, in file order
    pub records: Vec<T>,
    /// Raw non-blank lines that failed to parse, in file order
    pub unparsed: Vec<String>,
}

impl<T> Default for JsonLines<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            unparsed: Vec::new(),
        }
    }
}

/// Read a line log. A missing file reads as empty.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<JsonLines<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(JsonLines::default()),
        Err(e) => return Err(e.into()),
    };

    let mut lines = JsonLines::default();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => lines.records.push(record),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping unparseable record"
                );
                lines.unparsed.push(line.to_string());
            }
        }
    }

    Ok(lines)
}

/// Append records to a line log, creating it if needed
pub fn append_json_lines<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    // a torn tail must not absorb the first new record
    if !ends_with_newline(&mut file)? {
        buf.insert(0, b'\n');
    }
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// True when the file is empty or its last byte is `\n`
fn ends_with_newline(file: &mut fs::File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Rewrite a line log atomically. `trailing` raw lines are emitted verbatim
/// after the serialized records.
pub fn rewrite_json_lines<T: Serialize>(
    path: &Path,
    records: &[T],
    trailing: &[String],
) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    for line in trailing {
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
    }
    atomic_write(path, &buf)
}

/// Read a whole-file JSON document. A missing file reads as `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace a JSON document atomically, pretty-printed
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

/// Write to a temp file in the target directory, fsync, then rename over
/// the target. Readers observe either the old or the new content.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
