// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Append-only entry log
//!
//! Layout: `"CVEV"` magic, `u32` version, then entries of
//! `[type u8][len u32 le][json payload][crc32 u32 le]`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub(crate) const LOG_MAGIC: &[u8; 4] = b"CVEV";
pub(crate) const LOG_VERSION: u32 = 1;

pub(crate) const ENTRY_DATASET: u8 = 1;
pub(crate) const ENTRY_DATASET_DELETE: u8 = 2;
pub(crate) const ENTRY_RUN: u8 = 3;
pub(crate) const ENTRY_RESULT: u8 = 4;

/// One framed entry read back from the log
pub(crate) struct RawEntry {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl RawEntry {
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        match serde_json::from_slice(&self.data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Undecodable entry of type {} in store log: {}", self.kind, e);
                None
            }
        }
    }
}

/// Frame a value for appending
pub(crate) fn encode_entry<T: Serialize>(kind: u8, value: &T) -> io::Result<Vec<u8>> {
    let data =
        serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let crc = crc32fast::hash(&data);

    let mut frame = Vec::with_capacity(data.len() + 9);
    frame.push(kind);
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&data);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Create the log with its header if it does not exist yet
pub(crate) fn init_log(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut file = File::create(path)?;
    write_header(&mut file)?;
    file.flush()
}

fn write_header<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(LOG_MAGIC)?;
    writer.write_all(&LOG_VERSION.to_le_bytes())
}

/// Append already-framed entries in one write
pub(crate) fn append_frames(path: &Path, frames: &[Vec<u8>]) -> io::Result<()> {
    let file = OpenOptions::new().append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for frame in frames {
        writer.write_all(frame)?;
    }
    writer.flush()
}

/// Replace the log with a fresh one holding only `frames`
pub(crate) fn rewrite_log(path: &Path, frames: &[Vec<u8>]) -> io::Result<()> {
    let tmp_path = path.with_extension("log.new");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        for frame in frames {
            writer.write_all(frame)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp_path, path)
}

/// Read every intact entry. A truncated tail is ignored; entries failing
/// their CRC are skipped.
pub(crate) fn read_entries(path: &Path) -> io::Result<Vec<RawEntry>> {
    let mut entries = Vec::new();
    if !path.exists() {
        return Ok(entries);
    }

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    if reader.read_exact(&mut magic).is_err() {
        return Ok(entries);
    }
    if &magic != LOG_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a convoeval store log",
        ));
    }

    let mut version_bytes = [0u8; 4];
    reader.read_exact(&mut version_bytes)?;
    let version = u32::from_le_bytes(version_bytes);
    if version != LOG_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported store log version {}", version),
        ));
    }

    loop {
        let mut kind = [0u8; 1];
        if reader.read_exact(&mut kind).is_err() {
            break;
        }

        let mut len_bytes = [0u8; 4];
        if reader.read_exact(&mut len_bytes).is_err() {
            tracing::warn!("Truncated entry header at end of store log");
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut data = vec![0u8; len];
        if reader.read_exact(&mut data).is_err() {
            tracing::warn!("Truncated entry payload at end of store log");
            break;
        }

        let mut crc_bytes = [0u8; 4];
        if reader.read_exact(&mut crc_bytes).is_err() {
            tracing::warn!("Truncated entry checksum at end of store log");
            break;
        }

        if u32::from_le_bytes(crc_bytes) != crc32fast::hash(&data) {
            tracing::warn!("CRC mismatch in store log, skipping entry");
            continue;
        }

        entries.push(RawEntry {
            kind: kind[0],
            data,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: u64,
        name: String,
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.log");
        init_log(&path).unwrap();

        let first = encode_entry(ENTRY_RUN, &Sample { id: 1, name: "a".into() }).unwrap();
        let second = encode_entry(ENTRY_RUN, &Sample { id: 2, name: "b".into() }).unwrap();
        append_frames(&path, &[first, second[..second.len() - 3].to_vec()]).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].decode::<Sample>(),
            Some(Sample { id: 1, name: "a".into() })
        );
    }

    #[test]
    fn test_corrupt_entry_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.log");
        init_log(&path).unwrap();

        let mut bad = encode_entry(ENTRY_RUN, &Sample { id: 1, name: "a".into() }).unwrap();
        let payload_byte = 6;
        bad[payload_byte] ^= 0xFF;
        let good = encode_entry(ENTRY_RUN, &Sample { id: 2, name: "b".into() }).unwrap();
        append_frames(&path, &[bad, good]).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decode::<Sample>().map(|s| s.id), Some(2));
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.log");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(read_entries(&path).is_err());
    }
}
