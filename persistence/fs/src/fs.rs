// BiPact: execution core for two-party off-chain contracts
//
// SPDX-License-Identifier: Apache-2.0
//
// Designed in 2024-2025 by the BiPact developers
// Written in 2024-2025 by the BiPact developers
//
// Copyright (C) 2024-2025 BiPact developers.
// All rights under the above copyrights are reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//        http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Filesystem store for BiPact contract runtimes.
//!
//! Records are appended to a single log file; the latest record under each key wins. The key index
//! is kept in memory and rebuilt from the log on open.

#[macro_use]
extern crate amplify;

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use binfile::BinFile;
use bipact::Store;
use parking_lot::Mutex;

const LOG_MAGIC: u64 = u64::from_be_bytes(*b"BIPACTDB");
const BACKUP_MAGIC: u64 = u64::from_be_bytes(*b"BIPACTBK");

const VERSION_0: u16 = 0;

const HEADER_LEN: u64 = 10;

#[derive(Debug, Error, From)]
pub enum FsError {
    #[from]
    Io(io::Error),

    Magic(PathBuf),

    Version(u16),

    KeyTooLong(usize),

    ValueTooLarge(usize),

    InvalidKey(u64),
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Io(e) => Display::fmt(e, f),
            FsError::Magic(path) => write!(f, "file '{}' is not a BiPact store", path.display()),
            FsError::Version(v) => write!(f, "unsupported store version {v}"),
            FsError::KeyTooLong(len) => write!(f, "record key is too long ({len} bytes)"),
            FsError::ValueTooLarge(len) => write!(f, "record value is too large ({len} bytes)"),
            FsError::InvalidKey(offset) => write!(f, "invalid UTF-8 record key at offset {offset}"),
        }
    }
}

struct Log {
    file: File,
    /// Offset of the value length for each key.
    index: BTreeMap<String, u64>,
}

/// Append-only file store.
pub struct FileStore {
    path: PathBuf,
    log: Mutex<Log>,
}

impl FileStore {
    const FILENAME_LOG: &'static str = "runtime.log";

    /// Opens the store in the given directory, creating it if needed.
    ///
    /// A truncated record at the end of the log, left by an interrupted write, is dropped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FsError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let log_path = path.join(Self::FILENAME_LOG);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&log_path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(&LOG_MAGIC.to_be_bytes())?;
            file.write_all(&VERSION_0.to_le_bytes())?;
            file.sync_all()?;
            tracing::info!(path = %log_path.display(), "created new store");
        } else {
            let mut magic = [0u8; 8];
            let mut version = [0u8; 2];
            file.read_exact(&mut magic)
                .map_err(|_| FsError::Magic(log_path.clone()))?;
            file.read_exact(&mut version)
                .map_err(|_| FsError::Magic(log_path.clone()))?;
            if u64::from_be_bytes(magic) != LOG_MAGIC {
                return Err(FsError::Magic(log_path));
            }
            let version = u16::from_le_bytes(version);
            if version != VERSION_0 {
                return Err(FsError::Version(version));
            }
        }

        let index = Self::scan(&mut file)?;
        tracing::debug!(path = %log_path.display(), keys = index.len(), "store opened");
        Ok(Self { path, log: Mutex::new(Log { file, index }) })
    }

    fn scan(file: &mut File) -> Result<BTreeMap<String, u64>, FsError> {
        let len = file.metadata()?.len();
        let mut pos = file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut index = BTreeMap::new();
        let mut truncated = false;
        {
            let mut reader = io::BufReader::new(&mut *file);
            loop {
                match read_frame(&mut reader, pos) {
                    Ok(Some((key, value))) => {
                        let value_pos = pos + 2 + key.len() as u64;
                        pos = value_pos + 4 + value.len() as u64;
                        index.insert(key, value_pos);
                    }
                    Ok(None) => break,
                    Err(FsError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                        truncated = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        if truncated {
            tracing::warn!(offset = pos, dropped = len - pos, "dropping truncated record at the end of the log");
            file.set_len(pos)?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(index)
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn len(&self) -> usize { self.log.lock().index.len() }

    pub fn is_empty(&self) -> bool { self.log.lock().index.is_empty() }

    /// Writes the latest value of each record into a backup file.
    ///
    /// # Returns
    ///
    /// Number of exported records.
    pub fn backup(&self, dest: impl AsRef<Path>) -> Result<usize, FsError> {
        let records = self.batch_read("")?;
        let mut file = BinFile::<BACKUP_MAGIC, VERSION_0>::create_new(dest.as_ref())?;
        file.write_all(&(records.len() as u64).to_le_bytes())?;
        for (key, value) in &records {
            write_frame(&mut file, key, value)?;
        }
        file.flush()?;
        tracing::info!(dest = %dest.as_ref().display(), records = records.len(), "store backup written");
        Ok(records.len())
    }

    /// Imports all records from a backup file, replacing records under the same keys.
    pub fn restore(&self, src: impl AsRef<Path>) -> Result<usize, FsError> {
        let mut file = io::BufReader::new(BinFile::<BACKUP_MAGIC, VERSION_0>::open(src.as_ref())?);
        let mut count = [0u8; 8];
        file.read_exact(&mut count)?;
        let count = u64::from_le_bytes(count);
        let mut pos = 8u64;
        for _ in 0..count {
            let (key, value) = read_frame(&mut file, pos)?.ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            pos += 6 + key.len() as u64 + value.len() as u64;
            self.write(&key, &value)?;
        }
        tracing::info!(src = %src.as_ref().display(), records = count, "store restored from backup");
        Ok(count as usize)
    }
}

impl Store for FileStore {
    type Error = FsError;

    fn write(&self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        let mut log = self.log.lock();
        let pos = log.file.seek(SeekFrom::End(0))?;
        let mut frame = Vec::with_capacity(6 + key.len() + value.len());
        write_frame(&mut frame, key, value)?;
        if let Err(err) = log.file.write_all(&frame).and_then(|_| log.file.sync_data()) {
            // Drop a partially written record so that the log stays readable.
            let _ = log.file.set_len(pos);
            return Err(err.into());
        }
        log.index.insert(key.to_owned(), pos + 2 + key.len() as u64);
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut log = self.log.lock();
        let Some(pos) = log.index.get(key).copied() else {
            return Ok(None);
        };
        read_value(&mut log.file, pos).map(Some)
    }

    fn batch_read(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Self::Error> {
        let mut log = self.log.lock();
        let Log { file, index } = &mut *log;
        index
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, pos)| Ok((key.clone(), read_value(file, *pos)?)))
            .collect()
    }
}

fn write_frame(writer: &mut impl Write, key: &str, value: &[u8]) -> Result<(), FsError> {
    let key_len = u16::try_from(key.len()).map_err(|_| FsError::KeyTooLong(key.len()))?;
    let value_len = u32::try_from(value.len()).map_err(|_| FsError::ValueTooLarge(value.len()))?;
    writer.write_all(&key_len.to_le_bytes())?;
    writer.write_all(key.as_bytes())?;
    writer.write_all(&value_len.to_le_bytes())?;
    writer.write_all(value)?;
    Ok(())
}

/// Reads the next frame; returns `None` on a clean end of the stream.
fn read_frame(reader: &mut impl Read, pos: u64) -> Result<Option<(String, Vec<u8>)>, FsError> {
    let mut key_len = [0u8; 2];
    let read = reader.read(&mut key_len[..1])?;
    if read == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut key_len[1..])?;
    let mut key = vec![0u8; u16::from_le_bytes(key_len) as usize];
    reader.read_exact(&mut key)?;
    let key = String::from_utf8(key).map_err(|_| FsError::InvalidKey(pos))?;
    let mut value_len = [0u8; 4];
    reader.read_exact(&mut value_len)?;
    let mut value = vec![0u8; u32::from_le_bytes(value_len) as usize];
    reader.read_exact(&mut value)?;
    Ok(Some((key, value)))
}

fn read_value(file: &mut File, pos: u64) -> Result<Vec<u8>, FsError> {
    file.seek(SeekFrom::Start(pos))?;
    let mut len = [0u8; 4];
    file.read_exact(&mut len)?;
    let mut value = vec![0u8; u32::from_le_bytes(len) as usize];
    file.read_exact(&mut value)?;
    Ok(value)
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]

    use super::*;

    #[test]
    fn reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.write("tc-a", b"first").unwrap();
            store.write("tch-a-00000000-x", b"item").unwrap();
            store.write("tc-a", b"second").unwrap();
            assert_eq!(store.len(), 2);
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.read("tc-a").unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(store.read("tc-b").unwrap(), None);
        assert_eq!(store.batch_read("tch-a-").unwrap(), vec![(s!("tch-a-00000000-x"), b"item".to_vec())]);
    }

    #[test]
    fn truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.write("tc-a", b"complete").unwrap();
            store.write("tc-b", b"partial").unwrap();
        }
        let log = dir.path().join(FileStore::FILENAME_LOG);
        let len = fs::metadata(&log).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&log)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.read("tc-a").unwrap().as_deref(), Some(&b"complete"[..]));
        assert_eq!(store.read("tc-b").unwrap(), None);
        store.write("tc-b", b"again").unwrap();
        drop(store);
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.read("tc-b").unwrap().as_deref(), Some(&b"again"[..]));
    }

    #[test]
    fn foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(FileStore::FILENAME_LOG), b"not a store at all").unwrap();
        assert!(matches!(FileStore::open(dir.path()), Err(FsError::Magic(_))));
    }

    #[test]
    fn backup_restore() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let backup = src.path().join("backup.dat");

        let store = FileStore::open(src.path()).unwrap();
        store.write("tcr-000000000001", b"resv").unwrap();
        store.write("tc-a", b"old").unwrap();
        store.write("tc-a", b"new").unwrap();
        assert_eq!(store.backup(&backup).unwrap(), 2);

        let copy = FileStore::open(dst.path()).unwrap();
        assert_eq!(copy.restore(&backup).unwrap(), 2);
        assert_eq!(copy.read("tc-a").unwrap().as_deref(), Some(&b"new"[..]));
        assert_eq!(copy.batch_read("tcr-").unwrap().len(), 1);
    }
}
