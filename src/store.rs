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

use core::convert::Infallible;
use core::error::Error;
use std::collections::BTreeMap;

use parking_lot::RwLock;
use strict_encoding::{DecodeError, StreamReader, StreamWriter, StrictDecode, StrictEncode, StrictReader, StrictWriter};

/// Durable key-value storage shared by all contracts of a node.
///
/// Writes are atomic per key; a later write under the same key replaces the earlier value.
pub trait Store: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    fn write(&self, key: &str, value: &[u8]) -> Result<(), Self::Error>;

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Reads all records with keys starting with `prefix`, ordered by key.
    fn batch_read(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Self::Error>;
}

/// Layout of the keys under which runtime records are stored.
pub mod keys {
    use crate::{Address, ContractUrl, Outpoint};

    pub const RUNTIME: &str = "tc-";
    pub const HISTORY: &str = "tch-";
    pub const INVOKER: &str = "tcu-";
    pub const RESERVATION: &str = "tcr-";

    pub fn runtime(url: &ContractUrl) -> String { format!("{RUNTIME}{url}") }

    pub fn history_prefix(url: &ContractUrl) -> String { format!("{HISTORY}{url}-") }

    pub fn history_bucket(url: &ContractUrl, bucket: u64) -> String { format!("{HISTORY}{url}-{bucket:08}-") }

    pub fn history(url: &ContractUrl, bucket: u64, outpoint: Outpoint) -> String {
        format!("{}{outpoint}", history_bucket(url, bucket))
    }

    pub fn invoker_prefix(url: &ContractUrl) -> String { format!("{INVOKER}{url}-") }

    pub fn invoker(url: &ContractUrl, address: &Address) -> String { format!("{INVOKER}{url}-{address}") }

    pub fn reservation(id: u64) -> String { format!("{RESERVATION}{id:012}") }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemStore(RwLock<BTreeMap<String, Vec<u8>>>);

impl MemStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.0.read().len() }

    pub fn is_empty(&self) -> bool { self.0.read().is_empty() }
}

impl Store for MemStore {
    type Error = Infallible;

    fn write(&self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.0.write().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> { Ok(self.0.read().get(key).cloned()) }

    fn batch_read(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Self::Error> {
        Ok(self
            .0
            .read()
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum RecordError {
    /// record is too short to contain a schema version.
    Truncated,

    /// record schema version {0} is not supported.
    UnsupportedVersion(u16),

    /// invalid record data. Details: {0}
    #[from]
    Decode(DecodeError),
}

/// Serializes a record prefixed with its schema version.
pub(crate) fn encode_record(version: u16, value: &impl StrictEncode) -> Vec<u8> {
    let mut buf = version.to_le_bytes().to_vec();
    buf.extend(encode_payload(value));
    buf
}

pub(crate) fn encode_payload(value: &impl StrictEncode) -> Vec<u8> {
    let mut buf = Vec::new();
    let writer = StrictWriter::with(StreamWriter::new::<{ usize::MAX }>(&mut buf));
    value
        .strict_encode(writer)
        .expect("writing to a memory buffer never fails");
    buf
}

/// Splits a versioned record into the schema version and the encoded payload.
pub(crate) fn split_record(data: &[u8]) -> Result<(u16, &[u8]), RecordError> {
    if data.len() < 2 {
        return Err(RecordError::Truncated);
    }
    let (version, payload) = data.split_at(2);
    Ok((u16::from_le_bytes([version[0], version[1]]), payload))
}

pub(crate) fn decode_payload<T: StrictDecode>(payload: &[u8]) -> Result<T, RecordError> {
    let mut reader = StrictReader::with(StreamReader::new::<{ usize::MAX }>(payload));
    Ok(T::strict_decode(&mut reader)?)
}
