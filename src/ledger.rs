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

use std::collections::{BTreeMap, BTreeSet};

use amplify::confinement::LargeVec;
use indexmap::IndexMap;

use crate::store::{decode_payload, encode_record, split_record};
use crate::{
    bucket_of, keys, Address, ContractUrl, InvocationItem, InvokerStatus, ItemError, Layer, LegacyInvocationItem,
    Outpoint, RecordError, Store, Txid, UtxoId, ITEM_VERSION, LIB_NAME_BIPACT,
};

pub const INVOKER_VERSION: u16 = 0;

#[derive(Debug, Display, Error, From)]
#[display(inner)]
pub enum LedgerError {
    #[from]
    Item(ItemError),

    #[from]
    Record(RecordError),

    /// Error of the persistence layer.
    #[display("persistence error: {0}")]
    Persistence(String),

    #[display("malformed ledger key '{0}'")]
    MalformedKey(String),
}

impl LedgerError {
    pub(crate) fn persistence(err: impl core::error::Error) -> Self { Self::Persistence(err.to_string()) }
}

/// Decodes an invocation record, upgrading records of older schema versions.
///
/// # Returns
///
/// The item and whether it has to be re-written in the current schema.
pub(crate) fn decode_item(data: &[u8]) -> Result<(InvocationItem, bool), RecordError> {
    let (version, payload) = split_record(data)?;
    match version {
        0 => Ok((decode_payload::<LegacyInvocationItem>(payload)?.into(), true)),
        ITEM_VERSION => Ok((decode_payload(payload)?, false)),
        unknown => Err(RecordError::UnsupportedVersion(unknown)),
    }
}

fn decode_invoker(data: &[u8]) -> Result<InvokerStatus, RecordError> {
    let (version, payload) = split_record(data)?;
    match version {
        INVOKER_VERSION => decode_payload(payload),
        unknown => Err(RecordError::UnsupportedVersion(unknown)),
    }
}

/// Ledger records changed since they were last written under their own keys.
///
/// Travels inside the contract snapshot: a commit is durable once the snapshot is written, and
/// records under their own keys are only written afterwards.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
#[derive(StrictType, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
pub struct Journal {
    pub items: LargeVec<InvocationItem>,
    pub invokers: LargeVec<InvokerStatus>,
}

impl Journal {
    pub fn is_empty(&self) -> bool { self.items.is_empty() && self.invokers.is_empty() }
}

/// Ledger of invocations of a single contract.
///
/// Keeps pending items in an in-memory working set, together with an index of all outpoints ever
/// accepted. Terminal items are written to the store and evicted from the working set; history
/// queries read them back from the store.
#[derive(Clone, Debug)]
pub struct Ledger {
    url: ContractUrl,
    working: IndexMap<Outpoint, InvocationItem>,
    index: BTreeMap<Outpoint, u64>,
    invokers: BTreeMap<Address, InvokerStatus>,
    dirty: BTreeSet<Outpoint>,
    dirty_invokers: BTreeSet<Address>,
}

impl Ledger {
    pub fn new(url: ContractUrl) -> Self {
        Self {
            url,
            working: none!(),
            index: none!(),
            invokers: none!(),
            dirty: none!(),
            dirty_invokers: none!(),
        }
    }

    /// Restores the ledger from the store, keeping only items with ids below the `committed`
    /// invocation counter of the contract snapshot.
    ///
    /// # Blocking I/O
    ///
    /// Scans all invocation records of the contract.
    pub fn load<S: Store>(url: ContractUrl, store: &S, committed: u64) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(url);
        let prefix = keys::history_prefix(&ledger.url);
        let records = store.batch_read(&prefix).map_err(LedgerError::persistence)?;
        for (key, data) in records {
            let (item, upgraded) = decode_item(&data)?;
            let outpoint = Self::parse_key(&prefix, &key)?;
            if item.id >= committed {
                tracing::warn!(url = %ledger.url, id = item.id, %outpoint, committed, "skipping uncommitted invocation record");
                continue;
            }
            ledger.index.insert(outpoint, item.id);
            if upgraded {
                ledger.dirty.insert(outpoint);
            }
            if !item.is_terminal() || upgraded {
                ledger.working.insert(outpoint, item);
            }
        }
        ledger.working.sort_by(|_, a, _, b| a.id.cmp(&b.id));
        if !ledger.dirty.is_empty() {
            tracing::info!(url = %ledger.url, count = ledger.dirty.len(), "upgrading legacy invocation records");
        }
        Ok(ledger)
    }

    /// Applies the journal of the last committed snapshot over records read from the store.
    ///
    /// Replayed records stay unflushed until the next successful write.
    pub fn replay(&mut self, journal: Journal) {
        if journal.is_empty() {
            return;
        }
        tracing::debug!(url = %self.url, items = journal.items.len(), invokers = journal.invokers.len(), "replaying ledger journal");
        for item in journal.items {
            self.accept(item);
        }
        self.working.sort_by(|_, a, _, b| a.id.cmp(&b.id));
        for status in journal.invokers {
            self.dirty_invokers.insert(status.address.clone());
            self.invokers.insert(status.address.clone(), status);
        }
    }

    /// Collects records changed since the last successful [`Self::flush`].
    pub fn journal(&self) -> Journal {
        let items = self
            .dirty
            .iter()
            .filter_map(|outpoint| self.working.get(outpoint))
            .cloned()
            .collect();
        let invokers = self
            .dirty_invokers
            .iter()
            .filter_map(|address| self.invokers.get(address))
            .cloned()
            .collect();
        Journal { items: LargeVec::from_checked(items), invokers: LargeVec::from_checked(invokers) }
    }

    /// Checks that a stored record belongs to an accepted item.
    fn is_committed(&self, item: &InvocationItem) -> bool { self.index.get(&item.outpoint) == Some(&item.id) }

    fn parse_key(prefix: &str, key: &str) -> Result<Outpoint, LedgerError> {
        let malformed = || LedgerError::MalformedKey(key.to_owned());
        let rest = key.strip_prefix(prefix).ok_or_else(malformed)?;
        let (_, outpoint) = rest.split_once('-').ok_or_else(malformed)?;
        outpoint.parse().map_err(|_| malformed())
    }

    pub fn url(&self) -> &ContractUrl { &self.url }

    /// Number of invocations ever accepted into the ledger.
    pub fn len(&self) -> usize { self.index.len() }

    pub fn is_empty(&self) -> bool { self.index.is_empty() }

    pub fn contains(&self, outpoint: Outpoint) -> bool { self.index.contains_key(&outpoint) }

    pub fn pending(&self) -> impl Iterator<Item = &InvocationItem> { self.working.values().filter(|item| !item.is_terminal()) }

    pub fn pending_count(&self) -> usize { self.pending().count() }

    pub fn get(&self, outpoint: Outpoint) -> Option<&InvocationItem> { self.working.get(&outpoint) }

    /// Accepts a new item into the working set.
    pub fn accept(&mut self, item: InvocationItem) {
        self.index.insert(item.outpoint, item.id);
        self.dirty.insert(item.outpoint);
        self.working.insert(item.outpoint, item);
    }

    /// Replaces an item in the working set, preserving terminal statuses.
    pub fn update(&mut self, item: InvocationItem) -> Result<(), ItemError> {
        if let Some(old) = self.working.get(&item.outpoint) {
            if old.is_terminal() && old.status != item.status {
                return Err(ItemError::Terminal { id: old.id, status: old.status });
            }
        }
        self.accept(item);
        Ok(())
    }

    /// Applies a change to an item of the working set.
    pub fn modify<T>(
        &mut self,
        outpoint: Outpoint,
        f: impl FnOnce(&mut InvocationItem) -> Result<T, ItemError>,
    ) -> Option<Result<T, ItemError>> {
        let item = self.working.get_mut(&outpoint)?;
        self.dirty.insert(outpoint);
        Some(f(item))
    }

    /// Refreshes cached UTXO identifier of an already-ledgered output which was observed again,
    /// i.e. after it got re-mined following a reorganization.
    ///
    /// # Returns
    ///
    /// `false` if the output was never ledgered.
    ///
    /// # Blocking I/O
    ///
    /// Reads the item from the store if it was evicted from the working set.
    pub fn refresh_utxo<S: Store>(
        &mut self,
        store: &S,
        outpoint: Outpoint,
        utxo_id: UtxoId,
        height: u64,
    ) -> Result<bool, LedgerError> {
        if !self.contains(outpoint) {
            return Ok(false);
        }
        if !self.working.contains_key(&outpoint) {
            let Some(item) = self.by_outpoint(store, outpoint)? else {
                return Ok(false);
            };
            self.working.insert(outpoint, item);
        }
        self.modify(outpoint, |item| {
            if item.utxo_id != Some(utxo_id) {
                tracing::debug!(id = item.id, %outpoint, %utxo_id, "refreshing utxo id of re-observed invocation");
                item.utxo_id = Some(utxo_id);
                item.height = height;
            }
            Ok(())
        });
        Ok(true)
    }

    /// Re-inserts items loaded from the store into the working set.
    pub fn reinsert(&mut self, items: impl IntoIterator<Item = InvocationItem>) {
        for item in items {
            self.accept(item);
        }
        self.working.sort_by(|_, a, _, b| a.id.cmp(&b.id));
    }

    /// Invoker aggregate, loaded lazily from the store.
    ///
    /// # Blocking I/O
    ///
    /// Reads the store on the first access to the address.
    pub fn invoker_mut<S: Store>(&mut self, store: &S, address: &Address) -> Result<&mut InvokerStatus, LedgerError> {
        if !self.invokers.contains_key(address) {
            let status = match store
                .read(&keys::invoker(&self.url, address))
                .map_err(LedgerError::persistence)?
            {
                Some(data) => decode_invoker(&data)?,
                None => InvokerStatus::new(address.clone()),
            };
            self.invokers.insert(address.clone(), status);
        }
        self.dirty_invokers.insert(address.clone());
        Ok(self
            .invokers
            .get_mut(address)
            .expect("invoker status was inserted above"))
    }

    /// Writes all changed records into the store.
    ///
    /// # Blocking I/O
    ///
    /// Writes to the store.
    pub fn flush<S: Store>(&mut self, store: &S) -> Result<(), LedgerError> {
        for outpoint in &self.dirty {
            let Some(item) = self.working.get(outpoint) else {
                continue;
            };
            let key = keys::history(&self.url, item.bucket(), *outpoint);
            store
                .write(&key, &encode_record(ITEM_VERSION, item))
                .map_err(LedgerError::persistence)?;
        }
        for address in &self.dirty_invokers {
            let Some(status) = self.invokers.get(address) else {
                continue;
            };
            store
                .write(&keys::invoker(&self.url, address), &encode_record(INVOKER_VERSION, status))
                .map_err(LedgerError::persistence)?;
        }
        self.dirty.clear();
        self.dirty_invokers.clear();
        Ok(())
    }

    /// Drops already persisted terminal items from the working set.
    pub fn evict_terminal(&mut self) -> usize {
        let before = self.working.len();
        let dirty = &self.dirty;
        self.working
            .retain(|outpoint, item| !item.is_terminal() || dirty.contains(outpoint));
        before - self.working.len()
    }

    /// Looks up an item by its outpoint in the working set or the store.
    pub fn by_outpoint<S: Store>(&self, store: &S, outpoint: Outpoint) -> Result<Option<InvocationItem>, LedgerError> {
        if let Some(item) = self.working.get(&outpoint) {
            return Ok(Some(item.clone()));
        }
        let Some(id) = self.index.get(&outpoint) else {
            return Ok(None);
        };
        let key = keys::history(&self.url, bucket_of(*id), outpoint);
        match store.read(&key).map_err(LedgerError::persistence)? {
            Some(data) => Ok(Some(decode_item(&data)?.0)),
            None => Ok(None),
        }
    }

    pub fn by_id<S: Store>(&self, store: &S, id: u64) -> Result<Option<InvocationItem>, LedgerError> {
        if let Some(item) = self.working.values().find(|item| item.id == id) {
            return Ok(Some(item.clone()));
        }
        for (_, data) in store
            .batch_read(&keys::history_bucket(&self.url, bucket_of(id)))
            .map_err(LedgerError::persistence)?
        {
            let (item, _) = decode_item(&data)?;
            if item.id == id && self.is_committed(&item) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Finds all items funded by outputs of a transaction.
    pub fn by_txid<S: Store>(&self, store: &S, txid: Txid) -> Result<Vec<InvocationItem>, LedgerError> {
        let ids = self
            .index
            .iter()
            .filter(|(outpoint, _)| outpoint.txid == txid)
            .map(|(outpoint, _)| *outpoint)
            .collect::<Vec<_>>();
        let mut items = Vec::with_capacity(ids.len());
        for outpoint in ids {
            if let Some(item) = self.by_outpoint(store, outpoint)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Reads a page of the invocation history ordered by item id.
    ///
    /// # Blocking I/O
    ///
    /// Reads as many ledger buckets from the store as needed to fill the page.
    pub fn page<S: Store>(&self, store: &S, start: u64, limit: usize) -> Result<Vec<InvocationItem>, LedgerError> {
        let total = self.index.len() as u64;
        let mut page = Vec::with_capacity(limit.min(self.index.len()));
        let mut bucket = bucket_of(start);
        while page.len() < limit && bucket <= bucket_of(total) {
            let records = store
                .batch_read(&keys::history_bucket(&self.url, bucket))
                .map_err(LedgerError::persistence)?;
            let mut items = BTreeMap::new();
            for (_, data) in &records {
                let (item, _) = decode_item(data)?;
                if self.is_committed(&item) {
                    items.insert(item.outpoint, item);
                }
            }
            // Unflushed changes take precedence over the stored state.
            for item in self.working.values().filter(|item| item.bucket() == bucket) {
                items.insert(item.outpoint, item.clone());
            }
            let mut items = items.into_values().collect::<Vec<_>>();
            items.sort_by_key(|item| item.id);
            page.extend(items.into_iter().filter(|item| item.id >= start));
            bucket += 1;
        }
        page.truncate(limit);
        Ok(page)
    }

    /// Loads all items of a layer which were observed at or above a given height.
    ///
    /// # Blocking I/O
    ///
    /// Scans all invocation records of the contract.
    pub fn load_from_height<S: Store>(
        &self,
        store: &S,
        layer: Layer,
        height: u64,
    ) -> Result<Vec<InvocationItem>, LedgerError> {
        let records = store
            .batch_read(&keys::history_prefix(&self.url))
            .map_err(LedgerError::persistence)?;
        let mut items = BTreeMap::new();
        for (_, data) in records {
            let (item, _) = decode_item(&data)?;
            if self.is_committed(&item) {
                items.insert(item.outpoint, item);
            }
        }
        for (outpoint, item) in &self.working {
            items.insert(*outpoint, item.clone());
        }
        let mut items = items
            .into_values()
            .filter(|item| item.layer() == layer && item.height >= height)
            .collect::<Vec<_>>();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    /// Lists invoker addresses known to the contract.
    pub fn addresses<S: Store>(&self, store: &S, start: usize, limit: usize) -> Result<Vec<InvokerStatus>, LedgerError> {
        let mut statuses = store
            .batch_read(&keys::invoker_prefix(&self.url))
            .map_err(LedgerError::persistence)?
            .iter()
            .map(|(_, data)| decode_invoker(data))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|status| (status.address.clone(), status))
            .collect::<BTreeMap<_, _>>();
        for (address, status) in &self.invokers {
            statuses.insert(address.clone(), status.clone());
        }
        Ok(statuses.into_values().skip(start).take(limit).collect())
    }

    pub fn invoker<S: Store>(&self, store: &S, address: &Address) -> Result<Option<InvokerStatus>, LedgerError> {
        if let Some(status) = self.invokers.get(address) {
            return Ok(Some(status.clone()));
        }
        store
            .read(&keys::invoker(&self.url, address))
            .map_err(LedgerError::persistence)?
            .map(|data| decode_invoker(&data).map_err(LedgerError::from))
            .transpose()
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]

    use amplify::confinement::TinyString;

    use super::*;
    use crate::{Invocation, ItemStatus, MemStore, Reason};

    fn url() -> ContractUrl { "tb1qchannel_ordx:f:pearl_swap.tc".parse().unwrap() }

    fn item(id: u64, height: u64) -> InvocationItem {
        let invocation = Invocation {
            outpoint: Outpoint::new([id as u8 + 1; 32], 0),
            utxo_id: UtxoId::new(height as u32, id as u16, 0),
            address: "tb1qinvoker".parse().unwrap(),
            action: TinyString::from_checked(s!("swap")),
            param: none!(),
            amount: 100,
            value: 1000,
            to_l1: false,
        };
        InvocationItem::new(id, Layer::Settlement, height, &invocation)
    }

    #[test]
    fn flush_and_reload() {
        let store = MemStore::new();
        let mut ledger = Ledger::new(url());
        for id in 0..3 {
            ledger.accept(item(id, 100 + id));
        }
        let done = item(1, 101).outpoint;
        ledger
            .modify(done, |item| item.settle(ItemStatus::Dealt, Reason::Normal, None))
            .unwrap()
            .unwrap();
        ledger.flush(&store).unwrap();
        assert_eq!(ledger.evict_terminal(), 1);
        assert_eq!(ledger.pending_count(), 2);

        let reloaded = Ledger::load(url(), &store, 3).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.pending_count(), 2);
        assert!(reloaded.get(done).is_none());
        assert_eq!(reloaded.by_outpoint(&store, done).unwrap().unwrap().status, ItemStatus::Dealt);
    }

    #[test]
    fn terminal_update_rejected() {
        let mut ledger = Ledger::new(url());
        let mut first = item(0, 100);
        first.close_invalid().unwrap();
        ledger.accept(first.clone());
        first.status = ItemStatus::Dealt;
        assert!(ledger.update(first).is_err());
    }

    #[test]
    fn pagination_across_buckets() {
        let store = MemStore::new();
        let mut ledger = Ledger::new(url());
        for id in 0..205u64 {
            let mut item = item(id, 100);
            item.outpoint = Outpoint::new([(id % 251) as u8; 32], id as u32);
            ledger.accept(item);
        }
        ledger.flush(&store).unwrap();
        let page = ledger.page(&store, 95, 10).unwrap();
        assert_eq!(page.iter().map(|item| item.id).collect::<Vec<_>>(), (95..105).collect::<Vec<_>>());
        let tail = ledger.page(&store, 200, 10).unwrap();
        assert_eq!(tail.len(), 5);
    }

    #[test]
    fn legacy_records_upgrade() {
        let store = MemStore::new();
        let current = item(0, 100);
        let legacy = LegacyInvocationItem {
            id: current.id,
            status: current.status,
            reason: current.reason,
            action: current.action.clone(),
            outpoint: current.outpoint,
            utxo_id: current.utxo_id,
            height: current.height,
            address: current.address.clone(),
            from_l1: true,
            param: none!(),
            in_amt: 100,
            in_value: 1000,
            remaining_amt: 100,
            remaining_value: 1000,
            out_amt: 0,
            out_value: 0,
            out_txid: None,
        };
        store
            .write(&keys::history(&url(), 0, current.outpoint), &encode_record(0, &legacy))
            .unwrap();
        let mut ledger = Ledger::load(url(), &store, 1).unwrap();
        let upgraded = ledger.get(current.outpoint).unwrap();
        assert!(upgraded.to_l1);
        assert_eq!(upgraded.service_fee, 0);
        ledger.flush(&store).unwrap();
        let data = store
            .read(&keys::history(&url(), 0, current.outpoint))
            .unwrap()
            .unwrap();
        assert_eq!(split_record(&data).unwrap().0, ITEM_VERSION);
    }

    #[test]
    fn invoker_lazy_load() {
        let store = MemStore::new();
        let address = "tb1qinvoker".parse::<Address>().unwrap();
        let mut ledger = Ledger::new(url());
        ledger
            .invoker_mut(&store, &address)
            .unwrap()
            .record_input(&item(0, 100))
            .unwrap();
        ledger.flush(&store).unwrap();

        let mut fresh = Ledger::new(url());
        assert_eq!(fresh.invoker(&store, &address).unwrap().unwrap().invoke_count, 1);
        assert_eq!(fresh.invoker_mut(&store, &address).unwrap().input_value, 1000);
        assert_eq!(fresh.addresses(&store, 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn uncommitted_records_skipped() {
        let store = MemStore::new();
        let mut ledger = Ledger::new(url());
        for id in 0..3 {
            ledger.accept(item(id, 100));
        }
        ledger.flush(&store).unwrap();

        let reloaded = Ledger::load(url(), &store, 2).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(!reloaded.contains(item(2, 100).outpoint));
        assert_eq!(reloaded.by_id(&store, 2).unwrap(), None);
        assert_eq!(reloaded.page(&store, 0, 10).unwrap().len(), 2);
        assert_eq!(reloaded.load_from_height(&store, Layer::Settlement, 0).unwrap().len(), 2);
    }

    #[test]
    fn journal_replay() {
        let store = MemStore::new();
        let address = "tb1qinvoker".parse::<Address>().unwrap();
        let mut ledger = Ledger::new(url());
        let first = item(0, 100);
        ledger
            .invoker_mut(&store, &address)
            .unwrap()
            .record_input(&first)
            .unwrap();
        ledger.accept(first.clone());
        let journal = ledger.journal();
        assert_eq!(journal.items.len(), 1);
        assert_eq!(journal.invokers.len(), 1);

        let mut replayed = Ledger::load(url(), &store, 1).unwrap();
        assert!(replayed.is_empty());
        replayed.replay(journal);
        assert_eq!(replayed.by_id(&store, 0).unwrap(), Some(first.clone()));
        assert_eq!(replayed.page(&store, 0, 10).unwrap(), vec![first.clone()]);
        assert_eq!(replayed.invoker(&store, &address).unwrap().unwrap().invoke_count, 1);

        replayed.flush(&store).unwrap();
        assert!(replayed.journal().is_empty());
        let reloaded = Ledger::load(url(), &store, 1).unwrap();
        assert_eq!(reloaded.get(first.outpoint), Some(&first));
        assert_eq!(reloaded.invoker(&store, &address).unwrap().unwrap().input_value, 1000);
    }
}
