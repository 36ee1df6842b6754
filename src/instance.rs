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

use std::io;
use std::sync::Arc;

use chrono::DateTime;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use strict_encoding::{StreamReader, StrictDecode, StrictEncode, StrictReader};

use crate::identity::ScriptHex;
use crate::ledger::{Journal, LedgerError};
use crate::store::{encode_payload, encode_record, split_record};
use crate::{
    keys, multisig_redeem_script, p2wsh_script, Address, ContractParams, ContractStatus, ContractUrl,
    ContractVariant, DigestHistory, EnableParams, InvocationItem, InvokerStatus, Layer, Ledger, Outpoint, PublicKey,
    RecordError, RuntimeBase, StateCommitment, StateDigest, StaticDigest, Store, Txid, VariantError,
    LIB_NAME_BIPACT,
};

/// Schema version of persisted contract snapshots.
///
/// Version 0 snapshots carry no ledger journal.
pub const SNAPSHOT_VERSION: u16 = 1;

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum LifecycleError {
    /// contract enable block not set yet.
    EnableBlockUnset,

    /// contract not ready.
    NotReady,

    /// contract not enabled.
    NotEnabled,

    /// not reach start block {start}, current block is {current}.
    BeforeStart { start: u64, current: u64 },

    /// exceed the end block {end}, current block is {current}.
    AfterEnd { end: u64, current: u64 },

    /// contract can't change status from {from} to {to}.
    Transition { from: ContractStatus, to: ContractStatus },

    /// contract enable heights are already set.
    AlreadyEnabled,
}

#[derive(Debug, Display, Error, From)]
#[display(inner)]
pub enum InstanceError {
    #[from]
    Record(RecordError),

    #[from]
    Ledger(LedgerError),

    #[from]
    Variant(VariantError),

    #[from]
    Lifecycle(LifecycleError),

    #[display("persistence error: {0}")]
    Persistence(String),

    #[display("contract {0} is not found in the store")]
    NotFound(ContractUrl),

    #[display("stored snapshot belongs to contract {found} instead of {expected}")]
    UrlMismatch { expected: ContractUrl, found: ContractUrl },
}

/// Runtime state shared by all contract templates.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct CoreState {
    pub url: ContractUrl,
    pub params: ContractParams,
    pub resv_id: u64,
    pub deploy_time: i64,
    pub deployer: Address,
    pub status: ContractStatus,
    /// Zero until the enabling transaction is observed.
    pub enable_block: u64,
    pub enable_block_l1: u64,
    pub enable_txid: Option<Txid>,
    pub curr_block: u64,
    pub curr_block_l1: u64,
    pub invoke_count: u64,
    pub divisibility: u8,
    pub n: u32,
    pub static_digest: StaticDigest,
    pub running_digest: StateDigest,
    pub history: DigestHistory,
    /// Invocation counter last verified with the peer for settlement-layer payouts.
    pub checkpoint: u64,
    pub checkpoint_block: u64,
    /// Invocation counter last verified with the peer for base-layer payouts.
    pub checkpoint_l1: u64,
    pub checkpoint_block_l1: u64,
    pub local_pubkey: PublicKey,
    pub remote_pubkey: PublicKey,
    /// Total of fees spent by this node on settlement transactions, including failed attempts.
    pub fee_total: u64,
}

impl CoreState {
    pub fn cursor(&self, layer: Layer) -> u64 {
        match layer {
            Layer::Base => self.curr_block_l1,
            Layer::Settlement => self.curr_block,
        }
    }

    pub(crate) fn set_cursor(&mut self, layer: Layer, height: u64) {
        match layer {
            Layer::Base => self.curr_block_l1 = height,
            Layer::Settlement => self.curr_block = height,
        }
    }

    /// Height from which the layer cursor processes invocations, if already known.
    pub fn enable_height(&self, layer: Layer) -> Option<u64> {
        let height = match layer {
            Layer::Base => self.enable_block_l1,
            Layer::Settlement => self.enable_block,
        };
        (height > 0).then_some(height)
    }

    pub fn is_enable_set(&self) -> bool { self.enable_block > 0 }

    pub fn is_ready(&self) -> bool {
        self.status == ContractStatus::READY && self.is_enable_set() && self.curr_block >= self.enable_block
    }

    pub fn is_active(&self) -> bool {
        self.status.is_operational() && self.is_enable_set() && self.curr_block >= self.enable_block
    }

    pub fn is_expired(&self) -> bool { self.params.is_expired_at(self.curr_block) }

    /// Checks whether the contract accepts invocations at its current settlement-layer block.
    pub fn allow_invoke(&self) -> Result<(), LifecycleError> {
        if !self.is_enable_set() {
            return Err(LifecycleError::EnableBlockUnset);
        }
        if self.status < ContractStatus::READY {
            return Err(LifecycleError::NotReady);
        }
        if self.curr_block < self.enable_block {
            return Err(LifecycleError::NotEnabled);
        }
        if self.curr_block < self.params.start_block {
            return Err(LifecycleError::BeforeStart { start: self.params.start_block, current: self.curr_block });
        }
        if self.params.is_expired_at(self.curr_block) {
            return Err(LifecycleError::AfterEnd { end: self.params.end_block, current: self.curr_block });
        }
        Ok(())
    }

    pub(crate) fn transit(&mut self, to: ContractStatus) -> Result<(), LifecycleError> {
        if !self.status.can_transit(to) {
            return Err(LifecycleError::Transition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    pub fn checkpoint(&self, layer: Layer) -> u64 {
        match layer {
            Layer::Base => self.checkpoint_l1,
            Layer::Settlement => self.checkpoint,
        }
    }

    pub(crate) fn set_checkpoint(&mut self, layer: Layer, counter: u64) {
        match layer {
            Layer::Base => {
                self.checkpoint_l1 = counter;
                self.checkpoint_block_l1 = self.curr_block_l1;
            }
            Layer::Settlement => {
                self.checkpoint = counter;
                self.checkpoint_block = self.curr_block;
            }
        }
    }

    pub fn runtime_base(&self) -> RuntimeBase {
        RuntimeBase {
            deploy_time: self.deploy_time,
            status: self.status,
            enable_block: self.enable_block,
            enable_block_l1: self.enable_block_l1,
            enable_txid: self.enable_txid,
            deployer: self.deployer.clone(),
            channel: self.url.channel.clone(),
            resv_id: self.resv_id,
            invoke_count: self.invoke_count,
            divisibility: self.divisibility,
            n: self.n,
        }
    }

    pub fn redeem_script(&self) -> Vec<u8> { multisig_redeem_script(&self.local_pubkey, &self.remote_pubkey) }

    pub fn pk_script(&self) -> Vec<u8> { p2wsh_script(&self.redeem_script()) }
}

/// Summary of a contract instance returned by status queries.
#[derive(Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct InstanceStatus {
    pub url: String,
    pub status: String,
    /// Deployment time in RFC 3339 format.
    pub deployed: String,
    pub curr_block: u64,
    pub curr_block_l1: u64,
    pub enable_block: u64,
    pub enable_block_l1: u64,
    pub invoke_count: u64,
    pub pending: usize,
    pub static_digest: String,
    pub running_digest: String,
    pub checkpoint: u64,
    pub checkpoint_l1: u64,
    pub fee_total: u64,
    pub pk_script: String,
}

impl InstanceStatus {
    pub fn with(core: &CoreState, pending: usize) -> Self {
        Self {
            url: core.url.to_string(),
            status: core.status.to_string(),
            deployed: DateTime::from_timestamp(core.deploy_time, 0)
                .map(|time| time.to_rfc3339())
                .unwrap_or_default(),
            curr_block: core.curr_block,
            curr_block_l1: core.curr_block_l1,
            enable_block: core.enable_block,
            enable_block_l1: core.enable_block_l1,
            invoke_count: core.invoke_count,
            pending,
            static_digest: core.static_digest.to_string(),
            running_digest: core.running_digest.to_string(),
            checkpoint: core.checkpoint,
            checkpoint_l1: core.checkpoint_l1,
            fee_total: core.fee_total,
            pk_script: ScriptHex(&core.pk_script()).to_string(),
        }
    }
}

pub(crate) struct InstanceState {
    pub core: CoreState,
    pub ledger: Ledger,
    pub variant: Box<dyn ContractVariant>,
}

/// Copy of the instance state taken before a mutation, restored if the mutation can't be
/// persisted.
pub(crate) struct Savepoint {
    core: CoreState,
    ledger: Ledger,
    variant: Vec<u8>,
}

impl InstanceState {
    pub fn savepoint(&self) -> Savepoint {
        Savepoint { core: self.core.clone(), ledger: self.ledger.clone(), variant: self.variant.export_state() }
    }

    pub fn restore(&mut self, savepoint: Savepoint) {
        self.core = savepoint.core;
        self.ledger = savepoint.ledger;
        if let Err(err) = self.variant.import_state(&savepoint.variant) {
            tracing::error!(url = %self.core.url, error = %err, "unable to restore template state");
        }
    }

    pub fn state_digest(&self) -> StateDigest {
        StateCommitment {
            static_digest: self.core.static_digest,
            base_digest: self.core.runtime_base().base_digest(),
            variant_digest: self.variant.state_digest(),
        }
        .state_digest()
    }

    /// Archives the current digest under the previous counter and recomputes it, if any
    /// invocations were accepted since `prev_count`.
    pub fn update_checkpoint(&mut self, prev_count: u64) -> bool {
        if self.core.invoke_count == prev_count {
            return false;
        }
        self.core.history.archive(prev_count, self.core.running_digest);
        self.core.running_digest = self.state_digest();
        true
    }
}

/// Single contract instance.
///
/// All runtime state lives in one structure behind a reader-writer lock; status queries take the
/// shared lock. Mutating operations are serialized by a separate gate which stays held while the
/// state lock is released around calls to the block source or the broadcaster.
pub struct ContractInstance<S: Store> {
    pub(crate) store: Arc<S>,
    pub(crate) gate: Mutex<()>,
    pub(crate) state: RwLock<InstanceState>,
}

impl<S: Store> ContractInstance<S> {
    /// Creates a freshly installed contract instance.
    pub fn new(store: Arc<S>, mut core: CoreState, variant: Box<dyn ContractVariant>) -> Self {
        core.static_digest = core.params.static_digest();
        let ledger = Ledger::new(core.url.clone());
        let mut state = InstanceState { core, ledger, variant };
        state.core.running_digest = state.state_digest();
        Self { store, gate: Mutex::new(()), state: RwLock::new(state) }
    }

    /// Restores a contract instance from the store.
    ///
    /// # Blocking I/O
    ///
    /// Reads the snapshot and scans invocation records of the contract.
    pub fn load(store: Arc<S>, url: &ContractUrl, mut variant: Box<dyn ContractVariant>) -> Result<Self, InstanceError> {
        let (core, journal, variant_state) = Self::read_parts(store.as_ref(), url)?;
        variant.import_state(&variant_state)?;
        let mut ledger = Ledger::load(url.clone(), store.as_ref(), core.invoke_count)?;
        ledger.replay(journal);
        tracing::debug!(%url, counter = core.invoke_count, pending = ledger.pending_count(), "contract loaded");
        let state = InstanceState { core, ledger, variant };
        Ok(Self { store, gate: Mutex::new(()), state: RwLock::new(state) })
    }

    /// Reads the stored snapshot of a contract without instantiating template logic.
    pub fn read_snapshot(store: &S, url: &ContractUrl) -> Result<(CoreState, Vec<u8>), InstanceError> {
        let (core, _, variant) = Self::read_parts(store, url)?;
        Ok((core, variant))
    }

    /// Reads the stored snapshot of a contract together with its committed ledger.
    pub fn read_ledger(store: &S, url: &ContractUrl) -> Result<(CoreState, Ledger), InstanceError> {
        let (core, journal, _) = Self::read_parts(store, url)?;
        let mut ledger = Ledger::load(url.clone(), store, core.invoke_count)?;
        ledger.replay(journal);
        Ok((core, ledger))
    }

    fn read_parts(store: &S, url: &ContractUrl) -> Result<(CoreState, Journal, Vec<u8>), InstanceError> {
        let data = store
            .read(&keys::runtime(url))
            .map_err(|e| InstanceError::Persistence(e.to_string()))?
            .ok_or_else(|| InstanceError::NotFound(url.clone()))?;
        let (version, payload) = split_record(&data)?;
        if version > SNAPSHOT_VERSION {
            return Err(RecordError::UnsupportedVersion(version).into());
        }
        let mut cursor = io::Cursor::new(payload);
        let (core, journal) = {
            let mut reader = StrictReader::with(StreamReader::new::<{ usize::MAX }>(&mut cursor));
            let core = CoreState::strict_decode(&mut reader).map_err(RecordError::from)?;
            let journal = match version {
                0 => Journal::default(),
                _ => Journal::strict_decode(&mut reader).map_err(RecordError::from)?,
            };
            (core, journal)
        };
        if &core.url != url {
            return Err(InstanceError::UrlMismatch { expected: url.clone(), found: core.url });
        }
        let variant = payload[cursor.position() as usize..].to_vec();
        Ok((core, journal, variant))
    }

    /// Writes the contract snapshot, then changed ledger records. Must be called under the state
    /// lock.
    ///
    /// The snapshot write commits the change: changed ledger records travel inside it, so a
    /// failure to write them under their own keys is retried on the next commit.
    pub(crate) fn persist(&self, state: &mut InstanceState) -> Result<(), InstanceError> {
        let mut data = encode_record(SNAPSHOT_VERSION, &state.core);
        data.extend(encode_payload(&state.ledger.journal()));
        data.extend(state.variant.export_state());
        self.store
            .write(&keys::runtime(&state.core.url), &data)
            .map_err(|e| InstanceError::Persistence(e.to_string()))?;
        if let Err(err) = state.ledger.flush(self.store.as_ref()) {
            tracing::warn!(url = %state.core.url, error = %err, "ledger records are kept in the snapshot until the next commit");
        }
        state.ledger.evict_terminal();
        Ok(())
    }

    /// Persists the full state of a freshly created instance.
    pub fn save(&self) -> Result<(), InstanceError> {
        let _gate = self.gate.lock();
        let mut state = self.state.write();
        self.persist(&mut state)
    }

    pub fn store(&self) -> &S { self.store.as_ref() }

    /// Read access to the runtime state.
    pub fn core(&self) -> impl core::ops::Deref<Target = CoreState> + '_ {
        RwLockReadGuard::map(self.state.read(), |state| &state.core)
    }

    pub fn url(&self) -> ContractUrl { self.state.read().core.url.clone() }

    pub fn allow_invoke(&self) -> Result<(), LifecycleError> { self.state.read().core.allow_invoke() }

    pub fn is_ready(&self) -> bool { self.state.read().core.is_ready() }

    pub fn is_active(&self) -> bool { self.state.read().core.is_active() }

    pub fn is_expired(&self) -> bool { self.state.read().core.is_expired() }

    pub fn status(&self) -> InstanceStatus {
        let state = self.state.read();
        InstanceStatus::with(&state.core, state.ledger.pending_count())
    }

    pub fn running_digest(&self) -> StateDigest { self.state.read().core.running_digest }

    pub fn invoke_count(&self) -> u64 { self.state.read().core.invoke_count }

    pub fn pending_items(&self) -> Vec<InvocationItem> { self.state.read().ledger.pending().cloned().collect() }

    pub fn invoke_history(&self, start: u64, limit: usize) -> Result<Vec<InvocationItem>, LedgerError> {
        self.state.read().ledger.page(self.store.as_ref(), start, limit)
    }

    pub fn item(&self, outpoint: Outpoint) -> Result<Option<InvocationItem>, LedgerError> {
        self.state
            .read()
            .ledger
            .by_outpoint(self.store.as_ref(), outpoint)
    }

    pub fn item_by_id(&self, id: u64) -> Result<Option<InvocationItem>, LedgerError> {
        self.state.read().ledger.by_id(self.store.as_ref(), id)
    }

    pub fn items_by_txid(&self, txid: Txid) -> Result<Vec<InvocationItem>, LedgerError> {
        self.state.read().ledger.by_txid(self.store.as_ref(), txid)
    }

    pub fn invoker_status(&self, address: &Address) -> Result<Option<InvokerStatus>, LedgerError> {
        self.state
            .read()
            .ledger
            .invoker(self.store.as_ref(), address)
    }

    pub fn addresses(&self, start: usize, limit: usize) -> Result<Vec<InvokerStatus>, LedgerError> {
        self.state
            .read()
            .ledger
            .addresses(self.store.as_ref(), start, limit)
    }

    /// Records heights of the enabling transaction. Heights can be set only once.
    pub fn set_enable_heights(&self, enable: EnableParams) -> Result<(), InstanceError> {
        let _gate = self.gate.lock();
        let mut state = self.state.write();
        if state.core.is_enable_set() {
            if state.core.enable_txid == Some(enable.txid) {
                return Ok(());
            }
            return Err(LifecycleError::AlreadyEnabled.into());
        }
        state.core.enable_block = enable.height_l2;
        state.core.enable_block_l1 = enable.height_l1;
        state.core.enable_txid = Some(enable.txid);
        if let Err(err) = self.persist(&mut state) {
            state.core.enable_block = 0;
            state.core.enable_block_l1 = 0;
            state.core.enable_txid = None;
            return Err(err);
        }
        tracing::info!(url = %state.core.url, l1 = enable.height_l1, l2 = enable.height_l2, "contract enable heights set");
        Ok(())
    }

    /// Moves the contract into a template-private adjusting status or back into READY.
    pub fn adjust(&self, to: ContractStatus) -> Result<(), InstanceError> {
        if !to.is_operational() {
            let from = self.state.read().core.status;
            return Err(LifecycleError::Transition { from, to }.into());
        }
        self.transit(to)
    }

    /// Stops accepting invocations; the contract terminates once no pending items remain.
    pub fn begin_closing(&self) -> Result<(), InstanceError> { self.transit(ContractStatus::CLOSING) }

    fn transit(&self, to: ContractStatus) -> Result<(), InstanceError> {
        let _gate = self.gate.lock();
        let mut state = self.state.write();
        let from = state.core.status;
        if !from.is_operational() {
            return Err(LifecycleError::Transition { from, to }.into());
        }
        state.core.transit(to)?;
        if let Err(err) = self.persist(&mut state) {
            state.core.status = from;
            return Err(err);
        }
        tracing::info!(url = %state.core.url, %from, %to, "contract status changed");
        Ok(())
    }
}
