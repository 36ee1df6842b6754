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

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use amplify::confinement::{SmallBlob, SmallVec, TinyString};
use bipact::{
    Address, AssetName, BlockData, BlockSource, Broadcaster, ContractInstance, ContractParams, ContractStatus,
    ContractVariant, CoreState, DeployTx, DeploymentReservation, EnableParams, Invocation, InvocationItem, ItemStatus,
    Layer, MemStore, Outpoint, PublicKey, Reason, SettleKind, SettleRequest, SettlementOutput, SettlementPlan,
    SigBlob, SigValidator, Signer, Store, StubFeeError, TemplateName, Txid, UtxoId, VariantDigest, VariantError,
};
use commit_verify::{Digest, Sha256};
use parking_lot::Mutex;

pub const INVOKE_FEE: u64 = 10;
pub const MIN_FUNDING: u64 = 330;

#[derive(Clone, Debug, Display, Error)]
#[display("{0}")]
pub struct MockError(pub String);

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Slot {
    pub address: Address,
    pub amount: u128,
    pub value: u64,
}

/// Template which pools all invocations and pays them back in a single settlement.
#[derive(Clone, Debug, Default)]
pub struct PoolVariant {
    pub ready: bool,
    pub settlements: u64,
    pub pool: BTreeMap<Outpoint, Slot>,
}

impl PoolVariant {
    pub fn boxed() -> Box<dyn ContractVariant> { Box::new(Self::default()) }
}

impl ContractVariant for PoolVariant {
    fn template(&self) -> TemplateName { TemplateName::Swap }

    fn deploy_fee(&self, fee_rate: u64) -> u64 { 1000 + fee_rate * 100 }

    fn check_invoke_param(&self, _: &CoreState, invocation: &Invocation) -> Result<u64, VariantError> {
        if invocation.param.as_slice() == b"invalid" {
            return Err(VariantError::InvalidParam(s!("malformed order")));
        }
        Ok(INVOKE_FEE.min(invocation.value))
    }

    fn apply_invocation(&mut self, _: &CoreState, item: &mut InvocationItem) -> Result<(), VariantError> {
        if item.param.as_slice() == b"fail" {
            return Err(VariantError::Inner(s!("pool failure")));
        }
        self.pool.insert(item.outpoint, Slot {
            address: item.address.clone(),
            amount: item.remaining_amt,
            value: item.remaining_value,
        });
        Ok(())
    }

    fn is_ready_to_run(&self, _: &CoreState, deploy_tx: &DeployTx) -> Result<(), VariantError> {
        match deploy_tx.funding {
            Some((_, value)) if value >= MIN_FUNDING => Ok(()),
            _ => Err(VariantError::NotReady(s!("contract is not funded"))),
        }
    }

    fn set_ready(&mut self, _: &CoreState) { self.ready = true; }

    fn disable_item(&mut self, item: &mut InvocationItem) { self.pool.remove(&item.outpoint); }

    fn state_digest(&self) -> VariantDigest {
        let hash: [u8; 32] = Sha256::digest(self.export_state()).into();
        VariantDigest::from(hash)
    }

    fn settlement_plan(&self, core: &CoreState) -> Option<SettlementPlan> {
        if self.pool.is_empty() {
            return None;
        }
        let (kind, status) = if core.status == ContractStatus::CLOSING {
            (SettleKind::Refund, ItemStatus::Refunded)
        } else {
            (SettleKind::Deal, ItemStatus::Dealt)
        };
        let outputs = self
            .pool
            .iter()
            .map(|(outpoint, slot)| SettlementOutput {
                outpoint: *outpoint,
                status,
                reason: Reason::Normal,
                address: slot.address.clone(),
                amount: slot.amount,
                value: slot.value,
            })
            .collect::<Vec<_>>();
        Some(SettlementPlan { layer: Layer::Settlement, kind, outputs: SmallVec::from_checked(outputs) })
    }

    fn on_settled(&mut self, plan: &SettlementPlan) {
        for output in &plan.outputs {
            self.pool.remove(&output.outpoint);
        }
        self.settlements += 1;
    }

    fn export_state(&self) -> Vec<u8> {
        let mut text = format!("{} {}\n", self.ready, self.settlements);
        for (outpoint, slot) in &self.pool {
            text.push_str(&format!("{outpoint} {} {} {}\n", slot.address, slot.amount, slot.value));
        }
        text.into_bytes()
    }

    fn import_state(&mut self, data: &[u8]) -> Result<(), VariantError> {
        let err = || VariantError::State(s!("corrupted pool"));
        let text = String::from_utf8(data.to_vec()).map_err(|_| err())?;
        let mut lines = text.lines();
        let mut header = lines.next().ok_or_else(err)?.split(' ');
        let ready = header.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let settlements = header.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let mut pool = BTreeMap::new();
        for line in lines {
            let fields = line.split(' ').collect::<Vec<_>>();
            let [outpoint, address, amount, value] = fields[..] else {
                return Err(err());
            };
            pool.insert(outpoint.parse().map_err(|_| err())?, Slot {
                address: address.parse().map_err(|_| err())?,
                amount: amount.parse().map_err(|_| err())?,
                value: value.parse().map_err(|_| err())?,
            });
        }
        *self = Self { ready, settlements, pool };
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSource {
    pub blocks: BTreeMap<(Layer, u64), BlockData>,
    pub deploy_txs: BTreeMap<Txid, DeployTx>,
    pub gone: BTreeSet<Txid>,
    pub offline: bool,
    pub resyncs: RefCell<Vec<(Layer, u64, u64)>>,
    pub fetches: Cell<usize>,
}

impl MockSource {
    pub fn with_block(mut self, block: BlockData) -> Self {
        self.blocks.insert((block.layer, block.height), block);
        self
    }
}

impl BlockSource for MockSource {
    type Error = MockError;

    fn fetch_transaction(&self, txid: Txid) -> Result<DeployTx, Self::Error> {
        self.fetches.set(self.fetches.get() + 1);
        if self.offline {
            return Err(MockError(s!("source is offline")));
        }
        self.deploy_txs
            .get(&txid)
            .cloned()
            .ok_or_else(|| MockError(format!("unknown transaction {txid}")))
    }

    fn resync_range(&self, layer: Layer, start: u64, end: u64) -> Result<Vec<BlockData>, Self::Error> {
        self.resyncs.borrow_mut().push((layer, start, end));
        if self.offline {
            return Err(MockError(s!("source is offline")));
        }
        Ok((start..=end)
            .map(|height| {
                self.blocks
                    .get(&(layer, height))
                    .cloned()
                    .unwrap_or_else(|| BlockData::empty(layer, height))
            })
            .collect())
    }

    fn transaction_still_exists(&self, _: Layer, txid: Txid) -> Result<bool, Self::Error> {
        if self.offline {
            return Err(MockError(s!("source is offline")));
        }
        Ok(!self.gone.contains(&txid))
    }
}

/// Store rejecting writes under a key prefix until healed. Keeps a log of accepted writes.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemStore,
    failing: Mutex<Option<&'static str>>,
    log: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FlakyStore {
    pub fn fail_writes(&self, prefix: &'static str) { *self.failing.lock() = Some(prefix); }

    pub fn heal(&self) { *self.failing.lock() = None; }

    /// Values written under a key, oldest first.
    pub fn history(&self, key: &str) -> Vec<Vec<u8>> {
        self.log
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, value)| value.clone())
            .collect()
    }
}

impl Store for FlakyStore {
    type Error = MockError;

    fn write(&self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        if matches!(*self.failing.lock(), Some(prefix) if key.starts_with(prefix)) {
            return Err(MockError(format!("disk full while writing {key}")));
        }
        self.log.lock().push((key.to_owned(), value.to_vec()));
        self.inner.write(key, value).map_err(|e| match e {})
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> { self.inner.read(key).map_err(|e| match e {}) }

    fn batch_read(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Self::Error> {
        self.inner.batch_read(prefix).map_err(|e| match e {})
    }
}

/// Signature is the key followed by the message, which is enough to check that the right key
/// signed the right message.
pub struct MockSigner(pub PublicKey);

impl Signer for MockSigner {
    fn public_key(&self) -> PublicKey { self.0.clone() }

    fn sign(&self, message: [u8; 32]) -> SigBlob { mock_sig(&self.0, message) }
}

pub fn mock_sig(pubkey: &PublicKey, message: [u8; 32]) -> SigBlob {
    let mut data = pubkey.to_vec();
    data.extend(message);
    SigBlob::from(amplify::confinement::NonEmptyBlob::<4096>::try_from(data).unwrap())
}

pub struct MockValidator;

impl SigValidator for MockValidator {
    fn validate_sig(
        &self,
        message: impl Into<[u8; 32]>,
        pubkey: &PublicKey,
        sig: &SigBlob,
    ) -> Result<(), impl core::error::Error> {
        if *sig == mock_sig(pubkey, message.into()) {
            Ok(())
        } else {
            Err(MockError(s!("signature mismatch")))
        }
    }
}

pub struct MockBroadcaster {
    pub stub_fee: Option<u64>,
    pub fee: u64,
    pub sent: RefCell<Vec<SettleRequest>>,
}

impl MockBroadcaster {
    pub fn new(fee: u64) -> Self { Self { stub_fee: None, fee, sent: default!() } }

    pub fn failing(stub_fee: u64) -> Self { Self { stub_fee: Some(stub_fee), fee: 0, sent: default!() } }
}

impl Broadcaster for MockBroadcaster {
    fn broadcast(&self, request: &SettleRequest) -> Result<(Txid, u64), StubFeeError> {
        if let Some(stub_fee) = self.stub_fee {
            return Err(StubFeeError { stub_fee, message: s!("peer is unreachable") });
        }
        self.sent.borrow_mut().push(request.clone());
        Ok((txid(0xF0 + self.sent.borrow().len() as u8), self.fee))
    }
}

pub fn pubkey(byte: u8) -> PublicKey {
    let mut data = [byte; 33];
    data[0] = 0x02;
    PublicKey::from_slice(&data).unwrap()
}

pub fn txid(byte: u8) -> Txid { Txid::from([byte; 32]) }

pub fn address(name: &str) -> Address { name.parse().unwrap() }

pub fn params(start_block: u64, end_block: u64) -> ContractParams {
    ContractParams {
        template: TemplateName::Swap,
        asset: "ordx:f:pearl".parse::<AssetName>().unwrap(),
        start_block,
        end_block,
        content: SmallBlob::from_checked(b"swap pearl for sats".to_vec()),
    }
}

pub fn reservation(start_block: u64, end_block: u64) -> DeploymentReservation {
    let mut resv = DeploymentReservation::new(
        1,
        address("tb1qchannel"),
        params(start_block, end_block),
        address("tb1qdeployer"),
        10,
        pubkey(0x11),
        pubkey(0x22),
    )
    .unwrap();
    resv.deploy_time = 1_700_000_000;
    resv
}

/// Contract state as seen by the second peer.
pub fn peer_core(core: &CoreState) -> CoreState {
    let mut core = core.clone();
    core::mem::swap(&mut core.local_pubkey, &mut core.remote_pubkey);
    core
}

pub fn invocation(txid_byte: u8, vout: u32, height: u64, from: &str, amount: u128, value: u64) -> Invocation {
    Invocation {
        outpoint: Outpoint::new(txid(txid_byte), vout),
        utxo_id: UtxoId::new(height as u32, txid_byte as u16, vout as u16),
        address: address(from),
        action: TinyString::from_checked(s!("swap")),
        param: SmallBlob::default(),
        amount,
        value,
        to_l1: false,
    }
}

pub fn with_param(mut invocation: Invocation, param: &[u8]) -> Invocation {
    invocation.param = SmallBlob::from_checked(param.to_vec());
    invocation
}

pub fn block(layer: Layer, height: u64, invocations: Vec<Invocation>) -> BlockData {
    BlockData { layer, height, invocations }
}

/// Running contract enabled from block 100 on the settlement layer and block 50 on the base layer,
/// with both cursors right before the enable heights.
pub fn running<S: Store>(store: Arc<S>, core: CoreState) -> ContractInstance<S> {
    let mut core = core;
    core.status = ContractStatus::READY;
    core.curr_block = 99;
    core.curr_block_l1 = 49;
    let instance = ContractInstance::new(store, core, PoolVariant::boxed());
    instance.save().unwrap();
    instance
        .set_enable_heights(EnableParams { height_l1: 50, height_l2: 100, txid: txid(0xEE) })
        .unwrap();
    instance
}
