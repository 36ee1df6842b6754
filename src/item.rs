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

use amplify::confinement::{SmallBlob, SmallOrdMap, TinyOrdSet, TinyString};

use crate::{Address, Invocation, Layer, Outpoint, Txid, UtxoId, LIB_NAME_BIPACT};

/// Number of invocations per ledger bucket.
pub const BUCKET_SIZE: u64 = 100;

/// Schema version of persisted invocation records.
pub const ITEM_VERSION: u16 = 1;

pub const fn bucket_of(id: u64) -> u64 { id / BUCKET_SIZE }

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(lowercase)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT, tags = repr, try_from_u8, into_u8)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
#[repr(u8)]
pub enum ItemStatus {
    /// Accepted and awaiting settlement.
    #[strict_type(dumb)]
    #[display("pending")]
    NotYet = 0,
    Dealt = 1,
    Refunded = 2,
    /// Closed without entering the variant logic and without refund accounting.
    #[display("closed")]
    ClosedDirectly = 3,
    Cancelled = 4,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool { self != Self::NotYet }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
#[derive(StrictType, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT, tags = repr, try_from_u8, into_u8)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
#[repr(u8)]
pub enum Reason {
    #[default]
    #[strict_type(dumb)]
    #[display("")]
    Normal = 0,
    #[display("refund")]
    Refund = 1,
    #[display("cancel")]
    Cancel = 2,
    #[display("invalid")]
    Invalid = 3,
    #[display("inner error")]
    InnerError = 4,
    #[display("no enough asset")]
    InsufficientAsset = 5,
    #[display("slippage protection")]
    SlippageProtection = 6,
    #[display("input utxo not found")]
    UtxoNotFound = 7,
    #[display("input utxo not found after reorg")]
    UtxoNotFoundAfterReorg = 8,
}

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ItemError {
    /// invocation #{id} is already {status} and can't be changed.
    Terminal { id: u64, status: ItemStatus },

    /// invocation #{id} doesn't have enough remaining funds.
    Overspend { id: u64 },

    /// invocation #{0} can't be settled into a pending status.
    NotTerminal(u64),

    /// history of invoker {0} has too many buckets.
    HistoryOverflow(Address),
}

/// One accepted interaction with a contract, keyed by its funding output.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct InvocationItem {
    pub id: u64,
    pub status: ItemStatus,
    pub reason: Reason,
    pub action: TinyString,
    pub outpoint: Outpoint,
    /// Cleared while the funding output awaits re-confirmation after a reorganization.
    pub utxo_id: Option<UtxoId>,
    /// Height of the block in which the funding output was observed.
    pub height: u64,
    pub address: Address,
    pub from_l1: bool,
    pub to_l1: bool,
    pub param: SmallBlob,
    pub in_amt: u128,
    pub in_value: u64,
    pub remaining_amt: u128,
    pub remaining_value: u64,
    pub service_fee: u64,
    pub out_amt: u128,
    pub out_value: u64,
    pub out_txid: Option<Txid>,
}

impl InvocationItem {
    pub fn new(id: u64, layer: Layer, height: u64, invocation: &Invocation) -> Self {
        Self {
            id,
            status: ItemStatus::NotYet,
            reason: Reason::Normal,
            action: invocation.action.clone(),
            outpoint: invocation.outpoint,
            utxo_id: Some(invocation.utxo_id),
            height,
            address: invocation.address.clone(),
            from_l1: layer == Layer::Base,
            to_l1: invocation.to_l1,
            param: invocation.param.clone(),
            in_amt: invocation.amount,
            in_value: invocation.value,
            remaining_amt: invocation.amount,
            remaining_value: invocation.value,
            service_fee: 0,
            out_amt: 0,
            out_value: 0,
            out_txid: None,
        }
    }

    pub fn layer(&self) -> Layer { if self.from_l1 { Layer::Base } else { Layer::Settlement } }

    pub fn bucket(&self) -> u64 { bucket_of(self.id) }

    pub fn is_terminal(&self) -> bool { self.status.is_terminal() }

    fn ensure_pending(&self) -> Result<(), ItemError> {
        if self.is_terminal() {
            return Err(ItemError::Terminal { id: self.id, status: self.status });
        }
        Ok(())
    }

    /// Charges the service fee, reducing remaining value.
    pub fn charge_fee(&mut self, fee: u64) -> Result<(), ItemError> {
        self.consume(0, fee)?;
        self.service_fee += fee;
        Ok(())
    }

    /// Takes part of the remaining amount and value into a pending match.
    pub fn consume(&mut self, amt: u128, value: u64) -> Result<(), ItemError> {
        self.ensure_pending()?;
        if amt > self.remaining_amt || value > self.remaining_value {
            return Err(ItemError::Overspend { id: self.id });
        }
        self.remaining_amt -= amt;
        self.remaining_value -= value;
        Ok(())
    }

    /// Records a payout which will be made by the settling transaction.
    pub fn add_output(&mut self, amt: u128, value: u64) -> Result<(), ItemError> {
        self.ensure_pending()?;
        self.out_amt += amt;
        self.out_value += value;
        Ok(())
    }

    /// Moves the item into a terminal status. Terminal statuses never change afterwards.
    pub fn settle(&mut self, status: ItemStatus, reason: Reason, txid: Option<Txid>) -> Result<(), ItemError> {
        self.ensure_pending()?;
        if !status.is_terminal() {
            return Err(ItemError::NotTerminal(self.id));
        }
        self.status = status;
        self.reason = reason;
        if txid.is_some() {
            self.out_txid = txid;
        }
        Ok(())
    }

    /// Closes an item whose parameters were rejected. No refund is accounted for such items.
    pub fn close_invalid(&mut self) -> Result<(), ItemError> {
        self.settle(ItemStatus::ClosedDirectly, Reason::Invalid, None)
    }
}

/// Layout of invocation records persisted before destination-layer flags and service fees were
/// tracked.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
pub struct LegacyInvocationItem {
    pub id: u64,
    pub status: ItemStatus,
    pub reason: Reason,
    pub action: TinyString,
    pub outpoint: Outpoint,
    pub utxo_id: Option<UtxoId>,
    pub height: u64,
    pub address: Address,
    pub from_l1: bool,
    pub param: SmallBlob,
    pub in_amt: u128,
    pub in_value: u64,
    pub remaining_amt: u128,
    pub remaining_value: u64,
    pub out_amt: u128,
    pub out_value: u64,
    pub out_txid: Option<Txid>,
}

impl From<LegacyInvocationItem> for InvocationItem {
    fn from(old: LegacyInvocationItem) -> Self {
        Self {
            id: old.id,
            status: old.status,
            reason: old.reason,
            action: old.action,
            outpoint: old.outpoint,
            utxo_id: old.utxo_id,
            height: old.height,
            address: old.address,
            from_l1: old.from_l1,
            // Legacy records always paid out on the layer they came from.
            to_l1: old.from_l1,
            param: old.param,
            in_amt: old.in_amt,
            in_value: old.in_value,
            remaining_amt: old.remaining_amt,
            remaining_value: old.remaining_value,
            service_fee: 0,
            out_amt: old.out_amt,
            out_value: old.out_value,
            out_txid: old.out_txid,
        }
    }
}

/// Per-address aggregate over all invocations made by one invoker.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct InvokerStatus {
    pub address: Address,
    pub invoke_count: u64,
    pub input_amt: u128,
    pub input_value: u64,
    pub output_amt: u128,
    pub output_value: u64,
    pub refund_amt: u128,
    pub refund_value: u64,
    /// Invocation ids grouped by ledger bucket.
    pub history: SmallOrdMap<u64, TinyOrdSet<u64>>,
}

impl InvokerStatus {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            invoke_count: 0,
            input_amt: 0,
            input_value: 0,
            output_amt: 0,
            output_value: 0,
            refund_amt: 0,
            refund_value: 0,
            history: none!(),
        }
    }

    pub fn record_input(&mut self, item: &InvocationItem) -> Result<(), ItemError> {
        let overflow = || ItemError::HistoryOverflow(self.address.clone());
        let mut ids = self.history.get(&item.bucket()).cloned().unwrap_or_default();
        ids.push(item.id).map_err(|_| overflow())?;
        self.history.insert(item.bucket(), ids).map_err(|_| overflow())?;
        self.invoke_count += 1;
        self.input_amt += item.in_amt;
        self.input_value += item.in_value;
        Ok(())
    }

    pub fn record_settlement(&mut self, item: &InvocationItem) {
        match item.status {
            ItemStatus::Dealt => {
                self.output_amt += item.out_amt;
                self.output_value += item.out_value;
            }
            ItemStatus::Refunded | ItemStatus::Cancelled => {
                self.refund_amt += item.out_amt;
                self.refund_value += item.out_value;
            }
            ItemStatus::NotYet | ItemStatus::ClosedDirectly => {}
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ { self.history.values().flat_map(|ids| ids.iter().copied()) }
}
