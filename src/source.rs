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

use core::error::Error;

use amplify::confinement::{SmallBlob, TinyString};

use crate::{Address, ContractParams, ContractUrl, Outpoint, PublicKey, SigBlob, Txid, UtxoId, LIB_NAME_BIPACT};

/// Chain layer a block or invocation belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT, tags = repr, try_from_u8, into_u8)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
#[repr(u8)]
pub enum Layer {
    /// Slow base layer.
    #[display("l1")]
    Base = 1,
    /// Fast settlement layer.
    #[strict_type(dumb)]
    #[display("l2")]
    Settlement = 2,
}

/// Qualifying transaction output observed by the block source as an invocation of a contract.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Invocation {
    pub outpoint: Outpoint,
    pub utxo_id: UtxoId,
    pub address: Address,
    pub action: TinyString,
    pub param: SmallBlob,
    pub amount: u128,
    pub value: u64,
    /// Whether the invoker requests payout on the base layer.
    pub to_l1: bool,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct BlockData {
    pub layer: Layer,
    pub height: u64,
    pub invocations: Vec<Invocation>,
}

impl BlockData {
    pub fn empty(layer: Layer, height: u64) -> Self { Self { layer, height, invocations: vec![] } }
}

/// Heights from which the contract starts accepting invocations on each layer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct EnableParams {
    pub height_l1: u64,
    pub height_l2: u64,
    pub txid: Txid,
}

/// Data of a deployment transaction needed to complete contract installation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DeployTx {
    pub txid: Txid,
    pub url: ContractUrl,
    pub params: ContractParams,
    pub deploy_time: i64,
    /// Output funding the contract on the multisig address, if any.
    pub funding: Option<(Outpoint, u64)>,
    /// Signatures of the deployment invoice by the peers.
    pub invoice_sigs: Vec<(PublicKey, SigBlob)>,
}

/// Blockchain access used by the runtime: indexer and node RPC clients implement it.
pub trait BlockSource {
    type Error: Error;

    fn fetch_transaction(&self, txid: Txid) -> Result<DeployTx, Self::Error>;

    /// Requests blocks `start..=end` of a layer to be synchronized again and returns them in height
    /// order.
    fn resync_range(&self, layer: Layer, start: u64, end: u64) -> Result<Vec<BlockData>, Self::Error>;

    fn transaction_still_exists(&self, layer: Layer, txid: Txid) -> Result<bool, Self::Error>;
}
