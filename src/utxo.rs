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

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use amplify::hex::FromHex;
use amplify::Bytes32;

use crate::LIB_NAME_BIPACT;

/// Transaction identifier on either chain layer.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From, Display)]
#[wrapper(Deref, BorrowSlice, Hex, Index, RangeOps)]
#[display(LowerHex)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct Txid(
    #[from]
    #[from([u8; 32])]
    Bytes32,
);

impl FromStr for Txid {
    type Err = OutpointParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bytes32::from_hex(s)
            .map(Self)
            .map_err(|_| OutpointParseError::InvalidTxid(s.to_owned()))
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum OutpointParseError {
    /// outpoint '{0}' must have a form of `<txid>:<vout>`.
    Format(String),

    /// invalid transaction id '{0}'.
    InvalidTxid(String),

    /// invalid output number '{0}'.
    InvalidVout(String),
}

/// Transaction output reference; the primary key of an invocation.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct Outpoint {
    pub txid: Txid,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: impl Into<Txid>, vout: u32) -> Self { Self { txid: txid.into(), vout } }
}

impl Display for Outpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.txid, self.vout) }
}

impl FromStr for Outpoint {
    type Err = OutpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .split_once(':')
            .ok_or_else(|| OutpointParseError::Format(s.to_owned()))?;
        let txid = txid.parse()?;
        let vout = vout
            .parse()
            .map_err(|_| OutpointParseError::InvalidVout(vout.to_owned()))?;
        Ok(Self { txid, vout })
    }
}

/// Compact identifier of a confirmed transaction output as assigned by the chain indexer.
///
/// Encodes the block height in the upper 32 bits, transaction position inside the block in the
/// next 16 bits and the output number in the lowest 16 bits. The identifier of an output changes
/// when its transaction is re-mined in another block after a reorganization.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From, Display)]
#[wrapper(Deref)]
#[display(inner)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct UtxoId(u64);

impl UtxoId {
    pub const fn new(height: u32, tx_pos: u16, vout: u16) -> Self {
        Self(((height as u64) << 32) | ((tx_pos as u64) << 16) | vout as u64)
    }

    pub const fn height(self) -> u64 { self.0 >> 32 }
    pub const fn tx_pos(self) -> u16 { (self.0 >> 16) as u16 }
    pub const fn vout(self) -> u16 { self.0 as u16 }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]

    use super::*;

    #[test]
    fn utxo_id_layout() {
        let id = UtxoId::new(840_000, 12, 3);
        assert_eq!(id.height(), 840_000);
        assert_eq!(id.tx_pos(), 12);
        assert_eq!(id.vout(), 3);
        assert_eq!(*id, (840_000u64 << 32) | (12 << 16) | 3);
        assert!(UtxoId::new(101, 0, 0) > UtxoId::new(100, u16::MAX, u16::MAX));
    }

    #[test]
    fn outpoint_str() {
        let s = "0101010101010101010101010101010101010101010101010101010101010101:2";
        let outpoint = Outpoint::from_str(s).unwrap();
        assert_eq!(outpoint, Outpoint::new([1u8; 32], 2));
        assert_eq!(outpoint.to_string(), s);
        assert!(matches!(Outpoint::from_str("abcd"), Err(OutpointParseError::Format(_))));
        assert!(matches!(Outpoint::from_str("zz:1"), Err(OutpointParseError::InvalidTxid(_))));
    }
}
