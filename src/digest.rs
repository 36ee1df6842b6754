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

use core::str::FromStr;

use amplify::confinement::TinyOrdMap;
use amplify::hex::{self, FromHex};
use amplify::Bytes32;
use commit_verify::{CommitId, CommitmentId, DigestExt, Sha256};

use crate::{Address, ContractStatus, Txid, LIB_NAME_BIPACT};

/// Number of historical running-state digests kept per contract.
///
/// Both peers must use the same value, so it is a protocol constant rather than a configuration
/// option.
pub const DIGEST_HISTORY_CAP: usize = 10;

macro_rules! commitment_id {
    ($(#[$attr:meta])* $name:ident, $tag:literal) => {
        $(#[$attr])*
        #[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From, Display)]
        #[wrapper(Deref, BorrowSlice, Hex, Index, RangeOps)]
        #[display(LowerHex)]
        #[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
        #[strict_type(lib = LIB_NAME_BIPACT)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
        pub struct $name(
            #[from]
            #[from([u8; 32])]
            Bytes32,
        );

        impl From<Sha256> for $name {
            fn from(hasher: Sha256) -> Self { hasher.finish().into() }
        }

        impl CommitmentId for $name {
            const TAG: &'static str = $tag;
        }

        impl FromStr for $name {
            type Err = hex::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> { Bytes32::from_hex(s).map(Self) }
        }
    };
}

commitment_id!(
    /// Digest of the immutable contract parameters.
    StaticDigest,
    "urn:bipact:contract:static#2025-03-01"
);
commitment_id!(
    /// Digest of the runtime fields shared by all contract templates.
    BaseDigest,
    "urn:bipact:contract:base#2025-03-01"
);
commitment_id!(
    /// Digest of template-specific state, produced by the contract variant.
    VariantDigest,
    "urn:bipact:contract:variant#2025-03-01"
);
commitment_id!(
    /// Running-state digest combining static, base and variant digests.
    StateDigest,
    "urn:bipact:contract:state#2025-03-01"
);
commitment_id!(
    /// Digest of an invoice signed by a peer.
    InvoiceDigest,
    "urn:bipact:invoice#2025-03-01"
);

/// Runtime fields common to all contract templates which are committed into the running-state
/// digest.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[derive(CommitEncode)]
#[commit_encode(strategy = strict, id = BaseDigest)]
pub struct RuntimeBase {
    pub deploy_time: i64,
    pub status: ContractStatus,
    pub enable_block: u64,
    pub enable_block_l1: u64,
    pub enable_txid: Option<Txid>,
    pub deployer: Address,
    pub channel: Address,
    pub resv_id: u64,
    pub invoke_count: u64,
    pub divisibility: u8,
    pub n: u32,
}

impl RuntimeBase {
    pub fn base_digest(&self) -> BaseDigest { self.commit_id() }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[derive(CommitEncode)]
#[commit_encode(strategy = strict, id = StateDigest)]
pub struct StateCommitment {
    pub static_digest: StaticDigest,
    pub base_digest: BaseDigest,
    pub variant_digest: VariantDigest,
}

impl StateCommitment {
    pub fn state_digest(&self) -> StateDigest { self.commit_id() }
}

/// Bounded history of running-state digests keyed by the invocation counter at which each of
/// them was current.
///
/// Holds at most [`DIGEST_HISTORY_CAP`] entries; archiving into a full history evicts the entry
/// with the smallest counter.
#[derive(Wrapper, Clone, Eq, PartialEq, Debug, Default, From)]
#[wrapper(Deref)]
#[derive(StrictType, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct DigestHistory(TinyOrdMap<u64, StateDigest>);

impl DigestHistory {
    pub fn archive(&mut self, counter: u64, digest: StateDigest) {
        if !self.0.contains_key(&counter) {
            while self.0.len() >= DIGEST_HISTORY_CAP {
                let Some(oldest) = self.0.keys().next().copied() else {
                    break;
                };
                let _ = self.0.remove(&oldest);
            }
        }
        self.0
            .insert(counter, digest)
            .expect("digest history is capped far below the confinement limit");
    }

    pub fn get(&self, counter: u64) -> Option<StateDigest> { self.0.get(&counter).copied() }

    pub fn oldest(&self) -> Option<u64> { self.0.keys().next().copied() }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]

    use super::*;

    #[test]
    fn history_evicts_lowest() {
        let mut history = DigestHistory::default();
        for counter in 0..15u64 {
            history.archive(counter, StateDigest::from([counter as u8; 32]));
        }
        assert_eq!(history.len(), DIGEST_HISTORY_CAP);
        assert_eq!(history.oldest(), Some(5));
        assert_eq!(history.get(4), None);
        assert_eq!(history.get(14), Some(StateDigest::from([14u8; 32])));
    }

    #[test]
    fn history_overwrite_keeps_size() {
        let mut history = DigestHistory::default();
        for counter in 0..10u64 {
            history.archive(counter, StateDigest::from([0u8; 32]));
        }
        history.archive(3, StateDigest::from([7u8; 32]));
        assert_eq!(history.len(), 10);
        assert_eq!(history.oldest(), Some(0));
        assert_eq!(history.get(3), Some(StateDigest::from([7u8; 32])));
    }

    #[test]
    fn digest_sensitivity() {
        let base = RuntimeBase {
            deploy_time: 1_700_000_000,
            status: ContractStatus::READY,
            enable_block: 100,
            enable_block_l1: 800_000,
            enable_txid: None,
            deployer: "tb1qdeployer".parse().unwrap(),
            channel: "tb1qchannel".parse().unwrap(),
            resv_id: 1,
            invoke_count: 0,
            divisibility: 8,
            n: 0,
        };
        let mut other = base.clone();
        assert_eq!(base.base_digest(), other.base_digest());
        other.invoke_count += 1;
        assert_ne!(base.base_digest(), other.base_digest());

        let commitment = StateCommitment {
            static_digest: StaticDigest::from([1u8; 32]),
            base_digest: base.base_digest(),
            variant_digest: VariantDigest::from([2u8; 32]),
        };
        let digest = commitment.state_digest();
        assert_eq!(digest, commitment.state_digest());
        assert_eq!(StateDigest::from_str(&digest.to_string()).unwrap(), digest);
    }
}
