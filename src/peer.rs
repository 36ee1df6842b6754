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

use amplify::ByteArray;
use commit_verify::CommitId;

use crate::{
    ContractInstance, ContractUrl, CoreState, InvoiceDigest, Layer, PublicKey, SettlementPlan, SigBlob, SigValidator,
    Signer, StateDigest, StaticDigest, Store, LIB_NAME_BIPACT,
};

/// Running-state digest at a given invocation counter.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct Checkpoint {
    pub counter: u64,
    pub digest: StateDigest,
}

/// Request to co-sign a settlement transaction, sent by the initiating peer.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[derive(CommitEncode)]
#[commit_encode(strategy = strict, id = InvoiceDigest)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct SettleRequest {
    pub url: ContractUrl,
    pub static_digest: StaticDigest,
    pub checkpoint: Checkpoint,
    pub plan: SettlementPlan,
}

impl SettleRequest {
    pub fn with(core: &CoreState, plan: SettlementPlan) -> Self {
        Self {
            url: core.url.clone(),
            static_digest: core.static_digest,
            checkpoint: Checkpoint { counter: core.invoke_count, digest: core.running_digest },
            plan,
        }
    }

    pub fn layer(&self) -> Layer { self.plan.layer }

    pub fn request_id(&self) -> InvoiceDigest { self.commit_id() }
}

/// Signature of the counter-party over an accepted settlement request.
#[derive(Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct CoSignature {
    pub request: InvoiceDigest,
    pub pubkey: PublicKey,
    pub sig: SigBlob,
}

impl CoSignature {
    pub fn verify(&self, validator: &impl SigValidator) -> bool {
        validator
            .validate_sig(self.request.to_byte_array(), &self.pubkey, &self.sig)
            .is_ok()
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum PeerError {
    /// request is made for contract {0}, which is not known.
    WrongContract(ContractUrl),

    /// contract parameters digest {claimed} doesn't match the local one {local}; the peers run
    /// different contracts.
    StaticMismatch { claimed: StaticDigest, local: StaticDigest },

    /// claimed invocation counter {claimed} is ahead of the local counter {local}.
    CounterAhead { claimed: u64, local: u64 },

    /// state digest for invocation counter {0} is not available anymore.
    Unverifiable(u64),

    /// running state at invocation counter {0} differs from the local one.
    Inconsistent(u64),

    /// historical state at invocation counter {claimed} differs from the local one (the local
    /// counter is {local}).
    StaleInconsistent { claimed: u64, local: u64 },

    /// contract doesn't expect any settlement.
    NoSettlementExpected,

    /// settlement plan doesn't match the one expected by the contract.
    PlanMismatch,
}

impl<S: Store> ContractInstance<S> {
    /// Current invocation counter and running-state digest.
    pub fn checkpoint(&self) -> Checkpoint {
        let state = self.state.read();
        Checkpoint { counter: state.core.invoke_count, digest: state.core.running_digest }
    }

    /// Checks a settlement request of the peer against the local contract state and, if both agree,
    /// co-signs it.
    ///
    /// Since both the digest at each counter and the expected settlement are deterministic, a
    /// second request for the same counter either gets the same signature or is rejected.
    pub fn verify_peer_request(&self, request: &SettleRequest, signer: &impl Signer) -> Result<CoSignature, PeerError> {
        let state = self.state.read();
        let core = &state.core;
        if request.url != core.url {
            return Err(PeerError::WrongContract(request.url.clone()));
        }
        verify_checkpoint(core, request.static_digest, request.checkpoint).inspect_err(|err| {
            tracing::warn!(url = %core.url, counter = request.checkpoint.counter, error = %err,
                "peer state check failed");
        })?;

        let expected = state
            .variant
            .settlement_plan(core)
            .ok_or(PeerError::NoSettlementExpected)?;
        if expected != request.plan {
            tracing::warn!(url = %core.url, counter = request.checkpoint.counter, "peer settlement plan mismatch");
            return Err(PeerError::PlanMismatch);
        }

        let request_id = request.request_id();
        tracing::info!(url = %core.url, counter = request.checkpoint.counter, %request_id, "co-signing settlement");
        Ok(CoSignature { request: request_id, pubkey: signer.public_key(), sig: signer.sign(request_id.to_byte_array()) })
    }
}

/// Compares the claimed static digest and checkpoint with the local contract state.
pub fn verify_checkpoint(core: &CoreState, static_digest: StaticDigest, claimed: Checkpoint) -> Result<(), PeerError> {
    if static_digest != core.static_digest {
        return Err(PeerError::StaticMismatch { claimed: static_digest, local: core.static_digest });
    }
    let local_counter = core.invoke_count;
    if claimed.counter > local_counter {
        return Err(PeerError::CounterAhead { claimed: claimed.counter, local: local_counter });
    }
    let local = if claimed.counter == local_counter {
        core.running_digest
    } else {
        core.history
            .get(claimed.counter)
            .ok_or(PeerError::Unverifiable(claimed.counter))?
    };
    if local != claimed.digest {
        return Err(if claimed.counter == local_counter {
            PeerError::Inconsistent(claimed.counter)
        } else {
            PeerError::StaleInconsistent { claimed: claimed.counter, local: local_counter }
        });
    }
    Ok(())
}
