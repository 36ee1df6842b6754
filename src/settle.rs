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

use amplify::confinement::SmallVec;

use crate::instance::InstanceState;
use crate::ledger::LedgerError;
use crate::{
    verify_checkpoint, Address, ContractInstance, ContractStatus, InstanceError, ItemError, ItemStatus, Layer,
    LifecycleError, Outpoint, PeerError, Reason, SettleRequest, Store, Txid, LIB_NAME_BIPACT,
};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(lowercase)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT, tags = repr, try_from_u8, into_u8)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
#[repr(u8)]
pub enum SettleKind {
    #[strict_type(dumb)]
    Deal = 1,
    Refund = 2,
    Close = 3,
}

/// Payout of a single invocation made by a settlement transaction.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct SettlementOutput {
    pub outpoint: Outpoint,
    pub status: ItemStatus,
    pub reason: Reason,
    pub address: Address,
    pub amount: u128,
    pub value: u64,
}

/// Settlement which a contract template expects to be made.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct SettlementPlan {
    pub layer: Layer,
    pub kind: SettleKind,
    pub outputs: SmallVec<SettlementOutput>,
}

/// Builds, co-signs with the peer and broadcasts settlement transactions.
pub trait Broadcaster {
    /// # Returns
    ///
    /// Id of the broadcasted transaction and the fee it paid.
    fn broadcast(&self, request: &SettleRequest) -> Result<(Txid, u64), StubFeeError>;
}

/// Settlement attempt failed after a fee was already spent.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display("settlement failed after spending {stub_fee} sats on fees: {message}")]
pub struct StubFeeError {
    pub stub_fee: u64,
    pub message: String,
}

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum SettleError {
    /// {0}
    #[from]
    Broadcast(StubFeeError),

    /// settlement references unknown invocation {0}.
    UnknownItem(Outpoint),

    /// settlement was made for contract {0}, which is a different contract.
    WrongContract(String),

    /// {0}
    #[from]
    Lifecycle(LifecycleError),

    /// settlement was made from a state this node doesn't share. Details: {0}
    #[from]
    Peer(PeerError),

    /// {0}
    #[from]
    Item(ItemError),

    /// {0}
    #[from]
    Ledger(LedgerError),

    /// {0}
    #[from]
    Instance(InstanceError),
}

impl<S: Store> ContractInstance<S> {
    /// Settlement request for the next settlement expected by the contract template, stamped with
    /// the current checkpoint.
    pub fn settlement_request(&self) -> Option<SettleRequest> {
        let state = self.state.read();
        let plan = state.variant.settlement_plan(&state.core)?;
        Some(SettleRequest::with(&state.core, plan))
    }

    /// Makes the next settlement expected by the contract template, if any.
    ///
    /// Fees spent on failed attempts are accounted for, and the settlement is retried with the next
    /// processed block.
    ///
    /// # Blocking I/O
    ///
    /// Calls the broadcaster with the state lock released.
    pub fn settle(&self, broadcaster: &impl Broadcaster) -> Result<Option<Txid>, SettleError> {
        let _gate = self.gate.lock();
        let request = {
            let state = self.state.read();
            let status = state.core.status;
            if !status.is_operational() && status != ContractStatus::CLOSING {
                return Err(LifecycleError::NotReady.into());
            }
            let Some(plan) = state.variant.settlement_plan(&state.core) else {
                return Ok(None);
            };
            SettleRequest::with(&state.core, plan)
        };

        let result = broadcaster.broadcast(&request);

        let mut guard = self.state.write();
        let state = &mut *guard;
        let savepoint = state.savepoint();
        let (txid, fee) = match result {
            Ok(broadcast) => broadcast,
            Err(err) => {
                tracing::warn!(url = %state.core.url, counter = request.checkpoint.counter, stub_fee = err.stub_fee,
                    error = %err.message, "settlement broadcast failed");
                state.core.fee_total += err.stub_fee;
                if let Err(e) = self.persist(state) {
                    state.restore(savepoint);
                    return Err(e.into());
                }
                return Err(err.into());
            }
        };

        let result = self.apply_plan(state, &request, txid).and_then(|_| {
            state.core.fee_total += fee;
            self.update_lifecycle(state);
            self.persist(state)?;
            Ok(())
        });
        if let Err(err) = result {
            state.restore(savepoint);
            return Err(err);
        }
        tracing::info!(url = %state.core.url, %txid, fee, counter = request.checkpoint.counter, "settlement broadcasted");
        Ok(Some(txid))
    }

    /// Applies a settlement co-signed by this node and broadcasted by the peer.
    ///
    /// The checkpoint of the request must match the local state, as it does when this node
    /// co-signed it. Repeated application of the same settlement has no effect.
    pub fn apply_settlement(&self, request: &SettleRequest, txid: Txid) -> Result<(), SettleError> {
        let _gate = self.gate.lock();
        let mut guard = self.state.write();
        let state = &mut *guard;
        if request.url != state.core.url {
            return Err(SettleError::WrongContract(request.url.to_string()));
        }
        let savepoint = state.savepoint();
        let result = self.apply_plan(state, request, txid).and_then(|_| {
            self.update_lifecycle(state);
            self.persist(state)?;
            Ok(())
        });
        if let Err(err) = result {
            state.restore(savepoint);
            return Err(err);
        }
        Ok(())
    }

    fn apply_plan(&self, state: &mut InstanceState, request: &SettleRequest, txid: Txid) -> Result<(), SettleError> {
        let plan = &request.plan;
        let mut applied = false;
        for output in &plan.outputs {
            if state.ledger.get(output.outpoint).is_none() {
                match state.ledger.by_outpoint(self.store.as_ref(), output.outpoint)? {
                    Some(item) if item.out_txid == Some(txid) => continue,
                    Some(item) => return Err(ItemError::Terminal { id: item.id, status: item.status }.into()),
                    None => return Err(SettleError::UnknownItem(output.outpoint)),
                }
            }
            let item = state
                .ledger
                .modify(output.outpoint, |item| {
                    if item.is_terminal() && item.out_txid == Some(txid) {
                        return Ok(None);
                    }
                    item.add_output(output.amount, output.value)?;
                    item.settle(output.status, output.reason, Some(txid))?;
                    Ok(Some(item.clone()))
                })
                .ok_or(SettleError::UnknownItem(output.outpoint))??;
            if let Some(item) = item {
                state
                    .ledger
                    .invoker_mut(self.store.as_ref(), &item.address)?
                    .record_settlement(&item);
                applied = true;
            }
        }
        if applied {
            // Items were changed only in the working set, and are rolled back by the caller.
            verify_checkpoint(&state.core, request.static_digest, request.checkpoint).inspect_err(|err| {
                tracing::warn!(url = %state.core.url, counter = request.checkpoint.counter, error = %err,
                    "rejecting settlement made from a foreign state");
            })?;
            state.variant.on_settled(plan);
            state.core.set_checkpoint(plan.layer, request.checkpoint.counter);
        }
        Ok(())
    }
}
