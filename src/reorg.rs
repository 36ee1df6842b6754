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

use std::collections::BTreeSet;

use crate::ledger::LedgerError;
use crate::{BlockSource, ContractInstance, InstanceError, Layer, Reason, Store, Txid};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ReorgSummary {
    /// Items put back into the working set to await re-confirmation.
    pub reloaded: usize,
    /// Items whose funding transaction is gone.
    pub invalidated: usize,
    /// Layer cursor after the rollback.
    pub cursor: u64,
}

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum ReorgError {
    /// invalid {layer} reorganization: block {org} is not below the current block {current}.
    InvalidHeight { layer: Layer, org: u64, current: u64 },

    /// unable to check whether transaction {txid} still exists on {layer}. Details: {message}
    Source { layer: Layer, txid: Txid, message: String },

    /// {0}
    #[from]
    Ledger(LedgerError),

    /// {0}
    #[from]
    Instance(InstanceError),
}

impl<S: Store> ContractInstance<S> {
    /// Recovers from a reorganization of a layer which replaced blocks starting from `org_height`.
    ///
    /// Invocations observed at or above `org_height` lose their cached UTXO identifiers until they
    /// are observed again; those whose funding transactions disappeared are marked with
    /// [`Reason::UtxoNotFoundAfterReorg`] and, if still pending, disabled in the template logic.
    /// Items are never deleted. The layer cursor rolls back to `org_height - 1`, so the replacing
    /// blocks are processed again.
    ///
    /// # Blocking I/O
    ///
    /// Scans the invocation records in the store and queries the block source for each affected
    /// item with the state lock released.
    pub fn handle_reorg(
        &self,
        source: &impl BlockSource,
        layer: Layer,
        org_height: u64,
        curr_height: u64,
    ) -> Result<ReorgSummary, ReorgError> {
        if org_height == 0 || org_height > curr_height {
            return Err(ReorgError::InvalidHeight { layer, org: org_height, current: curr_height });
        }
        let _gate = self.gate.lock();

        let (url, items) = {
            let state = self.state.read();
            let items = state
                .ledger
                .load_from_height(self.store.as_ref(), layer, org_height)?;
            (state.core.url.clone(), items)
        };
        tracing::warn!(%url, %layer, org_height, curr_height, affected = items.len(), "handling reorganization");

        let mut gone = BTreeSet::new();
        for item in &items {
            let txid = item.outpoint.txid;
            let exists = source
                .transaction_still_exists(layer, txid)
                .map_err(|e| ReorgError::Source { layer, txid, message: e.to_string() })?;
            if !exists {
                gone.insert(item.outpoint);
            }
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        let savepoint = state.savepoint();

        let mut summary = ReorgSummary { reloaded: items.len(), invalidated: gone.len(), cursor: 0 };
        let mut reloaded = Vec::with_capacity(items.len());
        for mut item in items {
            item.utxo_id = None;
            if gone.contains(&item.outpoint) {
                tracing::info!(%url, id = item.id, outpoint = %item.outpoint, "invocation funding disappeared in reorg");
                item.reason = Reason::UtxoNotFoundAfterReorg;
                if !item.is_terminal() {
                    state.variant.disable_item(&mut item);
                }
            }
            reloaded.push(item);
        }
        state.ledger.reinsert(reloaded);

        let cursor = state.core.cursor(layer).min(org_height - 1);
        state.core.set_cursor(layer, cursor);
        summary.cursor = cursor;

        if let Err(err) = self.persist(state) {
            state.restore(savepoint);
            return Err(err.into());
        }
        Ok(summary)
    }
}
