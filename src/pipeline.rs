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

use crate::instance::InstanceState;
use crate::ledger::LedgerError;
use crate::{
    BlockData, BlockSource, ContractInstance, ContractStatus, InstanceError, InvocationItem, ItemError, ItemStatus, Layer,
    Reason, Store, VariantError,
};

/// Outcome of feeding a block into a layer cursor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Advance {
    /// The layer is not enabled at this height yet; the cursor moved without processing.
    NotEnabled { height: u64 },

    /// The block was applied.
    Applied { height: u64, accepted: usize },
}

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum PipelineError {
    /// {layer} block {height} is stale: the contract cursor is already at {cursor}.
    Stale { layer: Layer, cursor: u64, height: u64 },

    /// unable to resync {layer} blocks {start}..={end}. Details: {message}
    Resync { layer: Layer, start: u64, end: u64, message: String },

    /// block source was expected to provide {layer} block {expected}, but provided {got}.
    ResyncIncomplete { layer: Layer, expected: u64, got: u64 },

    /// {0}
    #[from]
    Instance(InstanceError),

    /// {0}
    #[from]
    Ledger(LedgerError),

    /// {0}
    #[from]
    Item(ItemError),
}

enum Step {
    Done(Advance),
    Gap { start: u64, end: u64 },
}

impl<S: Store> ContractInstance<S> {
    /// Feeds the next block of a layer into the contract.
    ///
    /// Blocks must come strictly in height order. A block from the past is rejected without any
    /// change; a block from the future makes the contract resync the missing range from the block
    /// source and apply it first.
    ///
    /// # Blocking I/O
    ///
    /// Calls the block source when resync is needed, and writes to the store after each applied
    /// block.
    pub fn advance(&self, source: &impl BlockSource, block: BlockData) -> Result<Advance, PipelineError> {
        let _gate = self.gate.lock();
        let layer = block.layer;

        let (start, end) = match self.step(&block)? {
            Step::Done(advance) => return Ok(advance),
            Step::Gap { start, end } => (start, end),
        };

        tracing::warn!(url = %self.url(), %layer, start, end, "missing blocks, requesting resync");
        let missing = source
            .resync_range(layer, start, end)
            .map_err(|e| PipelineError::Resync { layer, start, end, message: e.to_string() })?;
        for missed in missing {
            if missed.layer != layer || missed.height < start || missed.height > end {
                tracing::debug!(%layer, height = missed.height, "ignoring block outside of the resync range");
                continue;
            }
            if let Step::Gap { start: expected, .. } = self.step(&missed)? {
                return Err(PipelineError::ResyncIncomplete { layer, expected, got: missed.height });
            }
        }

        match self.step(&block)? {
            Step::Done(advance) => Ok(advance),
            Step::Gap { start: expected, .. } => {
                Err(PipelineError::ResyncIncomplete { layer, expected, got: block.height })
            }
        }
    }

    fn step(&self, block: &BlockData) -> Result<Step, PipelineError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let layer = block.layer;
        let height = block.height;
        let cursor = state.core.cursor(layer);

        let Some(enable) = state.core.enable_height(layer).filter(|enable| height >= *enable) else {
            if height > cursor {
                state.core.set_cursor(layer, height);
                if let Err(err) = self.persist(state) {
                    state.core.set_cursor(layer, cursor);
                    return Err(err.into());
                }
            }
            return Ok(Step::Done(Advance::NotEnabled { height }));
        };

        // Blocks below the enable height carry nothing to process.
        let next = cursor.max(enable - 1) + 1;
        if height < next {
            return Err(PipelineError::Stale { layer, cursor, height });
        }
        if height > next {
            return Ok(Step::Gap { start: next, end: height - 1 });
        }

        let savepoint = state.savepoint();
        let prev_count = state.core.invoke_count;
        state.core.set_cursor(layer, height);
        let result = self.apply_block(state, block).and_then(|accepted| {
            self.update_lifecycle(state);
            if state.update_checkpoint(prev_count) {
                tracing::debug!(url = %state.core.url, counter = state.core.invoke_count,
                    digest = %state.core.running_digest, "running state digest updated");
            }
            self.persist(state)?;
            Ok(accepted)
        });
        match result {
            Ok(accepted) => Ok(Step::Done(Advance::Applied { height, accepted })),
            Err(err) => {
                state.restore(savepoint);
                Err(err)
            }
        }
    }

    fn apply_block(&self, state: &mut InstanceState, block: &BlockData) -> Result<usize, PipelineError> {
        if let Err(reason) = state.core.allow_invoke() {
            if !block.invocations.is_empty() {
                tracing::debug!(url = %state.core.url, layer = %block.layer, height = block.height, %reason,
                    "contract doesn't accept invocations, skipping block");
            }
            return Ok(0);
        }
        if !state.core.status.is_operational() {
            if !block.invocations.is_empty() {
                tracing::debug!(url = %state.core.url, layer = %block.layer, height = block.height,
                    status = %state.core.status, "contract is closing, skipping block");
            }
            return Ok(0);
        }

        let store = self.store.as_ref();
        let mut accepted = 0usize;
        for invocation in &block.invocations {
            if state
                .ledger
                .refresh_utxo(store, invocation.outpoint, invocation.utxo_id, block.height)?
            {
                continue;
            }

            let mut item = InvocationItem::new(state.core.invoke_count, block.layer, block.height, invocation);
            let checked = state
                .variant
                .check_invoke_param(&state.core, invocation)
                .and_then(|fee| {
                    item.charge_fee(fee)
                        .map_err(|e| VariantError::InvalidParam(e.to_string()))
                });
            match checked {
                Err(err) => {
                    tracing::debug!(url = %state.core.url, id = item.id, outpoint = %item.outpoint, error = %err,
                        "invalid invocation");
                    item.close_invalid()?;
                }
                Ok(()) => {
                    if let Err(err) = state.variant.apply_invocation(&state.core, &mut item) {
                        tracing::warn!(url = %state.core.url, id = item.id, error = %err,
                            "template failed to process invocation");
                        if !item.is_terminal() {
                            item.settle(ItemStatus::ClosedDirectly, Reason::InnerError, None)?;
                        }
                    }
                }
            }

            let invoker = state.ledger.invoker_mut(store, &item.address)?;
            invoker.record_input(&item)?;
            invoker.record_settlement(&item);
            state.ledger.accept(item);
            state.core.invoke_count += 1;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Starts closing of expired contracts and terminates closing contracts without pending
    /// invocations.
    pub(crate) fn update_lifecycle(&self, state: &mut InstanceState) {
        let core = &mut state.core;
        if core.status.is_operational() && core.is_expired() && core.transit(ContractStatus::CLOSING).is_ok() {
            tracing::info!(url = %core.url, block = core.curr_block, "contract validity window passed, closing");
        }
        if core.status == ContractStatus::CLOSING && state.ledger.pending_count() == 0 {
            let terminal = if core.is_expired() { ContractStatus::EXPIRED } else { ContractStatus::CLOSED };
            if core.transit(terminal).is_ok() {
                tracing::info!(url = %core.url, status = %terminal, "contract terminated");
            }
        }
    }
}
