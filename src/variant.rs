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

use crate::{
    CoreState, DeployTx, Invocation, InvocationItem, SettlementPlan, TemplateName, VariantDigest,
};

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum VariantError {
    /// invalid invocation parameters: {0}.
    InvalidParam(String),

    /// contract is not ready to run: {0}.
    NotReady(String),

    /// invalid template state data: {0}.
    State(String),

    /// {0}
    Inner(String),
}

/// Template-specific contract logic.
///
/// The runtime never knows a concrete template; it drives all of them through this trait, and each
/// implementation keeps its own pools and derived state. Implementations must be deterministic:
/// two peers feeding the same invocations must end up with identical [`Self::state_digest`].
pub trait ContractVariant: Send + Sync {
    fn template(&self) -> TemplateName;

    /// Full deployment fee at a given fee rate, including the service fee.
    fn deploy_fee(&self, fee_rate: u64) -> u64;

    /// Validates invocation parameters before the invocation enters the pools.
    ///
    /// # Returns
    ///
    /// Service fee charged for the invocation.
    fn check_invoke_param(&self, core: &CoreState, invocation: &Invocation) -> Result<u64, VariantError>;

    /// Feeds a validated invocation into template logic. The item may be settled right away (for
    /// instance, refunded) or left pending.
    fn apply_invocation(&mut self, core: &CoreState, item: &mut InvocationItem) -> Result<(), VariantError>;

    /// Checks deployment transaction funding before installation completes.
    fn is_ready_to_run(&self, core: &CoreState, deploy_tx: &DeployTx) -> Result<(), VariantError>;

    fn set_ready(&mut self, core: &CoreState);

    /// Removes a pending item from all template pools; used when the funding output of the item
    /// disappears in a reorganization.
    fn disable_item(&mut self, item: &mut InvocationItem);

    fn state_digest(&self) -> VariantDigest;

    /// Settlement which the template expects to be made next, if any.
    fn settlement_plan(&self, core: &CoreState) -> Option<SettlementPlan>;

    /// Notifies the template that a settlement plan was executed.
    fn on_settled(&mut self, plan: &SettlementPlan);

    fn export_state(&self) -> Vec<u8>;

    fn import_state(&mut self, data: &[u8]) -> Result<(), VariantError>;
}
