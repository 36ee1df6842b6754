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

#![deny(
    unsafe_code,
    dead_code,
    // TODO: Complete documentation
    // missing_docs,
    unused_variables,
    unused_mut,
    unused_imports,
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case
)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Execution core of a two-party off-chain contract runtime.
//!
//! Each contract instance runs identically on two cooperating nodes which jointly control a 2-of-2
//! multisig settlement address. The crate provides the part shared by all contract variants: the
//! lifecycle state machine, per-layer block cursors feeding invocations into variant logic, the
//! invocation ledger, layered state digests with a bounded history, reorganization recovery, the
//! deployment reservation state machine and the peer consistency check which gates co-signing.

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate strict_types;
#[macro_use]
extern crate commit_verify;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde;

mod status;
mod params;
mod utxo;
mod identity;
mod digest;
mod item;
mod store;
mod ledger;
mod variant;
mod source;
mod instance;
mod pipeline;
mod reorg;
mod settle;
mod peer;
mod deploy;
mod runtime;
mod config;

pub use deploy::{
    verify_invoice_sigs, DeployError, DeployInvoice, DeploymentReservation, EnableInvoice, FeeInput, FeeWallet, ResvStatus,
    RESERVATION_VERSION,
};
pub use digest::{
    BaseDigest, DigestHistory, InvoiceDigest, RuntimeBase, StateCommitment, StateDigest, StaticDigest, VariantDigest,
    DIGEST_HISTORY_CAP,
};
pub use identity::{multisig_redeem_script, p2wsh_script, PublicKey, SigBlob, SigValidator, Signer};
pub use instance::{ContractInstance, CoreState, InstanceError, InstanceStatus, LifecycleError, SNAPSHOT_VERSION};
pub use item::{
    bucket_of, InvocationItem, InvokerStatus, ItemError, ItemStatus, LegacyInvocationItem, Reason, BUCKET_SIZE,
    ITEM_VERSION,
};
pub use ledger::{Journal, Ledger, LedgerError, INVOKER_VERSION};
pub use params::{Address, AssetName, AssetProtocol, ContractParams, ContractUrl, ParamsError, TemplateName};
pub use peer::{verify_checkpoint, Checkpoint, CoSignature, PeerError, SettleRequest};
pub use pipeline::{Advance, PipelineError};
pub use reorg::{ReorgError, ReorgSummary};
pub use runtime::Runtime;
pub use settle::{Broadcaster, SettleError, SettleKind, SettlementOutput, SettlementPlan, StubFeeError};
pub use source::{BlockData, BlockSource, DeployTx, EnableParams, Invocation, Layer};
pub use status::ContractStatus;
pub use store::{keys, MemStore, RecordError, Store};
pub use utxo::{Outpoint, OutpointParseError, Txid, UtxoId};
pub use variant::{ContractVariant, VariantError};
pub use config::{ConfigError, Network, RuntimeConfig, DEFAULT_DEPLOY_SERVICE_FEE};

pub const LIB_NAME_BIPACT: &str = "BiPact";
