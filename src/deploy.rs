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
use core::fmt::{self, Display, Formatter};

use amplify::confinement::{SmallBlob, SmallVec};
use amplify::ByteArray;
use commit_verify::CommitId;

use crate::store::{decode_payload, encode_record, split_record};

use crate::{
    Address, ContractParams, ContractStatus, ContractUrl, CoreState, DeployTx, DigestHistory, InstanceError,
    InvoiceDigest, Outpoint, ParamsError, PublicKey, RecordError, SigBlob, SigValidator, StateDigest, StaticDigest,
    Txid, VariantError, LIB_NAME_BIPACT,
};

/// Schema version of persisted deployment reservations.
pub const RESERVATION_VERSION: u16 = 0;

/// Status of a deployment reservation.
///
/// Statuses are ordered, and a reservation may only move forward. While the contract is being
/// installed, the reservation status mirrors the contract status on top of [`Self::INSTALL_STARTED`].
#[derive(Wrapper, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, From)]
#[wrapper(Deref)]
#[derive(StrictType, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ResvStatus(i32);

impl ResvStatus {
    pub const INIT: Self = Self(0);
    pub const DEPLOY_STARTED: Self = Self(10);
    pub const TX_BROADCASTED: Self = Self(11);
    pub const TX_CONFIRMED: Self = Self(12);
    pub const INSTALL_STARTED: Self = Self(20);
    pub const RUNNING: Self = Self(200);
    pub const SUSPENDED: Self = Self(201);
    pub const COMPLETED: Self = Self(202);

    /// Install sub-status matching a contract status from `INIT` up to `READY`.
    pub fn installing(contract: ContractStatus) -> Option<Self> {
        let code = contract.to_i16();
        (ContractStatus::INIT.to_i16()..=ContractStatus::READY.to_i16())
            .contains(&code)
            .then(|| Self(Self::INSTALL_STARTED.0 + code as i32))
    }

    pub fn is_installing(self) -> bool { self >= Self::INSTALL_STARTED && self < Self::RUNNING }

    pub fn can_transit(self, to: Self) -> bool { to >= self }
}

impl Display for ResvStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INIT => f.write_str("init"),
            Self::DEPLOY_STARTED => f.write_str("deploy-started"),
            Self::TX_BROADCASTED => f.write_str("tx-broadcasted"),
            Self::TX_CONFIRMED => f.write_str("tx-confirmed"),
            Self::INSTALL_STARTED => f.write_str("install-started"),
            Self::RUNNING => f.write_str("running"),
            Self::SUSPENDED => f.write_str("suspended"),
            Self::COMPLETED => f.write_str("completed"),
            other if other.is_installing() => write!(f, "installing({})", other.0 - Self::INSTALL_STARTED.0),
            other => write!(f, "unknown({})", other.0),
        }
    }
}

/// Spendable settlement-layer output used to pay the deployment fee.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct FeeInput {
    pub outpoint: Outpoint,
    pub value: u64,
}

/// Wallet of the deployer, which provides outputs for paying deployment fees.
pub trait FeeWallet {
    type Error: Error;

    /// Lists spendable settlement-layer outputs of an address, in the order of preference.
    fn spendable_outputs(&self, address: &Address) -> Result<Vec<FeeInput>, Self::Error>;
}

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum DeployError {
    /// contract {0} is already deployed.
    Duplicate(ContractUrl),

    /// deployment reservation {0} is not known.
    UnknownReservation(u64),

    /// deployment fee {fee} doesn't exceed the service fee {service_fee}.
    FeeTooLow { fee: u64, service_fee: u64 },

    /// insufficient funds for the deployment: {required} sats are required, but only {available}
    /// sats are available.
    InsufficientFunds { required: u64, available: u64 },

    /// unable to access the deployer wallet. Details: {0}
    Wallet(String),

    /// unable to fetch deployment transaction {txid}. Details: {message}
    Source { txid: Txid, message: String },

    /// deployment transaction for reservation {0} is not known yet.
    NoDeployTx(u64),

    /// transaction {txid} deploys contract {found} instead of {expected}.
    UrlMismatch { txid: Txid, expected: ContractUrl, found: ContractUrl },

    /// invoice is not signed by the peer with key {0}.
    MissingSig(PublicKey),

    /// invalid invoice signature of the peer with key {0}.
    InvalidSig(PublicKey),

    /// reservation can't change status from {from} to {to}.
    Transition { from: ResvStatus, to: ResvStatus },

    /// contract for reservation {0} is not installed.
    NotInstalled(u64),

    /// {0}
    #[from]
    Params(ParamsError),

    /// {0}
    #[from]
    Variant(VariantError),

    /// {0}
    #[from]
    Instance(InstanceError),

    /// {0}
    #[from]
    Record(RecordError),

    /// persistence error: {0}
    Persistence(String),
}

/// Invoice of a contract deployment, signed by both peers.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[derive(CommitEncode)]
#[commit_encode(strategy = strict, id = InvoiceDigest)]
pub struct DeployInvoice {
    pub url: ContractUrl,
    pub content: SmallBlob,
    pub deploy_time: i64,
}

/// Invoice enabling a contract from the given heights, signed by both peers.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[derive(CommitEncode)]
#[commit_encode(strategy = strict, id = InvoiceDigest)]
pub struct EnableInvoice {
    pub url: ContractUrl,
    pub height_l1: u64,
    pub height_l2: u64,
    pub pubkey: PublicKey,
}

/// Verifies that both peers signed an invoice.
pub fn verify_invoice_sigs(
    invoice: InvoiceDigest,
    peers: [&PublicKey; 2],
    sigs: &[(PublicKey, SigBlob)],
    validator: &impl SigValidator,
) -> Result<(), DeployError> {
    for pubkey in peers {
        let (_, sig) = sigs
            .iter()
            .find(|(pk, _)| pk == pubkey)
            .ok_or_else(|| DeployError::MissingSig(pubkey.clone()))?;
        validator
            .validate_sig(invoice.to_byte_array(), pubkey, sig)
            .map_err(|err| {
                tracing::warn!(%invoice, %pubkey, error = %err, "invalid invoice signature");
                DeployError::InvalidSig(pubkey.clone())
            })?;
    }
    Ok(())
}

/// Deployment of a contract, from the fee quote up to the running contract.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct DeploymentReservation {
    pub id: u64,
    pub status: ResvStatus,
    pub url: ContractUrl,
    pub params: ContractParams,
    pub deployer: Address,
    /// Fee rate in sats per virtual byte.
    pub fee_rate: u64,
    pub fee_inputs: SmallVec<FeeInput>,
    pub required_fee: u64,
    pub service_fee: u64,
    pub deploy_txid: Option<Txid>,
    /// Unix timestamp of the deployment.
    pub deploy_time: i64,
    pub divisibility: u8,
    pub n: u32,
    pub local_pubkey: PublicKey,
    pub remote_pubkey: PublicKey,
    pub enable_txid: Option<Txid>,
}

impl DeploymentReservation {
    pub fn new(
        id: u64,
        channel: Address,
        params: ContractParams,
        deployer: Address,
        fee_rate: u64,
        local_pubkey: PublicKey,
        remote_pubkey: PublicKey,
    ) -> Result<Self, DeployError> {
        params.check()?;
        Ok(Self {
            id,
            status: ResvStatus::INIT,
            url: ContractUrl::new(channel, &params),
            params,
            deployer,
            fee_rate,
            fee_inputs: none!(),
            required_fee: 0,
            service_fee: 0,
            deploy_txid: None,
            deploy_time: chrono::Utc::now().timestamp(),
            divisibility: 0,
            n: 0,
            local_pubkey,
            remote_pubkey,
            enable_txid: None,
        })
    }

    pub fn transit(&mut self, to: ResvStatus) -> Result<(), DeployError> {
        if !self.status.can_transit(to) {
            return Err(DeployError::Transition { from: self.status, to });
        }
        if self.status != to {
            tracing::debug!(resv = self.id, url = %self.url, from = %self.status, %to, "reservation status changed");
            self.status = to;
        }
        Ok(())
    }

    /// Selects fee inputs covering the required fee.
    ///
    /// Pre-selected inputs are only checked for sufficiency; otherwise, the wallet outputs are
    /// accumulated in the wallet order until the required amount is met.
    pub fn select_inputs(&mut self, wallet: &impl FeeWallet) -> Result<(), DeployError> {
        let required = self.required_fee;
        if !self.fee_inputs.is_empty() {
            let available = self.fee_inputs.iter().map(|input| input.value).sum::<u64>();
            if available < required {
                return Err(DeployError::InsufficientFunds { required, available });
            }
            return Ok(());
        }

        let outputs = wallet
            .spendable_outputs(&self.deployer)
            .map_err(|err| DeployError::Wallet(err.to_string()))?;
        let mut selected = vec![];
        let mut available = 0u64;
        for input in outputs {
            if available >= required {
                break;
            }
            available = available.saturating_add(input.value);
            selected.push(input);
        }
        if available < required {
            return Err(DeployError::InsufficientFunds { required, available });
        }
        self.fee_inputs = SmallVec::from_iter_checked(selected);
        Ok(())
    }

    pub fn deploy_invoice(&self) -> DeployInvoice {
        DeployInvoice { url: self.url.clone(), content: self.params.content.clone(), deploy_time: self.deploy_time }
    }

    pub fn enable_invoice(&self, height_l1: u64, height_l2: u64) -> EnableInvoice {
        EnableInvoice { url: self.url.clone(), height_l1, height_l2, pubkey: self.local_pubkey.clone() }
    }

    pub fn deploy_invoice_id(&self) -> InvoiceDigest { self.deploy_invoice().commit_id() }

    pub fn enable_invoice_id(&self, height_l1: u64, height_l2: u64) -> InvoiceDigest {
        self.enable_invoice(height_l1, height_l2).commit_id()
    }

    pub fn from_record(data: &[u8]) -> Result<Self, RecordError> {
        let (version, payload) = split_record(data)?;
        if version != RESERVATION_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        decode_payload(payload)
    }

    pub fn to_record(&self) -> Vec<u8> { encode_record(RESERVATION_VERSION, self) }

    /// Checks that a fetched deployment transaction matches this reservation.
    pub fn check_deploy_tx(&self, tx: &DeployTx) -> Result<(), DeployError> {
        if tx.url != self.url {
            return Err(DeployError::UrlMismatch { txid: tx.txid, expected: self.url.clone(), found: tx.url.clone() });
        }
        Ok(())
    }

    /// Initial runtime state of the contract installed by this reservation.
    pub fn core_state(&self) -> CoreState {
        CoreState {
            url: self.url.clone(),
            params: self.params.clone(),
            resv_id: self.id,
            deploy_time: self.deploy_time,
            deployer: self.deployer.clone(),
            status: ContractStatus::INIT,
            enable_block: 0,
            enable_block_l1: 0,
            enable_txid: None,
            curr_block: 0,
            curr_block_l1: 0,
            invoke_count: 0,
            divisibility: self.divisibility,
            n: self.n,
            static_digest: StaticDigest::from([0u8; 32]),
            running_digest: StateDigest::from([0u8; 32]),
            history: DigestHistory::default(),
            checkpoint: 0,
            checkpoint_block: 0,
            checkpoint_l1: 0,
            checkpoint_block_l1: 0,
            local_pubkey: self.local_pubkey.clone(),
            remote_pubkey: self.remote_pubkey.clone(),
            fee_total: 0,
        }
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]

    use super::*;
    use crate::{AssetName, AssetProtocol, TemplateName};

    struct Wallet(Vec<u64>);

    impl FeeWallet for Wallet {
        type Error = core::convert::Infallible;

        fn spendable_outputs(&self, _: &Address) -> Result<Vec<FeeInput>, Self::Error> {
            Ok(self
                .0
                .iter()
                .enumerate()
                .map(|(no, value)| FeeInput { outpoint: Outpoint::new([no as u8; 32], no as u32), value: *value })
                .collect())
        }
    }

    fn pubkey(byte: u8) -> PublicKey {
        let mut data = [byte; 33];
        data[0] = 0x02;
        PublicKey::from_slice(&data).unwrap()
    }

    fn reservation() -> DeploymentReservation {
        let params = ContractParams {
            template: TemplateName::Swap,
            asset: AssetName::new(AssetProtocol::Ordx, "pearl").unwrap(),
            start_block: 0,
            end_block: 0,
            content: SmallBlob::default(),
        };
        let channel = "tb1qchannel".parse().unwrap();
        let deployer = "tb1qdeployer".parse().unwrap();
        DeploymentReservation::new(1, channel, params, deployer, 10, pubkey(1), pubkey(2)).unwrap()
    }

    #[test]
    fn status_order() {
        assert!(ResvStatus::INIT.can_transit(ResvStatus::DEPLOY_STARTED));
        assert!(ResvStatus::TX_CONFIRMED.can_transit(ResvStatus::TX_CONFIRMED));
        assert!(!ResvStatus::RUNNING.can_transit(ResvStatus::INSTALL_STARTED));
        assert!(!ResvStatus::COMPLETED.can_transit(ResvStatus::SUSPENDED));

        let ready = ResvStatus::installing(ContractStatus::READY).unwrap();
        assert!(ready.is_installing());
        assert_eq!(ready.to_string(), "installing(100)");
        assert_eq!(ResvStatus::installing(ContractStatus::INIT), Some(ResvStatus::INSTALL_STARTED));
        assert_eq!(ResvStatus::installing(ContractStatus::CLOSING), None);
        assert!(ResvStatus::TX_CONFIRMED < ResvStatus::INSTALL_STARTED);
    }

    #[test]
    fn backward_transition() {
        let mut resv = reservation();
        resv.transit(ResvStatus::TX_BROADCASTED).unwrap();
        assert!(matches!(
            resv.transit(ResvStatus::DEPLOY_STARTED),
            Err(DeployError::Transition { from: ResvStatus::TX_BROADCASTED, to: ResvStatus::DEPLOY_STARTED })
        ));
        assert_eq!(resv.status, ResvStatus::TX_BROADCASTED);
    }

    #[test]
    fn greedy_selection() {
        let mut resv = reservation();
        resv.required_fee = 1500;
        resv.select_inputs(&Wallet(vec![1000, 400, 300, 5000])).unwrap();
        assert_eq!(resv.fee_inputs.len(), 3);
        assert_eq!(resv.fee_inputs.iter().map(|i| i.value).sum::<u64>(), 1700);

        let mut resv = reservation();
        resv.required_fee = 1500;
        assert!(matches!(
            resv.select_inputs(&Wallet(vec![1000, 400])),
            Err(DeployError::InsufficientFunds { required: 1500, available: 1400 })
        ));
        assert!(resv.fee_inputs.is_empty());
    }

    #[test]
    fn preselected_inputs() {
        let mut resv = reservation();
        resv.required_fee = 800;
        resv.fee_inputs = SmallVec::from_checked(vec![FeeInput { outpoint: Outpoint::new([7u8; 32], 0), value: 500 }]);
        assert!(matches!(
            resv.select_inputs(&Wallet(vec![10_000])),
            Err(DeployError::InsufficientFunds { required: 800, available: 500 })
        ));
        resv.required_fee = 500;
        resv.select_inputs(&Wallet(vec![10_000])).unwrap();
        assert_eq!(resv.fee_inputs.len(), 1);
    }

    #[test]
    fn invoice_binds_url() {
        let resv = reservation();
        let mut other = resv.clone();
        other.deploy_time += 1;
        assert_ne!(resv.deploy_invoice_id(), other.deploy_invoice_id());
        assert_ne!(resv.enable_invoice_id(10, 20), resv.enable_invoice_id(10, 21));
        assert_eq!(resv.core_state().status, ContractStatus::INIT);
        assert_eq!(resv.core_state().url, resv.url);
    }
}
