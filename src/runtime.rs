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

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{
    keys, verify_invoice_sigs, BlockSource, ContractInstance, ContractStatus, ContractUrl, ContractVariant,
    DeployError, DeployTx, DeploymentReservation, EnableParams, FeeWallet, InstanceError, LifecycleError, PublicKey,
    ResvStatus, RuntimeConfig, SigBlob, SigValidator, Store, Txid,
};

/// Node-wide registry of deployment reservations and running contract instances.
pub struct Runtime<S: Store> {
    config: RuntimeConfig,
    store: Arc<S>,
    contracts: RwLock<BTreeMap<ContractUrl, Arc<ContractInstance<S>>>>,
    reservations: RwLock<BTreeMap<u64, DeploymentReservation>>,
    /// Deployment transactions fetched during installation; not persisted.
    deploy_txs: Mutex<BTreeMap<u64, DeployTx>>,
}

impl<S: Store> Runtime<S> {
    /// Opens the runtime, loading all stored deployment reservations.
    ///
    /// Contract instances are loaded lazily with [`Self::load_contract`], since their template
    /// logic is provided by the caller.
    ///
    /// # Blocking I/O
    ///
    /// Scans the reservation records in the store.
    pub fn open(config: RuntimeConfig, store: Arc<S>) -> Result<Self, DeployError> {
        let mut reservations = BTreeMap::new();
        for (key, data) in store
            .batch_read(keys::RESERVATION)
            .map_err(|e| DeployError::Persistence(e.to_string()))?
        {
            let resv = DeploymentReservation::from_record(&data).inspect_err(|err| {
                tracing::error!(%key, error = %err, "unable to read deployment reservation");
            })?;
            reservations.insert(resv.id, resv);
        }
        tracing::info!(network = %config.network, reservations = reservations.len(), "runtime opened");
        Ok(Self {
            config,
            store,
            contracts: none!(),
            reservations: RwLock::new(reservations),
            deploy_txs: none!(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig { &self.config }

    pub fn store(&self) -> &S { self.store.as_ref() }

    pub fn reservation(&self, id: u64) -> Option<DeploymentReservation> { self.reservations.read().get(&id).cloned() }

    pub fn reservations(&self) -> Vec<DeploymentReservation> { self.reservations.read().values().cloned().collect() }

    pub fn next_reservation_id(&self) -> u64 {
        self.reservations
            .read()
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(1)
    }

    /// Persists a reservation and registers it with the runtime.
    pub fn save_reservation(&self, resv: &DeploymentReservation) -> Result<(), DeployError> {
        self.store
            .write(&keys::reservation(resv.id), &resv.to_record())
            .map_err(|e| DeployError::Persistence(e.to_string()))?;
        self.reservations.write().insert(resv.id, resv.clone());
        Ok(())
    }

    /// Registered contract instance, if it was installed or loaded.
    pub fn contract(&self, url: &ContractUrl) -> Option<Arc<ContractInstance<S>>> {
        self.contracts.read().get(url).cloned()
    }

    pub fn contracts(&self) -> Vec<ContractUrl> { self.contracts.read().keys().cloned().collect() }

    /// Loads a contract instance from the store, or returns an already registered one.
    ///
    /// # Blocking I/O
    ///
    /// Reads the snapshot and the invocation records of the contract.
    pub fn load_contract(
        &self,
        url: &ContractUrl,
        variant: Box<dyn ContractVariant>,
    ) -> Result<Arc<ContractInstance<S>>, InstanceError> {
        if let Some(instance) = self.contract(url) {
            return Ok(instance);
        }
        let instance = Arc::new(ContractInstance::load(self.store.clone(), url, variant)?);
        let mut contracts = self.contracts.write();
        Ok(contracts.entry(url.clone()).or_insert(instance).clone())
    }

    fn is_deployed(&self, url: &ContractUrl) -> Result<bool, DeployError> {
        if self.contracts.read().contains_key(url) {
            return Ok(true);
        }
        let stored = self
            .store
            .read(&keys::runtime(url))
            .map_err(|e| DeployError::Persistence(e.to_string()))?;
        Ok(stored.is_some())
    }

    /// Quotes the deployment of a reserved contract and selects the inputs paying for it.
    ///
    /// # Returns
    ///
    /// Fee which the deployer has to pay on top of the service fee.
    pub fn allow_deploy(
        &self,
        resv: &mut DeploymentReservation,
        variant: &dyn ContractVariant,
        wallet: &impl FeeWallet,
    ) -> Result<u64, DeployError> {
        if self.is_deployed(&resv.url)? {
            return Err(DeployError::Duplicate(resv.url.clone()));
        }
        let service_fee = self.config.deploy_service_fee;
        let fee = variant.deploy_fee(resv.fee_rate);
        if fee <= service_fee {
            return Err(DeployError::FeeTooLow { fee, service_fee });
        }
        resv.service_fee = service_fee;
        resv.required_fee = fee - service_fee;
        resv.select_inputs(wallet)?;
        resv.transit(ResvStatus::DEPLOY_STARTED)?;
        self.save_reservation(resv)?;
        tracing::info!(resv = resv.id, url = %resv.url, fee, service_fee, inputs = resv.fee_inputs.len(),
            "deployment allowed");
        Ok(resv.required_fee)
    }

    fn update_reservation<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut DeploymentReservation) -> Result<T, DeployError>,
    ) -> Result<T, DeployError> {
        let mut resv = self.reservation(id).ok_or(DeployError::UnknownReservation(id))?;
        let res = f(&mut resv)?;
        self.save_reservation(&resv)?;
        Ok(res)
    }

    /// Records the broadcasted deployment transaction.
    pub fn deploy_broadcasted(&self, id: u64, txid: Txid) -> Result<(), DeployError> {
        self.update_reservation(id, |resv| {
            resv.transit(ResvStatus::TX_BROADCASTED)?;
            resv.deploy_txid = Some(txid);
            Ok(())
        })
    }

    pub fn deploy_confirmed(&self, id: u64) -> Result<(), DeployError> {
        self.update_reservation(id, |resv| {
            if resv.deploy_txid.is_none() {
                return Err(DeployError::NoDeployTx(id));
            }
            resv.transit(ResvStatus::TX_CONFIRMED)
        })
    }

    /// Creates the contract instance of a reservation in the `INIT` status.
    ///
    /// Repeated calls return the already created instance.
    pub fn start_install(
        &self,
        id: u64,
        variant: Box<dyn ContractVariant>,
    ) -> Result<Arc<ContractInstance<S>>, DeployError> {
        let resv = self.reservation(id).ok_or(DeployError::UnknownReservation(id))?;
        if resv.deploy_txid.is_none() {
            return Err(DeployError::NoDeployTx(id));
        }
        if let Some(instance) = self.contract(&resv.url) {
            return Ok(instance);
        }
        if self.is_deployed(&resv.url)? {
            return Ok(self.load_contract(&resv.url, variant)?);
        }

        let instance = Arc::new(ContractInstance::new(self.store.clone(), resv.core_state(), variant));
        instance.save()?;
        self.update_reservation(id, |resv| resv.transit(ResvStatus::INSTALL_STARTED))?;
        self.contracts
            .write()
            .insert(resv.url.clone(), instance.clone());
        tracing::info!(resv = id, url = %resv.url, "contract installation started");
        Ok(instance)
    }

    /// Completes installation of a contract once its deployment transaction is funded and both
    /// peers signed the deployment invoice.
    ///
    /// Does nothing if the contract is already running.
    ///
    /// # Blocking I/O
    ///
    /// Fetches the deployment transaction from the block source unless it was fetched before.
    pub fn complete_install(
        &self,
        source: &impl BlockSource,
        id: u64,
        validator: &impl SigValidator,
    ) -> Result<(), DeployError> {
        let mut resv = self.reservation(id).ok_or(DeployError::UnknownReservation(id))?;
        let instance = self
            .contract(&resv.url)
            .ok_or(DeployError::NotInstalled(id))?;
        let status = instance.core().status;
        if status != ContractStatus::INIT {
            if resv.status < ResvStatus::RUNNING {
                self.mark_running(&mut resv, status)?;
            }
            return Ok(());
        }

        let txid = resv.deploy_txid.ok_or(DeployError::NoDeployTx(id))?;
        let cached = self.deploy_txs.lock().get(&id).cloned();
        let deploy_tx = match cached {
            Some(tx) => tx,
            None => {
                let tx = source
                    .fetch_transaction(txid)
                    .map_err(|e| DeployError::Source { txid, message: e.to_string() })?;
                self.deploy_txs.lock().insert(id, tx.clone());
                tx
            }
        };
        resv.check_deploy_tx(&deploy_tx)?;
        // Both peers take the deployment time from the transaction, so their base states match.
        resv.deploy_time = deploy_tx.deploy_time;
        verify_invoice_sigs(
            resv.deploy_invoice_id(),
            [&resv.local_pubkey, &resv.remote_pubkey],
            &deploy_tx.invoice_sigs,
            validator,
        )?;

        instance.install(&deploy_tx)?;
        let status = instance.core().status;
        self.mark_running(&mut resv, status)?;
        self.deploy_txs.lock().remove(&id);
        tracing::info!(resv = id, url = %resv.url, "contract installed");
        Ok(())
    }

    /// Records the install sub-status mirroring the contract status, then moves the reservation
    /// into RUNNING.
    fn mark_running(&self, resv: &mut DeploymentReservation, contract: ContractStatus) -> Result<(), DeployError> {
        if let Some(installing) = ResvStatus::installing(contract).filter(|installing| resv.status < *installing) {
            resv.transit(installing)?;
            self.save_reservation(resv)?;
        }
        resv.transit(ResvStatus::RUNNING)?;
        self.save_reservation(resv)
    }

    /// Enables the contract of a reservation from the heights signed by both peers.
    pub fn enable(
        &self,
        id: u64,
        enable: EnableParams,
        sigs: &[(PublicKey, SigBlob)],
        validator: &impl SigValidator,
    ) -> Result<(), DeployError> {
        let resv = self.reservation(id).ok_or(DeployError::UnknownReservation(id))?;
        let instance = self
            .contract(&resv.url)
            .ok_or(DeployError::NotInstalled(id))?;
        verify_invoice_sigs(
            resv.enable_invoice_id(enable.height_l1, enable.height_l2),
            [&resv.local_pubkey, &resv.remote_pubkey],
            sigs,
            validator,
        )?;
        instance.set_enable_heights(enable)?;
        self.update_reservation(id, |resv| {
            resv.enable_txid = Some(enable.txid);
            Ok(())
        })
    }

    /// Marks reservations of terminated contracts as completed.
    pub fn retire_terminated(&self) -> Result<usize, DeployError> {
        let terminated = self
            .reservations()
            .into_iter()
            .filter(|resv| resv.status < ResvStatus::COMPLETED)
            .filter(|resv| {
                self.contract(&resv.url)
                    .is_some_and(|instance| instance.core().status.is_terminated())
            })
            .map(|resv| resv.id)
            .collect::<Vec<_>>();
        for id in &terminated {
            self.update_reservation(*id, |resv| resv.transit(ResvStatus::COMPLETED))?;
        }
        Ok(terminated.len())
    }
}

impl<S: Store> ContractInstance<S> {
    /// Moves an `INIT` contract into `READY` if the template accepts the deployment funding.
    pub(crate) fn install(&self, deploy_tx: &DeployTx) -> Result<(), InstanceError> {
        let _gate = self.gate.lock();
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.core.status != ContractStatus::INIT {
            return Err(LifecycleError::Transition { from: state.core.status, to: ContractStatus::READY }.into());
        }
        state.variant.is_ready_to_run(&state.core, deploy_tx)?;

        let savepoint = state.savepoint();
        state.core.deploy_time = deploy_tx.deploy_time;
        state.variant.set_ready(&state.core);
        let result = state
            .core
            .transit(ContractStatus::READY)
            .map_err(InstanceError::from)
            .and_then(|_| {
                state.core.running_digest = state.state_digest();
                self.persist(state)
            });
        if let Err(err) = result {
            state.restore(savepoint);
            return Err(err);
        }
        Ok(())
    }
}
