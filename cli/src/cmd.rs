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

use std::path::{Path, PathBuf};

use anyhow::Context;
use bipact::{
    keys, Address, ContractInstance, ContractUrl, InstanceStatus, RuntimeConfig, Store, UtxoId,
};
use bipact_persist_fs::FileStore;

use crate::dump::dump_store;

#[derive(Subcommand)]
pub enum Cmd {
    /// Print out the configuration, or write it to a file
    Config {
        /// File to write the configuration to
        output: Option<PathBuf>,
    },

    /// List contracts and deployment reservations known to the node
    List,

    /// Print out the runtime status of a contract
    Status {
        /// Contract URL
        url: ContractUrl,
    },

    /// Print out a page of contract invocation history
    History {
        /// Contract URL
        url: ContractUrl,

        /// Id of the first invocation
        #[clap(short, long, default_value = "0")]
        start: u64,

        /// Maximum number of invocations to print
        #[clap(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print out invocation statistics of an address, or list all invoker addresses
    Invoker {
        /// Contract URL
        url: ContractUrl,

        /// Invoker address
        address: Option<Address>,
    },

    /// Decode a UTXO identifier into block height, transaction position and output number
    Utxo {
        /// UTXO identifier
        id: u64,
    },

    /// Dump all records of the store into a directory of YAML files
    Dump {
        /// Remove the destination directory if it already exists
        #[clap(short, long)]
        force: bool,

        /// Destination directory
        dst: PathBuf,
    },

    /// Export the store into a backup file
    Backup {
        /// Backup file to create
        output: PathBuf,
    },

    /// Import records from a backup file into the store
    Restore {
        /// Backup file to read
        input: PathBuf,
    },
}

impl Cmd {
    pub fn exec(&self, config: &RuntimeConfig) -> anyhow::Result<()> {
        match self {
            Cmd::Config { output } => print_config(config, output.as_deref())?,
            Cmd::List => list(&open(config)?)?,
            Cmd::Status { url } => status(&open(config)?, url)?,
            Cmd::History { url, start, limit } => history(&open(config)?, url, *start, *limit)?,
            Cmd::Invoker { url, address } => invoker(&open(config)?, url, address.as_ref())?,
            Cmd::Utxo { id } => utxo(*id),
            Cmd::Dump { force, dst } => dump_store(&open(config)?, dst, *force)?,
            Cmd::Backup { output } => {
                let count = open(config)?.backup(output)?;
                println!("{count} records exported to '{}'", output.display());
            }
            Cmd::Restore { input } => {
                let count = open(config)?.restore(input)?;
                println!("{count} records imported from '{}'", input.display());
            }
        }
        Ok(())
    }
}

fn open(config: &RuntimeConfig) -> anyhow::Result<FileStore> {
    let store = FileStore::open(&config.data_dir)
        .with_context(|| format!("unable to open the store at '{}'", config.data_dir.display()))?;
    tracing::debug!(path = %store.path().display(), records = store.len(), network = %config.network, "store opened");
    Ok(store)
}

fn print_config(config: &RuntimeConfig, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => config.save(path)?,
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}

fn list(store: &FileStore) -> anyhow::Result<()> {
    println!("Contracts:");
    for (key, _) in store.batch_read(keys::RUNTIME)? {
        println!("  {}", key.trim_start_matches(keys::RUNTIME));
    }
    println!("Reservations:");
    for (key, _) in store.batch_read(keys::RESERVATION)? {
        println!("  {}", key.trim_start_matches(keys::RESERVATION));
    }
    Ok(())
}

fn status(store: &FileStore, url: &ContractUrl) -> anyhow::Result<()> {
    let (core, ledger) = ContractInstance::read_ledger(store, url)?;
    let status = InstanceStatus::with(&core, ledger.pending_count());
    println!("{}", serde_yaml::to_string(&status)?);
    Ok(())
}

fn history(store: &FileStore, url: &ContractUrl, start: u64, limit: usize) -> anyhow::Result<()> {
    let (_, ledger) = ContractInstance::read_ledger(store, url)?;
    let page = ledger.page(store, start, limit)?;
    if page.is_empty() {
        println!("No invocations starting from #{start}");
        return Ok(());
    }
    println!("{}", serde_yaml::to_string(&page)?);
    Ok(())
}

fn invoker(store: &FileStore, url: &ContractUrl, address: Option<&Address>) -> anyhow::Result<()> {
    let (_, ledger) = ContractInstance::read_ledger(store, url)?;
    match address {
        Some(address) => {
            let status = ledger
                .invoker(store, address)?
                .with_context(|| format!("address {address} never invoked {url}"))?;
            println!("{}", serde_yaml::to_string(&status)?);
        }
        None => {
            for status in ledger.addresses(store, 0, usize::MAX)? {
                println!("{}\t{}", status.address, status.invoke_count);
            }
        }
    }
    Ok(())
}

fn utxo(id: u64) {
    let id = UtxoId::from(id);
    println!("height: {}\ntx: {}\nvout: {}", id.height(), id.tx_pos(), id.vout());
}
