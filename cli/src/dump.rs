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

use std::fs::{self, File};
use std::path::Path;

use anyhow::Context;
use bipact::{keys, ContractInstance, ContractUrl, DeploymentReservation, Store};
use bipact_persist_fs::FileStore;

pub fn dump_contract(store: &FileStore, url: &ContractUrl, dst: &Path) -> anyhow::Result<usize> {
    let dir = dst.join(url.to_string());
    fs::create_dir_all(&dir)?;

    let (core, variant) = ContractInstance::read_snapshot(store, url)?;
    let out = File::create_new(dir.join("runtime.yaml"))
        .context("can't create dump files; try to use the `--force` flag")?;
    serde_yaml::to_writer(&out, &core)?;
    fs::write(dir.join("variant.dat"), variant)?;

    let (_, ledger) = ContractInstance::read_ledger(store, url)?;
    let items = ledger.page(store, 0, usize::MAX)?;
    for item in &items {
        let out = File::create_new(dir.join(format!("{:06}-item-{}.yaml", item.id, item.outpoint)))?;
        serde_yaml::to_writer(&out, item)?;
    }

    for status in ledger.addresses(store, 0, usize::MAX)? {
        let out = File::create_new(dir.join(format!("invoker-{}.yaml", status.address)))?;
        serde_yaml::to_writer(&out, &status)?;
    }

    Ok(items.len())
}

pub fn dump_store(store: &FileStore, dst: impl AsRef<Path>, force: bool) -> anyhow::Result<()> {
    let dst = dst.as_ref();

    if force {
        let _ = fs::remove_dir_all(dst);
    }
    fs::create_dir_all(dst)?;

    print!("Processing reservations ... none found");
    for (no, (key, data)) in store.batch_read(keys::RESERVATION)?.into_iter().enumerate() {
        let resv = DeploymentReservation::from_record(&data).with_context(|| format!("invalid record '{key}'"))?;
        let out = File::create_new(dst.join(format!("resv-{:012}.yaml", resv.id)))?;
        serde_yaml::to_writer(&out, &resv)?;
        print!("\rProcessing reservations ... {} processed", no + 1);
    }
    println!();

    for (key, _) in store.batch_read(keys::RUNTIME)? {
        let url = key
            .trim_start_matches(keys::RUNTIME)
            .parse::<ContractUrl>()
            .with_context(|| format!("invalid contract key '{key}'"))?;
        print!("Processing contract {url} ... ");
        let count = dump_contract(store, &url, dst)?;
        println!("{count} invocations");
    }

    Ok(())
}
