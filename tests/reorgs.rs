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

#[macro_use]
extern crate amplify;

mod common;

use std::sync::Arc;

use bipact::{
    Advance, ContractInstance, ItemStatus, Layer, MemStore, Reason, ReorgError, ReorgSummary, UtxoId,
};
use common::*;

fn setup() -> (Arc<MemStore>, ContractInstance<MemStore>, MockSource) {
    let store = Arc::new(MemStore::new());
    let instance = running(store.clone(), reservation(0, 0).core_state());
    let source = MockSource::default();
    instance
        .advance(&source, block(Layer::Settlement, 100, vec![invocation(1, 0, 100, "tb1qalice", 100, 1000)]))
        .unwrap();
    instance
        .advance(&source, block(Layer::Settlement, 101, vec![
            invocation(2, 0, 101, "tb1qbob", 200, 1000),
            invocation(3, 0, 101, "tb1qcarol", 300, 1000),
        ]))
        .unwrap();
    instance
        .advance(&source, block(Layer::Settlement, 102, vec![invocation(4, 0, 102, "tb1qdave", 400, 1000)]))
        .unwrap();
    (store, instance, source)
}

#[test]
fn missing_funding_disables_item() {
    let (_, instance, mut source) = setup();
    source.gone.insert(txid(3));

    let summary = instance
        .handle_reorg(&source, Layer::Settlement, 101, 102)
        .unwrap();
    assert_eq!(summary, ReorgSummary { reloaded: 3, invalidated: 1, cursor: 100 });
    assert_eq!(instance.core().curr_block, 100);
    assert_eq!(instance.invoke_count(), 4);

    let items = instance.invoke_history(0, 10).unwrap();
    assert_eq!(items.len(), 4);
    assert_eq!(items[0].utxo_id, Some(UtxoId::new(100, 1, 0)));
    for item in &items[1..] {
        assert_eq!(item.utxo_id, None);
        assert_eq!(item.status, ItemStatus::NotYet);
    }
    assert_eq!(items[2].reason, Reason::UtxoNotFoundAfterReorg);
    assert_eq!(items[1].reason, Reason::Normal);

    let request = instance.settlement_request().unwrap();
    let settled = request
        .plan
        .outputs
        .iter()
        .map(|output| output.outpoint.txid)
        .collect::<Vec<_>>();
    assert_eq!(settled, vec![txid(1), txid(2), txid(4)]);
}

#[test]
fn replay_after_reorg() {
    let (_, instance, source) = setup();
    instance
        .handle_reorg(&source, Layer::Settlement, 101, 102)
        .unwrap();

    let mut moved = invocation(2, 0, 101, "tb1qbob", 200, 1000);
    moved.utxo_id = UtxoId::new(101, 5, 0);
    assert_eq!(
        instance
            .advance(&source, block(Layer::Settlement, 101, vec![moved.clone()]))
            .unwrap(),
        Advance::Applied { height: 101, accepted: 0 }
    );
    assert_eq!(instance.invoke_count(), 4);
    assert_eq!(instance.item(moved.outpoint).unwrap().unwrap().utxo_id, Some(moved.utxo_id));
    assert_eq!(instance.item(txid_outpoint(3)).unwrap().unwrap().utxo_id, None);

    // A new invocation in the replacing chain is accepted as usual.
    instance
        .advance(&source, block(Layer::Settlement, 102, vec![invocation(5, 0, 102, "tb1qerin", 1, 1000)]))
        .unwrap();
    assert_eq!(instance.invoke_count(), 5);
}

#[test]
fn settled_items_stay_terminal() {
    let (_, instance, mut source) = setup();
    let txid_settle = instance
        .settle(&MockBroadcaster::new(100))
        .unwrap()
        .unwrap();
    source.gone.insert(txid(4));

    let summary = instance
        .handle_reorg(&source, Layer::Settlement, 102, 102)
        .unwrap();
    assert_eq!(summary.reloaded, 1);
    assert_eq!(summary.invalidated, 1);

    let item = instance.item(txid_outpoint(4)).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Dealt);
    assert_eq!(item.out_txid, Some(txid_settle));
    assert_eq!(item.reason, Reason::UtxoNotFoundAfterReorg);
    assert!(instance.pending_items().is_empty());
}

#[test]
fn invalid_heights() {
    let (_, instance, source) = setup();
    assert!(matches!(
        instance.handle_reorg(&source, Layer::Settlement, 0, 102),
        Err(ReorgError::InvalidHeight { org: 0, .. })
    ));
    assert!(matches!(
        instance.handle_reorg(&source, Layer::Settlement, 103, 102),
        Err(ReorgError::InvalidHeight { org: 103, current: 102, .. })
    ));
    assert_eq!(instance.core().curr_block, 102);
}

#[test]
fn source_failure_changes_nothing() {
    let (_, instance, mut source) = setup();
    source.offline = true;
    assert!(matches!(
        instance.handle_reorg(&source, Layer::Settlement, 101, 102),
        Err(ReorgError::Source { layer: Layer::Settlement, .. })
    ));
    assert_eq!(instance.core().curr_block, 102);
    assert!(instance
        .invoke_history(0, 10)
        .unwrap()
        .iter()
        .all(|item| item.utxo_id.is_some()));
}

#[test]
fn layers_are_independent() {
    let (_, instance, mut source) = setup();
    let mut base = invocation(9, 0, 50, "tb1qfrank", 10, 1000);
    base.utxo_id = UtxoId::new(50, 1, 0);
    instance
        .advance(&source, block(Layer::Base, 50, vec![base.clone()]))
        .unwrap();
    instance
        .advance(&source, block(Layer::Base, 51, vec![]))
        .unwrap();
    source.gone.insert(txid(9));

    let summary = instance
        .handle_reorg(&source, Layer::Base, 50, 51)
        .unwrap();
    assert_eq!(summary, ReorgSummary { reloaded: 1, invalidated: 1, cursor: 49 });
    assert_eq!(instance.core().curr_block, 102);
    assert_eq!(instance.core().curr_block_l1, 49);
    let item = instance.item(base.outpoint).unwrap().unwrap();
    assert!(item.from_l1);
    assert_eq!(item.reason, Reason::UtxoNotFoundAfterReorg);
    assert_eq!(instance.item(txid_outpoint(4)).unwrap().unwrap().reason, Reason::Normal);
}

#[test]
fn reorg_is_persisted() {
    let (store, instance, mut source) = setup();
    source.gone.insert(txid(2));
    instance
        .handle_reorg(&source, Layer::Settlement, 101, 102)
        .unwrap();
    let url = instance.url();
    drop(instance);

    let instance = ContractInstance::load(store, &url, PoolVariant::boxed()).unwrap();
    assert_eq!(instance.core().curr_block, 100);
    let item = instance.item(txid_outpoint(2)).unwrap().unwrap();
    assert_eq!(item.reason, Reason::UtxoNotFoundAfterReorg);
    assert_eq!(item.utxo_id, None);
    let request = instance.settlement_request().unwrap();
    assert_eq!(request.plan.outputs.len(), 3);
}

fn txid_outpoint(byte: u8) -> bipact::Outpoint { bipact::Outpoint::new(txid(byte), 0) }
