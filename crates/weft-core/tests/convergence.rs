//! Multi-replica scenarios: a set of documents wired through an in-process
//! room that buffers encoded messages per receiver and delivers them in
//! random order, optionally duplicated. After every exchange all replicas
//! must hold identical content.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use weft_core::codec;
use weft_core::{ClientId, Doc, DocOptions, OpId, Operation, SendHook};

const ROOT: OpId = OpId { client: 0, clock: 0 };

struct Room {
    clients: Vec<ClientId>,
    docs: HashMap<ClientId, Doc>,
    inboxes: Arc<Mutex<HashMap<ClientId, VecDeque<Bytes>>>>,
}

impl Room {
    async fn new(clients: &[ClientId]) -> Room {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let inboxes: Arc<Mutex<HashMap<ClientId, VecDeque<Bytes>>>> =
            Arc::new(Mutex::new(
                clients.iter().map(|&c| (c, VecDeque::new())).collect(),
            ));
        let mut docs = HashMap::new();
        for &client in clients {
            let sink = Arc::clone(&inboxes);
            let send: SendHook = Arc::new(move |ops: &[Operation]| {
                let msg = codec::encode_operations(ops).unwrap();
                let mut map = sink.lock().unwrap();
                for (&receiver, queue) in map.iter_mut() {
                    if receiver != client {
                        queue.push_back(msg.clone());
                    }
                }
            });
            let doc = Doc::new(
                client,
                DocOptions { gc_interval: None, send: Some(send) },
            )
            .unwrap();
            doc.transact(|txn| txn.ensure_root_list(0)).await.unwrap();
            docs.insert(client, doc);
        }
        Room { clients: clients.to_vec(), docs, inboxes }
    }

    fn doc(&self, client: ClientId) -> &Doc {
        &self.docs[&client]
    }

    async fn quiesce(&self) {
        for client in &self.clients {
            self.docs[client].when_transactions_finished().await.unwrap();
        }
    }

    /// Delivers every buffered message in random order (duplicating about
    /// half of them when asked) until all buffers stay empty.
    async fn sync(&self, rng: &mut StdRng, duplicate: bool) {
        loop {
            self.quiesce().await;
            let mut deliveries: Vec<(ClientId, Bytes)> = {
                let mut map = self.inboxes.lock().unwrap();
                let mut all = Vec::new();
                for (&receiver, queue) in map.iter_mut() {
                    while let Some(msg) = queue.pop_front() {
                        all.push((receiver, msg));
                    }
                }
                all
            };
            if deliveries.is_empty() {
                break;
            }
            deliveries.shuffle(rng);
            if duplicate {
                let extra: Vec<_> = deliveries
                    .iter()
                    .filter(|_| rng.random_bool(0.5))
                    .cloned()
                    .collect();
                deliveries.extend(extra);
                deliveries.shuffle(rng);
            }
            for (receiver, msg) in deliveries {
                self.doc(receiver).apply_encoded(msg).unwrap();
            }
        }
    }

    async fn contents(&self) -> Vec<Vec<Value>> {
        let mut out = Vec::new();
        for client in &self.clients {
            out.push(
                self.docs[client]
                    .transact(|txn| Ok(txn.list_content(ROOT)))
                    .await
                    .unwrap(),
            );
        }
        out
    }

    async fn assert_converged(&self) -> Vec<Value> {
        let contents = self.contents().await;
        for pair in contents.windows(2) {
            assert_eq!(pair[0], pair[1], "replicas diverged");
        }
        contents.into_iter().next().unwrap()
    }
}

fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

#[tokio::test]
async fn insert_flows_to_the_other_replica() {
    let room = Room::new(&[1, 2]).await;
    room.doc(1)
        .transact(|txn| txn.insert_at(ROOT, 0, vec![json!("x"), json!("y"), json!("z")]))
        .await
        .unwrap();
    room.sync(&mut rng(1), false).await;
    let content = room.assert_converged().await;
    assert_eq!(content, vec![json!("x"), json!("y"), json!("z")]);
}

#[tokio::test]
async fn concurrent_head_inserts_resolve_by_client_id() {
    let room = Room::new(&[1, 2, 3]).await;
    for (client, value) in [(1u64, "a"), (2, "b"), (3, "c")] {
        room.doc(client)
            .transact(move |txn| txn.insert_at(ROOT, 0, vec![json!(value)]))
            .await
            .unwrap();
    }
    room.sync(&mut rng(2), true).await;
    let content = room.assert_converged().await;
    assert_eq!(content, vec![json!("a"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn concurrent_overlapping_deletes_leave_an_empty_list() {
    let room = Room::new(&[1, 2]).await;
    room.doc(1)
        .transact(|txn| txn.insert_at(ROOT, 0, vec![json!("x"), json!("y")]))
        .await
        .unwrap();
    room.sync(&mut rng(3), false).await;
    // A deletes both while B, not yet aware, deletes the second one
    room.doc(1).transact(|txn| txn.delete_at(ROOT, 0, 2)).await.unwrap();
    room.doc(2).transact(|txn| txn.delete_at(ROOT, 1, 1)).await.unwrap();
    room.sync(&mut rng(4), true).await;
    let content = room.assert_converged().await;
    assert_eq!(content, Vec::<Value>::new());
    for client in [1, 2] {
        let len = room
            .doc(client)
            .transact(|txn| Ok(txn.list_len(ROOT)))
            .await
            .unwrap();
        assert_eq!(len, 0);
    }
}

#[tokio::test]
async fn concurrent_map_sets_converge_to_one_value() {
    // the shared root slot 1 is a map on every replica
    let room = Room::new(&[1, 2]).await;
    for client in [1, 2] {
        room.doc(client)
            .transact(|txn| txn.ensure_root_map(1).map(|_| ()))
            .await
            .unwrap();
    }
    let map = OpId { client: 0, clock: 1 };
    room.doc(1)
        .transact(move |txn| txn.map_set(map, "k", json!("c0")))
        .await
        .unwrap();
    room.doc(2)
        .transact(move |txn| txn.map_set(map, "k", json!("c1")))
        .await
        .unwrap();
    room.sync(&mut rng(5), true).await;
    let mut values = Vec::new();
    for client in [1, 2] {
        values.push(
            room.doc(client)
                .transact(move |txn| Ok(txn.map_get(map, "k")))
                .await
                .unwrap(),
        );
    }
    assert!(values[0].is_some());
    assert_eq!(values[0], values[1]);
}

#[tokio::test]
async fn redelivered_and_reordered_messages_change_nothing() {
    let room = Room::new(&[1, 2]).await;
    room.doc(1)
        .transact(|txn| txn.insert_at(ROOT, 0, vec![json!("a"), json!("b")]))
        .await
        .unwrap();
    room.sync(&mut rng(6), false).await;
    let baseline = room.assert_converged().await;
    // capture the message stream again by re-sending manually: apply the
    // same operations a second and third time
    let resend = room
        .doc(1)
        .transact(|txn| {
            let mut ops = Vec::new();
            let mut cur = txn.get_operation(ROOT).and_then(|p| p.start());
            while let Some(id) = cur {
                let op = txn.get_operation(id).cloned().unwrap();
                cur = op.as_insert().and_then(|i| i.right);
                ops.push(op);
            }
            Ok(codec::encode_operations(&ops).unwrap())
        })
        .await
        .unwrap();
    room.doc(2).apply_encoded(resend.clone()).unwrap();
    room.doc(2).apply_encoded(resend).unwrap();
    room.quiesce().await;
    assert_eq!(room.assert_converged().await, baseline);
}

#[tokio::test]
async fn reclamation_mid_run_anchor_converges() {
    let room = Room::new(&[1, 2]).await;
    room.doc(1)
        .transact(|txn| txn.insert_at(ROOT, 0, vec![json!("x"), json!("y"), json!("z")]))
        .await
        .unwrap();
    room.sync(&mut rng(7), false).await;
    // B anchors on the middle unit while A deletes the run and starts
    // collecting
    room.doc(2)
        .transact(|txn| txn.insert_at(ROOT, 2, vec![json!("!")]))
        .await
        .unwrap();
    room.doc(1).transact(|txn| txn.delete_at(ROOT, 0, 3)).await.unwrap();
    room.doc(1).set_synced(true).unwrap();
    room.doc(1).collect_garbage().await.unwrap();
    room.sync(&mut rng(8), false).await;
    assert_eq!(room.assert_converged().await, vec![json!("!")]);
    // later epochs must not disturb the converged state
    room.doc(1).collect_garbage().await.unwrap();
    room.doc(1).collect_garbage().await.unwrap();
    let after = room
        .doc(1)
        .transact(|txn| Ok(txn.list_content(ROOT)))
        .await
        .unwrap();
    assert_eq!(after, vec![json!("!")]);
}

#[tokio::test]
async fn randomized_edits_converge_under_duplication() {
    let mut rng = rng(0x5eed);
    let room = Room::new(&[1, 2, 3]).await;
    for round in 0..10 {
        for &client in &[1u64, 2, 3] {
            let len = room
                .doc(client)
                .transact(|txn| Ok(txn.list_len(ROOT)))
                .await
                .unwrap();
            if len > 0 && rng.random_bool(0.3) {
                let pos = rng.random_range(0..len);
                let del = (len - pos).min(rng.random_range(1..3));
                room.doc(client)
                    .transact(move |txn| txn.delete_at(ROOT, pos, del))
                    .await
                    .unwrap();
            } else {
                let pos = if len == 0 { 0 } else { rng.random_range(0..=len) };
                let values: Vec<Value> = (0..rng.random_range(1..4))
                    .map(|i| json!(format!("{client}.{round}.{i}")))
                    .collect();
                room.doc(client)
                    .transact(move |txn| txn.insert_at(ROOT, pos, values).map(|_| ()))
                    .await
                    .unwrap();
            }
        }
        if round % 3 == 2 {
            room.sync(&mut rng, true).await;
            room.assert_converged().await;
        }
    }
    room.sync(&mut rng, true).await;
    room.assert_converged().await;
}
