// End-to-end scenarios from spec §8, 1/2/3/6: single-process transactions
// against one net-table (scenario 4, the distributed cache, needs the same
// `Cache` machinery but across two peers, and lives here too since `Cache`
// is a submerge-txn type; scenario 5, pure chunk join/leave with no
// transaction involved, lives in submerge-net/tests instead).

use std::sync::Arc;
use std::time::Duration;

use ordered_float::OrderedFloat;
use test_log::test;

use submerge_base::{Error, Hash128, LogicalTime};
use submerge_lang::{FieldType, FieldValue, TableDescriptor, TableKind};
use submerge_net::chord::{ChordAdapter, DirectoryStore, LocalDirectory};
use submerge_net::chunk::LockBackoff;
use submerge_net::hub::{Hub, HubConfig};
use submerge_net::net_table::NetTable;
use submerge_rowdb::{LocalStore, RedbLocalStore};
use submerge_txn::{Cache, NetTableTransaction};

fn descriptor() -> TableDescriptor {
    TableDescriptor::new("t", TableKind::Cru, vec![("n".into(), FieldType::Double)])
}

fn make_peer(dir: &std::path::Path, tag: &str, directory: Box<dyn DirectoryStore>) -> Arc<NetTable> {
    let hub = Hub::bind(HubConfig::default(), dir.join(format!("{tag}-discovery.txt"))).unwrap();
    let store: Arc<dyn LocalStore + Send + Sync> = Arc::new(RedbLocalStore::create_table(dir.join(format!("{tag}.redb")), descriptor()).unwrap());
    let chord = Arc::new(ChordAdapter::new(directory, 5, Duration::from_millis(1)));
    let table = NetTable::new("t", hub.own_address(), Arc::clone(&hub), store, chord, LockBackoff::default());
    hub.init().unwrap();
    table
}

struct SharedDirectory(Arc<LocalDirectory>);
impl DirectoryStore for SharedDirectory {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.0.get(key)
    }
    fn compare_and_swap(&self, key: &str, expected: Option<Vec<u8>>, new: Vec<u8>) -> bool {
        self.0.compare_and_swap(key, expected, new)
    }
}

#[test]
fn scenario_1_single_peer_insert_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let table = make_peer(dir.path(), "s1", Box::new(LocalDirectory::new()));

    let mut txn = NetTableTransaction::new(Arc::clone(&table));
    let id = Hash128::from_bytes(b"id1");
    let chunk_id = txn.insert(vec![FieldValue::Double(OrderedFloat(1.618))], id, LogicalTime(1)).unwrap();
    txn.commit(LogicalTime(1)).unwrap();

    let rev = table.get_by_id(id, LogicalTime(1)).unwrap();
    assert_eq!(rev.get("n").unwrap(), &FieldValue::Double(OrderedFloat(1.618)));

    let mut txn2 = NetTableTransaction::new(Arc::clone(&table));
    txn2.update(chunk_id, id, vec![FieldValue::Double(OrderedFloat(7.0))], LogicalTime(2)).unwrap();
    txn2.commit(LogicalTime(2)).unwrap();

    let rev2 = table.get_by_id(id, LogicalTime(3)).unwrap();
    assert_eq!(rev2.get("n").unwrap(), &FieldValue::Double(OrderedFloat(7.0)));
}

#[test]
fn scenario_2_serial_two_agent_insert() {
    let dir = tempfile::tempdir().unwrap();
    let directory: Arc<LocalDirectory> = Arc::new(LocalDirectory::new());
    let agent_a = make_peer(dir.path(), "s2-a", Box::new(SharedDirectory(Arc::clone(&directory))));
    let agent_b = make_peer(dir.path(), "s2-b", Box::new(SharedDirectory(Arc::clone(&directory))));

    let mut txn_a = NetTableTransaction::new(Arc::clone(&agent_a));
    let id_a = Hash128::from_bytes(b"agent-a-row");
    let chunk_a = txn_a.insert(vec![FieldValue::Double(OrderedFloat(3.14))], id_a, LogicalTime(1)).unwrap();
    txn_a.commit(LogicalTime(1)).unwrap();

    let mut txn_b = NetTableTransaction::new(Arc::clone(&agent_b));
    let id_b = Hash128::from_bytes(b"agent-b-row");
    let chunk_b = txn_b.insert(vec![FieldValue::Double(OrderedFloat(42.0))], id_b, LogicalTime(2)).unwrap();
    txn_b.commit(LogicalTime(2)).unwrap();

    // Verifier runs as agent A's process, reading back both ids. Agent B's
    // row lives in a chunk only agent B owns, so the verifier must pull it
    // across the wire via the shared directory.
    let mut verify = NetTableTransaction::new(Arc::clone(&agent_a));
    let seen_a = verify.get(chunk_a, id_a, LogicalTime(3)).unwrap();
    assert_eq!(seen_a.get("n").unwrap(), &FieldValue::Double(OrderedFloat(3.14)));

    let pulled_b = agent_a.get_from_chunk(chunk_b, id_b, LogicalTime(3)).unwrap();
    assert_eq!(pulled_b.get("n").unwrap(), &FieldValue::Double(OrderedFloat(42.0)));
}

#[test]
fn scenario_3_concurrent_update_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let table = make_peer(dir.path(), "s3", Box::new(LocalDirectory::new()));

    let mut seed = NetTableTransaction::new(Arc::clone(&table));
    let id = Hash128::from_bytes(b"contested");
    let chunk_id = seed.insert(vec![FieldValue::Double(OrderedFloat(3.14))], id, LogicalTime(1)).unwrap();
    seed.commit(LogicalTime(1)).unwrap();

    let mut txn_a = NetTableTransaction::new(Arc::clone(&table));
    txn_a.get(chunk_id, id, LogicalTime(2)).unwrap();

    let mut txn_b = NetTableTransaction::new(Arc::clone(&table));
    txn_b.update(chunk_id, id, vec![FieldValue::Double(OrderedFloat(0xDEADBEEFu32 as f64))], LogicalTime(2)).unwrap();
    txn_b.commit(LogicalTime(2)).unwrap();

    txn_a.update(chunk_id, id, vec![FieldValue::Double(OrderedFloat(42.0))], LogicalTime(2)).unwrap();
    let result = txn_a.commit(LogicalTime(3));
    assert!(matches!(result, Err(Error::Conflict { ref id, .. }) if id == &Hash128::from_bytes(b"contested").to_hex()));

    let mut verify = NetTableTransaction::new(Arc::clone(&table));
    let seen = verify.get(chunk_id, id, LogicalTime(4)).unwrap();
    assert_eq!(seen.get("n").unwrap(), &FieldValue::Double(OrderedFloat(0xDEADBEEFu32 as f64)));
}

#[test]
fn scenario_4_distributed_cache_via_peer_join() {
    let dir = tempfile::tempdir().unwrap();
    let directory: Arc<LocalDirectory> = Arc::new(LocalDirectory::new());
    let root = make_peer(dir.path(), "s4-root", Box::new(SharedDirectory(Arc::clone(&directory))));
    let peer_a = make_peer(dir.path(), "s4-a", Box::new(SharedDirectory(Arc::clone(&directory))));

    let cache_root: Cache<f64> = Cache::new(
        Arc::clone(&root),
        LogicalTime(1),
        |rev| match rev.get("n")? {
            FieldValue::Double(v) => Ok(v.0),
            other => Err(Error::schema_mismatch("Double", format!("{:?}", other.field_type()))),
        },
        |v| vec![FieldValue::Double(OrderedFloat(*v))],
    );

    let mut seed = NetTableTransaction::new(Arc::clone(&root));
    let id1 = Hash128::from_bytes(b"id1");
    let chunk_id = seed.insert(vec![FieldValue::Double(OrderedFloat(0.0))], id1, LogicalTime(1)).unwrap();
    seed.commit(LogicalTime(1)).unwrap();
    cache_root.get(id1).unwrap();

    // Peer A joins the chunk by requesting it from the directory, then
    // reads id1 through its own cache (a local-only lookup, so the join has
    // to happen first), mutates it, inserts id2, and commits.
    peer_a.get_chunk(chunk_id).unwrap();
    let cache_a: Cache<f64> = Cache::new(
        Arc::clone(&peer_a),
        LogicalTime(2),
        |rev| match rev.get("n")? {
            FieldValue::Double(v) => Ok(v.0),
            other => Err(Error::schema_mismatch("Double", format!("{:?}", other.field_type()))),
        },
        |v| vec![FieldValue::Double(OrderedFloat(*v))],
    );
    let handle = cache_a.get(id1).unwrap();
    *handle.lock().unwrap() = 2.0;
    cache_a.mark_dirty(id1);

    let mut txn_a = NetTableTransaction::new(Arc::clone(&peer_a));
    cache_a.prepare_for_commit(&mut txn_a).unwrap();
    let id2 = Hash128::from_bytes(b"id2");
    txn_a.insert(vec![FieldValue::Double(OrderedFloat(1.0))], id2, LogicalTime(2)).unwrap();
    txn_a.commit(LogicalTime(2)).unwrap();

    let mut verify = NetTableTransaction::new(Arc::clone(&root));
    let v1 = verify.get(chunk_id, id1, LogicalTime(3)).unwrap();
    assert_eq!(v1.get("n").unwrap(), &FieldValue::Double(OrderedFloat(2.0)));
    assert!(root.get_by_id(id2, LogicalTime(3)).is_ok());
    let id3 = Hash128::from_bytes(b"id3");
    assert!(matches!(root.get_by_id(id3, LogicalTime(3)), Err(Error::NotFound { .. })));
}

#[test]
fn scenario_6_lock_deadlock_freedom_both_orders() {
    let dir = tempfile::tempdir().unwrap();
    let table = make_peer(dir.path(), "s6", Box::new(LocalDirectory::new()));

    // Two distinct, solely-owned chunks (new_chunk always allocates a fresh
    // one; own_or_new_chunk would instead find the first one this peer
    // already owns).
    let chunk_1 = table.new_chunk().unwrap();
    let chunk_2 = table.new_chunk().unwrap();
    let id1 = Hash128::from_bytes(b"c1-row");
    let id2 = Hash128::from_bytes(b"c2-row");
    chunk_1
        .insert(submerge_vers::Revision::from_descriptor(table.descriptor(), vec![FieldValue::Double(OrderedFloat(1.0))], id1, chunk_1.id, LogicalTime(1)).unwrap())
        .unwrap();
    chunk_2
        .insert(submerge_vers::Revision::from_descriptor(table.descriptor(), vec![FieldValue::Double(OrderedFloat(1.0))], id2, chunk_2.id, LogicalTime(1)).unwrap())
        .unwrap();
    let (chunk1, chunk2) = (chunk_1.id, chunk_2.id);

    // Two transactions touch the same pair of chunks in opposite staging
    // order; `NetTableTransaction::commit` always acquires locks in
    // ascending chunk-id order regardless, so this can never deadlock.
    let table_a = Arc::clone(&table);
    let forward = std::thread::spawn(move || {
        let mut txn = NetTableTransaction::new(table_a);
        txn.update(chunk1, id1, vec![FieldValue::Double(OrderedFloat(10.0))], LogicalTime(2)).unwrap();
        txn.update(chunk2, id2, vec![FieldValue::Double(OrderedFloat(11.0))], LogicalTime(2)).unwrap();
        txn.commit(LogicalTime(2))
    });
    let table_b = Arc::clone(&table);
    let backward = std::thread::spawn(move || {
        let mut txn = NetTableTransaction::new(table_b);
        txn.update(chunk2, id2, vec![FieldValue::Double(OrderedFloat(21.0))], LogicalTime(3)).unwrap();
        txn.update(chunk1, id1, vec![FieldValue::Double(OrderedFloat(20.0))], LogicalTime(3)).unwrap();
        txn.commit(LogicalTime(3))
    });

    // Both threads must finish (join returning at all proves no deadlock);
    // the chunk lock's own retry-with-backoff may make exactly one of the
    // two racing commits conflict, which is an acceptable outcome here.
    let forward_result = forward.join().unwrap();
    let backward_result = backward.join().unwrap();
    assert!(forward_result.is_ok() || backward_result.is_ok());
}
