// End-to-end scenario from spec §8, scenario 5: chunk join and leave,
// exercised over real loopback TCP sockets between two in-process `Hub`s.

use std::sync::Arc;
use std::time::Duration;

use test_log::test;

use submerge_base::{Hash128, LogicalTime};
use submerge_lang::{FieldType, FieldValue, TableDescriptor, TableKind};
use submerge_net::chord::{ChordAdapter, DirectoryStore, LocalDirectory};
use submerge_net::chunk::LockBackoff;
use submerge_net::hub::{Hub, HubConfig};
use submerge_net::net_table::NetTable;
use submerge_rowdb::{LocalStore, RedbLocalStore};

fn descriptor() -> TableDescriptor {
    TableDescriptor::new("t", TableKind::Cru, vec![("n".into(), FieldType::Uint32)])
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

fn make_peer(dir: &std::path::Path, tag: &str, directory: Arc<LocalDirectory>) -> (Arc<NetTable>, Arc<ChordAdapter>) {
    let hub = Hub::bind(HubConfig::default(), dir.join(format!("{tag}-discovery.txt"))).unwrap();
    let store: Arc<dyn LocalStore + Send + Sync> = Arc::new(RedbLocalStore::create_table(dir.join(format!("{tag}.redb")), descriptor()).unwrap());
    let chord = Arc::new(ChordAdapter::new(Box::new(SharedDirectory(directory)), 5, Duration::from_millis(1)));
    let table = NetTable::new("t", hub.own_address(), Arc::clone(&hub), store, Arc::clone(&chord), LockBackoff::default());
    hub.init().unwrap();
    (table, chord)
}

#[test]
fn scenario_5_chunk_join_and_leave() {
    let dir = tempfile::tempdir().unwrap();
    let directory: Arc<LocalDirectory> = Arc::new(LocalDirectory::new());
    let (peer_x, chord_x) = make_peer(dir.path(), "s5-x", Arc::clone(&directory));
    let (peer_y, chord_y) = make_peer(dir.path(), "s5-y", Arc::clone(&directory));
    let _ = &chord_x;

    for (i, n) in [10u32, 20, 30].into_iter().enumerate() {
        let id = Hash128::from_bytes(format!("row-{i}").as_bytes());
        peer_x.insert(vec![FieldValue::Uint32(n)], id, LogicalTime(1)).unwrap();
    }
    let x_dump = peer_x.dump_active_chunks(LogicalTime(1)).unwrap();
    assert_eq!(x_dump.len(), 3);
    let chunk_id = x_dump[0].chunk_id;

    // Y pulls the chunk via get_chunk, which drives a ConnectRequest/
    // InitRequest round trip against X.
    let pulled = peer_y.get_chunk(chunk_id).unwrap();
    let mut y_dump: Vec<_> = pulled.dump(LogicalTime(1)).unwrap();
    let mut x_chunk_dump: Vec<_> = x_dump.iter().filter(|r| r.chunk_id == chunk_id).cloned().collect();
    y_dump.sort_by_key(|r| r.id);
    x_chunk_dump.sort_by_key(|r| r.id);
    assert_eq!(y_dump.len(), x_chunk_dump.len());
    for (a, b) in y_dump.iter().zip(x_chunk_dump.iter()) {
        assert!(a.equal(b));
    }
    assert!(pulled.swarm().contains(&peer_y.self_id()));

    // Y leaves; its swarm and the directory both drop Y.
    let y_self = peer_y.self_id();
    pulled.leave(|| chord_y.renounce_possession(chunk_id, y_self)).unwrap();

    assert!(!pulled.swarm().contains(&y_self));
}
