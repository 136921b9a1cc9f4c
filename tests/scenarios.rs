//! End-to-end scenarios from the design notes: S1 basic insert/split, S2
//! big records, S3 AK order/duplicates, S4 AK split/merge, S5 lock
//! denial/deadlock, S6 transaction commit/rollback.

use multistore::akindex::AkIndex;
use multistore::error::StoreError;
use multistore::glock::GroupLockTable;
use multistore::hashfile::HashFile;
use multistore::layout::{self, AkHeader, AK_ENABLED, AK_LSORT, AK_NOCASE};
use multistore::rlock::{LocalLockTable, LockMode, RecordLockTable};
use multistore::subfile::SubfileSet;
use multistore::txn::{commit_single_file, Transaction};
use std::sync::{Arc, Mutex};

fn scratch_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("scenario_{}_{}", name, std::process::id()))
}

fn make_file(dir: &std::path::Path) -> HashFile {
    std::fs::create_dir_all(dir).unwrap();
    let cache = Arc::new(Mutex::new(subfile_io::cache::FdsCache::new(16)));
    let sfs = SubfileSet::new(1, dir.to_str().unwrap(), 1024, layout::DH_VERSION, cache);
    let glocks = Arc::new(Mutex::new(GroupLockTable::new(64)));
    HashFile::create(1, dir.to_str().unwrap(), 1024, 1, 60, 40, 600, sfs, glocks)
}

fn make_ak(dir: &std::path::Path, flags: u16) -> AkIndex {
    std::fs::create_dir_all(dir).unwrap();
    let cache = Arc::new(Mutex::new(subfile_io::cache::FdsCache::new(16)));
    let sfs = SubfileSet::new(
        1,
        dir.to_str().unwrap(),
        layout::DH_AK_NODE_SIZE as u32,
        layout::DH_VERSION,
        cache,
    );
    let header = AkHeader {
        magic: layout::DH_INDEX,
        flags: flags | AK_ENABLED,
        fno: 1,
        free_chain: 0,
        itype_len: 0,
        itype: Vec::new(),
        ak_name: "F1".into(),
        data_creation_timestamp: 0,
        collation_map_name: String::new(),
        collation_map: None,
    };
    AkIndex::create(0, header, sfs).unwrap()
}

#[test]
fn s1_basic_insert_and_split() {
    let dir = scratch_dir("s1");
    let mut hf = make_file(&dir);
    for i in 1..=20 {
        let id = format!("K{:02}", i);
        hf.write(id.as_bytes(), vec![b'x'; 80]).unwrap();
    }
    assert!(hf.header.modulus >= 2);
    for i in 1..=20 {
        let id = format!("K{:02}", i);
        let data = hf.read(id.as_bytes()).unwrap();
        assert_eq!(data, vec![b'x'; 80]);
    }
    assert_eq!(hf.header.record_count, 20);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn s2_big_record_frees_on_delete() {
    let dir = scratch_dir("s2");
    let mut hf = make_file(&dir);
    hf.write(b"BIG", vec![b'z'; 2048]).unwrap();
    let data = hf.read(b"BIG").unwrap();
    assert_eq!(data.len(), 2048);
    assert!(data.iter().all(|&b| b == b'z'));
    hf.delete(b"BIG").unwrap();
    assert_ne!(hf.header.free_chain, 0);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn s3_ak_order_and_duplicates() {
    let dir = scratch_dir("s3");
    let mut ak = make_ak(&dir, AK_LSORT | AK_NOCASE);
    for (field1, rec_id) in [
        ("charlie", "R1"),
        ("Alpha", "R2"),
        ("BRAVO", "R3"),
        ("alpha", "R4"),
        ("delta", "R5"),
    ] {
        ak.insert(field1.as_bytes(), rec_id.as_bytes()).unwrap();
    }
    let scan = ak.scan_forward(None).unwrap();
    let keys: Vec<String> = scan.iter().map(|e| String::from_utf8(e.key.clone()).unwrap()).collect();
    let alpha_positions: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| k.eq_ignore_ascii_case("alpha"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(alpha_positions.len(), 2);
    assert!(alpha_positions[1] == alpha_positions[0] + 1);
    let ids_for_alpha: Vec<&str> = alpha_positions
        .iter()
        .map(|&i| std::str::from_utf8(&scan[i].record_id).unwrap())
        .collect();
    assert_eq!(ids_for_alpha, vec!["R2", "R4"]);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn s4_ak_split_and_merge() {
    let dir = scratch_dir("s4");
    let mut ak = make_ak(&dir, 0);
    for i in 0..300u32 {
        let id = format!("id{:03}", i);
        ak.insert(id.as_bytes(), id.as_bytes()).unwrap();
    }
    let scan = ak.scan_forward(None).unwrap();
    assert_eq!(scan.len(), 300);
    let mut sorted = scan.iter().map(|e| e.key.clone()).collect::<Vec<_>>();
    let mut expected = sorted.clone();
    expected.sort();
    assert_eq!(sorted, expected);

    for i in (1..300u32).step_by(2) {
        let id = format!("id{:03}", i);
        ak.delete(id.as_bytes(), id.as_bytes()).unwrap();
    }
    let remaining = ak.scan_forward(None).unwrap();
    assert_eq!(remaining.len(), 150);
    sorted = remaining.iter().map(|e| e.key.clone()).collect();
    let mut expected_remaining = sorted.clone();
    expected_remaining.sort();
    assert_eq!(sorted, expected_remaining);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn s5_lock_denial_and_deadlock() {
    let mut rlocks = RecordLockTable::new(64, 5);
    let mut llt_a = LocalLockTable::default();
    let mut llt_b = LocalLockTable::default();

    // A locks X exclusively.
    rlocks
        .acquire(1, b"X", LockMode::Update, 100, 0, || false, &mut llt_a)
        .unwrap();

    // B tries X with no-wait (cancelled immediately) and is denied.
    let denied = rlocks.acquire(1, b"X", LockMode::Update, 200, 0, || true, &mut llt_b);
    assert!(denied.is_err());

    // B locks Y exclusively, then A tries Y (creating a cycle) and detects deadlock.
    rlocks
        .acquire(1, b"Y", LockMode::Update, 200, 0, || false, &mut llt_b)
        .unwrap();
    let mut tries = 0;
    rlocks
        .acquire(1, b"X", LockMode::Update, 200, 0, || {
            tries += 1;
            tries > 50
        }, &mut llt_b)
        .ok();
    let result = rlocks.acquire(1, b"Y", LockMode::Update, 100, 0, || false, &mut llt_a);
    assert!(matches!(result, Err(StoreError::Deadlock)));
}

#[test]
fn s6_transaction_commit_and_rollback() {
    let dir = scratch_dir("s6");
    let mut hf = make_file(&dir);
    hf.write(b"T2", b"two".to_vec()).unwrap();

    let mut txn = Transaction::begin(1);
    txn.buffer_write(1, b"T1", b"one".to_vec());
    txn.buffer_delete(1, b"T2");
    assert_eq!(txn.read(1, b"T1").unwrap().unwrap(), b"one");
    assert!(matches!(txn.read(1, b"T2").unwrap(), Err(StoreError::NotFound)));
    txn.rollback();
    assert!(matches!(hf.read(b"T1").unwrap_err(), StoreError::NotFound));
    assert_eq!(hf.read(b"T2").unwrap(), b"two");

    let mut txn2 = Transaction::begin(2);
    txn2.buffer_write(1, b"T1", b"one".to_vec());
    txn2.buffer_delete(1, b"T2");
    commit_single_file(txn2, &mut hf).unwrap();
    assert_eq!(hf.read(b"T1").unwrap(), b"one");
    assert!(matches!(hf.read(b"T2").unwrap_err(), StoreError::NotFound));

    std::fs::remove_dir_all(&dir).ok();
}
