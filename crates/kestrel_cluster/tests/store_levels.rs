//! Level-occupancy lifecycle of a replicated store: flush accumulation,
//! compaction control, and the interaction between manual compaction and
//! ingest-behind loading.

mod common;

use std::time::Duration;

use tempfile::TempDir;

use common::{open_follower, test_options, write_table_file};
use kestrel_common::StoreError;
use kestrel_cluster::states::ReplicaRole;
use kestrel_cluster::store::ReplicatedStore;
use kestrel_storage::engine::{EngineOptions, IngestBatch};

#[test]
fn test_fresh_store_reports_top_empty_level() {
    let dir = TempDir::new().unwrap();
    let store = open_follower(&dir.path().join("p0"), test_options());

    assert_eq!(store.num_levels().unwrap(), 7);
    // Levels 0..=6 all empty: the highest empty index is 6.
    assert_eq!(store.highest_empty_level().unwrap(), Some(6));
}

#[test]
fn test_ingest_behind_disabled_then_enabled_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p0");

    let external = dir.path().join("bulk.tbl");
    write_table_file(&external, &[(b"a", b"1"), (b"b", b"2")]);

    // Default open: capability absent. The failure leaves levels untouched.
    let store = open_follower(&path, test_options());
    let err = store
        .ingest_behind(&IngestBatch::behind(vec![external.clone()]))
        .unwrap_err();
    assert!(matches!(err, StoreError::IngestionDisabled));
    assert_eq!(store.highest_empty_level().unwrap(), Some(6));
    store.close().unwrap();

    // The capability is fixed at open time: a fresh open is the only way
    // to gain it.
    let store = open_follower(
        &path,
        EngineOptions {
            allow_ingest_behind: true,
            ..test_options()
        },
    );
    let before = store.highest_empty_level().unwrap().unwrap();
    store
        .ingest_behind(&IngestBatch::behind(vec![external]))
        .unwrap();
    let after = store.highest_empty_level().unwrap().unwrap();
    assert!(after < before, "expected strict decrease, got {before} -> {after}");

    // Ingested data is readable.
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn test_compaction_level_placement_after_ingest() {
    let dir = TempDir::new().unwrap();
    let store = open_follower(
        &dir.path().join("p0"),
        EngineOptions {
            allow_ingest_behind: true,
            ..test_options()
        },
    );

    let external = dir.path().join("bulk.tbl");
    write_table_file(&external, &[(b"a", b"1"), (b"b", b"2")]);
    store
        .ingest_behind(&IngestBatch::behind(vec![external]))
        .unwrap();
    assert_eq!(store.highest_empty_level().unwrap(), Some(5));

    // Without change_level the run stays at the bottommost occupied level.
    store.compact(false).unwrap();
    assert_eq!(store.highest_empty_level().unwrap(), Some(5));

    // With change_level the small run collapses to a shallow level and
    // the bottom opens up again.
    store.compact(true).unwrap();
    assert_eq!(store.highest_empty_level().unwrap(), Some(6));
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_flush_accumulation_and_quiescent_drain() {
    let dir = TempDir::new().unwrap();
    let store = open_follower(
        &dir.path().join("p0"),
        EngineOptions {
            level0_file_num_compaction_trigger: 1,
            ..test_options()
        },
    );

    // Quiescent window: no new compactions start after this returns.
    assert!(store.set_compaction_enabled(false).unwrap());

    for round in 0..3u32 {
        for i in 0..5u32 {
            let key = format!("r{round}_k{i}");
            store.put(key.as_bytes(), b"v").unwrap();
        }
        store.flush().unwrap();
        assert_eq!(store.files_at_level(0).unwrap(), (round + 1) as usize);
    }

    // Work is still estimated while the scheduler is off.
    assert!(store.pending_compaction_count().unwrap() >= 1);

    // Re-enable and wait on the quiescence primitive, not a sleep.
    store.set_compaction_enabled(true).unwrap();
    assert!(store
        .wait_for_quiescence(Some(Duration::from_secs(10)))
        .unwrap());
    assert_eq!(store.pending_compaction_count().unwrap(), 0);
    assert_eq!(store.files_at_level(0).unwrap(), 0);
    assert_eq!(store.files_at_level(1).unwrap(), 1);

    // Every key survives the merge.
    for round in 0..3u32 {
        for i in 0..5u32 {
            let key = format!("r{round}_k{i}");
            assert_eq!(store.get(key.as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
    }
}

#[test]
fn test_stable_level_snapshot_recipe() {
    // The documented recipe for a stable occupancy read: disable
    // compaction, wait for quiescence, then inspect levels.
    let dir = TempDir::new().unwrap();
    let store = open_follower(
        &dir.path().join("p0"),
        EngineOptions {
            level0_file_num_compaction_trigger: 2,
            ..test_options()
        },
    );

    for i in 0..20u32 {
        store.put(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    store.flush().unwrap();

    store.set_compaction_enabled(false).unwrap();
    assert!(store
        .wait_for_quiescence(Some(Duration::from_secs(10)))
        .unwrap());

    let l0_before = store.files_at_level(0).unwrap();
    let l1_before = store.files_at_level(1).unwrap();

    // Memtable-only writes never move level occupancy while the
    // scheduler is off.
    for i in 0..10u32 {
        store.put(format!("extra_{i}").as_bytes(), b"v").unwrap();
    }
    assert_eq!(store.files_at_level(0).unwrap(), l0_before);
    assert_eq!(store.files_at_level(1).unwrap(), l1_before);

    // The next flush adds exactly one level-0 file and nothing merges.
    store.flush().unwrap();
    assert_eq!(store.files_at_level(0).unwrap(), l0_before + 1);
    assert_eq!(store.files_at_level(1).unwrap(), l1_before);
}

#[test]
fn test_closed_store_is_a_contract_error() {
    let dir = TempDir::new().unwrap();
    let store = open_follower(&dir.path().join("p0"), test_options());
    store.close().unwrap();

    assert!(matches!(store.put(b"k", b"v"), Err(StoreError::Closed)));
    assert!(matches!(
        store.pending_compaction_count(),
        Err(StoreError::Closed)
    ));
    assert!(matches!(
        store.set_compaction_enabled(false),
        Err(StoreError::Closed)
    ));
}

#[test]
fn test_open_conflicts_surface_as_open_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p0");

    // Two live instances on one path: the second open fails on the lock.
    let store = open_follower(&path, test_options());
    let err = ReplicatedStore::open(&path, ReplicaRole::Follower, test_options()).unwrap_err();
    assert!(matches!(err, StoreError::Open { .. }));
    store.close().unwrap();

    // error_if_exists against an existing directory.
    let err = ReplicatedStore::open(
        &path,
        ReplicaRole::Follower,
        EngineOptions {
            error_if_exists: true,
            ..test_options()
        },
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::Open { .. }));
}
