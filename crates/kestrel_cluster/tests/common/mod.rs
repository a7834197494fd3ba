#![allow(dead_code)]

use std::path::Path;

use kestrel_cluster::states::ReplicaRole;
use kestrel_cluster::store::ReplicatedStore;
use kestrel_storage::engine::EngineOptions;
use kestrel_storage::lsm::table::TableWriter;

/// Engine options for tests: no fsync, defaults otherwise.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        sync_writes: false,
        ..Default::default()
    }
}

pub fn open_follower(path: &Path, options: EngineOptions) -> ReplicatedStore {
    ReplicatedStore::open(path, ReplicaRole::Follower, options).unwrap()
}

/// Build an external table file the way a trusted bulk-load producer would.
pub fn write_table_file(path: &Path, entries: &[(&[u8], &[u8])]) {
    let mut writer = TableWriter::create(path, entries.len()).unwrap();
    for (key, value) in entries {
        writer.add(key, Some(value)).unwrap();
    }
    writer.finish(false).unwrap();
}
