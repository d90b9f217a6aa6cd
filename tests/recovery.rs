//! Crash recovery over shared media

mod common;

use common::Media;
use flash_journal::{BackingStore, JournalConfig, JournalError};

fn populate(media: &Media) {
    let registry = media.start();
    let c = registry.open(0).unwrap();
    let value = vec![b'v'; 250];
    for i in 1..=10u64 {
        c.write(&format!("{}_pg{}_k", i, i % 3), &value).unwrap();
    }
    c.trim("4_pg1").unwrap();
    c.delete("5_pg2_k").unwrap();
    // crash with the newest SO only in the durable buffer
}

#[test]
fn test_recovery_is_idempotent() {
    let media = Media::new();
    populate(&media);

    let first = {
        let registry = media.start();
        let snapshot = registry.open(0).unwrap().snapshot();
        // crash again without writing anything
        snapshot
    };
    let second = {
        let registry = media.start();
        registry.open(0).unwrap().snapshot()
    };

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_recovered_container_serves_reads() {
    let media = Media::new();
    populate(&media);

    let registry = media.start();
    let c = registry.open(0).unwrap();
    assert_eq!(c.read("10_pg1_k").unwrap(), vec![b'v'; 250]);
    assert!(c.read("1_pg1_k").is_err());
    assert!(c.read("5_pg2_k").is_err());
    assert_eq!(c.read("8_pg2_k").unwrap().len(), 250);

    // New writes continue after the recovered sequence numbers
    let before = c.snapshot().streams[0].seq_next;
    c.write("11_pg0_k", b"after").unwrap();
    registry.close_all().unwrap();

    let registry = media.start();
    let c = registry.open(0).unwrap();
    assert_eq!(c.read("11_pg0_k").unwrap(), b"after");
    assert!(c.snapshot().streams[0].seq_next > before);
    registry.close_all().unwrap();
}

#[test]
fn test_recovery_with_multiple_streams() {
    let mut config = JournalConfig::test();
    config.journal.streams_per_container = 2;
    let media = Media::with_config(config);
    {
        let registry = media.start();
        let c = registry.open(0).unwrap();
        for i in 1..=6u64 {
            c.write(&format!("{}_g{}_k", i, i % 4), b"x").unwrap();
        }
    }

    let registry = media.start();
    let c = registry.open(0).unwrap();
    let snapshot = c.snapshot();
    assert_eq!(snapshot.streams.len(), 2);
    assert_eq!(snapshot.groups.len(), 4);
    for i in 1..=6u64 {
        assert_eq!(c.read(&format!("{}_g{}_k", i, i % 4)).unwrap(), b"x");
    }
    assert!(media.store.exists(0, "SO_0_0").unwrap());
    assert!(media.store.exists(0, "SO_1_0").unwrap());
    registry.close_all().unwrap();
}

#[test]
fn test_recovered_streams_beyond_config_need_free_buffers() {
    let mut config = JournalConfig::test();
    config.journal.max_containers = 2;
    config.journal.streams_per_container = 2;
    config.buffer.buffer_count = 4;
    let media = Media::with_config(config);
    {
        let registry = media.start();
        let c = registry.open(0).unwrap();
        for i in 1..=6u64 {
            c.write(&format!("{}_g{}_k", i, i % 4), b"x").unwrap();
        }
        registry.close_all().unwrap();
    }
    assert!(media.store.exists(0, "SO_1_0").unwrap());

    // Fewer streams and buffers than the media was written with
    let mut shrunk = media.config.clone();
    shrunk.journal.streams_per_container = 1;
    shrunk.buffer.buffer_count = 2;
    let registry = media.start_with(shrunk);
    registry.open(1).unwrap();
    assert!(matches!(registry.open(0), Err(JournalError::NoSpace)));
    assert!(matches!(registry.get(0), Err(JournalError::ContainerUnknown(0))));

    // With a buffer to spare every recovered stream comes back
    registry.close(1).unwrap();
    let c = registry.open(0).unwrap();
    assert_eq!(c.snapshot().streams.len(), 2);
    for i in 1..=6u64 {
        assert_eq!(c.read(&format!("{}_g{}_k", i, i % 4)).unwrap(), b"x");
    }
    registry.close_all().unwrap();
}
