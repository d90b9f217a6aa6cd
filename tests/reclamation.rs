//! Streaming objects are deleted only once everything in them is obsolete

mod common;

use common::Media;
use flash_journal::{BackingStore, Container, JournalError};

fn trim_of(c: &Container, name: &str) -> Option<u64> {
    c.snapshot()
        .groups
        .into_iter()
        .find(|g| g.name == name)
        .and_then(|g| g.trim)
}

#[test]
fn test_untrimmed_group_pins_oldest_object() {
    let media = Media::new();
    let registry = media.start();
    let c = registry.open(0).unwrap();

    c.write("1_hot_a", b"pinned").unwrap();

    let filler = vec![b'c'; 300];
    let mut counter = 0u64;
    for round in 0..10 {
        for _ in 0..4 {
            counter += 1;
            c.write(&format!("{}_cold_x", counter), &filler).unwrap();
        }
        c.trim(&format!("{}_cold", counter)).unwrap();
        c.reclaim().unwrap();

        assert!(!c.oldest_reclaimable(0).unwrap(), "round {}", round);
        assert!(media.store.exists(0, "SO_0_0").unwrap(), "round {}", round);
        assert_eq!(c.snapshot().streams[0].seq_oldest, 0);
    }
    assert_eq!(c.stats().objects_reclaimed, 0);
    assert_eq!(c.read("1_hot_a").unwrap(), b"pinned");

    // Trimming the pinning group releases every obsolete object
    c.trim("1_hot").unwrap();
    let reclaimed = c.reclaim().unwrap();
    assert!(reclaimed > 0);
    assert!(!media.store.exists(0, "SO_0_0").unwrap());
    assert_eq!(c.snapshot().streams[0].seq_oldest, reclaimed as u64);
    registry.close_all().unwrap();
}

#[test]
fn test_open_transaction_pins_objects() {
    let media = Media::new();
    let registry = media.start();
    let c = registry.open(0).unwrap();
    let filler = vec![b'c'; 300];

    let pinned = std::thread::scope(|s| {
        let (opened_tx, opened_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let transactions = registry.transactions();
        let handle = s.spawn(move || {
            transactions.begin();
            opened_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            transactions.finish();
        });
        opened_rx.recv().unwrap();

        for i in 1..=8u64 {
            c.write(&format!("{}_cold_x", i), &filler).unwrap();
        }
        c.trim("8_cold").unwrap();
        let pinned = c.reclaim().unwrap();

        done_tx.send(()).unwrap();
        handle.join().unwrap();
        pinned
    });
    assert_eq!(pinned, 0);

    assert!(c.reclaim().unwrap() > 0);
    registry.close_all().unwrap();
}

#[test]
fn test_trim_survives_reclaiming_its_object() {
    let media = Media::new();
    {
        let registry = media.start();
        let c = registry.open(0).unwrap();

        // SO_0_0 holds pg1's only trim record
        c.write("1_pg1_a", b"a").unwrap();
        c.trim("5_pg1").unwrap();
        let filler = vec![b'f'; 300];
        for i in 1..=6 {
            c.write(&format!("{}_fill_x", i), &filler).unwrap();
        }
        c.trim("6_fill").unwrap();
        c.write("2_pg1_late", b"late").unwrap();
        assert!(matches!(c.read("2_pg1_late"), Err(JournalError::ObjectDeleted)));

        assert!(c.reclaim().unwrap() >= 1);
        assert!(!media.store.exists(0, "SO_0_0").unwrap());
        assert_eq!(trim_of(&c, "pg1"), Some(5));
        // crash without close
    }

    let registry = media.start();
    let c = registry.open(0).unwrap();
    assert_eq!(trim_of(&c, "pg1"), Some(5));
    assert_eq!(trim_of(&c, "fill"), Some(6));
    assert!(matches!(c.read("2_pg1_late"), Err(JournalError::ObjectDeleted)));
    assert!(matches!(c.read("1_pg1_a"), Err(JournalError::ObjectDeleted)));
    assert!(c.enumerate_start("pg1").unwrap().next().is_none());
    registry.close_all().unwrap();
}
