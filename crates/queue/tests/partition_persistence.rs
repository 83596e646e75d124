//! Durability and ordering tests for the local partitioned queue.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use metrion_queue::{FsyncPolicy, PartitionedQueue, QueueBackend};
use serde_json::Value;
use tempfile::TempDir;

const PAYLOAD: &[u8] = br#"{"metrics":[{"timestamp":"2025-10-12T15:30:00.000Z","name":"cpu","value":75.5}]}"#;

fn log_lines(root: &TempDir, partition: u32) -> Vec<Value> {
    let path = root.path().join(format!("partition-{partition}/messages.log"));
    let text = fs::read_to_string(path).unwrap_or_default();
    text.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn offsets_are_contiguous_from_zero_per_partition() {
    let dir = TempDir::new().unwrap();
    let queue = PartitionedQueue::open(dir.path(), 4, FsyncPolicy::Always).unwrap();

    for i in 0..40 {
        let key = format!("client-{}", i % 7);
        queue.produce(&key, PAYLOAD).unwrap();
    }

    for partition in 0..4 {
        let offsets: Vec<u64> = log_lines(&dir, partition)
            .iter()
            .map(|line| line["offset"].as_u64().unwrap())
            .collect();
        let expected: Vec<u64> = (0..offsets.len() as u64).collect();
        assert_eq!(offsets, expected, "partition {partition}");
    }
}

#[test]
fn one_key_always_lands_in_one_partition_in_order() {
    let dir = TempDir::new().unwrap();
    let queue = PartitionedQueue::open(dir.path(), 4, FsyncPolicy::Always).unwrap();

    let first = queue.produce("cli1", PAYLOAD).unwrap();
    let mut previous = first.offset;
    for _ in 0..9 {
        let ack = queue.produce("cli1", PAYLOAD).unwrap();
        assert_eq!(ack.partition, first.partition);
        assert!(ack.offset > previous);
        previous = ack.offset;
    }
}

#[test]
fn record_lines_carry_the_full_wire_shape() {
    let dir = TempDir::new().unwrap();
    let queue = PartitionedQueue::open(dir.path(), 1, FsyncPolicy::Always).unwrap();
    let ack = queue.produce("cli1", PAYLOAD).unwrap();

    let lines = log_lines(&dir, 0);
    assert_eq!(lines.len(), 1);
    let line = &lines[0];
    assert_eq!(line["offset"].as_u64().unwrap(), ack.offset);
    assert_eq!(line["key"], "cli1");
    assert!(line["ts"].as_u64().is_some());
    assert_eq!(
        line["payload"],
        serde_json::from_slice::<Value>(PAYLOAD).unwrap()
    );
}

#[test]
fn offsets_continue_across_a_clean_restart() {
    let dir = TempDir::new().unwrap();
    {
        let queue = PartitionedQueue::open(dir.path(), 2, FsyncPolicy::Always).unwrap();
        for _ in 0..5 {
            queue.produce("cli1", PAYLOAD).unwrap();
        }
    }
    let queue = PartitionedQueue::open(dir.path(), 2, FsyncPolicy::Always).unwrap();
    let ack = queue.produce("cli1", PAYLOAD).unwrap();
    assert_eq!(ack.offset, 5);
}

#[test]
fn recovery_advances_past_an_uncheckpointed_record() {
    let dir = TempDir::new().unwrap();
    let partition = {
        let queue = PartitionedQueue::open(dir.path(), 2, FsyncPolicy::Always).unwrap();
        let mut last = None;
        for _ in 0..3 {
            last = Some(queue.produce("cli1", PAYLOAD).unwrap());
        }
        last.unwrap().partition
    };

    // Simulate a crash between the append and the checkpoint update by
    // rolling the checkpoint file back one record.
    let offset_path = dir.path().join(format!("partition-{partition}/offset"));
    fs::write(&offset_path, "00000000000002").unwrap();

    let queue = PartitionedQueue::open(dir.path(), 2, FsyncPolicy::Always).unwrap();
    let ack = queue.produce("cli1", PAYLOAD).unwrap();
    assert_eq!(ack.offset, 3, "orphan record must not be overwritten");

    let offsets: Vec<u64> = log_lines(&dir, partition)
        .iter()
        .map(|line| line["offset"].as_u64().unwrap())
        .collect();
    assert_eq!(offsets, vec![0, 1, 2, 3]);
}

#[test]
fn a_torn_final_line_is_truncated_on_recovery() {
    let dir = TempDir::new().unwrap();
    let partition = {
        let queue = PartitionedQueue::open(dir.path(), 2, FsyncPolicy::Always).unwrap();
        queue.produce("cli1", PAYLOAD).unwrap().partition
    };

    let log_path = dir.path().join(format!("partition-{partition}/messages.log"));
    let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
    file.write_all(br#"{"offset":1,"key":"cli1","ts":17"#).unwrap();
    drop(file);

    let queue = PartitionedQueue::open(dir.path(), 2, FsyncPolicy::Always).unwrap();
    let ack = queue.produce("cli1", PAYLOAD).unwrap();
    assert_eq!(ack.offset, 1);

    let offsets: Vec<u64> = log_lines(&dir, partition)
        .iter()
        .map(|line| line["offset"].as_u64().unwrap())
        .collect();
    assert_eq!(offsets, vec![0, 1]);
}

#[test]
fn batched_fsync_policies_still_append_every_record() {
    for policy in [
        FsyncPolicy::EveryN(8),
        FsyncPolicy::Interval(Duration::from_secs(60)),
    ] {
        let dir = TempDir::new().unwrap();
        let queue = PartitionedQueue::open(dir.path(), 1, policy).unwrap();
        for _ in 0..10 {
            queue.produce("cli1", PAYLOAD).unwrap();
        }
        queue.flush().unwrap();
        assert_eq!(log_lines(&dir, 0).len(), 10);
    }
}

#[test]
fn concurrent_producers_keep_partitions_contiguous() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(PartitionedQueue::open(dir.path(), 4, FsyncPolicy::EveryN(16)).unwrap());

    let mut handles = Vec::new();
    for worker in 0..8 {
        let queue = Arc::clone(&queue);
        handles.push(std::thread::spawn(move || {
            let mut acks = Vec::new();
            for i in 0..25 {
                let key = format!("client-{worker}-{}", i % 3);
                acks.push((key.clone(), queue.produce(&key, PAYLOAD).unwrap()));
            }
            acks
        }));
    }

    let mut per_client_partitions: HashMap<String, u32> = HashMap::new();
    for handle in handles {
        for (key, ack) in handle.join().unwrap() {
            let entry = per_client_partitions.entry(key).or_insert(ack.partition);
            assert_eq!(*entry, ack.partition);
        }
    }

    for partition in 0..4 {
        let mut offsets: Vec<u64> = log_lines(&dir, partition)
            .iter()
            .map(|line| line["offset"].as_u64().unwrap())
            .collect();
        offsets.sort_unstable();
        let expected: Vec<u64> = (0..offsets.len() as u64).collect();
        assert_eq!(offsets, expected, "partition {partition}");
    }
}
