//! Local file-backed queue: one append-only log plus an offset checkpoint
//! per partition.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

use crate::{route_partition, QueueAck, QueueBackend, QueueError};

/// Width of the zero-padded decimal in the `offset` checkpoint file.
const OFFSET_WIDTH: usize = 14;

/// How far back from the end of a log the recovery scan reads. Any single
/// record line is far smaller than this (payloads cap at 1 MiB), so the
/// window always contains the final complete line.
const TAIL_SCAN_BYTES: u64 = 2 * 1024 * 1024;

/// When the log is forced down to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every record. Strict durability.
    Always,
    /// fsync once every `n` records.
    EveryN(u32),
    /// fsync when at least this long has passed since the previous sync.
    Interval(Duration),
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::Always
    }
}

/// One serialized record per log line.
#[derive(Serialize)]
struct RecordLine<'a> {
    offset: u64,
    key: &'a str,
    ts: u64,
    payload: &'a RawValue,
}

#[derive(Deserialize)]
struct RecordHead {
    offset: u64,
}

struct Partition {
    dir: PathBuf,
    log: File,
    /// Authoritative next offset. The on-disk `offset` file is a checkpoint
    /// of this counter, re-derived on startup.
    next_offset: u64,
    unsynced_writes: u32,
    last_sync: Instant,
}

impl Partition {
    fn open(root: &Path, index: u32) -> Result<Self, QueueError> {
        let dir = root.join(format!("partition-{index}"));
        fs::create_dir_all(&dir)?;
        let log_path = dir.join("messages.log");

        let checkpoint = read_checkpoint(&dir)?;
        let last_logged = recover_log_tail(&log_path, index)?;

        let next_offset = match last_logged {
            // Crash after append but before the checkpoint update leaves the
            // log one record ahead; the log wins.
            Some(last) if last + 1 > checkpoint => {
                if checkpoint > 0 || last > 0 {
                    info!(
                        partition = index,
                        checkpoint,
                        recovered = last + 1,
                        "advancing offset past un-checkpointed record"
                    );
                }
                last + 1
            }
            _ => checkpoint,
        };

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        Ok(Self {
            dir,
            log,
            next_offset,
            unsynced_writes: 0,
            last_sync: Instant::now(),
        })
    }

    fn append(
        &mut self,
        key: &str,
        payload: &RawValue,
        ts: u64,
        policy: FsyncPolicy,
    ) -> Result<u64, QueueError> {
        let offset = self.next_offset;
        let mut line = serde_json::to_vec(&RecordLine {
            offset,
            key,
            ts,
            payload,
        })?;
        line.push(b'\n');
        self.log.write_all(&line)?;
        self.maybe_sync(policy)?;
        self.next_offset += 1;
        self.write_checkpoint()?;
        Ok(offset)
    }

    fn maybe_sync(&mut self, policy: FsyncPolicy) -> Result<(), QueueError> {
        self.unsynced_writes += 1;
        let due = match policy {
            FsyncPolicy::Always => true,
            FsyncPolicy::EveryN(n) => self.unsynced_writes >= n.max(1),
            FsyncPolicy::Interval(interval) => self.last_sync.elapsed() >= interval,
        };
        if due {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), QueueError> {
        self.log.sync_data()?;
        self.unsynced_writes = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Persist the counter with a write-then-rename so a crash can never
    /// leave a half-written checkpoint.
    fn write_checkpoint(&self) -> Result<(), QueueError> {
        let tmp = self.dir.join("offset.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(format!("{:0width$}", self.next_offset, width = OFFSET_WIDTH).as_bytes())?;
        file.sync_data()?;
        fs::rename(&tmp, self.dir.join("offset"))?;
        Ok(())
    }
}

fn read_checkpoint(dir: &Path) -> Result<u64, QueueError> {
    match fs::read_to_string(dir.join("offset")) {
        Ok(text) => text.trim().parse::<u64>().map_err(|_| {
            QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("corrupt offset checkpoint in {}", dir.display()),
            ))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

/// Inspect the log tail: drop a torn final line left by a crash mid-append,
/// then report the offset of the last complete record, if any.
fn recover_log_tail(log_path: &Path, index: u32) -> Result<Option<u64>, QueueError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(log_path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }

    let scan_start = len.saturating_sub(TAIL_SCAN_BYTES);
    file.seek(SeekFrom::Start(scan_start))?;
    let mut tail = Vec::with_capacity((len - scan_start) as usize);
    file.read_to_end(&mut tail)?;

    // Anything after the final newline is a torn write; truncate it away so
    // the next append starts on a clean line boundary.
    let complete_len = match tail.iter().rposition(|&byte| byte == b'\n') {
        Some(last_newline) => last_newline + 1,
        None => 0,
    };
    if complete_len < tail.len() {
        let torn = tail.len() - complete_len;
        warn!(
            partition = index,
            torn_bytes = torn,
            "truncating torn record at log tail"
        );
        file.set_len(len - torn as u64)?;
        tail.truncate(complete_len);
    }

    for line in tail.split(|&byte| byte == b'\n').rev() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<RecordHead>(line) {
            Ok(head) => return Ok(Some(head.offset)),
            Err(err) => {
                warn!(
                    partition = index,
                    error = %err,
                    "skipping unreadable record line during recovery"
                );
            }
        }
    }
    Ok(None)
}

/// Hash-partitioned local queue over `partition-<i>/` directories.
///
/// Each partition is exclusively owned by its mutex; offsets within one
/// partition are strictly increasing and contiguous from zero, across
/// restarts.
pub struct PartitionedQueue {
    partitions: Vec<Mutex<Partition>>,
    policy: FsyncPolicy,
}

impl PartitionedQueue {
    pub fn open(
        root: impl AsRef<Path>,
        partition_count: u32,
        policy: FsyncPolicy,
    ) -> Result<Self, QueueError> {
        let root = root.as_ref();
        if partition_count == 0 {
            return Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "partition count must be at least 1",
            )));
        }
        fs::create_dir_all(root)?;

        let mut partitions = Vec::with_capacity(partition_count as usize);
        for index in 0..partition_count {
            partitions.push(Mutex::new(Partition::open(root, index)?));
        }
        info!(
            root = %root.display(),
            partitions = partition_count,
            "local queue ready"
        );
        Ok(Self { partitions, policy })
    }
}

impl QueueBackend for PartitionedQueue {
    fn produce(&self, key: &str, payload: &[u8]) -> Result<QueueAck, QueueError> {
        let text = std::str::from_utf8(payload).map_err(|_| {
            QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "payload is not valid utf-8",
            ))
        })?;
        let raw: &RawValue = serde_json::from_str(text)?;
        let ts = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let index = route_partition(key, self.partitions.len() as u32);

        let mut partition = self.partitions[index as usize].lock();
        let offset = partition.append(key, raw, ts, self.policy)?;
        debug!(partition = index, offset, key, "record appended");
        Ok(QueueAck {
            partition: index,
            offset,
        })
    }

    fn flush(&self) -> Result<(), QueueError> {
        for partition in &self.partitions {
            partition.lock().sync()?;
        }
        Ok(())
    }

    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}
