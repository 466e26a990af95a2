//! Snapshot stream format and the background snapshot scheduler.
//!
//! A snapshot stream is: magic, format version, applied term and index,
//! the length-prefixed node metadata map, then the SQLite database image.
//! A snapshot at index `i` plus the log tail `i+1..` reconstructs the same
//! state as replaying the whole log.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::raft::node::RaftCore;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"RSQL";
pub const SNAPSHOT_VERSION: u8 = 1;

/// magic + version + term + index + metadata length
const HEADER_LEN: usize = 4 + 1 + 8 + 8 + 4;

/// Decoded snapshot contents.
pub(crate) struct SnapshotPayload {
    pub applied_term: u64,
    pub applied_index: u64,
    pub node_meta: BTreeMap<String, BTreeMap<String, String>>,
    pub db_bytes: Vec<u8>,
}

impl SnapshotPayload {
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let meta =
            bincode::serialize(&self.node_meta).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + meta.len() + self.db_bytes.len());
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.push(SNAPSHOT_VERSION);
        buf.extend_from_slice(&self.applied_term.to_be_bytes());
        buf.extend_from_slice(&self.applied_index.to_be_bytes());
        buf.extend_from_slice(&(meta.len() as u32).to_be_bytes());
        buf.extend_from_slice(&meta);
        buf.extend_from_slice(&self.db_bytes);
        Ok(buf)
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(StoreError::Encoding(format!(
                "snapshot stream truncated: {} bytes",
                data.len()
            )));
        }
        if data[..4] != SNAPSHOT_MAGIC {
            return Err(StoreError::Encoding("bad snapshot magic".to_string()));
        }
        if data[4] != SNAPSHOT_VERSION {
            return Err(StoreError::Encoding(format!(
                "unsupported snapshot version {}",
                data[4]
            )));
        }

        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&data[5..13]);
        let applied_term = u64::from_be_bytes(u64buf);
        u64buf.copy_from_slice(&data[13..21]);
        let applied_index = u64::from_be_bytes(u64buf);

        let mut u32buf = [0u8; 4];
        u32buf.copy_from_slice(&data[21..25]);
        let meta_len = u32::from_be_bytes(u32buf) as usize;
        if data.len() < HEADER_LEN + meta_len {
            return Err(StoreError::Encoding(
                "snapshot metadata section truncated".to_string(),
            ));
        }

        let node_meta = bincode::deserialize(&data[HEADER_LEN..HEADER_LEN + meta_len])
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let db_bytes = data[HEADER_LEN + meta_len..].to_vec();

        Ok(Self {
            applied_term,
            applied_index,
            node_meta,
            db_bytes,
        })
    }
}

/// A captured snapshot, consumable once via [`StoreSnapshot::persist`].
pub struct StoreSnapshot {
    term: u64,
    index: u64,
    data: Vec<u8>,
}

impl StoreSnapshot {
    pub(crate) fn new(term: u64, index: u64, data: Vec<u8>) -> Self {
        Self { term, index, data }
    }

    /// Applied log index this snapshot covers.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Writes the encoded stream to `sink`, consuming the snapshot.
    pub fn persist<W: Write>(self, sink: &mut W) -> Result<()> {
        sink.write_all(&self.data)?;
        Ok(())
    }
}

/// Periodically checks whether enough log has accumulated since the last
/// snapshot and asks the consensus engine to compact.
pub(crate) struct SnapshotScheduler {
    raft: RaftCore,
    threshold: u64,
    last_snapshot_index: Arc<AtomicU64>,
}

impl SnapshotScheduler {
    pub(crate) fn new(
        raft: RaftCore,
        threshold: u64,
        last_snapshot_index: Arc<AtomicU64>,
    ) -> Self {
        Self {
            raft,
            threshold,
            last_snapshot_index,
        }
    }

    pub(crate) async fn tick_once(&self) -> Result<()> {
        if self.threshold == 0 {
            return Ok(());
        }
        let metrics = self.raft.metrics().borrow().clone();
        let applied = metrics.last_applied.map_or(0, |l| l.index);
        let uncompacted = applied.saturating_sub(self.last_snapshot_index.load(Ordering::SeqCst));
        if uncompacted < self.threshold {
            return Ok(());
        }
        debug!(applied, uncompacted, "snapshot threshold reached");
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| StoreError::Consensus(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(e) = self.tick_once().await {
                    warn!(error = %e, "snapshot check failed");
                }
            }
        })
    }
}
