//! Wait-for graph and the buffer of recently detected deadlocks.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;

use super::TransactionId;

/// One transaction on a deadlock path and the key it was waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    pub txn_id: TransactionId,
    pub column_family_id: u32,
    pub exclusive: bool,
    pub waiting_key: Bytes,
}

/// A detected wait cycle, listed from the transaction that started the
/// cycle to the one whose request closed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlockPath {
    pub path: Vec<DeadlockInfo>,
    /// The search gave up at the depth limit; `path` is empty.
    pub limit_exceeded: bool,
    /// Seconds since the Unix epoch.
    pub deadlock_time: u64,
}

impl DeadlockPath {
    pub fn new(path: Vec<DeadlockInfo>, deadlock_time: u64) -> Self {
        Self {
            path,
            limit_exceeded: false,
            deadlock_time,
        }
    }

    pub fn limit_exceeded(deadlock_time: u64) -> Self {
        Self {
            path: Vec::new(),
            limit_exceeded: true,
            deadlock_time,
        }
    }

    /// An unused buffer slot.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && !self.limit_exceeded
    }
}

#[derive(Debug, Default)]
struct PathsBuffer {
    paths: Vec<DeadlockPath>,
    /// Slot of the next write.
    idx: usize,
}

impl PathsBuffer {
    /// Paths oldest first, without unused slots.
    fn normalize(&self) -> Vec<DeadlockPath> {
        let mut working = self.paths.clone();
        if working.is_empty() {
            return working;
        }
        if self.paths[self.idx].is_empty() {
            working.truncate(self.idx);
        } else {
            working.rotate_left(self.idx);
        }
        working
    }
}

/// Ring buffer of the most recent deadlocks.
#[derive(Debug)]
pub struct DeadlockInfoBuffer {
    inner: Mutex<PathsBuffer>,
}

impl DeadlockInfoBuffer {
    pub fn new(n_latest_dlocks: usize) -> Self {
        Self {
            inner: Mutex::new(PathsBuffer {
                paths: vec![DeadlockPath::default(); n_latest_dlocks],
                idx: 0,
            }),
        }
    }

    /// Record a path, overwriting the oldest one when full. A zero-sized
    /// buffer records nothing.
    pub fn add_new_path(&self, path: DeadlockPath) {
        let mut inner = self.inner.lock();
        if inner.paths.is_empty() {
            return;
        }
        let idx = inner.idx;
        inner.paths[idx] = path;
        inner.idx = (idx + 1) % inner.paths.len();
    }

    /// Change the number of retained paths, keeping the newest.
    pub fn resize(&self, target_size: usize) {
        let mut inner = self.inner.lock();
        let mut paths = inner.normalize();
        if target_size < paths.len() {
            paths.drain(..paths.len() - target_size);
            inner.idx = 0;
        } else {
            let prev_size = paths.len();
            paths.resize(target_size, DeadlockPath::default());
            inner.idx = if target_size == 0 { 0 } else { prev_size % target_size };
        }
        inner.paths = paths;
    }

    /// Recorded paths, newest first.
    pub fn prepare_buffer(&self) -> Vec<DeadlockPath> {
        let mut working = self.inner.lock().normalize();
        working.reverse();
        working
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().paths.len()
    }
}

#[derive(Debug, Clone)]
struct TrackedTxnInfo {
    neighbors: Vec<TransactionId>,
    column_family_id: u32,
    exclusive: bool,
    waiting_key: Bytes,
}

/// Who waits on whom.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
    /// waiter -> waitees
    wait_txn_map: HashMap<TransactionId, TrackedTxnInfo>,
    /// waitee -> number of waiters
    rev_wait_txn_map: HashMap<TransactionId, usize>,
}

/// Request about to block, as seen by deadlock detection.
pub(crate) struct WaitRequest<'a> {
    pub txn_id: TransactionId,
    pub wait_ids: &'a [TransactionId],
    pub column_family_id: u32,
    pub key: &'a Bytes,
    pub exclusive: bool,
    pub depth: usize,
}

impl WaitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the edges of `req` and look for a cycle back to the requester.
    ///
    /// Returns true if one was found or the search ran out of depth. The
    /// path is recorded in `buffer` and the edges are removed again.
    pub fn increment_waiters(&mut self, req: &WaitRequest<'_>, buffer: &DeadlockInfoBuffer) -> bool {
        let id = req.txn_id;
        self.wait_txn_map.insert(
            id,
            TrackedTxnInfo {
                neighbors: req.wait_ids.to_vec(),
                column_family_id: req.column_family_id,
                exclusive: req.exclusive,
                waiting_key: req.key.clone(),
            },
        );
        for wait_id in req.wait_ids {
            *self.rev_wait_txn_map.entry(*wait_id).or_insert(0) += 1;
        }

        // No cycle can pass through a transaction nobody waits on.
        if !self.rev_wait_txn_map.contains_key(&id) {
            return false;
        }

        // The queues grow on demand; `depth` only bounds how far they go.
        let depth = req.depth;
        let mut queue_values: Vec<TransactionId> = Vec::new();
        let mut queue_parents: Vec<Option<usize>> = Vec::new();
        let mut next_ids: Option<Vec<TransactionId>> = Some(req.wait_ids.to_vec());
        let mut parent: Option<usize> = None;

        for head in 0..depth {
            if let Some(ids) = next_ids.take() {
                let room = depth - queue_values.len();
                for next in ids.into_iter().take(room) {
                    queue_values.push(next);
                    queue_parents.push(parent);
                }
            }

            if queue_values.len() == head {
                return false;
            }

            let next = queue_values[head];
            if next == id {
                let mut path = Vec::new();
                let mut cursor = Some(head);
                while let Some(pos) = cursor {
                    let txn_id = queue_values[pos];
                    if let Some(info) = self.wait_txn_map.get(&txn_id) {
                        path.push(DeadlockInfo {
                            txn_id,
                            column_family_id: info.column_family_id,
                            exclusive: info.exclusive,
                            waiting_key: info.waiting_key.clone(),
                        });
                    }
                    cursor = queue_parents[pos];
                }
                path.reverse();
                tracing::warn!(txn_id = id, path_len = path.len(), "deadlock detected");
                buffer.add_new_path(DeadlockPath::new(path, now_secs()));
                self.decrement_waiters(id, req.wait_ids);
                return true;
            }

            match self.wait_txn_map.get(&next) {
                Some(info) => {
                    parent = Some(head);
                    next_ids = Some(info.neighbors.clone());
                }
                None => next_ids = None,
            }
        }

        tracing::warn!(txn_id = id, depth, "deadlock detection depth exceeded");
        buffer.add_new_path(DeadlockPath::limit_exceeded(now_secs()));
        self.decrement_waiters(id, req.wait_ids);
        true
    }

    /// Remove the edges added for `txn_id`.
    pub fn decrement_waiters(&mut self, txn_id: TransactionId, wait_ids: &[TransactionId]) {
        self.wait_txn_map.remove(&txn_id);
        for wait_id in wait_ids {
            if let Some(count) = self.rev_wait_txn_map.get_mut(wait_id) {
                *count -= 1;
                if *count == 0 {
                    self.rev_wait_txn_map.remove(wait_id);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn is_waiting(&self, txn_id: TransactionId) -> bool {
        self.wait_txn_map.contains_key(&txn_id)
    }

    #[cfg(test)]
    pub fn num_waiters(&self) -> usize {
        self.wait_txn_map.len()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
