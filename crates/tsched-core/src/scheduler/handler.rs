//! Per-VO round-robin cursor over one dispatch pass's ready transfers.
//!
//! Sweeping the VO snapshot with one `get` per VO, and repeating until the
//! handler is empty, visits every file exactly once and interleaves VOs
//! fairly: no VO is served twice in a sweep while another non-empty VO is
//! still waiting.

use std::collections::VecDeque;

use crate::transfer::{TransferFile, VoQueueMap};

pub struct TransferFileHandler {
    queues: VoQueueMap,
    remaining: usize,
}

impl TransferFileHandler {
    pub fn new(queues: VoQueueMap) -> Self {
        let remaining = queues.values().map(VecDeque::len).sum();
        TransferFileHandler { queues, remaining }
    }

    /// Files not yet handed out, across all VOs.
    pub fn size(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Snapshot of the VOs still holding unconsumed files, in stable
    /// order. Recompute once per sweep; VOs drained mid-sweep simply
    /// yield nothing from `get`.
    pub fn vos(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(vo, _)| vo.clone())
            .collect()
    }

    /// Next file for this VO, preserving per-VO input order. `None` means
    /// the VO has nothing available right now; that is a normal outcome.
    pub fn get(&mut self, vo: &str) -> Option<TransferFile> {
        let file = self.queues.get_mut(vo)?.pop_front();
        if file.is_some() {
            self.remaining -= 1;
        }
        file
    }

    /// Drains every remaining file of `job_id` from this VO's queue, so a
    /// session-reuse or multihop job rides a single worker invocation.
    pub fn take_job_siblings(&mut self, vo: &str, job_id: &str) -> Vec<TransferFile> {
        let Some(files) = self.queues.get_mut(vo) else {
            return Vec::new();
        };
        let mut siblings = Vec::new();
        let mut kept = VecDeque::with_capacity(files.len());
        for file in files.drain(..) {
            if file.job_id == job_id {
                siblings.push(file);
            } else {
                kept.push_back(file);
            }
        }
        *files = kept;
        self.remaining -= siblings.len();
        siblings
    }
}
