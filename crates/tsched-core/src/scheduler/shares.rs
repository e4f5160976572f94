//! VO share allocation: which discovered queues may be dispatched this
//! round, and how many ready files each may contribute.
//!
//! Weights are relative between the VOs with pending work on the same
//! link. Admission happens here; proportional throughput follows from the
//! per-queue fetch quota computed here plus the handler's round-robin.

use std::collections::HashMap;

use crate::transfer::{QueueId, ScheduledQueue, ShareConfig};

/// Result of one allocation round.
#[derive(Debug, Default)]
pub struct ShareAllocation {
    pub schedulable: Vec<ScheduledQueue>,
    pub unschedulable: Vec<QueueId>,
}

/// Applies the configured VO shares to the discovered queues.
///
/// Rules, per link:
/// - no share rows at all: every VO is admitted with equal weight;
/// - rows present: a VO is admitted with its own row's weight, else the
///   `"*"` public row's weight, else `default_share_weight` if set;
///   otherwise the queue is unschedulable;
/// - a zero weight bars the VO explicitly.
///
/// Each admitted queue's quota splits `fetch_batch_size` by its weight
/// relative to the total weight of admitted queues on the same link, with
/// a floor of one so an admitted VO is never starved outright.
///
/// Input order is preserved in `schedulable`, so the caller's shuffle
/// carries through to the fan-out partition.
pub fn apply_vo_shares(
    queues: Vec<QueueId>,
    link_shares: &HashMap<(String, String), Vec<ShareConfig>>,
    fetch_batch_size: usize,
    default_share_weight: Option<u32>,
) -> ShareAllocation {
    // First pass: admission and raw weight per queue.
    let mut weights: Vec<Option<u32>> = Vec::with_capacity(queues.len());
    for queue in &queues {
        let rows = link_shares.get(&queue.link()).map(Vec::as_slice).unwrap_or(&[]);
        let weight = if rows.is_empty() {
            Some(1)
        } else {
            rows.iter()
                .find(|row| row.vo_name == queue.vo_name)
                .or_else(|| rows.iter().find(|row| row.vo_name == "*"))
                .map(|row| row.weight)
                .or(default_share_weight)
        };
        weights.push(weight.filter(|w| *w > 0));
    }

    // Total admitted weight per link, counting only VOs with pending work.
    let mut link_totals: HashMap<(String, String), u64> = HashMap::new();
    for (queue, weight) in queues.iter().zip(&weights) {
        if let Some(w) = weight {
            *link_totals.entry(queue.link()).or_insert(0) += u64::from(*w);
        }
    }

    let mut allocation = ShareAllocation::default();
    for (queue, weight) in queues.into_iter().zip(weights) {
        match weight {
            Some(w) => {
                let total = link_totals.get(&queue.link()).copied().unwrap_or(1).max(1);
                let quota = (fetch_batch_size as u64 * u64::from(w) + total / 2) / total;
                allocation.schedulable.push(ScheduledQueue {
                    queue,
                    quota: (quota as usize).max(1),
                });
            }
            None => allocation.unschedulable.push(queue),
        }
    }
    allocation
}
