//! Transfer scheduling and dispatch core.
//!
//! A periodic service discovers link queues with pending work, applies VO
//! share weights, and fans the admitted queues out across parallel dispatch
//! workers. Each worker fetches its slice's ready transfers, interleaves
//! them fairly across VOs, and launches bounded numbers of external
//! worker processes through the executor pool.

mod executor;
mod handler;
mod pool;
mod proxy;
mod service;
mod shares;

pub use executor::{ExecutorContext, FileTransferExecutor, UrlCopyCommand};
pub use handler::TransferFileHandler;
pub use pool::ExecutorPool;
pub use proxy::ProxyCache;
pub use service::{IdentityShuffler, QueueShuffler, ThreadRngShuffler, TransfersService};
pub use shares::{apply_vo_shares, ShareAllocation};

/// Error used to unwind a dispatch pass when shutdown has been requested.
/// Not a failure: no file marking happens on this path.
#[derive(Debug, thiserror::Error)]
#[error("interruption requested")]
pub struct Interrupted;
