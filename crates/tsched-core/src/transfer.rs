//! Transfer data model: queues, files, states, share configuration.
//!
//! A queue is a directed (source storage, destination storage) link plus the
//! VO submitting on it; files are the per-transfer records the scheduler
//! selects and hands to external worker processes.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// File identifier inside the transfer database.
pub type FileId = i64;

/// Whether a queue holds plain transfers or session-reuse/multihop jobs,
/// whose files all go to a single worker-process invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Regular,
    Reuse,
}

/// One unit of schedulable work: a (source storage, destination storage)
/// link, the VO submitting on it, and the queue variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub source_se: String,
    pub dest_se: String,
    pub vo_name: String,
    pub kind: QueueKind,
}

impl QueueId {
    /// The undirected link key, shared by every VO submitting on this pair.
    pub fn link(&self) -> (String, String) {
        (self.source_se.clone(), self.dest_se.clone())
    }
}

/// A queue admitted by the share allocator, with the number of ready files
/// the fetch step may pull for it this round.
#[derive(Debug, Clone)]
pub struct ScheduledQueue {
    pub queue: QueueId,
    pub quota: usize,
}

/// One VO share row for a link. Weights are relative between the VOs with
/// pending work on the same link; `"*"` is the catch-all public share.
#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub vo_name: String,
    pub weight: u32,
}

/// Transfer file lifecycle. The scheduler only performs
/// `Submitted -> Ready` (dispatch) and `Submitted -> Failed` (no share,
/// missing credential, launch failure); the worker's status channel owns
/// the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Submitted,
    Ready,
    Active,
    Finished,
    Failed,
    Canceled,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Submitted => "SUBMITTED",
            FileState::Ready => "READY",
            FileState::Active => "ACTIVE",
            FileState::Finished => "FINISHED",
            FileState::Failed => "FAILED",
            FileState::Canceled => "CANCELED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SUBMITTED" => FileState::Submitted,
            "READY" => FileState::Ready,
            "ACTIVE" => FileState::Active,
            "FINISHED" => FileState::Finished,
            "CANCELED" => FileState::Canceled,
            _ => FileState::Failed,
        }
    }
}

/// How the files of a job are handed to worker processes: one process per
/// file, or the whole job bundled into a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Regular,
    Reuse,
    Multihop,
}

impl JobMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JobMode::Regular => "regular",
            JobMode::Reuse => "reuse",
            JobMode::Multihop => "multihop",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "reuse" => JobMode::Reuse,
            "multihop" => JobMode::Multihop,
            _ => JobMode::Regular,
        }
    }

    /// True when every file of the job goes to one worker invocation.
    pub fn is_bundled(self) -> bool {
        matches!(self, JobMode::Reuse | JobMode::Multihop)
    }
}

/// Checksum specification carried opaquely to the worker, serialized as
/// `ALGORITHM:VALUE`. A spec without a colon is algorithm-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: String,
    pub value: String,
}

impl Checksum {
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((algo, value)) => Checksum {
                algorithm: algo.to_string(),
                value: value.to_string(),
            },
            None => Checksum {
                algorithm: spec.to_string(),
                value: String::new(),
            },
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.algorithm)
        } else {
            write!(f, "{}:{}", self.algorithm, self.value)
        }
    }
}

/// One file-level transfer request, read-only for the scheduler.
#[derive(Debug, Clone)]
pub struct TransferFile {
    pub file_id: FileId,
    pub job_id: String,
    pub vo_name: String,
    pub user_dn: String,
    pub cred_id: String,
    pub source_se: String,
    pub dest_se: String,
    pub source_surl: String,
    pub dest_surl: String,
    pub checksum: Option<Checksum>,
    pub user_filesize: u64,
    pub file_metadata: Option<String>,
    pub activity: String,
    pub job_mode: JobMode,
}

/// Per-VO queues of ready transfers for one scheduling pass, built fresh
/// from storage and owned by a single dispatch worker's handler.
pub type VoQueueMap = BTreeMap<String, VecDeque<TransferFile>>;

/// Extracts the storage element (`scheme://host[:port]`) from a SURL.
/// Returns the whole string when it does not look like a URL.
pub fn storage_element_of(surl: &str) -> String {
    let Some(scheme_end) = surl.find("://") else {
        return surl.to_string();
    };
    let rest = &surl[scheme_end + 3..];
    match rest.find('/') {
        Some(path_start) => surl[..scheme_end + 3 + path_start].to_string(),
        None => surl.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_spec_splits_on_colon() {
        let c = Checksum::parse("ADLER32:8a23d4f8");
        assert_eq!(c.algorithm, "ADLER32");
        assert_eq!(c.value, "8a23d4f8");
        assert_eq!(c.to_string(), "ADLER32:8a23d4f8");
    }

    #[test]
    fn checksum_spec_without_colon_is_algorithm_only() {
        let c = Checksum::parse("MD5");
        assert_eq!(c.algorithm, "MD5");
        assert!(c.value.is_empty());
        assert_eq!(c.to_string(), "MD5");
    }

    #[test]
    fn file_state_roundtrip() {
        for state in [
            FileState::Submitted,
            FileState::Ready,
            FileState::Active,
            FileState::Finished,
            FileState::Failed,
            FileState::Canceled,
        ] {
            assert_eq!(FileState::from_str(state.as_str()), state);
        }
        // Unknown states collapse to Failed rather than panicking.
        assert_eq!(FileState::from_str("BOGUS"), FileState::Failed);
    }

    #[test]
    fn storage_element_extraction() {
        assert_eq!(
            storage_element_of("gsiftp://se01.example.org:2811/data/f1"),
            "gsiftp://se01.example.org:2811"
        );
        assert_eq!(
            storage_element_of("srm://storage.cern.ch/pnfs/file"),
            "srm://storage.cern.ch"
        );
        assert_eq!(storage_element_of("not-a-url"), "not-a-url");
        assert_eq!(
            storage_element_of("root://xrd.site.edu"),
            "root://xrd.site.edu"
        );
    }
}
