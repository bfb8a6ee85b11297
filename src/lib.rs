#![doc = include_str!("../README.md")]

/// Per-release check orchestration
pub mod check;
/// Environment-backed configuration
pub mod config;
/// Decision thresholds, verdicts and host edits
pub mod decision;
mod error;
/// Single-instance lock file
pub mod lock;
/// NZB descriptor parsing and probe sampling
pub mod nzb;
/// Per-provider session pool
pub mod pool;
/// Multi-provider availability prober
pub mod prober;
/// News-server providers and filtering
pub mod providers;
/// Candidate selection and host pause orchestration
pub mod queue;
/// Host-visible stdout reporting
pub mod report;
/// Invocation routing and the scan hook
pub mod router;
/// Host RPC adapter (XML-RPC and JSON-RPC)
pub mod rpc;
/// NNTP probe session and state machine
pub mod session;

pub use check::{ReleaseCandidate, ReleaseChecker};
pub use config::{Config, DupeMode, Options, Tuning};
pub use decision::{DecisionEngine, Verdict, decide, release_threshold};
pub use error::{CompletionError, DescriptorError, Result};
pub use lock::{LockDisposition, LockFile, LockOutcome};
pub use nzb::{ArticleCounts, NzbArticle, ProbeSet};
pub use pool::{ProviderReport, SessionPool};
pub use prober::AvailabilityProber;
pub use providers::{Provider, filter_providers};
pub use report::Reporter;
pub use router::InvocationMode;
pub use rpc::{HostClient, HostStatus, QueueEntry, QueuedFile};
pub use session::{ProbeSession, ReplyEvent, SessionState};
