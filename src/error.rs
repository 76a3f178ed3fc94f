use thiserror::Error;

/// Error taxonomy for the reparent coordinator (spec §7).
///
/// Mirrors the flat, one-variant-per-kind shape the rest of this codebase
/// uses for its error enums: a short `{0}` message per variant rather than
/// structured fields, so call sites stay terse.
#[derive(Error, Debug)]
pub enum ErsError {
    #[error("malformed replication position: {0}")]
    Parse(String),

    #[error("replication positions use incompatible flavors: {0}")]
    FlavorMismatch(String),

    #[error("unknown durability policy: {0}")]
    Configuration(String),

    #[error("tablet {0} claims to be primary")]
    NotReplica(String),

    #[error("shard lock lost: {0}")]
    LockLost(String),

    #[error("no primary elected: candidate positions diverge")]
    SplitBrain,

    #[error("cannot establish durability for candidate {0}: insufficient eligible acknowledgers")]
    CannotEstablish(String),

    #[error("explicit candidate {alias} is ineligible: {reason}")]
    ExplicitCandidateIneligible { alias: String, reason: String },

    #[error("failed to write reparent journal on new primary {0}: {1}")]
    JournalWrite(String, String),

    #[error("could not read reparent journal term counter from tablet {0}: {1}")]
    JournalUnreadable(String, String),

    #[error("tablet {0} has a zero/uninitialized replication position")]
    ZeroPosition(String),

    #[error("relay logs did not apply on any candidate before the timeout")]
    RelayLogsDidNotApply,

    #[error("intermediate promotion failed: {0}")]
    IntermediatePromotionFailed(String),

    #[error("all surviving replicas failed to reparent")]
    AllReplicasFailed,

    #[error("stop-replication failed on a majority of tablets: {0}")]
    StopReplicationFailed(String),

    #[error("expected primary {expected} but shard record has {actual}")]
    ExpectedPrimaryMismatch { expected: String, actual: String },

    #[error("no eligible candidate for promotion")]
    NoCandidates,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("tablet manager RPC {rpc} on {tablet} failed: {source}")]
    RpcFailed {
        rpc: &'static str,
        tablet: String,
        source: String,
    },

    #[error("shard {keyspace}/{shard} not found in topology store")]
    NoNode { keyspace: String, shard: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ErsError {
    fn from(e: serde_json::Error) -> Self {
        ErsError::Internal(format!("serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ErsError>;
