use shared::domain::LocalKey;
use thiserror::Error;

/// Failures raised while merging into the canonical sequence.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The pending entry a confirmation was meant to replace is gone,
    /// usually because a realtime delete raced the send. Non-fatal.
    #[error("no pending message with local key {local_key}")]
    PendingNotFound { local_key: LocalKey },
}

/// Engine-level error taxonomy. Nothing here is fatal to the process and
/// nothing is retried; retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was used before activation, after deactivation, or with
    /// inputs that cannot produce an active conversation.
    #[error("conversation engine is not usable: {0}")]
    InvalidState(&'static str),
    /// A fetch collaborator reported a transport or server error.
    #[error("failed to fetch from collaborator")]
    FetchFailed(#[source] anyhow::Error),
    /// The send collaborator reported a transport or server error. The
    /// optimistic entry stays in the sequence, still delivering.
    #[error("failed to send message")]
    SendFailed(#[source] anyhow::Error),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}
