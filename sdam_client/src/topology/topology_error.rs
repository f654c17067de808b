use crate::error_chain_fmt;

#[derive(thiserror::Error)]
pub enum TopologyError {
    #[error("No hosts were supplied and a topology can't exist without at least one")]
    MissingHostsError,
    #[error("Invalid host `{host}`: {reason}")]
    InvalidHostError { host: String, reason: String },
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl std::fmt::Debug for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
