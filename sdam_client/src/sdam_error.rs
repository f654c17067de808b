use crate::{error_chain_fmt, ServerAddress};

/// Server error codes meaning "this server is no longer (or not yet) primary".
const NOT_MASTER_CODES: [i32; 3] = [10107, 13435, 10058];
/// Server error codes meaning "this server is recovering or shutting down".
const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const SHUTDOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_CODES: [i32; 13] = [
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436, 10058,
];

#[derive(thiserror::Error, Clone)]
pub enum SdamError {
    #[error("Server selection timed out after {timeout_ms} ms")]
    ServerSelectionTimeout {
        timeout_ms: u64,
        /// The last error recorded against any server in the topology.
        topology_error: Option<String>,
    },
    #[error("Topology is closed, please connect")]
    TopologyClosed,
    #[error("{0}")]
    Compatibility(String),
    #[error("Invalid read preference: {0}")]
    InvalidReadPreference(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Network error talking to {address}: {message}")]
    Network {
        address: ServerAddress,
        message: String,
    },
    #[error("Operation against {address} timed out after {timeout_ms} ms")]
    Timeout {
        address: ServerAddress,
        timeout_ms: u64,
    },
    #[error("Command failed with code {code} ({code_name}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
    },
    #[error("{0}")]
    UnexpectedError(String),
}

impl SdamError {
    pub fn network(address: &ServerAddress, message: impl Into<String>) -> Self {
        Self::Network {
            address: address.clone(),
            message: message.into(),
        }
    }

    /// Builds a [`SdamError::Command`] from a server reply with a falsy `ok`.
    pub fn from_error_reply(reply: &serde_json::Value) -> Self {
        Self::Command {
            code: reply
                .get("code")
                .and_then(|c| c.as_i64())
                .unwrap_or_default() as i32,
            code_name: reply
                .get("codeName")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string(),
            message: reply
                .get("errmsg")
                .and_then(|c| c.as_str())
                .unwrap_or("command failed")
                .to_string(),
        }
    }

    /// Network errors and timeouts both mean the connection can no longer be trusted.
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    pub fn is_not_master(&self) -> bool {
        match self {
            Self::Command { code, message, .. } => {
                NOT_MASTER_CODES.contains(code)
                    || (!self.is_recovering() && message.contains("not master"))
            }
            _ => false,
        }
    }

    pub fn is_recovering(&self) -> bool {
        match self {
            Self::Command { code, message, .. } => {
                RECOVERING_CODES.contains(code)
                    || message.contains("not master or secondary")
                    || message.contains("node is recovering")
            }
            _ => false,
        }
    }

    /// A "not master" or "node is recovering" error: the server's role changed
    /// and its description can no longer be trusted.
    pub fn is_state_change_error(&self) -> bool {
        self.is_not_master() || self.is_recovering()
    }

    pub fn is_node_shutting_down(&self) -> bool {
        matches!(self, Self::Command { code, .. } if SHUTDOWN_CODES.contains(code))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Command { code, .. } => {
                RETRYABLE_CODES.contains(code) || self.is_state_change_error()
            }
            _ => false,
        }
    }
}

impl From<anyhow::Error> for SdamError {
    fn from(e: anyhow::Error) -> Self {
        Self::UnexpectedError(format!("{:#}", e))
    }
}

impl std::fmt::Debug for SdamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
