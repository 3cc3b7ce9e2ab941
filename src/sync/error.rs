use crate::domain::StageId;

/// Failure of a single request/response command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("server rejected command ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode server response: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("unknown card: {0}")]
    UnknownCard(String),

    #[error("unknown stage: {0}")]
    UnknownStage(StageId),

    #[error("card {0} is busy, retry once the pending change settles")]
    CardBusy(String),

    #[error("no move is awaiting confirmation for card {0}")]
    NoPendingConfirmation(String),

    #[error("command failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("board fetch failed: {0}")]
    BoardFetch(String),
}
