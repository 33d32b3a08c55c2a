use std::fmt;

pub type QuizResult<T> = Result<T, QuizError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuizError {
    /// A form field is missing or out of range. Raised before any network call.
    Validation(String),
    /// No wallet connected, or the connected wallet is not allowed to do this.
    UnauthorizedWallet,
    /// The quiz store rejected the request. The message is shown as-is.
    Api(String),
    AlreadyJoined,
    QuizNotOpen { finished: bool },
    NotFoundOnChain(String),
    /// A transaction reverted or was never mined.
    ChainTransaction(String),
    /// The requested transition is not allowed from the current state.
    InvalidState(&'static str),
    ClaimInProgress,
    AlreadyClaimed { tx_hash: String },
}

impl QuizError {
    /// Whether the user can meaningfully try the same action again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            QuizError::Api(_) | QuizError::NotFoundOnChain(_) | QuizError::ChainTransaction(_)
        )
    }
}

impl fmt::Display for QuizError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuizError::Validation(msg) => write!(f, "{}", msg),
            QuizError::UnauthorizedWallet => write!(f, "Please connect your wallet first."),
            QuizError::Api(msg) => write!(f, "{}", msg),
            QuizError::AlreadyJoined => write!(f, "This wallet has already joined the quiz."),
            QuizError::QuizNotOpen { finished: true } => write!(f, "Quiz has ended."),
            QuizError::QuizNotOpen { finished: false } => write!(f, "Quiz hasn't started yet."),
            QuizError::NotFoundOnChain(quiz_id) => {
                write!(f, "Quiz {} was not found in the escrow contract.", quiz_id)
            }
            QuizError::ChainTransaction(reason) => write!(f, "Transaction failed: {}", reason),
            QuizError::InvalidState(what) => write!(f, "Not allowed right now: {}", what),
            QuizError::ClaimInProgress => write!(f, "A reward claim is already being processed."),
            QuizError::AlreadyClaimed { tx_hash } => {
                write!(f, "Reward was already claimed in transaction {}.", tx_hash)
            }
        }
    }
}

impl std::error::Error for QuizError {}

impl From<reqwest::Error> for QuizError {
    fn from(err: reqwest::Error) -> Self {
        QuizError::Api(format!("request failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retriable() {
        assert!(QuizError::Api("timeout".to_string()).is_retriable());
        assert!(QuizError::ChainTransaction("nonce too low".to_string()).is_retriable());
        assert!(!QuizError::UnauthorizedWallet.is_retriable());
        assert!(!QuizError::AlreadyJoined.is_retriable());
        assert!(!QuizError::Validation("All fields are required".to_string()).is_retriable());
    }
}
