//! Clearing engine error types.

use clearing_fhe::FheError;
use clearing_types::{FheType, Phase};
use decryption_gateway::GatewayError;
use sorting_network::NetworkError;
use thiserror::Error;

use crate::config::ConfigValidationError;
use crate::token::LedgerError;

/// Errors that can occur in the clearing engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClearingError {
    // === Timing ===
    #[error("Too early: bidding has not started")]
    BiddingNotStarted,

    #[error("Too late: bidding window has closed")]
    TooLate,

    #[error("Too early: bidding window is still open")]
    TooEarly,

    #[error("Too early: demand has not been compared to supply")]
    DemandNotDecided,

    #[error("Settlement price not yet decrypted")]
    SettlementPriceNotDecrypted,

    #[error("Too early: bids of this account are not allocated yet")]
    AllocationPending,

    #[error("Too early: auction is not finalized")]
    NotFinalized,

    // === Authorization ===
    #[error("Unauthorized account {0}")]
    OwnableUnauthorizedAccount(String),

    #[error("Unauthorized decryption callback from {0}")]
    UnauthorizedOracle(String),

    // === State ===
    #[error("Max bids per address exceeded")]
    MaxBidsExceeded,

    #[error("Invalid phase. Expected: {expected:?}, Got: {got:?}")]
    InvalidPhase { expected: Phase, got: Phase },

    #[error("Demand decryption already requested")]
    DemandAlreadyRequested,

    #[error("Ranking completed")]
    RankingCompleted,

    #[error("Allocation completed")]
    AllocationCompleted,

    #[error("Batch size must be positive")]
    InvalidBatchSize,

    #[error("Bid already claimed or cannot claim")]
    AlreadyClaimed,

    #[error("No bids for account")]
    NoBids,

    #[error("Bid must be claimed before withdraw")]
    NotClaimed,

    #[error("Bid already withdrawn")]
    AlreadyWithdrawn,

    #[error("Owner proceeds already withdrawn")]
    OwnerAlreadyWithdrawn,

    #[error("Unknown decryption request {0}")]
    UnknownDecryptionRequest(String),

    #[error("Bid {0} has not been ranked")]
    BidNotRanked(u32),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),

    // === Dependency ===
    #[error("Ledger transfer failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Encrypted operation failed: {0}")]
    Fhe(#[from] FheError),

    #[error("Decryption oracle failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Sorting network failed: {0}")]
    Network(#[from] NetworkError),

    #[error("Oracle returned {got:?}, expected {expected:?}")]
    PlaintextTypeMismatch { expected: FheType, got: FheType },
}

/// Failure classes, by how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong time; retry later
    Timing,
    /// Caller may never perform this call
    Authorization,
    /// Permanent for this bid or bidder
    State,
    /// A collaborator failed; nothing was committed
    Dependency,
}

impl ClearingError {
    pub fn kind(&self) -> ErrorKind {
        use ClearingError::*;
        match self {
            BiddingNotStarted
            | TooLate
            | TooEarly
            | DemandNotDecided
            | SettlementPriceNotDecrypted
            | AllocationPending
            | NotFinalized => ErrorKind::Timing,

            OwnableUnauthorizedAccount(_)
            | UnauthorizedOracle(_)
            | Fhe(FheError::InvalidInputProof)
            | Fhe(FheError::AccessDenied(_)) => ErrorKind::Authorization,

            MaxBidsExceeded
            | InvalidPhase { .. }
            | DemandAlreadyRequested
            | RankingCompleted
            | AllocationCompleted
            | InvalidBatchSize
            | AlreadyClaimed
            | NoBids
            | NotClaimed
            | AlreadyWithdrawn
            | OwnerAlreadyWithdrawn
            | UnknownDecryptionRequest(_)
            | BidNotRanked(_)
            | Config(_) => ErrorKind::State,

            Ledger(_) | Fhe(_) | Gateway(_) | Network(_) | PlaintextTypeMismatch { .. } => {
                ErrorKind::Dependency
            }
        }
    }

    /// Whether the same call may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timing | ErrorKind::Dependency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ClearingError::TooLate.kind(), ErrorKind::Timing);
        assert_eq!(
            ClearingError::OwnableUnauthorizedAccount("00".into()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(ClearingError::AlreadyClaimed.kind(), ErrorKind::State);
        assert_eq!(
            ClearingError::Ledger(LedgerError::InsufficientAllowance).kind(),
            ErrorKind::Dependency
        );
        assert_eq!(
            ClearingError::Fhe(FheError::InvalidInputProof).kind(),
            ErrorKind::Authorization
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ClearingError::TooEarly.is_retryable());
        assert!(ClearingError::Ledger(LedgerError::InsufficientAllowance).is_retryable());
        assert!(!ClearingError::AllocationCompleted.is_retryable());
        assert!(!ClearingError::OwnableUnauthorizedAccount("00".into()).is_retryable());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ClearingError::NotClaimed.to_string(),
            "Bid must be claimed before withdraw"
        );
        assert_eq!(
            ClearingError::SettlementPriceNotDecrypted.to_string(),
            "Settlement price not yet decrypted"
        );
    }
}
