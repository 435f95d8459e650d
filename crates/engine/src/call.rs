//! Call message types for the clearing engine.

use borsh::{BorshDeserialize, BorshSerialize};
use clearing_types::{EncryptedInput, InputProof, PlaintextValue, RequestId};

/// Call messages for the clearing engine.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ClearingCall {
    // === Bidding ===
    /// Submit an encrypted bid. The proof must bind both inputs to the
    /// engine and the sender.
    SubmitBid {
        price: EncryptedInput,
        quantity: EncryptedInput,
        proof: InputProof,
    },

    // === Clearing (owner only) ===
    /// Compare demand to supply once bidding has closed.
    CloseBidding,

    /// Run up to `batch_size` rank-and-clear steps.
    AdvanceRanking { batch_size: u32 },

    /// Allocate up to `batch_size` bids.
    Allocate { batch_size: u32 },

    // === Payouts ===
    /// Receive the allocated asset.
    Claim,

    /// Receive the escrow refund. Requires a prior claim.
    Withdraw,

    /// Collect proceeds, penalties and unsold supply (owner only).
    OwnerWithdraw,

    // === Oracle ===
    /// Deliver a decryption result (oracle only).
    OnDecryptionResult {
        request_id: RequestId,
        value: PlaintextValue,
    },
}

/// Result of a successful call.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum CallOutcome {
    /// Bid stored at `index`.
    BidAccepted { index: u32 },

    /// Demand comparison sent to the oracle.
    DemandRequested { request_id: RequestId },

    /// Ranking progress after the batch. `settlement_request` is set by the
    /// batch that completed ranking.
    RankingAdvanced {
        cursor: u64,
        total_steps: u64,
        settlement_request: Option<RequestId>,
    },

    /// Allocation progress after the batch.
    Allocated { cursor: u64, finalized: bool },

    /// Bids of the sender marked claimed.
    Claimed { bids: u32 },

    /// Bids of the sender marked withdrawn.
    Withdrawn { bids: u32 },

    OwnerWithdrawn,

    /// `applied` is false for a replayed result.
    DecryptionApplied { applied: bool },
}
