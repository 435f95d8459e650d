//! Core type definitions for confidential auction clearing.
//!
//! This crate provides the shared data structures used across the clearing
//! system: ciphertext handles, the auction phase machine, decryption request
//! identifiers and the plaintext values an oracle may hand back.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

// =========================
// ACCOUNTS
// =========================

/// Generic address type (32 bytes)
pub type Address = [u8; 32];

/// Identifier of an outstanding decryption request
pub type RequestId = [u8; 32];

// =========================
// CIPHERTEXTS
// =========================

/// Opaque reference to a value held by the FHE coprocessor.
///
/// Contract code never sees the plaintext behind a handle; it can only feed
/// the handle into homomorphic operations or ask the oracle to decrypt it.
#[serde_as]
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct Handle(#[serde_as(as = "Hex")] pub [u8; 32]);

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Plaintext type carried behind a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum FheType {
    Bool,
    Uint64,
}

/// Encrypted 64-bit unsigned integer.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct EncryptedU64(pub Handle);

/// Encrypted boolean.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct EncryptedBool(pub Handle);

impl EncryptedU64 {
    pub fn handle(&self) -> Handle {
        self.0
    }
}

impl EncryptedBool {
    pub fn handle(&self) -> Handle {
        self.0
    }
}

/// A ciphertext uploaded by a user, not yet accepted by any contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct EncryptedInput {
    pub handle: Handle,
}

/// Proof binding an [`EncryptedInput`] to the contract and user it was
/// produced for.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct InputProof {
    #[serde_as(as = "Hex")]
    pub tag: [u8; 32],
}

/// A decrypted value as returned by the oracle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum PlaintextValue {
    Bool(bool),
    Uint64(u64),
}

impl PlaintextValue {
    pub fn fhe_type(&self) -> FheType {
        match self {
            PlaintextValue::Bool(_) => FheType::Bool,
            PlaintextValue::Uint64(_) => FheType::Uint64,
        }
    }
}

// =========================
// AUCTION LIFECYCLE
// =========================

/// Auction clearing phase.
///
/// Phases only ever move forward in declaration order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum Phase {
    /// Accepting bids until `end_time`
    Bidding,
    /// Bidding window elapsed, demand not yet compared to supply
    Closed,
    /// Waiting for the oracle to reveal whether demand exceeds supply
    AwaitingDemandDecryption,
    /// Running rank-and-clear batches
    Ranking,
    /// Waiting for the oracle to reveal the settlement price
    AwaitingSettlementDecryption,
    /// Allocating quantities and refunds in batches
    Allocating,
    /// Every bid allocated
    Finalized,
}

/// Rank-and-clear strategy selected once per auction.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ClearingPath {
    /// Demand within supply: every valid bid is filled at the lowest valid price
    MinPrice,
    /// Demand over supply: rank through the oblivious sorting network
    #[default]
    SortingNetwork,
    /// Demand over supply: pairwise cumulative demand, no sorting
    CumulativeDemand,
}

/// Which engine field a decryption request resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum DecryptionTarget {
    DemandExceedsSupply,
    SettlementPrice,
}

impl DecryptionTarget {
    /// Plaintext type the oracle must return for this target.
    pub fn expected_type(&self) -> FheType {
        match self {
            DecryptionTarget::DemandExceedsSupply => FheType::Bool,
            DecryptionTarget::SettlementPrice => FheType::Uint64,
        }
    }
}

// =========================
// HELPER FUNCTIONS
// =========================

/// Derive a decryption request identifier from the requester, the handle and
/// a per-oracle nonce.
pub fn compute_request_id(requester: &Address, handle: &Handle, nonce: u64) -> RequestId {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"DECRYPTION_REQUEST_V1:");
    hasher.update(requester);
    hasher.update(handle.0);
    hasher.update(nonce.to_le_bytes());
    hasher.finalize().into()
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}
