//! Encrypted-integer capability for confidential auction clearing.
//!
//! Contract code manipulates ciphertext handles only. This crate defines the
//! operations it may apply to them and an in-memory coprocessor that backs
//! those operations for local runs and tests.
//!
//! # Overview
//!
//! 1. **Inputs**: a user encrypts a value for a given contract and receives an
//!    [`EncryptedInput`](clearing_types::EncryptedInput) plus an
//!    [`InputProof`](clearing_types::InputProof). The contract accepts the input
//!    only if the proof binds it to itself and to the sender.
//!
//! 2. **Computation**: [`FheOps`] exposes addition, subtraction,
//!    multiplication, comparisons, boolean logic and `select`. There is no way
//!    to branch on an encrypted value; data-dependent choices are expressed by
//!    evaluating both sides and selecting.
//!
//! 3. **Disclosure**: a handle becomes decryptable by the oracle only once the
//!    contract marks it with [`FheOps::allow_for_decryption`]. Individual
//!    accounts can be granted a private view of a handle with
//!    [`FheOps::allow`].

pub mod coprocessor;
pub mod error;
pub mod input;
pub mod ops;

pub use coprocessor::{KeyHolder, MockCoprocessor};
pub use error::FheError;
pub use input::{encrypt_bid, BidInputs};
pub use ops::FheOps;
