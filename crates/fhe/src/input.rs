//! Client-side helpers for preparing encrypted bids.

use clearing_types::{Address, EncryptedInput, InputProof};

use crate::coprocessor::MockCoprocessor;

/// Encrypted price and quantity for a single bid, with the proof covering both.
#[derive(Clone, Debug)]
pub struct BidInputs {
    pub price: EncryptedInput,
    pub quantity: EncryptedInput,
    pub proof: InputProof,
}

/// Encrypt a bid's price and quantity for submission by `bidder` to `contract`.
pub fn encrypt_bid(
    coprocessor: &MockCoprocessor,
    contract: &Address,
    bidder: &Address,
    price: u64,
    quantity: u64,
) -> BidInputs {
    let (inputs, proof) = coprocessor.encrypt_inputs(&[price, quantity], contract, bidder);
    BidInputs {
        price: inputs[0],
        quantity: inputs[1],
        proof,
    }
}

impl BidInputs {
    /// Inputs in the order the proof commits to them.
    pub fn as_inputs(&self) -> [EncryptedInput; 2] {
        [self.price, self.quantity]
    }
}
