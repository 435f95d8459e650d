//! Confidential Uniform-Price Auction Clearing Engine
//!
//! This crate implements a sealed-bid, uniform-price auction whose bids stay
//! encrypted from submission to payout:
//!
//! 1. **Bidding**: bidders submit an encrypted price and quantity and escrow
//!    `price × quantity + penalty_fee` in the payment token. Bids under the
//!    minimum price or quantity are accepted but marked invalid under
//!    encryption.
//! 2. **Demand**: after the bidding window the owner compares total valid
//!    demand to supply. The comparison is the first value the oracle decrypts.
//! 3. **Ranking**: demand within supply clears at the lowest valid price.
//!    Demand over supply ranks bids by price through an oblivious sorting
//!    network (or pairwise cumulative demand) and finds the marginal bid. The
//!    owner drives this work in batches.
//! 4. **Allocation**: once the oracle reveals the settlement price, every bid
//!    is allocated its quantity, charged at that price and assigned a refund.
//! 5. **Payout**: bidders claim their asset then withdraw their refund; the
//!    owner collects proceeds, forfeited escrow and unsold supply.
//!
//! All work over encrypted values runs the same operations whatever the bid
//! contents are.

pub mod call;
pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod queries;
pub mod settlement;
pub mod state;
pub mod strategy;
pub mod token;

pub use call::{CallOutcome, ClearingCall};
pub use config::{ClearingConfig, ConfigValidationError, DefaultClearingParams};
pub use engine::ClearingEngine;
pub use error::{ClearingError, ErrorKind};
pub use handlers::{CallContext, Env, HandlerResult};
pub use queries::{BidView, ClearingQuery, ClearingQueryResponse, Progress, QueryContext};
pub use state::{Bid, ClearingState};
pub use strategy::{strategy_for, RankAndClear};
pub use token::{ConfidentialLedger, InMemoryLedger, LedgerError, Transfer};
