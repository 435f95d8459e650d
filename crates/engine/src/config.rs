//! Construction parameters for a clearing engine instance.
//!
//! A registry creates each engine from a [`ClearingConfig`]. Parameters the
//! registry leaves out fall back to [`DefaultClearingParams`].

use borsh::{BorshDeserialize, BorshSerialize};
use clearing_types::{Address, ClearingPath};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

/// Configuration of one auction.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct ClearingConfig {
    /// Account allowed to drive ranking and allocation and to collect proceeds
    #[serde_as(as = "Hex")]
    pub owner: Address,

    /// Ledger account of the auction itself (escrow and asset holder)
    #[serde_as(as = "Hex")]
    pub engine_address: Address,

    /// Only account allowed to deliver decryption results
    #[serde_as(as = "Hex")]
    pub oracle: Address,

    /// Token being sold
    #[serde_as(as = "Hex")]
    pub asset_token: Address,

    /// Token bids are paid in
    #[serde_as(as = "Hex")]
    pub payment_token: Address,

    pub total_supply: u64,

    pub start_time: u64,

    #[serde(default = "defaults::bidding_duration")]
    pub bidding_duration: u64,

    #[serde(default)]
    pub min_price: u64,

    #[serde(default)]
    pub min_quantity: u64,

    #[serde(default = "defaults::max_bids_per_address")]
    pub max_bids_per_address: u32,

    /// Bond escrowed with every bid, forfeited by invalid bids
    #[serde(default = "defaults::penalty_fee")]
    pub penalty_fee: u64,

    /// Ranking strategy used when demand exceeds supply
    #[serde(default = "defaults::over_demand_path")]
    pub over_demand_path: ClearingPath,
}

/// Default parameters for new auctions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefaultClearingParams {
    pub bidding_duration: u64,
    pub max_bids_per_address: u32,
    pub penalty_fee: u64,
    pub over_demand_path: ClearingPath,
}

impl Default for DefaultClearingParams {
    fn default() -> Self {
        Self {
            bidding_duration: 3600, // 1 hour
            max_bids_per_address: 2,
            penalty_fee: 50,
            over_demand_path: ClearingPath::SortingNetwork,
        }
    }
}

mod defaults {
    use super::DefaultClearingParams;
    use clearing_types::ClearingPath;

    pub fn bidding_duration() -> u64 {
        DefaultClearingParams::default().bidding_duration
    }

    pub fn max_bids_per_address() -> u32 {
        DefaultClearingParams::default().max_bids_per_address
    }

    pub fn penalty_fee() -> u64 {
        DefaultClearingParams::default().penalty_fee
    }

    pub fn over_demand_path() -> ClearingPath {
        DefaultClearingParams::default().over_demand_path
    }
}

impl ClearingConfig {
    /// Create a config with default timing, caps and fees.
    pub fn new(
        owner: Address,
        engine_address: Address,
        oracle: Address,
        asset_token: Address,
        payment_token: Address,
        total_supply: u64,
        start_time: u64,
    ) -> Self {
        let defaults = DefaultClearingParams::default();
        Self {
            owner,
            engine_address,
            oracle,
            asset_token,
            payment_token,
            total_supply,
            start_time,
            bidding_duration: defaults.bidding_duration,
            min_price: 0,
            min_quantity: 0,
            max_bids_per_address: defaults.max_bids_per_address,
            penalty_fee: defaults.penalty_fee,
            over_demand_path: defaults.over_demand_path,
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigValidationError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigValidationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// First timestamp at which bids are rejected.
    pub fn end_time(&self) -> u64 {
        self.start_time.saturating_add(self.bidding_duration)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.total_supply == 0 {
            return Err(ConfigValidationError::ZeroSupply);
        }
        // Demand is summed with saturation and must still compare above supply
        if self.total_supply == u64::MAX {
            return Err(ConfigValidationError::SupplyTooLarge);
        }
        if self.bidding_duration == 0 {
            return Err(ConfigValidationError::ZeroDuration);
        }
        if self.max_bids_per_address == 0 {
            return Err(ConfigValidationError::ZeroBidCap);
        }

        // Roles must be distinct accounts
        let roles = [
            ("owner", self.owner),
            ("engine", self.engine_address),
            ("oracle", self.oracle),
        ];
        for (i, (name_a, a)) in roles.iter().enumerate() {
            for (name_b, b) in &roles[i + 1..] {
                if a == b {
                    return Err(ConfigValidationError::AddressCollision(format!(
                        "{} and {} share address {}",
                        name_a,
                        name_b,
                        hex::encode(a)
                    )));
                }
            }
        }

        if self.over_demand_path == ClearingPath::MinPrice {
            return Err(ConfigValidationError::InvalidOverDemandPath);
        }

        Ok(())
    }
}

/// Errors that can occur during config validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Total supply cannot be zero")]
    ZeroSupply,

    #[error("Total supply must be below u64::MAX")]
    SupplyTooLarge,

    #[error("Bidding duration cannot be zero")]
    ZeroDuration,

    #[error("Max bids per address cannot be zero")]
    ZeroBidCap,

    #[error("Address collision: {0}")]
    AddressCollision(String),

    #[error("Min-price clearing cannot serve over-demand")]
    InvalidOverDemandPath,

    #[error("Malformed config: {0}")]
    Parse(String),
}
