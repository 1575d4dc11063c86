use super::{
    ProportionalShareAllocator, ReputationAuctionAllocator, SlotAllocator, StaticSplitAllocator,
    UploadAllocator,
};
use crate::data::{Error, PeerId};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Per-participant inputs shared by the request selector and every allocator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub blocks_per_piece: usize,
    /// Blocks per round this participant can upload.
    pub upload_capacity: usize,
    pub max_requests_per_neighbor: usize,
    /// Bounds of upload capacity across the swarm, used to seed reputation defaults.
    pub min_upload_capacity: usize,
    pub max_upload_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocks_per_piece: 32,
            upload_capacity: 40,
            max_requests_per_neighbor: 4,
            min_upload_capacity: 16,
            max_upload_capacity: 64,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.blocks_per_piece == 0 {
            Err(Error::InvalidConfig("zero blocks per piece"))
        } else if self.min_upload_capacity > self.max_upload_capacity {
            Err(Error::InvalidConfig("min upload capacity above max"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropShareParams {
    /// Share of capacity split in proportion to last round's receipts. The rest goes to one
    /// requester that sent nothing.
    pub reserved_fraction: f64,
}

impl PropShareParams {
    pub fn validate(&self) -> Result<(), Error> {
        if (0.0..=1.0).contains(&self.reserved_fraction) {
            Ok(())
        } else {
            Err(Error::InvalidConfig("reserved fraction outside [0, 1]"))
        }
    }
}

impl Default for PropShareParams {
    fn default() -> Self {
        Self {
            reserved_fraction: 0.9,
        }
    }
}

/// How slotted neighbors' demand is measured when splitting bandwidth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandWeighting {
    /// Sum of blocks still missing in every requested piece.
    #[default]
    RemainingBlocks,
    /// Ignore remaining need, split evenly between slots.
    Uniform,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotParams {
    pub max_slots: usize,
    pub reevaluation_period: usize,
    pub optimistic_period: usize,
    /// Number of past rounds summed when ranking neighbors.
    pub history_window: usize,
    pub demand: DemandWeighting,
}

impl SlotParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.reevaluation_period == 0 || self.optimistic_period == 0 {
            Err(Error::InvalidConfig("zero slot period"))
        } else {
            Ok(())
        }
    }
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            max_slots: 3,
            reevaluation_period: 10,
            optimistic_period: 30,
            history_window: 20,
            demand: DemandWeighting::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionParams {
    /// Consecutive reciprocating periods before a neighbor's price is lowered.
    pub reciprocation_periods: usize,
    pub price_decrease: f64,
    pub price_increase: f64,
    pub period: usize,
    /// Number of neighbors the default estimates assume we and they serve at once.
    pub initial_slots: usize,
}

impl AuctionParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.period == 0 || self.initial_slots == 0 {
            Err(Error::InvalidConfig("zero auction period or slots"))
        } else if !(0.0..1.0).contains(&self.price_decrease) || self.price_increase < 0.0 {
            Err(Error::InvalidConfig("price factors out of range"))
        } else {
            Ok(())
        }
    }
}

impl Default for AuctionParams {
    fn default() -> Self {
        Self {
            reciprocation_periods: 1,
            price_decrease: 0.1,
            price_increase: 0.2,
            period: 5,
            initial_slots: 4,
        }
    }
}

/// Upload allocation policy of one participant.
#[derive(Clone, Debug, PartialEq, Display, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    #[display("static")]
    Static,
    #[display("prop_share")]
    PropShare(PropShareParams),
    #[display("slots")]
    Slots(SlotParams),
    #[display("auction")]
    Auction(AuctionParams),
}

impl Policy {
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Policy::Static => Ok(()),
            Policy::PropShare(params) => params.validate(),
            Policy::Slots(params) => params.validate(),
            Policy::Auction(params) => params.validate(),
        }
    }

    /// Create a fresh allocator with its own persistent state.
    pub fn build(
        &self,
        self_id: PeerId,
        config: &Config,
    ) -> Result<Box<dyn UploadAllocator>, Error> {
        config.validate()?;
        let allocator: Box<dyn UploadAllocator> = match self {
            Policy::Static => Box::new(StaticSplitAllocator::new(self_id, config)),
            Policy::PropShare(params) => {
                Box::new(ProportionalShareAllocator::new(self_id, config, params.clone())?)
            }
            Policy::Slots(params) => Box::new(SlotAllocator::new(self_id, config, params.clone())?),
            Policy::Auction(params) => {
                Box::new(ReputationAuctionAllocator::new(self_id, config, params.clone())?)
            }
        };
        Ok(allocator)
    }
}
