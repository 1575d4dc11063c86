use crate::data::Error;
use crate::engine::{AuctionParams, Config, Policy, PropShareParams, SlotParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// `count` participants running `policy`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub policy: Policy,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub piece_count: usize,
    /// Template for every participant. `upload_capacity` is drawn per participant from
    /// `[min_upload_capacity, max_upload_capacity]`.
    pub engine: Config,
    pub max_rounds: usize,
    pub seed: u64,
    /// Number of participants that start with the complete content.
    pub seeds: usize,
    pub seed_upload_capacity: usize,
    pub groups: Vec<GroupConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            piece_count: 32,
            engine: Config {
                blocks_per_piece: 16,
                upload_capacity: 32,
                max_requests_per_neighbor: 4,
                min_upload_capacity: 16,
                max_upload_capacity: 48,
            },
            max_rounds: 1000,
            seed: 0,
            seeds: 2,
            seed_upload_capacity: 48,
            groups: [
                Policy::Static,
                Policy::PropShare(PropShareParams::default()),
                Policy::Slots(SlotParams::default()),
                Policy::Auction(AuctionParams::default()),
            ]
            .into_iter()
            .map(|policy| GroupConfig { policy, count: 2 })
            .collect(),
        }
    }
}

impl SimConfig {
    pub fn load(filepath: impl AsRef<Path>) -> Result<Self, Error> {
        let file = fs::File::open(filepath)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, filepath: impl AsRef<Path>) -> Result<(), Error> {
        let file = fs::File::create(filepath)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.piece_count == 0 {
            return Err(Error::InvalidConfig("zero pieces"));
        }
        self.engine.validate()?;
        for group in &self.groups {
            group.policy.validate()?;
        }
        Ok(())
    }

    pub fn participant_count(&self) -> usize {
        self.seeds + self.groups.iter().map(|group| group.count).sum::<usize>()
    }
}
