use super::split::split_evenly;
use super::{Config, PropShareParams, RoundContext, UploadAllocator, grant, requested_blocks};
use crate::data::{Error, PeerId, UploadGrant};
use rand::RngCore;
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;

/// Give back what you got: capacity is split in proportion to what each requester uploaded to
/// us last round, except for a small optimistic share that goes to one random requester which
/// uploaded nothing.
pub struct ProportionalShareAllocator {
    self_id: PeerId,
    upload_capacity: usize,
    blocks_per_piece: usize,
    params: PropShareParams,
}

impl ProportionalShareAllocator {
    pub fn new(
        self_id: PeerId,
        config: &Config,
        params: PropShareParams,
    ) -> Result<Self, Error> {
        config.validate()?;
        params.validate()?;
        Ok(Self {
            self_id,
            upload_capacity: config.upload_capacity,
            blocks_per_piece: config.blocks_per_piece,
            params,
        })
    }
}

impl UploadAllocator for ProportionalShareAllocator {
    fn allocate(
        &mut self,
        ctx: &RoundContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<UploadGrant>, Error> {
        let demand = requested_blocks(&self.self_id, ctx.requests, self.blocks_per_piece)?;
        if demand.is_empty() {
            return Ok(Vec::new());
        }

        let received = match ctx.round.checked_sub(1) {
            Some(prev_round) => ctx.history.blocks_received(prev_round..ctx.round, &self.self_id)?,
            None => BTreeMap::new(),
        };
        let contributions = demand
            .keys()
            .map(|peer| (peer, received.get(peer).copied().unwrap_or(0)))
            .collect::<Vec<_>>();
        let total_received: usize = contributions.iter().map(|(_, blocks)| blocks).sum();

        if total_received == 0 {
            log::debug!(
                "{}: no reciprocity in round {}, splitting evenly",
                self.self_id,
                ctx.round
            );
            return Ok(split_evenly(
                &self.self_id,
                demand.keys().collect(),
                self.upload_capacity,
                rng,
            ));
        }

        let freeloaders = contributions
            .iter()
            .filter_map(|(peer, blocks)| (*blocks == 0).then_some(*peer))
            .collect::<Vec<_>>();
        let optimistic = freeloaders.choose(rng).copied();
        let fraction = if optimistic.is_some() {
            self.params.reserved_fraction
        } else {
            1.0
        };

        let capacity = self.upload_capacity as f64;
        let proportional_pool = capacity * fraction;
        let mut shares = contributions
            .iter()
            .filter(|(_, blocks)| *blocks > 0)
            .map(|(peer, blocks)| {
                (*peer, proportional_pool * *blocks as f64 / total_received as f64)
            })
            .collect::<Vec<_>>();
        if let Some(peer) = optimistic {
            log::debug!("{}: optimistic share for {peer}", self.self_id);
            shares.push((peer, capacity - proportional_pool));
        }

        Ok(round_shares(&self.self_id, &shares, self.upload_capacity))
    }
}

/// Floor every share, then hand out the integer shortfall one block at a time, largest
/// fractional remainder first.
fn round_shares(self_id: &PeerId, shares: &[(&PeerId, f64)], capacity: usize) -> Vec<UploadGrant> {
    let mut blocks = shares.iter().map(|(_, share)| share.floor() as usize).collect::<Vec<_>>();
    let shortfall = capacity.saturating_sub(blocks.iter().sum());

    let mut by_remainder = (0..shares.len()).collect::<Vec<_>>();
    by_remainder.sort_by(|&lhs, &rhs| {
        let remainder = |i: usize| shares[i].1 - shares[i].1.floor();
        remainder(rhs).total_cmp(&remainder(lhs))
    });
    for i in by_remainder.into_iter().cycle().take(shortfall) {
        blocks[i] += 1;
    }

    shares
        .iter()
        .zip(blocks)
        .filter(|(_, blocks)| *blocks > 0)
        .map(|((peer, _), blocks)| grant(self_id, peer, blocks))
        .collect()
}
