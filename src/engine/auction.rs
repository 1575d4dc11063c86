use super::{AuctionParams, Config, RoundContext, UploadAllocator, grant, requested_blocks};
use crate::data::{Error, PeerId, UploadGrant};
use rand::{Rng, RngCore};
use std::collections::{BTreeMap, BTreeSet};

/// What we know about one neighbor. Created with [`NeighborEstimate::new`] the first time the
/// neighbor shows up, never read before that.
#[derive(Clone, Debug, PartialEq)]
struct NeighborEstimate {
    /// Blocks per round we expect to get from it (`d`).
    received: f64,
    /// Blocks per round we think we must send to be reciprocated (`u`).
    price: f64,
    /// Consecutive periods it uploaded to us.
    periods_reciprocated: usize,
    efficiency: f64,
    reputation: RunningMean,
}

impl NeighborEstimate {
    fn new(default_received: f64, default_price: f64) -> Self {
        Self {
            received: default_received,
            price: default_price,
            periods_reciprocated: 0,
            efficiency: 0.0,
            reputation: Default::default(),
        }
    }

    /// What we actually upload when unchoking this neighbor.
    fn bid(&self) -> usize {
        (self.price.floor() as usize).max(1)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
struct RunningMean {
    mean: f64,
    samples: usize,
}

impl RunningMean {
    fn update(&mut self, value: f64) {
        self.samples += 1;
        self.mean += (value - self.mean) / self.samples as f64;
    }
}

/// Sells upload capacity to the neighbors with the best ratio of blocks received to blocks
/// needed to keep them reciprocating. Prices adapt every period: cheaper for those who kept
/// uploading to us, more expensive for those who didn't.
pub struct ReputationAuctionAllocator {
    self_id: PeerId,
    upload_capacity: usize,
    blocks_per_piece: usize,
    max_upload_capacity: usize,
    params: AuctionParams,
    default_received: f64,
    default_price: f64,
    estimates: BTreeMap<PeerId, NeighborEstimate>,
    unchoked: BTreeSet<PeerId>,
}

impl ReputationAuctionAllocator {
    pub fn new(self_id: PeerId, config: &Config, params: AuctionParams) -> Result<Self, Error> {
        config.validate()?;
        params.validate()?;
        let expected_capacity =
            (config.min_upload_capacity + config.max_upload_capacity) as f64 / 2.0;
        let slots = params.initial_slots as f64;
        Ok(Self {
            self_id,
            upload_capacity: config.upload_capacity,
            blocks_per_piece: config.blocks_per_piece,
            max_upload_capacity: config.max_upload_capacity,
            default_received: expected_capacity / slots,
            default_price: config.upload_capacity as f64 / slots,
            params,
            estimates: Default::default(),
            unchoked: Default::default(),
        })
    }

    /// Current upload price of `peer`, or the default one if we haven't met it yet.
    pub fn price(&self, peer: &PeerId) -> f64 {
        self.estimates.get(peer).map_or(self.default_price, |e| e.price)
    }

    /// Mean blocks per round `peer` uploaded to us since we first saw it.
    pub fn reputation(&self, peer: &PeerId) -> Option<f64> {
        self.estimates
            .get(peer)
            .filter(|e| e.reputation.samples > 0)
            .map(|e| e.reputation.mean)
    }

    pub fn is_unchoked(&self, peer: &PeerId) -> bool {
        self.unchoked.contains(peer)
    }

    fn estimate_mut(&mut self, peer: &PeerId) -> &mut NeighborEstimate {
        let (received, price) = (self.default_received, self.default_price);
        self.estimates
            .entry(peer.clone())
            .or_insert_with(|| NeighborEstimate::new(received, price))
    }

    fn update_estimates(
        &mut self,
        ctx: &RoundContext<'_>,
    ) -> Result<BTreeMap<PeerId, usize>, Error> {
        let Some(prev_round) = ctx.round.checked_sub(1) else {
            return Ok(BTreeMap::new());
        };
        let received = ctx.history.blocks_received(prev_round..ctx.round, &self.self_id)?;
        for neighbor in ctx.neighbors {
            let blocks = received.get(&neighbor.id).copied().unwrap_or(0);
            self.estimate_mut(&neighbor.id).reputation.update(blocks as f64);
        }
        for (peer, &blocks) in &received {
            if blocks > 0 {
                self.estimate_mut(peer).received = blocks as f64;
            }
        }
        Ok(received)
    }

    fn adjust_prices(&mut self, received: &BTreeMap<PeerId, usize>) {
        let reciprocated = |peer: &PeerId| received.get(peer).is_some_and(|blocks| *blocks > 0);

        for (peer, estimate) in &mut self.estimates {
            if reciprocated(peer) {
                estimate.periods_reciprocated += 1;
            } else {
                estimate.periods_reciprocated = 0;
            }
        }
        for peer in &self.unchoked {
            let Some(estimate) = self.estimates.get_mut(peer) else {
                continue;
            };
            let old_price = estimate.price;
            if reciprocated(peer) {
                if estimate.periods_reciprocated >= self.params.reciprocation_periods {
                    estimate.price *= 1.0 - self.params.price_decrease;
                }
            } else {
                estimate.price = (estimate.price * (1.0 + self.params.price_increase))
                    .min(self.max_upload_capacity as f64);
            }
            log::debug!(
                "{}: price of {peer} {old_price:.2} -> {:.2}",
                self.self_id,
                estimate.price
            );
        }
    }

    fn recompute_efficiency(&mut self, rng: &mut dyn RngCore) {
        // small enough not to reorder distinct ratios
        let max_noise = 1.0 / (self.max_upload_capacity.max(1) as f64).powi(2);
        for estimate in self.estimates.values_mut() {
            estimate.efficiency = estimate.received / estimate.bid() as f64
                + rng.random_range(0.0..max_noise);
        }
    }
}

impl UploadAllocator for ReputationAuctionAllocator {
    fn allocate(
        &mut self,
        ctx: &RoundContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<UploadGrant>, Error> {
        let demand = requested_blocks(&self.self_id, ctx.requests, self.blocks_per_piece)?;
        let received = self.update_estimates(ctx)?;
        for requester in demand.keys() {
            self.estimate_mut(requester);
        }

        let period_start = ctx.round % self.params.period == 0;
        if period_start {
            self.adjust_prices(&received);
            self.recompute_efficiency(rng);
            self.unchoked.clear();
        }

        let mut grants = Vec::new();
        let mut remaining_capacity = self.upload_capacity;
        for peer in self.unchoked.iter().filter(|peer| demand.contains_key(*peer)) {
            let bid = self.estimates.get(peer).map_or(1, NeighborEstimate::bid);
            if bid <= remaining_capacity {
                remaining_capacity -= bid;
                grants.push(grant(&self.self_id, peer, bid));
            }
        }

        if period_start {
            let mut candidates = demand
                .keys()
                .filter(|peer| !self.unchoked.contains(*peer))
                .filter_map(|peer| self.estimates.get(peer).map(|e| (peer, e.efficiency, e.bid())))
                .collect::<Vec<_>>();
            candidates.sort_by(|(_, lhs, _), (_, rhs, _)| rhs.total_cmp(lhs));

            for (peer, _, bid) in candidates {
                if bid > remaining_capacity {
                    break;
                }
                remaining_capacity -= bid;
                grants.push(grant(&self.self_id, peer, bid));
                self.unchoked.insert(peer.clone());
            }
            log::debug!("{}: round {} unchoked {:?}", self.self_id, ctx.round, self.unchoked);
        }
        Ok(grants)
    }
}
