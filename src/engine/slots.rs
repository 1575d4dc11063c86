use super::{
    Config, DemandWeighting, RoundContext, SlotParams, UploadAllocator, grant, requested_blocks,
};
use crate::data::{Error, PeerId, UploadGrant};
use rand::seq::IndexedRandom;
use rand::{Rng, RngCore};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Regular,
    Optimistic,
    Choked,
}

/// Classic choke/unchoke: `num_slots - 1` regular slots go to the neighbors that uploaded the
/// most to us recently, one optimistic slot rotates randomly. Bandwidth is then water-filled
/// between slot holders by how much they asked for.
pub struct SlotAllocator {
    self_id: PeerId,
    upload_capacity: usize,
    blocks_per_piece: usize,
    num_slots: usize,
    params: SlotParams,
    regular_slots: BTreeSet<PeerId>,
    optimistic_slot: BTreeSet<PeerId>,
}

impl SlotAllocator {
    pub fn new(self_id: PeerId, config: &Config, params: SlotParams) -> Result<Self, Error> {
        config.validate()?;
        params.validate()?;
        Ok(Self {
            self_id,
            upload_capacity: config.upload_capacity,
            blocks_per_piece: config.blocks_per_piece,
            num_slots: params.max_slots.min(config.upload_capacity),
            params,
            regular_slots: Default::default(),
            optimistic_slot: Default::default(),
        })
    }

    pub fn slot_state(&self, peer: &PeerId) -> SlotState {
        if self.regular_slots.contains(peer) {
            SlotState::Regular
        } else if self.optimistic_slot.contains(peer) {
            SlotState::Optimistic
        } else {
            SlotState::Choked
        }
    }

    fn occupied_slots(&self) -> usize {
        self.regular_slots.len() + self.optimistic_slot.len()
    }

    fn is_slotted(&self, peer: &PeerId) -> bool {
        self.slot_state(peer) != SlotState::Choked
    }

    fn reassign_slots(
        &mut self,
        ctx: &RoundContext<'_>,
        requesters: impl Iterator<Item = PeerId>,
        rng: &mut dyn RngCore,
    ) -> Result<(), Error> {
        if ctx.round % self.params.reevaluation_period == 0 {
            self.regular_slots.clear();
        }
        if ctx.round % self.params.optimistic_period == 0 {
            self.optimistic_slot.clear();
        }

        let window_start = ctx.round.saturating_sub(self.params.history_window);
        let received = ctx.history.blocks_received(window_start..ctx.round, &self.self_id)?;

        // fractional noise breaks ties between equal totals without reordering different ones
        let mut candidates = requesters
            .filter(|peer| !self.is_slotted(peer))
            .map(|peer| {
                let score = received.get(&peer).copied().unwrap_or(0) as f64
                    + rng.random_range(0.0..1.0);
                (peer, score)
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|(_, lhs), (_, rhs)| rhs.total_cmp(lhs));

        let free_regular_slots =
            self.num_slots.saturating_sub(1).saturating_sub(self.regular_slots.len());
        let regular_count = free_regular_slots.min(candidates.len());
        let (best, rest) = candidates.split_at(regular_count);
        self.regular_slots.extend(best.iter().map(|(peer, _)| peer.clone()));

        if self.optimistic_slot.is_empty() && self.occupied_slots() < self.num_slots {
            if let Some((peer, _)) = rest.choose(rng) {
                self.optimistic_slot.insert(peer.clone());
            }
        }
        log::debug!(
            "{}: round {} regular={:?} optimistic={:?}",
            self.self_id,
            ctx.round,
            self.regular_slots,
            self.optimistic_slot
        );
        Ok(())
    }
}

impl UploadAllocator for SlotAllocator {
    fn allocate(
        &mut self,
        ctx: &RoundContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<UploadGrant>, Error> {
        let demand = requested_blocks(&self.self_id, ctx.requests, self.blocks_per_piece)?;

        // free the slots of those who are no longer requesting
        self.regular_slots.retain(|peer| demand.contains_key(peer));
        self.optimistic_slot.retain(|peer| demand.contains_key(peer));

        let reevaluation_round = ctx.round % self.params.reevaluation_period == 0;
        if reevaluation_round || self.occupied_slots() < self.num_slots {
            self.reassign_slots(ctx, demand.keys().cloned(), rng)?;
        }

        let mut unchoked = self
            .regular_slots
            .iter()
            .chain(&self.optimistic_slot)
            .map(|peer| {
                let wanted = match self.params.demand {
                    DemandWeighting::RemainingBlocks => demand.get(peer).copied().unwrap_or(0),
                    DemandWeighting::Uniform => usize::MAX,
                };
                (peer, wanted)
            })
            .collect::<Vec<_>>();
        unchoked.sort_by_key(|(peer, wanted)| (*wanted, *peer));

        // water-filling: whoever wants less than an equal share gets all of it, the rest is
        // split between those who want more
        let mut grants = Vec::with_capacity(unchoked.len());
        let mut remaining_capacity = self.upload_capacity;
        let slot_count = unchoked.len();
        for (i, (peer, wanted)) in unchoked.into_iter().enumerate() {
            if remaining_capacity == 0 {
                break;
            }
            let remaining_slots = slot_count - i;
            let blocks = if wanted.saturating_mul(remaining_slots) <= remaining_capacity {
                wanted
            } else {
                remaining_capacity / remaining_slots
            };
            remaining_capacity -= blocks;
            if blocks > 0 {
                grants.push(grant(&self.self_id, peer, blocks));
            }
        }
        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutils::*;
    use super::*;
    use crate::data::{ExchangeHistory, RequestIntent};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn allocator(capacity: usize, params: SlotParams) -> SlotAllocator {
        let config = Config {
            upload_capacity: capacity,
            blocks_per_piece: 4,
            ..Default::default()
        };
        SlotAllocator::new(id("me"), &config, params).unwrap()
    }

    fn allocate(
        allocator: &mut SlotAllocator,
        round: usize,
        requests: &[RequestIntent],
        history: &ExchangeHistory,
        rng: &mut StdRng,
    ) -> Vec<UploadGrant> {
        allocator
            .allocate(
                &RoundContext {
                    round,
                    requests,
                    neighbors: &[],
                    history,
                },
                rng,
            )
            .unwrap()
    }

    fn in_state<'a>(
        allocator: &SlotAllocator,
        peers: &[&'a str],
        state: SlotState,
    ) -> Vec<&'a str> {
        peers.iter().copied().filter(|p| allocator.slot_state(&id(p)) == state).collect()
    }

    fn regular<'a>(allocator: &SlotAllocator, peers: &[&'a str]) -> Vec<&'a str> {
        in_state(allocator, peers, SlotState::Regular)
    }

    fn optimistic<'a>(allocator: &SlotAllocator, peers: &[&'a str]) -> Vec<&'a str> {
        in_state(allocator, peers, SlotState::Optimistic)
    }

    fn unchoked(allocator: &SlotAllocator, peers: &[&str]) -> Vec<String> {
        peers
            .iter()
            .filter(|p| allocator.slot_state(&id(p)) != SlotState::Choked)
            .map(|p| p.to_string())
            .collect()
    }

    #[test]
    fn test_best_uploaders_get_regular_slots() {
        let mut history = ExchangeHistory::new();
        history.append_round([(id("a"), id("me"), 3), (id("b"), id("me"), 2)]);
        history.append_round([(id("a"), id("me"), 3), (id("c"), id("me"), 4)]);
        let mut allocator = allocator(100, SlotParams::default());
        let requests = requests_from("me", &["a", "b", "c", "d"]);
        let mut rng = StdRng::seed_from_u64(0);

        let grants = allocate(&mut allocator, 2, &requests, &history, &mut rng);

        assert_eq!(SlotState::Regular, allocator.slot_state(&id("a")));
        assert_eq!(SlotState::Regular, allocator.slot_state(&id("c")));
        let optimistic = ["b", "d"]
            .into_iter()
            .filter(|p| allocator.slot_state(&id(p)) == SlotState::Optimistic)
            .count();
        assert_eq!(1, optimistic);
        // everyone asked for one piece of 4 blocks
        assert_eq!(3, grants.len());
        assert!(grants.iter().all(|g| g.blocks == 4), "{grants:?}");
    }

    #[test]
    fn test_water_filling_by_requested_amount() {
        let history = ExchangeHistory::new();
        let mut allocator = allocator(10, SlotParams::default());
        let requests = [
            request("a", "me", 0, 3),
            request("b", "me", 0, 0),
            request("b", "me", 1, 0),
            request("c", "me", 0, 0),
            request("c", "me", 1, 0),
            request("c", "me", 2, 0),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let grants = allocate(&mut allocator, 0, &requests, &history, &mut rng);

        // a wants 1, b wants 8, c wants 12
        assert_eq!(Some(1), blocks_to(&grants, "a"));
        assert_eq!(Some(4), blocks_to(&grants, "b"));
        assert_eq!(Some(5), blocks_to(&grants, "c"));
        assert_eq!(10, total(&grants));
    }

    #[test]
    fn test_uniform_demand_splits_evenly() {
        let history = ExchangeHistory::new();
        let params = SlotParams {
            demand: DemandWeighting::Uniform,
            ..Default::default()
        };
        let mut allocator = allocator(10, params);
        let requests =
            [request("a", "me", 0, 3), request("b", "me", 0, 0), request("c", "me", 0, 0)];
        let mut rng = StdRng::seed_from_u64(1);
        let grants = allocate(&mut allocator, 0, &requests, &history, &mut rng);

        assert_eq!(10, total(&grants));
        assert!(grants.iter().all(|g| g.blocks == 3 || g.blocks == 4), "{grants:?}");
    }

    #[test]
    fn test_slots_bounded_by_capacity() {
        let history = ExchangeHistory::new();
        let mut allocator = allocator(1, SlotParams::default());
        let requests = requests_from("me", &["a", "b", "c"]);
        let mut rng = StdRng::seed_from_u64(4);
        let grants = allocate(&mut allocator, 0, &requests, &history, &mut rng);

        assert_eq!(1, unchoked(&allocator, &["a", "b", "c"]).len());
        assert_eq!(1, grants.len());
        assert_eq!(1, total(&grants));
    }

    #[test]
    fn test_regular_slot_kept_until_reevaluation() {
        let mut history = ExchangeHistory::new();
        history.append_round([(id("a"), id("me"), 10), (id("b"), id("me"), 9)]);
        let mut allocator = allocator(30, SlotParams::default());
        let mut rng = StdRng::seed_from_u64(2);

        let requests = requests_from("me", &["a", "b", "c"]);
        allocate(&mut allocator, 1, &requests, &history, &mut rng);
        assert_eq!(SlotState::Regular, allocator.slot_state(&id("a")));
        assert_eq!(SlotState::Regular, allocator.slot_state(&id("b")));
        assert_eq!(SlotState::Optimistic, allocator.slot_state(&id("c")));

        // d now uploads far more, but a and b hold on to their slots until round 10
        for round in 2..10 {
            history.append_round([(id("d"), id("me"), 50)]);
            let requests = requests_from("me", &["a", "b", "c", "d"]);
            allocate(&mut allocator, round, &requests, &history, &mut rng);
            assert_eq!(SlotState::Regular, allocator.slot_state(&id("a")), "round {round}");
            assert_eq!(SlotState::Regular, allocator.slot_state(&id("b")), "round {round}");
            assert_eq!(SlotState::Choked, allocator.slot_state(&id("d")), "round {round}");
        }

        history.append_round([(id("d"), id("me"), 50)]);
        let requests = requests_from("me", &["a", "b", "c", "d"]);
        allocate(&mut allocator, 10, &requests, &history, &mut rng);
        assert_eq!(SlotState::Regular, allocator.slot_state(&id("d")));
        assert_eq!(SlotState::Regular, allocator.slot_state(&id("a")));
        assert_eq!(SlotState::Optimistic, allocator.slot_state(&id("c")));
    }

    #[test]
    fn test_slot_freed_when_peer_stops_requesting() {
        let mut history = ExchangeHistory::new();
        history.append_round([(id("a"), id("me"), 10), (id("b"), id("me"), 9)]);
        let mut allocator = allocator(30, SlotParams::default());
        let mut rng = StdRng::seed_from_u64(2);

        allocate(&mut allocator, 1, &requests_from("me", &["a", "b", "c"]), &history, &mut rng);
        assert_eq!(SlotState::Regular, allocator.slot_state(&id("a")));

        history.append_round([]);
        let grants =
            allocate(&mut allocator, 2, &requests_from("me", &["b", "c", "d"]), &history, &mut rng);
        assert_eq!(SlotState::Choked, allocator.slot_state(&id("a")));
        assert_eq!(SlotState::Regular, allocator.slot_state(&id("d")));
        assert!(blocks_to(&grants, "a").is_none());
        assert_eq!(3, grants.len());
    }

    #[test]
    fn test_optimistic_slot_rotates_on_its_own_schedule() {
        let mut history = ExchangeHistory::new();
        history.append_round([(id("a"), id("me"), 10), (id("b"), id("me"), 9)]);
        let mut allocator = allocator(30, SlotParams::default());
        let mut rng = StdRng::seed_from_u64(6);
        let peers = ["a", "b", "c", "d", "e", "f"];
        let requests = requests_from("me", &peers);

        allocate(&mut allocator, 1, &requests, &history, &mut rng);
        assert_eq!(vec!["a", "b"], regular(&allocator, &peers));
        let first_optimistic = optimistic(&allocator, &peers);
        assert_eq!(1, first_optimistic.len());
        let first_optimistic = id(first_optimistic[0]);
        let others = ["c", "d", "e", "f"]
            .into_iter()
            .filter(|p| id(p) != first_optimistic)
            .collect::<Vec<_>>();
        let (x, y) = (others[0], others[1]);

        for round in 2..30 {
            let prev_round = round - 1;
            let uploads = match prev_round {
                1..=9 => vec![(id(x), id("me"), 50), (id(y), id("me"), 50)],
                10..=19 => vec![(id("a"), id("me"), 100), (id("b"), id("me"), 100)],
                _ => vec![(first_optimistic.clone(), id("me"), 200)],
            };
            history.append_round(uploads);
            allocate(&mut allocator, round, &requests, &history, &mut rng);

            let state = allocator.slot_state(&first_optimistic);
            assert_eq!(SlotState::Optimistic, state, "round {round}");
            match round {
                10..20 => assert_eq!(vec![x, y], regular(&allocator, &peers), "round {round}"),
                20..30 => assert_eq!(vec!["a", "b"], regular(&allocator, &peers), "round {round}"),
                _ => (),
            }
        }

        // both sets are cleared at round 30, so the top uploader of the window takes a regular
        // slot and the optimistic one goes to someone left over
        history.append_round([(first_optimistic.clone(), id("me"), 200)]);
        allocate(&mut allocator, 30, &requests, &history, &mut rng);

        assert_eq!(SlotState::Regular, allocator.slot_state(&first_optimistic));
        let regular = regular(&allocator, &peers);
        assert_eq!(2, regular.len());
        assert!(regular.contains(&"a") != regular.contains(&"b"), "{regular:?}");
        let new_optimistic = optimistic(&allocator, &peers);
        assert_eq!(1, new_optimistic.len());
        assert!(!regular.contains(&new_optimistic[0]));
    }

    #[test]
    fn test_reject_zero_periods() {
        let params = SlotParams {
            reevaluation_period: 0,
            ..Default::default()
        };
        let result = SlotAllocator::new(id("me"), &Config::default(), params);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let params = SlotParams {
            optimistic_period: 0,
            ..Default::default()
        };
        let result = SlotAllocator::new(id("me"), &Config::default(), params);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_no_requesters_no_grants() {
        let history = ExchangeHistory::new();
        let mut allocator = allocator(10, SlotParams::default());
        let grants = allocate(&mut allocator, 0, &[], &history, &mut StdRng::seed_from_u64(0));
        assert!(grants.is_empty());
    }
}
