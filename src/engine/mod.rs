use crate::data::{Error, ExchangeHistory, NeighborView, PeerId, RequestIntent, UploadGrant};
use rand::RngCore;
use std::collections::BTreeMap;

mod auction;
mod config;
mod propshare;
mod requests;
mod slots;
mod split;

pub use auction::ReputationAuctionAllocator;
pub use config::{AuctionParams, Config, DemandWeighting, Policy, PropShareParams, SlotParams};
pub use propshare::ProportionalShareAllocator;
pub use requests::RequestSelector;
pub use slots::{SlotAllocator, SlotState};
pub use split::{StaticSplitAllocator, even_split};

/// Everything an allocator may look at during one round.
pub struct RoundContext<'a> {
    pub round: usize,
    /// Requests addressed to this participant during `round`.
    pub requests: &'a [RequestIntent],
    pub neighbors: &'a [NeighborView],
    pub history: &'a ExchangeHistory,
}

/// Divides a participant's upload capacity between the neighbors that requested data from it.
/// Each instance owns the persistent state of exactly one participant.
pub trait UploadAllocator: Send {
    /// The sum of granted blocks never exceeds the configured upload capacity. Randomness is
    /// drawn from `rng` only.
    fn allocate(
        &mut self,
        ctx: &RoundContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<UploadGrant>, Error>;
}

/// Blocks still missing in every piece each requester asked for, keyed by requester. A request
/// for a piece the requester already completed is malformed.
fn requested_blocks(
    self_id: &PeerId,
    requests: &[RequestIntent],
    blocks_per_piece: usize,
) -> Result<BTreeMap<PeerId, usize>, Error> {
    let mut demand = BTreeMap::<PeerId, usize>::new();
    for request in requests {
        if &request.provider != self_id {
            return Err(Error::MisaddressedRequest {
                provider: request.provider.clone(),
                receiver: self_id.clone(),
            });
        }
        if request.start_block >= blocks_per_piece {
            return Err(Error::StartBlockOutOfRange {
                piece: request.piece_index,
                start_block: request.start_block,
                blocks_per_piece,
            });
        }
        *demand.entry(request.requester.clone()).or_default() +=
            blocks_per_piece - request.start_block;
    }
    Ok(demand)
}

fn grant(from: &PeerId, to: &PeerId, blocks: usize) -> UploadGrant {
    UploadGrant {
        from: from.clone(),
        to: to.clone(),
        blocks,
    }
}
