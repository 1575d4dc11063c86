use super::{Config, RoundContext, UploadAllocator, grant, requested_blocks};
use crate::data::{Error, PeerId, UploadGrant};
use rand::RngCore;
use rand::seq::SliceRandom;

/// Split `capacity` into `parts` shares that differ by at most one, larger shares first.
pub fn even_split(capacity: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let (share, remainder) = (capacity / parts, capacity % parts);
    (0..parts).map(|i| share + usize::from(i < remainder)).collect()
}

/// Even split between `recipients` in random order, so the remainder doesn't always favor
/// the same neighbors.
pub(super) fn split_evenly(
    self_id: &PeerId,
    mut recipients: Vec<&PeerId>,
    capacity: usize,
    rng: &mut dyn RngCore,
) -> Vec<UploadGrant> {
    recipients.shuffle(rng);
    let shares = even_split(capacity, recipients.len());
    recipients
        .into_iter()
        .zip(shares)
        .filter(|(_, blocks)| *blocks > 0)
        .map(|(to, blocks)| grant(self_id, to, blocks))
        .collect()
}

/// Every requester gets the same share regardless of history. Used by seeders and as the
/// bootstrap policy when no reciprocity data exists yet.
pub struct StaticSplitAllocator {
    self_id: PeerId,
    upload_capacity: usize,
    blocks_per_piece: usize,
}

impl StaticSplitAllocator {
    pub fn new(self_id: PeerId, config: &Config) -> Self {
        Self {
            self_id,
            upload_capacity: config.upload_capacity,
            blocks_per_piece: config.blocks_per_piece,
        }
    }
}

impl UploadAllocator for StaticSplitAllocator {
    fn allocate(
        &mut self,
        ctx: &RoundContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<UploadGrant>, Error> {
        let demand = requested_blocks(&self.self_id, ctx.requests, self.blocks_per_piece)?;
        Ok(split_evenly(&self.self_id, demand.keys().collect(), self.upload_capacity, rng))
    }
}
