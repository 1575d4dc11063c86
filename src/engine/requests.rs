use crate::data::{Error, NeighborView, PeerId, PieceAvailability, PieceProgress, RequestIntent};
use rand::RngCore;
use rand::seq::IndexedRandom;

/// Rarest-first piece selection. Pieces that fewer neighbors advertise are requested first;
/// between equally rare pieces the choice is random so that participants don't all chase the
/// same ones.
pub struct RequestSelector {
    self_id: PeerId,
    max_requests_per_neighbor: usize,
}

impl RequestSelector {
    pub fn new(self_id: PeerId, max_requests_per_neighbor: usize) -> Self {
        Self {
            self_id,
            max_requests_per_neighbor,
        }
    }

    pub fn select(
        &self,
        progress: &PieceProgress,
        neighbors: &[NeighborView],
        rng: &mut dyn RngCore,
    ) -> Result<Vec<RequestIntent>, Error> {
        let mut availability =
            PieceAvailability::from_neighbors(progress.piece_count(), neighbors)?;
        for piece in progress.completed_pieces().iter_ones() {
            availability.forget_piece(piece);
        }

        let mut requests = Vec::new();
        for neighbor in neighbors {
            let mut remaining_requests = self.max_requests_per_neighbor;
            for (_owner_count, pieces) in availability.buckets().filter(|(count, _)| *count > 0) {
                if remaining_requests == 0 {
                    break;
                }
                let candidates = pieces
                    .iter()
                    .copied()
                    .filter(|piece| neighbor.has_piece(*piece))
                    .collect::<Vec<_>>();
                for &piece_index in candidates.choose_multiple(rng, remaining_requests) {
                    let start_block =
                        progress.blocks_owned(piece_index).ok_or(Error::PieceOutOfRange {
                            piece: piece_index,
                            piece_count: progress.piece_count(),
                        })?;
                    let request = RequestIntent {
                        requester: self.self_id.clone(),
                        provider: neighbor.id.clone(),
                        piece_index,
                        start_block,
                    };
                    log::trace!("{request}");
                    requests.push(request);
                    remaining_requests -= 1;
                }
            }
        }
        Ok(requests)
    }
}
