use super::{Bitfield, Error, NeighborView, PeerId};
use std::collections::{BTreeMap, BTreeSet};

/// Rarity index built from one round's neighbor snapshot: how many neighbors advertise each
/// piece, and which pieces fall into each owner count.
pub struct PieceAvailability {
    piece_index_to_owner_count: BTreeMap<usize, usize>,
    owner_count_to_piece_indices: BTreeMap<usize, BTreeSet<usize>>,
}

impl PieceAvailability {
    pub fn new(piece_count: usize) -> Self {
        let indices = (0..piece_count).collect::<BTreeSet<usize>>();
        Self {
            piece_index_to_owner_count: indices.iter().map(|index| (*index, 0)).collect(),
            owner_count_to_piece_indices: BTreeMap::from([(0usize, indices)]),
        }
    }

    pub fn from_neighbors(piece_count: usize, neighbors: &[NeighborView]) -> Result<Self, Error> {
        let mut seen = BTreeSet::<&PeerId>::new();
        let mut availability = Self::new(piece_count);
        for neighbor in neighbors {
            if !seen.insert(&neighbor.id) {
                return Err(Error::DuplicateNeighbor(neighbor.id.clone()));
            }
            neighbor.validate(piece_count)?;
            availability.add_bitfield_record(&neighbor.available_pieces);
        }
        Ok(availability)
    }

    pub fn add_single_record(&mut self, piece_index: usize) -> bool {
        if self.piece_index_to_owner_count.contains_key(&piece_index) {
            self.change_owner_count_for_piece(piece_index, |prev_count| prev_count + 1);
            true
        } else {
            false
        }
    }

    pub fn add_bitfield_record(&mut self, bitfield: &Bitfield) {
        for piece_index in bitfield.iter_ones() {
            self.add_single_record(piece_index);
        }
    }

    /// Stop tracking a piece, e.g. because it is already complete.
    pub fn forget_piece(&mut self, piece_index: usize) {
        if let Some(owner_count) = self.piece_index_to_owner_count.remove(&piece_index) {
            if let Some(indices) = self.owner_count_to_piece_indices.get_mut(&owner_count) {
                indices.remove(&piece_index);
                if indices.is_empty() {
                    self.owner_count_to_piece_indices.remove(&owner_count);
                }
            }
        }
    }

    pub fn owner_count(&self, piece_index: usize) -> Option<usize> {
        self.piece_index_to_owner_count.get(&piece_index).copied()
    }

    /// Tracked pieces grouped by owner count, rarest first. Includes the bucket of pieces no
    /// neighbor has.
    pub fn buckets(&self) -> impl Iterator<Item = (usize, &BTreeSet<usize>)> + '_ {
        self.owner_count_to_piece_indices.iter().map(|(count, indices)| (*count, indices))
    }

    pub fn pieces_rarest_first(&self) -> impl Iterator<Item = usize> + '_ {
        self.owner_count_to_piece_indices
            .iter()
            .skip_while(|(count, _indices)| **count == 0usize)
            .flat_map(|(_count, indices)| indices.iter().copied())
    }

    fn change_owner_count_for_piece<F>(&mut self, piece_index: usize, op: F)
    where
        F: FnOnce(usize) -> usize,
    {
        if let Some(current_owner_count) = self.piece_index_to_owner_count.get_mut(&piece_index) {
            if let Some(indices) = self.owner_count_to_piece_indices.get_mut(current_owner_count) {
                indices.remove(&piece_index);
                if indices.is_empty() {
                    self.owner_count_to_piece_indices.remove(current_owner_count);
                }
            }
            let new_owner_count = op(*current_owner_count);
            *current_owner_count = new_owner_count;
            self.owner_count_to_piece_indices
                .entry(new_owner_count)
                .or_default()
                .insert(piece_index);
        }
    }
}
