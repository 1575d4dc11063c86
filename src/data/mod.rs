use bitvec::prelude::*;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

mod availability;
mod history;

pub use availability::PieceAvailability;
pub use history::ExchangeHistory;

/// Set of piece indices, one bit per piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Common error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("piece {piece} out of range (piece count {piece_count})")]
    PieceOutOfRange { piece: usize, piece_count: usize },
    #[error("progress {blocks} on piece {piece} exceeds {blocks_per_piece} blocks per piece")]
    ProgressOutOfRange {
        piece: usize,
        blocks: usize,
        blocks_per_piece: usize,
    },
    #[error("start block {start_block} on piece {piece} exceeds {blocks_per_piece} blocks per piece")]
    StartBlockOutOfRange {
        piece: usize,
        start_block: usize,
        blocks_per_piece: usize,
    },
    #[error("duplicate neighbor {0}")]
    DuplicateNeighbor(PeerId),
    #[error("request for {provider} handed to {receiver}")]
    MisaddressedRequest { provider: PeerId, receiver: PeerId },
    #[error("round {requested} is not in the past (current round {current})")]
    FutureRound { requested: usize, current: usize },
    #[error("invalid config ({0})")]
    InvalidConfig(&'static str),
    #[error("{provider} granted {granted} blocks with capacity {capacity}")]
    CapacityExceeded {
        provider: PeerId,
        granted: usize,
        capacity: usize,
    },
    #[error("{provider} granted upload to {recipient} who didn't request it")]
    UnrequestedGrant { provider: PeerId, recipient: PeerId },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Identifier of a swarm participant.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId(value.to_owned())
    }
}

/// Per-piece count of blocks owned by a participant. Blocks within a piece are always
/// acquired in order, so the count is also the index of the next block needed.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PieceProgress {
    blocks: Vec<usize>,
    blocks_per_piece: usize,
}

impl PieceProgress {
    pub fn new(piece_count: usize, blocks_per_piece: usize) -> Self {
        Self {
            blocks: vec![0; piece_count],
            blocks_per_piece,
        }
    }

    pub fn complete(piece_count: usize, blocks_per_piece: usize) -> Self {
        Self {
            blocks: vec![blocks_per_piece; piece_count],
            blocks_per_piece,
        }
    }

    pub fn from_blocks(blocks: Vec<usize>, blocks_per_piece: usize) -> Result<Self, Error> {
        if blocks_per_piece == 0 {
            return Err(Error::InvalidConfig("zero blocks per piece"));
        }
        if let Some((piece, &count)) =
            blocks.iter().enumerate().find(|(_, count)| **count > blocks_per_piece)
        {
            return Err(Error::ProgressOutOfRange {
                piece,
                blocks: count,
                blocks_per_piece,
            });
        }
        Ok(Self {
            blocks,
            blocks_per_piece,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks_per_piece(&self) -> usize {
        self.blocks_per_piece
    }

    pub fn blocks_owned(&self, piece: usize) -> Option<usize> {
        self.blocks.get(piece).copied()
    }

    pub fn is_piece_complete(&self, piece: usize) -> bool {
        self.blocks.get(piece).is_some_and(|count| *count >= self.blocks_per_piece)
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|count| *count >= self.blocks_per_piece)
    }

    pub fn needed_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(piece, count)| (*count < self.blocks_per_piece).then_some(piece))
    }

    pub fn completed_pieces(&self) -> Bitfield {
        self.blocks.iter().map(|count| *count >= self.blocks_per_piece).collect()
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.iter().sum()
    }

    /// Append up to `count` blocks to `piece`, returns how many were actually added.
    pub fn add_blocks(&mut self, piece: usize, count: usize) -> Result<usize, Error> {
        let piece_count = self.blocks.len();
        let owned = self
            .blocks
            .get_mut(piece)
            .ok_or(Error::PieceOutOfRange { piece, piece_count })?;
        let added = count.min(self.blocks_per_piece - *owned);
        *owned += added;
        Ok(added)
    }
}

/// Snapshot of the pieces a neighbor currently advertises.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NeighborView {
    pub id: PeerId,
    pub available_pieces: Bitfield,
}

impl NeighborView {
    pub fn new(id: PeerId, available_pieces: Bitfield) -> Self {
        Self {
            id,
            available_pieces,
        }
    }

    pub fn from_pieces(
        id: PeerId,
        piece_count: usize,
        pieces: impl IntoIterator<Item = usize>,
    ) -> Result<Self, Error> {
        let mut available_pieces = Bitfield::repeat(false, piece_count);
        for piece in pieces {
            if piece >= piece_count {
                return Err(Error::PieceOutOfRange { piece, piece_count });
            }
            available_pieces.set(piece, true);
        }
        Ok(Self {
            id,
            available_pieces,
        })
    }

    pub fn has_piece(&self, piece: usize) -> bool {
        self.available_pieces.get(piece).is_some_and(|bit| *bit)
    }

    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.available_pieces.iter_ones()
    }

    pub(crate) fn validate(&self, piece_count: usize) -> Result<(), Error> {
        match self.pieces().find(|piece| *piece >= piece_count) {
            Some(piece) => Err(Error::PieceOutOfRange { piece, piece_count }),
            None => Ok(()),
        }
    }
}

/// Ask `provider` for the blocks of `piece_index` starting at `start_block`.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("{requester}->{provider} ind={piece_index} start={start_block}")]
pub struct RequestIntent {
    pub requester: PeerId,
    pub provider: PeerId,
    pub piece_index: usize,
    pub start_block: usize,
}

/// Upload bandwidth granted by `from` to `to` for one round.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("{from}->{to} blocks={blocks}")]
pub struct UploadGrant {
    pub from: PeerId,
    pub to: PeerId,
    pub blocks: usize,
}

/// Blocks actually moved from `from` to `to` during `round`.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("round={round} {from}->{to} blocks={blocks}")]
pub struct ExchangeRecord {
    pub from: PeerId,
    pub to: PeerId,
    pub blocks: usize,
    pub round: usize,
}
