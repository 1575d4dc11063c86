use super::{Error, ExchangeRecord, PeerId};
use std::collections::BTreeMap;
use std::ops::Range;

/// Append-only log of completed rounds. Only rounds strictly before [`current_round`] can be
/// read.
///
/// [`current_round`]: ExchangeHistory::current_round
#[derive(Default, Debug)]
pub struct ExchangeHistory {
    rounds: Vec<Vec<ExchangeRecord>>,
}

impl ExchangeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_round(&self) -> usize {
        self.rounds.len()
    }

    /// Close the current round with the given `(from, to, blocks)` transfers.
    pub fn append_round(&mut self, transfers: impl IntoIterator<Item = (PeerId, PeerId, usize)>) {
        let round = self.current_round();
        self.rounds.push(
            transfers
                .into_iter()
                .map(|(from, to, blocks)| ExchangeRecord {
                    from,
                    to,
                    blocks,
                    round,
                })
                .collect(),
        );
    }

    pub fn round(&self, round: usize) -> Result<&[ExchangeRecord], Error> {
        self.rounds.get(round).map(Vec::as_slice).ok_or(Error::FutureRound {
            requested: round,
            current: self.current_round(),
        })
    }

    pub fn received_by<'a>(
        &'a self,
        round: usize,
        receiver: &'a PeerId,
    ) -> Result<impl Iterator<Item = &'a ExchangeRecord> + 'a, Error> {
        Ok(self.round(round)?.iter().filter(move |record| &record.to == receiver))
    }

    /// Total blocks `receiver` got from each sender over `rounds`.
    pub fn blocks_received(
        &self,
        rounds: Range<usize>,
        receiver: &PeerId,
    ) -> Result<BTreeMap<PeerId, usize>, Error> {
        if rounds.end > self.current_round() {
            return Err(Error::FutureRound {
                requested: rounds.end - 1,
                current: self.current_round(),
            });
        }
        let mut totals = BTreeMap::<PeerId, usize>::new();
        for round in rounds {
            for record in self.received_by(round, receiver)? {
                *totals.entry(record.from.clone()).or_default() += record.blocks;
            }
        }
        Ok(totals)
    }
}
