use crate::data::{
    Error, ExchangeHistory, NeighborView, PeerId, PieceProgress, RequestIntent, UploadGrant,
};
use crate::engine::{Config, Policy, RequestSelector, RoundContext, UploadAllocator};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;

mod config;

pub use config::{GroupConfig, SimConfig};

struct Participant {
    id: PeerId,
    policy: Policy,
    seeding: bool,
    progress: PieceProgress,
    upload_capacity: usize,
    selector: RequestSelector,
    allocator: Box<dyn UploadAllocator>,
    rng: StdRng,
    completed_at: Option<usize>,
    uploaded: usize,
    downloaded: usize,
}

impl Participant {
    fn new(
        id: PeerId,
        policy: Policy,
        progress: PieceProgress,
        engine: &Config,
        upload_capacity: usize,
        seed: u64,
    ) -> Result<Self, Error> {
        let config = Config {
            upload_capacity,
            ..engine.clone()
        };
        let allocator = policy.build(id.clone(), &config)?;
        let seeding = progress.is_complete();
        Ok(Self {
            selector: RequestSelector::new(id.clone(), config.max_requests_per_neighbor),
            allocator,
            id,
            policy,
            seeding,
            progress,
            upload_capacity,
            rng: StdRng::seed_from_u64(seed),
            completed_at: None,
            uploaded: 0,
            downloaded: 0,
        })
    }

    fn view(&self) -> NeighborView {
        NeighborView::new(self.id.clone(), self.progress.completed_pieces())
    }

    fn is_done(&self) -> bool {
        self.seeding || self.completed_at.is_some()
    }
}

/// What happened during one [`Swarm::step`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoundSummary {
    pub round: usize,
    pub requests: usize,
    pub grants: usize,
    pub blocks_transferred: usize,
    /// Participants that got their last block this round.
    pub completed: Vec<PeerId>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParticipantReport {
    pub id: PeerId,
    pub policy: String,
    pub seeding: bool,
    pub upload_capacity: usize,
    pub completed_at: Option<usize>,
    pub uploaded: usize,
    pub downloaded: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimReport {
    pub rounds: usize,
    pub participants: Vec<ParticipantReport>,
}

impl SimReport {
    pub fn all_completed(&self) -> bool {
        self.participants.iter().all(|p| p.seeding || p.completed_at.is_some())
    }
}

/// Round-driven swarm where every participant sees every other participant. Each round runs
/// request selection for everyone, routes requests to providers, runs every allocator and
/// executes the resulting transfers.
pub struct Swarm {
    config: SimConfig,
    participants: Vec<Participant>,
    index: BTreeMap<PeerId, usize>,
    history: ExchangeHistory,
}

impl Swarm {
    pub fn new(config: SimConfig) -> Result<Self, Error> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let engine = &config.engine;
        let mut participants = Vec::with_capacity(config.participant_count());

        for i in 0..config.seeds {
            participants.push(Participant::new(
                format!("seed-{i}").into(),
                Policy::Static,
                PieceProgress::complete(config.piece_count, engine.blocks_per_piece),
                engine,
                config.seed_upload_capacity,
                rng.next_u64(),
            )?);
        }
        for group in &config.groups {
            for _ in 0..group.count {
                let upload_capacity =
                    rng.random_range(engine.min_upload_capacity..=engine.max_upload_capacity);
                participants.push(Participant::new(
                    format!("{}-{}", group.policy, participants.len() - config.seeds).into(),
                    group.policy.clone(),
                    PieceProgress::new(config.piece_count, engine.blocks_per_piece),
                    engine,
                    upload_capacity,
                    rng.next_u64(),
                )?);
            }
        }

        let index = participants.iter().enumerate().map(|(i, p)| (p.id.clone(), i)).collect();
        Ok(Self {
            config,
            participants,
            index,
            history: ExchangeHistory::new(),
        })
    }

    pub fn current_round(&self) -> usize {
        self.history.current_round()
    }

    pub fn history(&self) -> &ExchangeHistory {
        &self.history
    }

    pub fn is_finished(&self) -> bool {
        self.participants.iter().all(Participant::is_done)
    }

    pub fn step(&mut self) -> Result<RoundSummary, Error> {
        let round = self.history.current_round();
        let views = self.participants.iter().map(Participant::view).collect::<Vec<_>>();
        let neighbors = (0..views.len())
            .map(|i| {
                views
                    .iter()
                    .enumerate()
                    .filter_map(|(j, view)| (j != i).then(|| view.clone()))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut outgoing = Vec::with_capacity(self.participants.len());
        let mut incoming = vec![Vec::<RequestIntent>::new(); self.participants.len()];
        for (participant, neighbors) in self.participants.iter_mut().zip(&neighbors) {
            let requests = participant.selector.select(
                &participant.progress,
                neighbors,
                &mut participant.rng,
            )?;
            for request in &requests {
                let provider = self.index[&request.provider];
                incoming[provider].push(request.clone());
            }
            outgoing.push(requests);
        }

        let mut grants = Vec::new();
        for ((participant, neighbors), requests) in
            self.participants.iter_mut().zip(&neighbors).zip(&incoming)
        {
            let ctx = RoundContext {
                round,
                requests,
                neighbors,
                history: &self.history,
            };
            let participant_grants = participant.allocator.allocate(&ctx, &mut participant.rng)?;
            check_grants(participant, requests, &participant_grants)?;
            grants.extend(participant_grants);
        }

        let mut records = Vec::new();
        for grant in &grants {
            let (provider, receiver) = (self.index[&grant.from], self.index[&grant.to]);
            let mut remaining = grant.blocks;
            for request in outgoing[receiver].iter().filter(|r| r.provider == grant.from) {
                if remaining == 0 {
                    break;
                }
                remaining -= self.participants[receiver]
                    .progress
                    .add_blocks(request.piece_index, remaining)?;
            }
            let moved = grant.blocks - remaining;
            if moved > 0 {
                self.participants[provider].uploaded += moved;
                self.participants[receiver].downloaded += moved;
                records.push((grant.from.clone(), grant.to.clone(), moved));
            }
        }

        let mut completed = Vec::new();
        for participant in &mut self.participants {
            if !participant.is_done() && participant.progress.is_complete() {
                log::info!("{} completed in round {round}", participant.id);
                participant.completed_at = Some(round);
                completed.push(participant.id.clone());
            }
        }

        let summary = RoundSummary {
            round,
            requests: outgoing.iter().map(Vec::len).sum(),
            grants: grants.len(),
            blocks_transferred: records.iter().map(|(_, _, blocks)| blocks).sum(),
            completed,
        };
        log::debug!(
            "round {round}: {} requests, {} grants, {} blocks transferred",
            summary.requests,
            summary.grants,
            summary.blocks_transferred
        );
        self.history.append_round(records);
        Ok(summary)
    }

    /// Step until every participant has the whole content or the round limit is hit.
    pub fn run(&mut self) -> Result<SimReport, Error> {
        while !self.is_finished() && self.current_round() < self.config.max_rounds {
            self.step()?;
        }
        if self.is_finished() {
            log::info!("Swarm finished after {} rounds", self.current_round());
        } else {
            log::info!("Round limit {} reached", self.config.max_rounds);
        }
        Ok(self.report())
    }

    pub fn report(&self) -> SimReport {
        SimReport {
            rounds: self.current_round(),
            participants: self
                .participants
                .iter()
                .map(|p| ParticipantReport {
                    id: p.id.clone(),
                    policy: p.policy.to_string(),
                    seeding: p.seeding,
                    upload_capacity: p.upload_capacity,
                    completed_at: p.completed_at,
                    uploaded: p.uploaded,
                    downloaded: p.downloaded,
                })
                .collect(),
        }
    }
}

/// Allocator output must stay within capacity and only go to those who asked.
fn check_grants(
    participant: &Participant,
    requests: &[RequestIntent],
    grants: &[UploadGrant],
) -> Result<(), Error> {
    let granted: usize = grants.iter().map(|grant| grant.blocks).sum();
    if granted > participant.upload_capacity {
        log::warn!(
            "{} granted {granted} blocks above capacity {}",
            participant.id,
            participant.upload_capacity
        );
        return Err(Error::CapacityExceeded {
            provider: participant.id.clone(),
            granted,
            capacity: participant.upload_capacity,
        });
    }
    for grant in grants {
        if grant.from != participant.id || !requests.iter().any(|r| r.requester == grant.to) {
            log::warn!("{} rejected grant {grant}", participant.id);
            return Err(Error::UnrequestedGrant {
                provider: participant.id.clone(),
                recipient: grant.to.clone(),
            });
        }
    }
    Ok(())
}
