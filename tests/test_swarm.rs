use swarm_engine::data::Error;
use swarm_engine::engine::{
    AuctionParams, Config, DemandWeighting, Policy, PropShareParams, SlotParams,
};
use swarm_engine::sim::{GroupConfig, SimConfig, Swarm};

fn config(groups: Vec<GroupConfig>, seed: u64) -> SimConfig {
    SimConfig {
        piece_count: 16,
        engine: Config {
            blocks_per_piece: 4,
            upload_capacity: 8,
            max_requests_per_neighbor: 3,
            min_upload_capacity: 4,
            max_upload_capacity: 16,
        },
        max_rounds: 300,
        seed,
        seeds: 1,
        seed_upload_capacity: 12,
        groups,
    }
}

fn group(policy: Policy, count: usize) -> GroupConfig {
    GroupConfig { policy, count }
}

fn all_policies() -> Vec<Policy> {
    vec![
        Policy::Static,
        Policy::PropShare(PropShareParams::default()),
        Policy::Slots(SlotParams::default()),
        Policy::Slots(SlotParams {
            demand: DemandWeighting::Uniform,
            ..Default::default()
        }),
        Policy::Auction(AuctionParams::default()),
    ]
}

#[test]
fn test_mixed_swarm_completes() {
    let groups = all_policies().into_iter().map(|policy| group(policy, 2)).collect();
    let mut swarm = Swarm::new(config(groups, 1)).unwrap();
    let report = swarm.run().unwrap();

    assert!(report.all_completed(), "{report:#?}");
    assert!(swarm.is_finished());
    assert_eq!(11, report.participants.len());
    for participant in report.participants.iter().filter(|p| !p.seeding) {
        assert_eq!(64, participant.downloaded, "{participant:?}");
        assert!(participant.completed_at.unwrap() < report.rounds);
    }
    let uploaded: usize = report.participants.iter().map(|p| p.uploaded).sum();
    assert_eq!(64 * 10, uploaded);
}

#[test]
fn test_each_policy_completes_alone() {
    for policy in all_policies() {
        let mut swarm = Swarm::new(config(vec![group(policy.clone(), 4)], 2)).unwrap();
        let report = swarm.run().unwrap();
        assert!(report.all_completed(), "{policy}: {report:#?}");
    }
}

#[test]
fn test_same_seed_same_report() {
    let groups = || all_policies().into_iter().map(|policy| group(policy, 1)).collect();

    let first = Swarm::new(config(groups(), 42)).unwrap().run().unwrap();
    let second = Swarm::new(config(groups(), 42)).unwrap().run().unwrap();
    assert_eq!(first, second);

    let mut swarm = Swarm::new(config(groups(), 42)).unwrap();
    let mut summaries = Vec::new();
    while !swarm.is_finished() {
        summaries.push(swarm.step().unwrap());
    }
    assert_eq!(first.rounds, summaries.len());
    assert_eq!(first, swarm.report());
}

#[test]
fn test_capacity_respected_every_round() {
    let groups = all_policies().into_iter().map(|policy| group(policy, 2)).collect();
    let mut swarm = Swarm::new(config(groups, 3)).unwrap();
    let capacities = swarm
        .report()
        .participants
        .into_iter()
        .map(|p| (p.id, p.upload_capacity))
        .collect::<std::collections::BTreeMap<_, _>>();

    while !swarm.is_finished() && swarm.current_round() < 300 {
        let summary = swarm.step().unwrap();
        let mut uploaded = std::collections::BTreeMap::new();
        for record in swarm.history().round(summary.round).unwrap() {
            assert_eq!(summary.round, record.round);
            assert!(record.blocks > 0);
            *uploaded.entry(record.from.clone()).or_insert(0) += record.blocks;
        }
        for (provider, blocks) in uploaded {
            assert!(blocks <= capacities[&provider], "{provider}: {blocks}");
        }
    }
    assert!(swarm.is_finished());
}

#[test]
fn test_round_limit() {
    let mut config = config(vec![group(Policy::Static, 3)], 0);
    config.max_rounds = 2;
    let report = Swarm::new(config).unwrap().run().unwrap();
    assert_eq!(2, report.rounds);
    assert!(!report.all_completed());
}

#[test]
fn test_no_seeds_no_progress() {
    let mut config = config(vec![group(Policy::Static, 3)], 0);
    config.seeds = 0;
    config.max_rounds = 5;
    let report = Swarm::new(config).unwrap().run().unwrap();
    assert!(report.participants.iter().all(|p| p.completed_at.is_none() && p.downloaded == 0));
}

#[test]
fn test_invalid_config_rejected() {
    let mut invalid = config(vec![group(Policy::Static, 1)], 0);
    invalid.engine.min_upload_capacity = 20;
    assert!(matches!(Swarm::new(invalid), Err(Error::InvalidConfig(_))));

    let invalid = config(
        vec![group(
            Policy::PropShare(PropShareParams {
                reserved_fraction: -0.5,
            }),
            1,
        )],
        0,
    );
    assert!(matches!(Swarm::new(invalid), Err(Error::InvalidConfig(_))));
}
