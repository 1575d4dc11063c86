//! Per-round decision engine of a participant in a Bittorrent-like swarm: which byte ranges to
//! request from which neighbors, and how to divide the participant's own upload capacity among
//! the neighbors that requested data from it.
//!
//! Example usage:
//! - Round-driven swarm simulator: [`sim::Swarm`]
//! - CLI application: `swarm_sim` (see `src/bin/swarm_sim.rs`)

/// Value objects exchanged between the engine and its driver.
pub mod data;

/// Request selection and upload allocation policies.
pub mod engine;

/// Round-driven swarm simulator feeding the engine.
pub mod sim;
