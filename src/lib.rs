//! Embergate - admission control for multi-tenant messaging fleets.
//!
//! # Overview
//!
//! Embergate decides, for every prospective outbound message, whether it
//! may be sent, from which sending instance, at what rate, and with what
//! content type - so that young or risky sender identities are protected
//! from network bans while tenants share a fleet of instances.
//!
//! Refusals are decision values with reasons and retry boundaries, never
//! errors; errors are reserved for faults (unknown aggregates, tenant
//! mismatches, collaborator I/O). The engine holds no loops and no
//! shared mutable state: each call is a bounded computation over
//! externally supplied snapshots.
//!
//! # Modules
//!
//! - [`model`]: Shared vocabulary - kinds, sources, reasons, decisions
//! - [`instance`]: The instance aggregate and its reputation
//! - [`intent`]: The message intent aggregate and its status machine
//! - [`control`]: Operational pause switches
//! - [`policy`]: The pure dispatch policy
//! - [`scorer`]: Candidate scoring
//! - [`ports`]: Async traits for external collaborators
//! - [`gate`]: The single-intent gate
//! - [`intent_gate`]: The multi-instance intent gate
//! - [`heater`]: The warm-up scheduler
//! - [`storage`]: SQLite adapters
//! - [`metrics`]: Decision-log aggregation
//! - [`collaborators`]: HTTP and in-process adapters
//! - [`api`]: HTTP API handlers

pub mod api;
pub mod collaborators;
pub mod control;
pub mod gate;
pub mod heater;
pub mod instance;
pub mod intent;
pub mod intent_gate;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod ports;
pub mod scorer;
pub mod storage;
