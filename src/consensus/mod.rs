//! # Block-lattice consensus core
//!
//! Three collaborating pieces:
//!
//! 1. **Total ordering** ([`ordering`]) — collapses the ack DAG into one
//!    linear sequence of deliver sets, identically on every honest node.
//! 2. **Lattice façade** ([`lattice`]) — per-chain shape validation and the
//!    round config table, feeding confirmed blocks to the ordering engine.
//! 3. **Sync resolver** ([`syncer`]) — finds a safe block on an
//!    already-agreed compaction chain from which the ordering engine can be
//!    re-seeded for catch-up.

pub mod lattice;
pub mod ordering;
pub mod syncer;
