//! # Tessera
//!
//! A Byzantine-fault-tolerant consensus engine built around a **block-lattice
//! DAG** with a deterministic **total-ordering** algorithm:
//! - **Block lattice** — every validator proposes on its own chain; blocks
//!   acknowledge blocks on other chains, forming a DAG instead of one line
//! - **Deterministic total ordering** — the DAG's partial order is collapsed
//!   into one linear sequence that every honest node computes identically,
//!   regardless of block-arrival interleaving
//! - **Catch-up sync** — a resolver walks an already-agreed compaction chain
//!   to find a safe block from which the ordering engine can be re-seeded
//!
//! Signing, transport, per-chain agreement voting, and governance are
//! consumed through the flat traits in [`interfaces`]; this crate is the
//! ordering core only.

pub mod consensus;
pub mod interfaces;
pub mod storage;
pub mod types;

/// Protocol constants
pub mod constants {
    /// Rounds of configuration that must be fetched ahead of the highest
    /// round in use.
    pub const CONFIG_ROUND_SHIFT: u64 = 2;
    /// Capacity of the confirmed-block receive channel.
    pub const RECEIVE_CHANNEL_SIZE: usize = 1000;
    /// Capacity of the block-pull request channel.
    pub const PULL_CHANNEL_SIZE: usize = 1000;
    /// Polling cadence of the CRS readiness monitor in milliseconds.
    pub const CRS_POLL_INTERVAL_MS: u64 = 1000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Tessera domains use ASCII).
/// Panics at runtime if domain is not valid UTF-8 — this is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_domain_separates() {
        let a = hash_domain(b"tessera.a", b"data");
        let b = hash_domain(b"tessera.b", b"data");
        assert_ne!(a, b);
    }
}
