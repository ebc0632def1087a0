//! Core protocol types: blocks, positions, and per-round configuration.
//!
//! A block lives on exactly one chain of the lattice and acknowledges blocks
//! on other chains; the set of acknowledgements is what the total-ordering
//! engine consumes. `Config` carries the per-round consensus parameters and
//! round-trips through a fixed little-endian wire layout shared with other
//! implementations.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Hash;

/// Chain identifier in `[0, num_chains)`.
pub type ChainId = u32;

/// A block's content identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub Hash);

impl BlockHash {
    /// The all-zero hash, used as "no parent" and "CRS not ready".
    pub fn zero() -> Self {
        BlockHash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({}..)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Where a block sits in the lattice: which round, which chain, how high.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub round: u64,
    pub chain: ChainId,
    pub height: u64,
}

impl Position {
    pub fn new(round: u64, chain: ChainId, height: u64) -> Self {
        Position {
            round,
            chain,
            height,
        }
    }

    /// Whether this position was produced strictly before `other`,
    /// comparing `(round, height)` and ignoring the chain.
    pub fn older(&self, other: &Position) -> bool {
        self.round < other.round || (self.round == other.round && self.height < other.height)
    }
}

/// A block's link in the compaction chain, assigned downstream once the
/// block has been totally ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalization {
    /// Consecutive height on the compaction chain, starting at 0.
    pub height: u64,
    /// Hash of the previous compaction-chain block (zero at the start).
    pub parent_hash: BlockHash,
}

/// A block of the lattice. Immutable once admitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    /// Content identifier (unique).
    pub hash: BlockHash,
    /// Previous block on the same chain (zero for a chain's genesis block).
    pub parent_hash: BlockHash,
    /// Round, proposer chain, and per-chain height.
    pub position: Position,
    /// Unix millis, advisory only — not used for ordering.
    pub timestamp: u64,
    /// Hashes of other blocks this block acknowledges. Must include
    /// `parent_hash` for non-genesis blocks; at most one block per other chain.
    pub acks: Vec<BlockHash>,
    /// Opaque transaction payload; execution is out of scope.
    pub payload: Vec<u8>,
    /// Compaction-chain linkage, consumed by the sync resolver.
    pub finalization: Finalization,
}

impl Block {
    pub fn chain_id(&self) -> ChainId {
        self.position.chain
    }

    pub fn height(&self) -> u64 {
        self.position.height
    }

    /// A chain's first block: height 0 and no parent.
    pub fn is_genesis(&self) -> bool {
        self.position.height == 0 && self.parent_hash.is_zero()
    }

    /// Compute the block's content hash from its header fields.
    ///
    /// Acks are sorted before hashing so the id does not depend on the
    /// order the proposer happened to list them in.
    pub fn compute_hash(&self) -> BlockHash {
        let mut hasher = blake3::Hasher::new_derive_key("tessera.block");
        hasher.update(&self.position.round.to_le_bytes());
        hasher.update(&self.position.chain.to_le_bytes());
        hasher.update(&self.position.height.to_le_bytes());
        hasher.update(&self.parent_hash.0);
        let mut acks = self.acks.clone();
        acks.sort();
        for ack in &acks {
            hasher.update(&ack.0);
        }
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.payload);
        BlockHash(*hasher.finalize().as_bytes())
    }
}

/// Result of the per-chain Byzantine agreement on one block. The agreement
/// protocol itself is external; the syncer only uses this to learn which
/// block hashes were confirmed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgreementResult {
    pub block_hash: BlockHash,
    pub round: u64,
    pub position: Position,
}

/// Threshold-signature randomness attached to a confirmed block by the
/// external DKG layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockRandomnessResult {
    pub block_hash: BlockHash,
    pub round: u64,
    pub randomness: Vec<u8>,
}

/// Byte length of the serialized `Config` wire format.
pub const CONFIG_WIRE_LEN: usize = 64;

/// Errors decoding the `Config` wire format.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config blob must be {CONFIG_WIRE_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Per-round consensus parameters, fetched from governance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of proposer chains in the lattice.
    pub num_chains: u32,

    /// Byzantine-agreement latency parameter.
    pub lambda_ba: Duration,
    /// DKG latency parameter.
    pub lambda_dkg: Duration,

    /// The `k` in k-level total ordering.
    pub k: u32,
    /// Supermajority ratio; `phi = ceil(phi_ratio * num_chains)`.
    pub phi_ratio: f32,

    pub num_notary_set: u32,
    pub num_witness_set: u32,
    pub num_dkg_set: u32,

    pub round_interval: Duration,
    pub min_block_interval: Duration,
    pub max_block_interval: Duration,
}

impl Config {
    /// The supermajority threshold derived from `phi_ratio`.
    pub fn phi(&self) -> u32 {
        (self.phi_ratio * self.num_chains as f32).ceil() as u32
    }

    /// Whether the total-ordering parameters differ between two rounds.
    /// This is the "config change" the sync resolver must stay clear of.
    pub fn ordering_changed(&self, other: &Config) -> bool {
        self.k != other.k
            || self.num_chains != other.num_chains
            || self.phi_ratio != other.phi_ratio
    }

    /// Serialize to the fixed 64-byte little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; CONFIG_WIRE_LEN] {
        let mut buf = [0u8; CONFIG_WIRE_LEN];
        buf[0..4].copy_from_slice(&self.num_chains.to_le_bytes());
        buf[4..12].copy_from_slice(&(self.lambda_ba.as_nanos() as i64).to_le_bytes());
        buf[12..20].copy_from_slice(&(self.lambda_dkg.as_nanos() as i64).to_le_bytes());
        buf[20..24].copy_from_slice(&self.k.to_le_bytes());
        buf[24..28].copy_from_slice(&self.phi_ratio.to_bits().to_le_bytes());
        buf[28..32].copy_from_slice(&self.num_notary_set.to_le_bytes());
        buf[32..36].copy_from_slice(&self.num_witness_set.to_le_bytes());
        buf[36..40].copy_from_slice(&self.num_dkg_set.to_le_bytes());
        buf[40..48].copy_from_slice(&(self.round_interval.as_nanos() as i64).to_le_bytes());
        buf[48..56].copy_from_slice(&(self.min_block_interval.as_nanos() as i64).to_le_bytes());
        buf[56..64].copy_from_slice(&(self.max_block_interval.as_nanos() as i64).to_le_bytes());
        buf
    }

    /// Decode the fixed wire layout produced by [`Config::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() != CONFIG_WIRE_LEN {
            return Err(ConfigError::InvalidLength(bytes.len()));
        }
        let u32_at = |off: usize| {
            u32::from_le_bytes(bytes[off..off + 4].try_into().expect("4-byte slice"))
        };
        let dur_at = |off: usize| {
            let nanos = i64::from_le_bytes(bytes[off..off + 8].try_into().expect("8-byte slice"));
            Duration::from_nanos(nanos as u64)
        };
        Ok(Config {
            num_chains: u32_at(0),
            lambda_ba: dur_at(4),
            lambda_dkg: dur_at(12),
            k: u32_at(20),
            phi_ratio: f32::from_bits(u32_at(24)),
            num_notary_set: u32_at(28),
            num_witness_set: u32_at(32),
            num_dkg_set: u32_at(36),
            round_interval: dur_at(40),
            min_block_interval: dur_at(48),
            max_block_interval: dur_at(56),
        })
    }
}
