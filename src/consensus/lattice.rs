//! Lattice façade: per-chain shape validation in front of the ordering engine.
//!
//! The lattice owns the round config table and the per-chain tips. A
//! confirmed block is checked for parent linkage, height continuity, and
//! round assignment before it reaches total ordering; deliver sets flow out
//! to the application. Nothing here blocks on I/O.

use std::sync::Arc;

use crate::consensus::ordering::{OrderingError, TotalOrdering};
use crate::interfaces::{Application, DebugApplication};
use crate::storage::{BlockDatabase, StorageError};
use crate::types::{Block, BlockHash, Config};

/// Errors from lattice admission.
#[derive(Debug, thiserror::Error)]
pub enum LatticeError {
    #[error("block's chain id is outside the configured lattice width")]
    InvalidChainId,
    #[error("block height is not contiguous on its chain")]
    InvalidHeight,
    #[error("block's parent hash does not match the chain tip")]
    InvalidParent,
    #[error("block round has no configuration or regresses on its chain")]
    InvalidRound,
    #[error("config rounds must be appended consecutively")]
    InvalidConfigRound,
    #[error(transparent)]
    Ordering(#[from] OrderingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The newest admitted block on one chain.
#[derive(Clone, Copy, Debug)]
struct ChainTip {
    height: u64,
    hash: BlockHash,
    round: u64,
}

/// Per-chain ordered admission in front of [`TotalOrdering`].
pub struct Lattice {
    app: Arc<dyn Application>,
    debug: Option<Arc<dyn DebugApplication>>,
    db: Arc<dyn BlockDatabase>,
    /// Round of `configs[0]`.
    base_round: u64,
    configs: Vec<Config>,
    chains: Vec<Option<ChainTip>>,
    ordering: TotalOrdering,
}

impl Lattice {
    /// Create a lattice seeded at `round` with that round's config.
    pub fn new(
        round: u64,
        config: Config,
        app: Arc<dyn Application>,
        debug: Option<Arc<dyn DebugApplication>>,
        db: Arc<dyn BlockDatabase>,
    ) -> Self {
        let ordering =
            TotalOrdering::new(config.k as u64, config.phi() as u64, config.num_chains);
        let chains = (0..config.num_chains).map(|_| None).collect();
        Lattice {
            app,
            debug,
            db,
            base_round: round,
            configs: vec![config],
            chains,
            ordering,
        }
    }

    /// The highest round with a known configuration.
    pub fn last_round(&self) -> u64 {
        self.base_round + self.configs.len() as u64 - 1
    }

    /// Extend the config table by one round.
    ///
    /// Growing `num_chains` widens the per-chain array and the ordering
    /// engine. Shrinking is not supported; the old width is kept until all
    /// old blocks drain.
    pub fn append_config(&mut self, round: u64, config: Config) -> Result<(), LatticeError> {
        if round != self.base_round + self.configs.len() as u64 {
            return Err(LatticeError::InvalidConfigRound);
        }
        let width = self.chains.len() as u32;
        if config.num_chains > width {
            self.chains.resize(config.num_chains as usize, None);
            self.ordering
                .resize(config.num_chains, config.phi() as u64);
        } else if config.num_chains < width {
            tracing::warn!(
                round,
                old = width,
                new = config.num_chains,
                "shrinking num_chains is not supported, keeping old width"
            );
        }
        self.configs.push(config);
        Ok(())
    }

    /// Admit a freshly confirmed block: validate, persist, order.
    pub fn process_block(&mut self, block: Block) -> Result<(), LatticeError> {
        self.sanity_check(&block)?;
        match self.db.put(&block) {
            Ok(()) | Err(StorageError::BlockExists) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(debug) = &self.debug {
            debug.block_confirmed(&block);
        }
        self.append(block)
    }

    /// Replay entry for the syncer: the block comes from the agreed
    /// compaction chain and is already stored, so admission is tolerant —
    /// duplicates and stale heights are ignored rather than rejected.
    pub fn process_finalized_block(&mut self, block: Block) -> Result<(), LatticeError> {
        let chain = block.chain_id() as usize;
        if chain >= self.chains.len() {
            return Err(LatticeError::InvalidChainId);
        }
        if let Some(tip) = &self.chains[chain] {
            if block.height() <= tip.height {
                return Ok(());
            }
        }
        self.append(block)
    }

    fn sanity_check(&self, block: &Block) -> Result<(), LatticeError> {
        let chain = block.chain_id() as usize;
        if chain >= self.chains.len() {
            return Err(LatticeError::InvalidChainId);
        }
        let round = block.position.round;
        if round < self.base_round || round > self.last_round() {
            return Err(LatticeError::InvalidRound);
        }
        if !block.parent_hash.is_zero() && !block.acks.contains(&block.parent_hash) {
            return Err(LatticeError::InvalidParent);
        }
        match &self.chains[chain] {
            Some(tip) => {
                if block.height() != tip.height + 1 {
                    return Err(LatticeError::InvalidHeight);
                }
                if block.parent_hash != tip.hash {
                    return Err(LatticeError::InvalidParent);
                }
                if round < tip.round {
                    return Err(LatticeError::InvalidRound);
                }
            }
            None => {
                // First block seen on this chain. Height 0 must be a real
                // genesis; a higher height is a catch-up seed and accepted.
                if block.height() == 0 && !block.parent_hash.is_zero() {
                    return Err(LatticeError::InvalidParent);
                }
            }
        }
        Ok(())
    }

    fn append(&mut self, block: Block) -> Result<(), LatticeError> {
        let chain = block.chain_id() as usize;
        self.chains[chain] = Some(ChainTip {
            height: block.height(),
            hash: block.hash,
            round: block.position.round,
        });
        if let Some(set) = self.ordering.process_block(block)? {
            tracing::debug!(
                blocks = set.blocks.len(),
                early = set.early,
                "deliver set emitted"
            );
            let hashes: Vec<BlockHash> = set.blocks.iter().map(|b| b.hash).collect();
            self.app.total_ordering_delivered(hashes, set.early);
            for delivered in &set.blocks {
                self.app.block_delivered(delivered);
            }
        }
        Ok(())
    }
}
