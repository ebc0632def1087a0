//! Block storage: a keyed retrieval interface with two backends.
//!
//! The consensus core treats storage as append-mostly and tolerant of
//! duplicate puts; `BlockExists` is routinely swallowed by callers. The
//! sled backend persists across restarts, the in-memory backend serves
//! tests and short-lived replay.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{Block, BlockHash};

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("block already exists")]
    BlockExists,
    #[error("block not found")]
    NotFound,
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Keyed block retrieval.
pub trait BlockDatabase: Send + Sync {
    /// Store a block. Returns [`StorageError::BlockExists`] when the hash is
    /// already present; the stored copy is never overwritten.
    fn put(&self, block: &Block) -> Result<(), StorageError>;

    /// Fetch a block by hash.
    fn get(&self, hash: &BlockHash) -> Result<Block, StorageError>;

    fn has(&self, hash: &BlockHash) -> Result<bool, StorageError>;

    /// All stored blocks ordered by compaction height, for replay.
    fn blocks(&self) -> Result<Vec<Block>, StorageError>;
}

/// In-memory block database.
#[derive(Default)]
pub struct MemBlockDb {
    blocks: RwLock<HashMap<BlockHash, Block>>,
}

impl MemBlockDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockDatabase for MemBlockDb {
    fn put(&self, block: &Block) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write().expect("storage lock poisoned");
        if blocks.contains_key(&block.hash) {
            return Err(StorageError::BlockExists);
        }
        blocks.insert(block.hash, block.clone());
        Ok(())
    }

    fn get(&self, hash: &BlockHash) -> Result<Block, StorageError> {
        self.blocks
            .read()
            .expect("storage lock poisoned")
            .get(hash)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn has(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self
            .blocks
            .read()
            .expect("storage lock poisoned")
            .contains_key(hash))
    }

    fn blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut all: Vec<Block> = self
            .blocks
            .read()
            .expect("storage lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|b| b.finalization.height);
        Ok(all)
    }
}

/// Sled-backed block database.
pub struct SledBlockDb {
    #[allow(dead_code)]
    db: sled::Db,
    blocks: sled::Tree,
}

impl SledBlockDb {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let blocks = db
            .open_tree("blocks")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledBlockDb { db, blocks })
    }
}

impl BlockDatabase for SledBlockDb {
    fn put(&self, block: &Block) -> Result<(), StorageError> {
        if self
            .blocks
            .contains_key(block.hash.0)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            return Err(StorageError::BlockExists);
        }
        let value =
            bincode::serialize(block).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.blocks
            .insert(block.hash.0, value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get(&self, hash: &BlockHash) -> Result<Block, StorageError> {
        match self
            .blocks
            .get(hash.0)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
            }
            None => Err(StorageError::NotFound),
        }
    }

    fn has(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        self.blocks
            .contains_key(hash.0)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut all = Vec::new();
        for entry in self.blocks.iter() {
            let (_, bytes) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let block: Block = bincode::deserialize(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            all.push(block);
        }
        all.sort_by_key(|b| b.finalization.height);
        Ok(all)
    }
}
