//! Catch-up sync against an already-agreed compaction chain.
//!
//! While a node is behind, the rest of the network keeps appending to the
//! compaction chain (the totally-ordered output). The syncer consumes a
//! prefix of that chain, finds a deliver-set boundary from which the
//! ordering engine can be safely re-seeded, replays the chain from there
//! through a fresh [`Lattice`], and in parallel pools freshly confirmed
//! blocks arriving over the network. Sync is complete once, on every chain,
//! the pooled confirmed blocks overlap the compaction tip.
//!
//! All mutable state sits behind one `RwLock`; inbound traffic funnels
//! through bounded channels; a single cancellation token stops the
//! background tasks.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::consensus::lattice::{Lattice, LatticeError};
use crate::constants::{
    CONFIG_ROUND_SHIFT, CRS_POLL_INTERVAL_MS, PULL_CHANNEL_SIZE, RECEIVE_CHANNEL_SIZE,
};
use crate::interfaces::{
    Application, DebugApplication, Governance, Network, NetworkEvent, NetworkReceiver,
};
use crate::storage::{BlockDatabase, StorageError};
use crate::types::{Block, BlockHash, BlockRandomnessResult, Config};

/// Errors surfaced by the syncer.
#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    #[error("already synced")]
    AlreadySynced,
    #[error("genesis block reached")]
    GenesisBlockReached,
    #[error("synced blocks are not consecutive in compaction height")]
    InvalidBlockOrder,
    #[error("configuration for round {0} is not available")]
    MissingConfig(u64),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lattice(#[from] LatticeError),
}

/// Everything handed over once sync completes: the re-seeded lattice plus
/// the confirmed blocks and randomness collected while catching up.
pub struct SyncedState {
    pub lattice: Option<Lattice>,
    pub confirmed_blocks: Vec<Block>,
    pub randomness: Vec<BlockRandomnessResult>,
    pub round_begin_times: Vec<SystemTime>,
}

/// Mutable state shared with the background tasks.
struct SyncerState {
    configs: Vec<Config>,
    round_begin_times: Vec<SystemTime>,
    /// Per-chain pools of confirmed blocks arriving over the network,
    /// sorted by position.
    blocks: Vec<Vec<Block>>,
    lattice: Option<Lattice>,
    /// Highest round whose config the lattice has been told about.
    lattice_last_round: u64,
    /// Once found, confirmed blocks below this round are dropped so the
    /// pools stay inside one configuration.
    agreement_round_cut: u64,
    /// Latest round whose CRS governance reports ready.
    crs_round: u64,
    randomness: Vec<BlockRandomnessResult>,
}

/// Consensus catch-up driver.
pub struct Syncer {
    app: Arc<dyn Application>,
    debug: Option<Arc<dyn DebugApplication>>,
    gov: Arc<dyn Governance>,
    db: Arc<dyn BlockDatabase>,
    network: Arc<dyn Network>,
    network_rx: Option<NetworkReceiver>,
    state: Arc<RwLock<SyncerState>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    receive_tx: mpsc::Sender<Block>,
    receive_rx: Option<mpsc::Receiver<Block>>,
    pull_tx: mpsc::Sender<BlockHash>,
    pull_rx: Option<mpsc::Receiver<BlockHash>>,
    synced: bool,
}

impl Syncer {
    /// Create a syncer. `dmoment` is the network launch instant, from which
    /// round begin times accumulate. Round 0's configuration must already
    /// be decided by governance.
    pub fn new(
        dmoment: SystemTime,
        app: Arc<dyn Application>,
        debug: Option<Arc<dyn DebugApplication>>,
        gov: Arc<dyn Governance>,
        db: Arc<dyn BlockDatabase>,
        network: Arc<dyn Network>,
        network_rx: NetworkReceiver,
    ) -> Result<Self, SyncerError> {
        let genesis_config = gov.configuration(0).ok_or(SyncerError::MissingConfig(0))?;
        let num_chains = genesis_config.num_chains as usize;
        let (receive_tx, receive_rx) = mpsc::channel(RECEIVE_CHANNEL_SIZE);
        let (pull_tx, pull_rx) = mpsc::channel(PULL_CHANNEL_SIZE);
        let state = SyncerState {
            configs: vec![genesis_config],
            round_begin_times: vec![dmoment],
            blocks: vec![Vec::new(); num_chains],
            lattice: None,
            lattice_last_round: 0,
            agreement_round_cut: 0,
            crs_round: 0,
            randomness: Vec::new(),
        };
        Ok(Syncer {
            app,
            debug,
            gov,
            db,
            network,
            network_rx: Some(network_rx),
            state: Arc::new(RwLock::new(state)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            receive_tx,
            receive_rx: Some(receive_rx),
            pull_tx,
            pull_rx: Some(pull_rx),
            synced: false,
        })
    }

    /// Latest round whose CRS the monitor has seen ready.
    pub async fn crs_round(&self) -> u64 {
        self.state.read().await.crs_round
    }

    /// Feed a consecutive run of compaction-chain blocks. `latest` marks
    /// that the caller believes these are the newest ones (it may be true
    /// many times). Returns whether the syncer is now synced.
    pub async fn sync_blocks(
        &mut self,
        blocks: &[Block],
        latest: bool,
    ) -> Result<bool, SyncerError> {
        if self.synced {
            return Err(SyncerError::AlreadySynced);
        }
        if blocks.is_empty() {
            return Ok(false);
        }
        for pair in blocks.windows(2) {
            if pair[1].finalization.height != pair[0].finalization.height + 1 {
                return Err(SyncerError::InvalidBlockOrder);
            }
        }
        tracing::info!(
            first = %blocks[0].hash,
            height = blocks[0].finalization.height,
            len = blocks.len(),
            latest,
            "sync blocks"
        );
        self.setup_configs(blocks).await?;
        {
            let state = self.state.clone();
            let mut st = state.write().await;
            for block in blocks {
                match self.db.put(block) {
                    Ok(()) | Err(StorageError::BlockExists) => {}
                    Err(err) => return Err(err.into()),
                }
                if let Some(lattice) = st.lattice.as_mut() {
                    lattice.process_finalized_block(block.clone())?;
                }
            }
        }
        if latest {
            let needs_seed = self.state.read().await.lattice.is_none();
            if needs_seed {
                let seed = {
                    let st = self.state.read().await;
                    find_sync_block(&st.configs, self.db.as_ref(), blocks)?
                };
                if let Some(seed) = seed {
                    tracing::info!(
                        seed = %seed.hash,
                        round = seed.position.round,
                        "deliver set boundary found"
                    );
                    self.init_consensus(&seed).await?;
                    self.replay_from(&seed, blocks).await?;
                }
            }
            let aligned = {
                let state = self.state.clone();
                let mut st = state.write().await;
                ensure_overlap_round(&mut st)
            };
            if aligned {
                self.check_if_synced(blocks).await?;
            }
        }
        Ok(self.synced)
    }

    /// Stop the background tasks and hand over the collected state.
    pub async fn finish(mut self) -> SyncedState {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(%err, "syncer task aborted");
            }
        }
        let mut st = self.state.write().await;
        SyncedState {
            lattice: st.lattice.take(),
            confirmed_blocks: std::mem::take(&mut st.blocks).into_iter().flatten().collect(),
            randomness: std::mem::take(&mut st.randomness),
            round_begin_times: std::mem::take(&mut st.round_begin_times),
        }
    }

    /// Fetch configurations up to the highest round seen plus the round
    /// shift, grow the pools if the lattice widens, and notify the lattice
    /// of newly covered rounds.
    async fn setup_configs(&self, blocks: &[Block]) -> Result<(), SyncerError> {
        let max_round = blocks
            .iter()
            .map(|b| b.position.round)
            .max()
            .unwrap_or(0);
        let until = max_round + CONFIG_ROUND_SHIFT;

        let mut st = self.state.write().await;
        for round in st.configs.len() as u64..=until {
            let config = self
                .gov
                .configuration(round)
                .ok_or(SyncerError::MissingConfig(round))?;
            let begin = st.round_begin_times[round as usize - 1]
                + st.configs[round as usize - 1].round_interval;
            st.round_begin_times.push(begin);
            st.configs.push(config);
        }
        let widest = st
            .configs
            .iter()
            .map(|c| c.num_chains)
            .max()
            .unwrap_or(0) as usize;
        if widest > st.blocks.len() {
            st.blocks.resize(widest, Vec::new());
        }
        if st.lattice.is_some() {
            while st.lattice_last_round + 1 <= max_round {
                let round = st.lattice_last_round + 1;
                let config = st.configs[round as usize].clone();
                if let Some(lattice) = st.lattice.as_mut() {
                    lattice.append_config(round, config)?;
                }
                st.lattice_last_round = round;
            }
        }
        Ok(())
    }

    /// Build the lattice seeded at the sync block's round and start the
    /// background tasks.
    async fn init_consensus(&mut self, seed: &Block) -> Result<(), SyncerError> {
        {
            let mut st = self.state.write().await;
            let round = seed.position.round;
            let config = st
                .configs
                .get(round as usize)
                .cloned()
                .ok_or(SyncerError::MissingConfig(round))?;
            st.lattice_last_round = round;
            st.lattice = Some(Lattice::new(
                round,
                config,
                self.app.clone(),
                self.debug.clone(),
                self.db.clone(),
            ));
        }
        self.start_tasks();
        Ok(())
    }

    /// Replay stored compaction blocks from the seed up to the newest one
    /// through the fresh lattice.
    async fn replay_from(&self, seed: &Block, blocks: &[Block]) -> Result<(), SyncerError> {
        let Some(last) = blocks.last() else {
            return Ok(());
        };
        let span = (last.finalization.height - seed.finalization.height + 1) as usize;
        let mut to_process = Vec::with_capacity(span);
        let mut cursor = last.clone();
        loop {
            to_process.push(cursor.clone());
            if cursor.hash == seed.hash {
                break;
            }
            cursor = self.db.get(&cursor.finalization.parent_hash)?;
        }
        to_process.reverse();

        let mut st = self.state.write().await;
        if let Some(lattice) = st.lattice.as_mut() {
            for block in to_process {
                lattice.process_finalized_block(block)?;
            }
        }
        Ok(())
    }

    /// Compare the newest compaction block per chain against the oldest
    /// pooled confirmed block per chain; all chains overlapping means the
    /// two views have met and sync is done.
    async fn check_if_synced(&mut self, blocks: &[Block]) -> Result<(), SyncerError> {
        let Some(last) = blocks.last() else {
            return Ok(());
        };
        let state = self.state.clone();
        let st = state.read().await;
        let cut = st.agreement_round_cut;
        let num_chains = st
            .configs
            .get(cut as usize)
            .map(|c| c.num_chains)
            .ok_or(SyncerError::MissingConfig(cut))?;

        // Newest compaction block per chain.
        let mut tips: Vec<Option<Block>> = vec![None; num_chains as usize];
        let mut tip_count = 0u32;
        let mut cursor = last.clone();
        loop {
            let chain = cursor.position.chain as usize;
            if chain < tips.len() && tips[chain].is_none() {
                tips[chain] = Some(cursor.clone());
                tip_count += 1;
                if tip_count == num_chains {
                    break;
                }
            }
            if cursor.finalization.parent_hash.is_zero() {
                // Compaction chain too short to cover every chain yet.
                return Ok(());
            }
            cursor = self.db.get(&cursor.finalization.parent_hash)?;
        }

        let mut overlap = 0u32;
        for (chain, tip) in tips.iter().enumerate() {
            let (Some(tip), Some(front)) =
                (tip.as_ref(), st.blocks.get(chain).and_then(|pool| pool.first()))
            else {
                continue;
            };
            if !tip.position.older(&front.position) {
                overlap += 1;
            }
        }
        drop(st);
        if overlap == num_chains {
            tracing::info!("confirmed blocks overlap the compaction tip, synced");
            self.synced = true;
        } else {
            tracing::info!(overlap, num_chains, "not overlapped yet");
        }
        Ok(())
    }

    /// Spawn the network dispatch loop, the confirmed-block collector, the
    /// pull forwarder, and the CRS monitor. Idempotent.
    fn start_tasks(&mut self) {
        let Some(mut network_rx) = self.network_rx.take() else {
            return;
        };

        let receive_tx = self.receive_tx.clone();
        let pull_tx = self.pull_tx.clone();
        let db = self.db.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = network_rx.recv() => match event {
                        None => return,
                        Some(NetworkEvent::Block(block)) => {
                            let _ = receive_tx.send(*block).await;
                        }
                        Some(NetworkEvent::Agreement(result)) => {
                            // An agreed block we have not stored yet must be
                            // pulled before the pools can make progress.
                            if !db.has(&result.block_hash).unwrap_or(false) {
                                let _ = pull_tx.send(result.block_hash).await;
                            }
                        }
                        Some(NetworkEvent::Randomness(result)) => {
                            let mut st = state.write().await;
                            if result.round >= st.agreement_round_cut {
                                st.randomness.push(result);
                            }
                        }
                    }
                }
            }
        }));

        if let Some(mut receive_rx) = self.receive_rx.take() {
            let state = self.state.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        block = receive_rx.recv() => match block {
                            None => return,
                            Some(block) => {
                                let mut st = state.write().await;
                                admit_confirmed(&mut st, block);
                            }
                        }
                    }
                }
            }));
        }

        if let Some(mut pull_rx) = self.pull_rx.take() {
            let network = self.network.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        hash = pull_rx.recv() => match hash {
                            None => return,
                            Some(hash) => network.pull_blocks(vec![hash]),
                        }
                    }
                }
            }));
        }

        let gov = self.gov.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(CRS_POLL_INTERVAL_MS));
            let mut last_notified = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut round = last_notified;
                        while gov.crs(round + 1) != [0u8; 32] {
                            round += 1;
                        }
                        if round != last_notified {
                            tracing::info!(round, "CRS is ready");
                            last_notified = round;
                            state.write().await.crs_round = round;
                        }
                    }
                }
            }
        }));
    }
}

/// Insert a confirmed block into its chain's pool, keeping the pool sorted
/// by position. Blocks below the round cut and duplicates are dropped.
fn admit_confirmed(state: &mut SyncerState, block: Block) {
    if block.position.round < state.agreement_round_cut {
        return;
    }
    let chain = block.position.chain as usize;
    if chain >= state.blocks.len() {
        tracing::error!(position = ?block.position, "confirmed block on unknown chain");
        return;
    }
    let pool = &mut state.blocks[chain];
    if pool.iter().any(|b| b.hash == block.hash) {
        return;
    }
    pool.push(block);
    pool.sort_by_key(|b| b.position);
}

/// Align the per-chain pools so every non-empty pool starts in the same
/// round, then fix the round cut once all chains of that round's config
/// are present. Avoids straddling a config change while syncing.
fn ensure_overlap_round(state: &mut SyncerState) -> bool {
    if state.agreement_round_cut > 0 {
        return true;
    }
    loop {
        let mut tip_rounds: Vec<u64> = state
            .blocks
            .iter()
            .filter_map(|pool| pool.first().map(|b| b.position.round))
            .collect();
        tip_rounds.sort_unstable();
        tip_rounds.dedup();
        match tip_rounds.len() {
            0 => return false,
            1 => {
                let round = tip_rounds[0];
                let populated = state
                    .blocks
                    .iter()
                    .filter(|pool| !pool.is_empty())
                    .count() as u32;
                let Some(config) = state.configs.get(round as usize) else {
                    return false;
                };
                if populated == config.num_chains {
                    state.agreement_round_cut = round;
                    tracing::info!(round, "agreement round cut found");
                    return true;
                }
                return false;
            }
            _ => {
                // Drop pooled blocks older than the newest tip round.
                let max_round = tip_rounds[tip_rounds.len() - 1];
                for pool in &mut state.blocks {
                    pool.retain(|b| b.position.round >= max_round);
                }
            }
        }
    }
}

/// Walk the compaction chain backwards for a block from which replaying
/// the ordering engine reproduces the remaining prefix.
///
/// First settle on a round whose total-ordering config agrees with both
/// neighbours, then locate two adjacent deliver-set boundaries: deliver
/// sets leave the engine hash-sorted, so a compaction entry whose
/// predecessor hashes higher marks a set start. The first block of the
/// earlier of the two sets is the seed, provided that whole set sits in the
/// settled round; otherwise retry one round lower.
fn find_sync_block(
    configs: &[Config],
    db: &dyn BlockDatabase,
    blocks: &[Block],
) -> Result<Option<Block>, SyncerError> {
    let Some(last) = blocks.last() else {
        return Ok(None);
    };
    let mut seek = last.clone();
    let mut round = seek.position.round;
    loop {
        round = match stable_round(configs, round) {
            Some(r) => r,
            None => return Ok(None),
        };
        // Newest compaction block still in `round`.
        while seek.position.round != round {
            if seek.finalization.parent_hash.is_zero() {
                return Err(SyncerError::GenesisBlockReached);
            }
            seek = db.get(&seek.finalization.parent_hash)?;
        }
        // Scan back to the start of the deliver set containing `seek`.
        let mut cur = seek.clone();
        let set_last;
        loop {
            if cur.finalization.parent_hash.is_zero() {
                return Err(SyncerError::GenesisBlockReached);
            }
            let prev = db.get(&cur.finalization.parent_hash)?;
            if prev.hash >= cur.hash {
                set_last = prev;
                break;
            }
            cur = prev;
        }
        // And again, to the start of the set before it.
        let mut cur = set_last.clone();
        loop {
            if cur.finalization.parent_hash.is_zero() {
                break;
            }
            let prev = db.get(&cur.finalization.parent_hash)?;
            if prev.hash >= cur.hash {
                break;
            }
            cur = prev;
        }
        let set_first = cur;
        // The earlier set must sit entirely in the settled round.
        let mut ok = true;
        let mut cur = set_last.clone();
        loop {
            if cur.position.round != round {
                ok = false;
                break;
            }
            if cur.hash == set_first.hash {
                break;
            }
            cur = db.get(&cur.finalization.parent_hash)?;
        }
        if ok {
            return Ok(Some(set_first));
        }
        if round == 0 {
            return Ok(None);
        }
        round -= 1;
    }
}

/// Highest round `r <= round` such that rounds `r-1`, `r`, `r+1` agree on
/// the total-ordering parameters. `None` when no such round exists yet.
fn stable_round(configs: &[Config], mut round: u64) -> Option<u64> {
    loop {
        let same_prev = round == 0
            || !configs[round as usize - 1].ordering_changed(&configs[round as usize]);
        let same_next = (round as usize + 1) < configs.len()
            && !configs[round as usize].ordering_changed(&configs[round as usize + 1]);
        if same_prev && same_next {
            return Some(round);
        }
        if round == 0 {
            return None;
        }
        round -= 1;
    }
}
