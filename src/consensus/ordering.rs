//! Deterministic total ordering over the block lattice.
//!
//! Blocks arrive in any DAG-respecting order (per chain, heights strictly
//! ascending). The engine tracks which pending blocks transitively
//! acknowledge which others, summarises that relation per candidate as an
//! **acking status vector** (`{min_height, count}` per chain), derives an
//! **acking height vector** against the global vector, and compares
//! candidates pairwise with a three-valued **precedence grade**. Candidates
//! that no other candidate can precede form the next **deliver set**,
//! emitted in ascending hash order once the window is stable.
//!
//! When a block acks a chain at some height, every later block on that chain
//! acks it too (through the parent chain), so `{min_height, count}` is a
//! complete summary of one chain's acking frontier.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::{Block, BlockHash, ChainId};

/// Height value standing for "decided absent": the chain can no longer
/// contribute an ack inside the window.
pub const INFINITY: u64 = u64::MAX;

/// Errors from the ordering engine.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OrderingError {
    /// The block does not extend its chain's pending sequence.
    #[error("block does not form a valid DAG")]
    NotValidDag,
}

/// One chain's acking frontier for a candidate: the lowest acking height and
/// how many consecutive heights from there ack it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckStatus {
    pub min_height: u64,
    pub count: u64,
}

/// Per-chain `AckStatus` map, kept per candidate and globally.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct StatusVector(pub(crate) HashMap<ChainId, AckStatus>);

/// Per-chain acking heights; missing entries are not yet decidable.
type HeightVector = HashMap<ChainId, u64>;

impl StatusVector {
    /// Fold one more acking block into the vector. Extends the contiguous
    /// run upward or downward; heights inside the run or beyond a gap are
    /// ignored until the gap fills.
    fn add_block(&mut self, chain: ChainId, height: u64) {
        match self.0.get_mut(&chain) {
            None => {
                self.0.insert(
                    chain,
                    AckStatus {
                        min_height: height,
                        count: 1,
                    },
                );
            }
            Some(rec) => {
                if height == rec.min_height + rec.count {
                    rec.count += 1;
                } else if height + 1 == rec.min_height {
                    rec.min_height = height;
                    rec.count += 1;
                }
            }
        }
    }

    /// Derive the acking height vector against the global vector.
    ///
    /// Only the height `global.min + k` per chain matters: a chain decides a
    /// finite value once its contiguous acking run covers that height, and
    /// decides `INFINITY` once it provably cannot (its acks start above the
    /// window, or it has produced more than `k` blocks without acking).
    fn acking_height_vector(&self, global: &StatusVector, k: u64) -> HeightVector {
        let mut ret = HeightVector::new();
        for (&chain, gs) in &global.0 {
            match self.0.get(&chain) {
                None => {
                    if gs.count > k {
                        ret.insert(chain, INFINITY);
                    }
                }
                Some(ls) => {
                    if ls.min_height <= gs.min_height + k {
                        if ls.min_height + ls.count - 1 >= gs.min_height + k {
                            ret.insert(chain, gs.min_height + k);
                        }
                    } else {
                        ret.insert(chain, INFINITY);
                    }
                }
            }
        }
        ret
    }

    /// Chains whose contiguous acking run reaches `global.min + k`.
    fn acking_node_set(&self, global: &StatusVector, k: u64) -> HashSet<ChainId> {
        let mut ret = HashSet::new();
        for (&chain, gs) in &global.0 {
            if let Some(ls) = self.0.get(&chain) {
                if ls.min_height + ls.count - 1 >= gs.min_height + k {
                    ret.insert(chain);
                }
            }
        }
        ret
    }
}

/// A batch of blocks leaving the engine as one ordering unit.
#[derive(Clone, Debug)]
pub struct DeliverSet {
    /// Delivered blocks in ascending hash order.
    pub blocks: Vec<Block>,
    /// Emitted under the early-delivery rule, before every chain reached
    /// `k + 1` consecutive acks.
    pub early: bool,
}

/// The total-ordering engine.
pub struct TotalOrdering {
    /// The `k` in k-level ordering: only height `global minimum + k` per
    /// chain is compared.
    k: u64,
    /// Supermajority threshold over chains.
    phi: u64,
    num_chains: u32,
    /// Blocks awaiting ordering, by hash.
    pendings: HashMap<BlockHash, Block>,
    /// Per-chain queues of pending hashes in ascending height order.
    chains: Vec<VecDeque<BlockHash>>,
    /// `acked[a]` is the set of pending hashes that transitively ack `a`.
    acked: HashMap<BlockHash, HashSet<BlockHash>>,
    /// Candidate blocks with their acking status vectors.
    candidates: HashMap<BlockHash, StatusVector>,
}

impl TotalOrdering {
    pub fn new(k: u64, phi: u64, num_chains: u32) -> Self {
        TotalOrdering {
            k,
            phi,
            num_chains,
            pendings: HashMap::new(),
            chains: (0..num_chains).map(|_| VecDeque::new()).collect(),
            acked: HashMap::new(),
            candidates: HashMap::new(),
        }
    }

    pub fn num_chains(&self) -> u32 {
        self.num_chains
    }

    /// Grow the engine to a wider lattice. Shrinking is not supported; a
    /// narrower width keeps the current one.
    pub fn resize(&mut self, num_chains: u32, phi: u64) {
        if num_chains as usize > self.chains.len() {
            self.chains.resize_with(num_chains as usize, VecDeque::new);
            self.num_chains = num_chains;
        }
        self.phi = phi;
    }

    /// Admit one block and return the deliver set it triggers, if any.
    ///
    /// Re-admitting a pending hash is a no-op. A block that does not extend
    /// its chain's pending sequence is rejected with [`OrderingError::NotValidDag`]
    /// and leaves the engine untouched.
    pub fn process_block(&mut self, block: Block) -> Result<Option<DeliverSet>, OrderingError> {
        if self.pendings.contains_key(&block.hash) {
            return Ok(None);
        }
        let chain = block.chain_id() as usize;
        if chain >= self.chains.len() {
            return Err(OrderingError::NotValidDag);
        }
        if let Some(tail) = self.chains[chain].back() {
            if self.pendings[tail].height() >= block.height() {
                return Err(OrderingError::NotValidDag);
            }
        }

        let hash = block.hash;
        self.chains[chain].push_back(hash);
        self.pendings.insert(hash, block);
        self.build_block_relation(hash);
        self.update_vectors(hash);
        if self.acks_only_delivered(&hash) {
            self.prepare_candidate(hash);
        }

        let (precedings, early) = self.select_deliver_set();
        if precedings.is_empty() {
            return Ok(None);
        }
        Ok(Some(DeliverSet {
            blocks: self.output(precedings),
            early,
        }))
    }

    /// Record `hash` into `acked[..]` of everything it transitively acks.
    ///
    /// Breadth-first with the `acked` membership itself as the visited set,
    /// so ack cycles and self-acks terminate.
    fn build_block_relation(&mut self, hash: BlockHash) {
        let mut queue = VecDeque::from([hash]);
        while let Some(cur) = queue.pop_front() {
            let acks = match self.pendings.get(&cur) {
                Some(b) => b.acks.clone(),
                None => continue,
            };
            for ack in acks {
                if !self.acked.entry(ack).or_default().insert(hash) {
                    continue;
                }
                if self.pendings.contains_key(&ack) {
                    queue.push_back(ack);
                }
            }
        }
    }

    /// Fold the new block into the status vector of every candidate it acks.
    fn update_vectors(&mut self, hash: BlockHash) {
        let (chain, height) = {
            let block = &self.pendings[&hash];
            (block.chain_id(), block.height())
        };
        let acked = &self.acked;
        for (candidate, vector) in self.candidates.iter_mut() {
            if acked.get(candidate).is_some_and(|s| s.contains(&hash)) {
                vector.add_block(chain, height);
            }
        }
    }

    /// A pending block is promotable once nothing it acks is still pending.
    /// Unknown hashes (delivered before this engine was seeded) don't block
    /// promotion; a self-ack does, permanently.
    fn acks_only_delivered(&self, hash: &BlockHash) -> bool {
        self.pendings[hash]
            .acks
            .iter()
            .all(|ack| !self.pendings.contains_key(ack))
    }

    /// Build the acking status vector for a freshly promoted candidate.
    ///
    /// The candidate is the oldest pending block on its chain, so its own
    /// chain contributes the whole queue. On every other chain, everything
    /// at or above the first acking block acks it through the parent chain.
    fn prepare_candidate(&mut self, hash: BlockHash) {
        let (own_chain, height) = {
            let block = &self.pendings[&hash];
            (block.chain_id(), block.height())
        };
        let mut vector = StatusVector::default();
        vector.0.insert(
            own_chain,
            AckStatus {
                min_height: height,
                count: self.chains[own_chain as usize].len() as u64,
            },
        );
        if let Some(ackers) = self.acked.get(&hash) {
            for (chain, queue) in self.chains.iter().enumerate() {
                if chain == own_chain as usize {
                    continue;
                }
                for (i, h) in queue.iter().enumerate() {
                    if ackers.contains(h) {
                        vector.0.insert(
                            chain as ChainId,
                            AckStatus {
                                min_height: self.pendings[h].height(),
                                count: (queue.len() - i) as u64,
                            },
                        );
                        break;
                    }
                }
            }
        }
        self.candidates.insert(hash, vector);
    }

    /// Global acking status vector: per chain, the oldest pending height and
    /// how many pending blocks the chain holds.
    fn global_vector(&self) -> StatusVector {
        let mut global = StatusVector::default();
        for (chain, queue) in self.chains.iter().enumerate() {
            if let Some(front) = queue.front() {
                global.0.insert(
                    chain as ChainId,
                    AckStatus {
                        min_height: self.pendings[front].height(),
                        count: queue.len() as u64,
                    },
                );
            }
        }
        global
    }

    /// Three-valued precedence comparison between two candidates' acking
    /// height vectors over the chain set `ans`:
    /// `1` — the first provably precedes the second;
    /// `0` — it provably cannot;
    /// `-1` — not yet decidable.
    fn grade(&self, ahv1: &HeightVector, ahv2: &HeightVector, ans: &HashSet<ChainId>) -> i32 {
        let mut count: u64 = 0;
        for chain in ans {
            let (Some(&h1), Some(&h2)) = (ahv1.get(chain), ahv2.get(chain)) else {
                continue;
            };
            if h1 != INFINITY && h1 < h2 {
                count += 1;
            }
        }
        let undecided_chains = self.num_chains as u64 - ans.len() as u64;
        if count >= self.phi {
            1
        } else if count + undecided_chains < self.phi {
            0
        } else {
            -1
        }
    }

    /// Compute the preceding set and decide whether it is deliverable now.
    ///
    /// With every chain holding at least `k + 1` consecutive pending blocks
    /// the window is fully revealed and the preceding set is final. Before
    /// that, delivery needs internal stability (each preceding strictly
    /// precedes every other candidate) and external stability (each
    /// preceding has more than `phi` decided-finite chains and an acking
    /// node set of at least `num_chains - phi`) — the early-delivery rule.
    fn select_deliver_set(&self) -> (HashSet<BlockHash>, bool) {
        if self.candidates.is_empty() {
            return (HashSet::new(), false);
        }
        let global = self.global_vector();
        let global_ans = global.acking_node_set(&global, self.k);
        let ahvs: HashMap<BlockHash, HeightVector> = self
            .candidates
            .iter()
            .map(|(hash, vector)| (*hash, vector.acking_height_vector(&global, self.k)))
            .collect();

        let mut precedings = HashSet::new();
        'candidate: for candidate in self.candidates.keys() {
            for other in self.candidates.keys() {
                if other == candidate {
                    continue;
                }
                if self.grade(&ahvs[other], &ahvs[candidate], &global_ans) != 0 {
                    continue 'candidate;
                }
            }
            precedings.insert(*candidate);
        }
        if precedings.is_empty() {
            return (precedings, false);
        }

        if global_ans.len() as u32 == self.num_chains {
            return (precedings, false);
        }

        // Internal stability.
        for candidate in self.candidates.keys() {
            if precedings.contains(candidate) {
                continue;
            }
            for preceding in &precedings {
                if self.grade(&ahvs[preceding], &ahvs[candidate], &global_ans) != 1 {
                    return (HashSet::new(), false);
                }
            }
        }
        // External stability.
        for preceding in &precedings {
            let decided = ahvs[preceding]
                .values()
                .filter(|&&h| h != INFINITY)
                .count() as u64;
            if decided <= self.phi {
                return (HashSet::new(), false);
            }
            let ans = self.candidates[preceding].acking_node_set(&global, self.k);
            if (ans.len() as u64) < (self.num_chains as u64).saturating_sub(self.phi) {
                return (HashSet::new(), false);
            }
        }
        (precedings, true)
    }

    /// Remove the preceding set from every working structure, emit it in
    /// ascending hash order, and promote chain heads that became eligible.
    fn output(&mut self, precedings: HashSet<BlockHash>) -> Vec<Block> {
        let mut delivered = Vec::with_capacity(precedings.len());
        for hash in &precedings {
            if let Some(block) = self.pendings.remove(hash) {
                let chain = block.chain_id() as usize;
                if self.chains[chain].front() == Some(hash) {
                    self.chains[chain].pop_front();
                }
                delivered.push(block);
            }
            self.acked.remove(hash);
            self.candidates.remove(hash);
        }
        delivered.sort_by(|a, b| a.hash.cmp(&b.hash));

        let heads: Vec<BlockHash> = self
            .chains
            .iter()
            .filter_map(|queue| queue.front().copied())
            .collect();
        for head in heads {
            if !self.candidates.contains_key(&head) && self.acks_only_delivered(&head) {
                self.prepare_candidate(head);
            }
        }
        delivered
    }
}
