//! Capability traits connecting the consensus core to its collaborators.
//!
//! These are deliberately flat: the application, governance, and network
//! layers each expose a handful of methods and no hierarchy. The core never
//! calls back into them while holding its own lock beyond the duration of a
//! single notification.

use tokio::sync::mpsc;

use crate::types::{AgreementResult, Block, BlockHash, BlockRandomnessResult, Config};
use crate::Hash;

/// Notification surface for ordering output.
pub trait Application: Send + Sync {
    /// A deliver set was emitted; `hashes` are in final (ascending) order.
    /// `early` marks emission under the early-delivery rule.
    fn total_ordering_delivered(&self, hashes: Vec<BlockHash>, early: bool);

    /// A single block reached its final position in the total order.
    fn block_delivered(&self, block: &Block);
}

/// Debug variant of [`Application`] that additionally observes per-block
/// processing events before ordering.
pub trait DebugApplication: Application {
    /// A confirmed block was admitted into the lattice.
    fn block_confirmed(&self, block: &Block);
}

/// Read-only view of governance decisions.
///
/// Configurations must be available at least
/// [`crate::constants::CONFIG_ROUND_SHIFT`] rounds ahead of consumption.
pub trait Governance: Send + Sync {
    /// Configuration for `round`, or `None` if governance has not decided it.
    fn configuration(&self, round: u64) -> Option<Config>;

    /// Common random seed for `round`; the zero hash while not yet ready.
    fn crs(&self, round: u64) -> Hash;
}

/// Inbound consensus traffic, already verified by the transport layer.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    Block(Box<Block>),
    Agreement(AgreementResult),
    Randomness(BlockRandomnessResult),
}

/// Outbound requests toward the gossip layer. Inbound traffic arrives on an
/// [`mpsc::Receiver<NetworkEvent>`] handed to the consumer at construction.
pub trait Network: Send + Sync {
    /// Ask peers for blocks we have heard of but not yet received.
    fn pull_blocks(&self, hashes: Vec<BlockHash>);
}

/// Convenience alias for the inbound event stream.
pub type NetworkReceiver = mpsc::Receiver<NetworkEvent>;
