//! Static configuration of the validator machine.
use frostnode_protocol::{
    group_id, merkle, Address, GroupId, Hash32, Parameters,
    Participant,
};

/// Blocks per epoch at five-second blocks, roughly one day.
pub const BLOCKS_PER_EPOCH: u64 = (24 * 60 * 60) / 5;

/// Default round timeout in blocks, roughly ten minutes.
pub const DEFAULT_TIMEOUT: u64 = (10 * 60) / 5;

/// Configuration of a validator machine instance.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Default roster new groups are generated from.
    pub participants: Vec<Participant>,
    /// Account of the local validator.
    pub local_address: Address,
    /// Chain the consensus core lives on.
    pub chain_id: u64,
    /// Address of the consensus core contract.
    pub consensus: Address,
    /// Blocks per epoch.
    pub blocks_per_epoch: u64,
    /// Deadline in blocks for each key generation round.
    pub key_gen_timeout: u64,
    /// Deadline in blocks for each signing step.
    pub signing_timeout: u64,
    /// Context value the genesis group id is derived with.
    pub genesis_context: Hash32,
}

impl MachineConfig {
    /// Configuration with the default epoch length and timeouts.
    pub fn new(
        participants: Vec<Participant>,
        local_address: Address,
        chain_id: u64,
        consensus: Address,
    ) -> Self {
        Self {
            participants,
            local_address,
            chain_id,
            consensus,
            blocks_per_epoch: BLOCKS_PER_EPOCH,
            key_gen_timeout: DEFAULT_TIMEOUT,
            signing_timeout: DEFAULT_TIMEOUT,
            genesis_context: Hash32::default(),
        }
    }

    /// Indices of the default roster in canonical order.
    pub fn default_signers(&self) -> Vec<u16> {
        let mut signers: Vec<u16> =
            self.participants.iter().map(|p| p.index).collect();
        signers.sort_unstable();
        signers
    }

    /// Epoch a block belongs to.
    pub fn epoch_at(&self, block: u64) -> u64 {
        block / self.blocks_per_epoch
    }

    /// First block of an epoch.
    pub fn rollover_block(&self, epoch: u64) -> u64 {
        epoch.saturating_mul(self.blocks_per_epoch)
    }

    /// Parameters of a group generated from the default roster.
    pub fn genesis_parameters(&self) -> Parameters {
        Parameters::for_roster(self.participants.len() as u16)
    }

    /// Group id the genesis key generation must announce.
    pub fn genesis_group_id(&self) -> GroupId {
        let parameters = self.genesis_parameters();
        group_id(
            &merkle::participants_root(&self.participants),
            parameters.count,
            parameters.threshold,
            &self.genesis_context,
        )
    }
}
