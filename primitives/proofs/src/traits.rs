use sp_runtime::{DispatchError, DispatchResult};

use crate::types::{ProverId, RawCommitment, RegisteredSealProof, SectorDeal, SectorNumber, Ticket};

/// Represents functions that are provided by the Market Pallet.
pub trait Market<AccountId, BlockNumber> {
    /// Verifies a given set of storage deals is valid for a sector being PreCommitted.
    /// Computes the UnsealedCID (CommD) of the sector, deal pieces padded up to the sector size.
    /// A sector without deals gets the zero data commitment.
    fn verify_deals_for_activation(
        storage_provider: &AccountId,
        sector_deal: SectorDeal,
    ) -> Result<RawCommitment, DispatchError>;

    /// Activates the deals of a proven sector.
    /// Deals are activated as a group, if one of them cannot be activated, none is.
    fn activate_deals(storage_provider: &AccountId, sector_deal: SectorDeal) -> DispatchResult;
}

/// Entrypoint for proof verification.
///
/// `Ok(false)` means the proof has been checked and rejected,
/// `Err` means it could not be checked at all (e.g. malformed inputs).
pub trait ProofVerification {
    fn verify_porep(
        prover_id: ProverId,
        seal_proof: RegisteredSealProof,
        comm_d: RawCommitment,
        comm_r: RawCommitment,
        ticket: Ticket,
        proof: &[u8],
        seed: Ticket,
        sector: SectorNumber,
    ) -> Result<bool, DispatchError>;
}

/// Represents functions that are provided by a Randomness source.
pub trait Randomness<BlockNumber> {
    fn get_randomness(block_number: BlockNumber) -> Result<[u8; 32], DispatchError>;
}
