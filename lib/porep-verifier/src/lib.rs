//! Production [`ProofVerification`] for the miner pallet.
//!
//! This crate works only as a facade separating the pallets from `rust-fil-proofs`,
//! nothing from `filecoin-proofs` leaks through its interface.
//!
//! Verification needs the Groth16 verifying keys of the seal proof to be present in the
//! `filecoin-proofs` parameter cache, see `FIL_PROOFS_PARAMETER_CACHE`.

use filecoin_proofs::{PoRepConfig, SectorShape2KiB};
use primitives_proofs::{
    ProofVerification, ProverId, RawCommitment, RegisteredSealProof, SectorNumber, Ticket,
};
use sp_runtime::DispatchError;
use storage_proofs_core::{api_version::ApiVersion, sector::SectorId};

#[derive(Debug, thiserror::Error)]
pub enum PoRepError {
    #[error("proof is {0} bytes long, expected {1}")]
    InvalidProofLength(usize, usize),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<PoRepError> for DispatchError {
    fn from(value: PoRepError) -> Self {
        match value {
            PoRepError::InvalidProofLength(..) => DispatchError::Other("invalid proof length"),
            PoRepError::Anyhow(_) => DispatchError::Other("porep verification failed"),
        }
    }
}

/// Verifies Proofs-of-Replication with `filecoin_proofs::verify_seal`.
pub struct FilecoinPoRepVerifier;

impl FilecoinPoRepVerifier {
    /// Checks a seal proof, returning `Ok(false)` when the proof has been checked and rejected.
    pub fn verify(
        prover_id: ProverId,
        seal_proof: RegisteredSealProof,
        comm_d: RawCommitment,
        comm_r: RawCommitment,
        ticket: Ticket,
        proof: &[u8],
        seed: Ticket,
        sector: SectorNumber,
    ) -> Result<bool, PoRepError> {
        let expected_length = proof_length(seal_proof);
        if proof.len() != expected_length {
            return Err(PoRepError::InvalidProofLength(proof.len(), expected_length));
        }

        let config = seal_to_config(seal_proof);
        let valid = match seal_proof {
            RegisteredSealProof::StackedDRG2KiBV1P1 => {
                filecoin_proofs::verify_seal::<SectorShape2KiB>(
                    &config,
                    comm_r,
                    comm_d,
                    prover_id,
                    SectorId::from(sector),
                    ticket,
                    seed,
                    proof,
                )?
            }
        };

        Ok(valid)
    }
}

impl ProofVerification for FilecoinPoRepVerifier {
    fn verify_porep(
        prover_id: ProverId,
        seal_proof: RegisteredSealProof,
        comm_d: RawCommitment,
        comm_r: RawCommitment,
        ticket: Ticket,
        proof: &[u8],
        seed: Ticket,
        sector: SectorNumber,
    ) -> Result<bool, DispatchError> {
        Self::verify(
            prover_id, seal_proof, comm_d, comm_r, ticket, proof, seed, sector,
        )
        .map_err(|err| {
            tracing::error!(sector, %err, "could not verify porep");
            DispatchError::from(err)
        })
    }
}

/// Size of a single Groth16 proof, a sector proof is made of one per partition.
const GROTH_PROOF_BYTES: usize = 192;

/// Reference:
/// * <https://github.com/filecoin-project/ref-fvm/blob/32583cc05aa422c8e1e7ba81d56a888ac9d90e61/shared/src/sector/registered_proof.rs#L90>
fn proof_length(seal_proof: RegisteredSealProof) -> usize {
    match seal_proof {
        // 1 partition
        RegisteredSealProof::StackedDRG2KiBV1P1 => GROTH_PROOF_BYTES,
    }
}

fn seal_to_config(seal_proof: RegisteredSealProof) -> PoRepConfig {
    match seal_proof {
        RegisteredSealProof::StackedDRG2KiBV1P1 => {
            // https://github.com/filecoin-project/rust-filecoin-proofs-api/blob/b44e7cecf2a120aa266b6886628e869ba67252af/src/registry.rs#L308
            let sector_size = seal_proof.sector_size().bytes();
            let porep_id = [0u8; 32];

            PoRepConfig::new_groth16(sector_size, porep_id, ApiVersion::V1_2_0)
        }
    }
}
