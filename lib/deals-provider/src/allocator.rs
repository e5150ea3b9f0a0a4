use std::sync::Mutex;

use async_trait::async_trait;
use primitives_commitment::piece::{PaddedPieceSize, PaddedPieceSizeError};
use primitives_proofs::{SectorNumber, SectorSize};

use crate::{
    deal::MinerDeal,
    node::{BoxError, SectorAllocator},
};

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("invalid piece size: {0}")]
    InvalidPieceSize(#[from] PaddedPieceSizeError),

    #[error("piece of {piece_size} bytes does not fit in a sector of {sector_size} bytes")]
    PieceTooLarge { piece_size: u64, sector_size: u64 },

    #[error("ran out of sector numbers")]
    SectorNumbersExhausted,
}

/// Assigns pieces to the first open sector with enough padded space left,
/// opening the next sector number when none fits.
pub struct BinPackingAllocator {
    sector_size: SectorSize,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    next_sector: SectorNumber,
    /// Open sectors and the amount of padded bytes already assigned to them.
    open: Vec<(SectorNumber, u64)>,
}

impl BinPackingAllocator {
    /// Creates an allocator whose first sector is `first_sector`.
    pub fn new(sector_size: SectorSize, first_sector: SectorNumber) -> Self {
        Self {
            sector_size,
            state: Mutex::new(AllocatorState {
                next_sector: first_sector,
                open: Vec::new(),
            }),
        }
    }

    pub fn allocate(&self, piece_size: u64) -> Result<SectorNumber, AllocationError> {
        let piece_size = *PaddedPieceSize::new(piece_size)?;
        let sector_size = *PaddedPieceSize::of_sector(self.sector_size);
        if piece_size > sector_size {
            return Err(AllocationError::PieceTooLarge {
                piece_size,
                sector_size,
            });
        }

        // The state is never left half-updated, so a poisoned lock is still usable.
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some((sector_number, used)) = state
            .open
            .iter_mut()
            .find(|(_, used)| *used + piece_size <= sector_size)
        {
            *used += piece_size;
            tracing::debug!(
                sector_number = *sector_number,
                used = *used,
                "piece added to an open sector"
            );
            return Ok(*sector_number);
        }

        let sector_number = state.next_sector;
        state.next_sector = sector_number
            .checked_add(1)
            .ok_or(AllocationError::SectorNumbersExhausted)?;
        // Full sectors are not kept around.
        state.open.retain(|(_, used)| *used < sector_size);
        state.open.push((sector_number, piece_size));
        tracing::debug!(sector_number, used = piece_size, "opened sector");

        Ok(sector_number)
    }
}

#[async_trait]
impl SectorAllocator for BinPackingAllocator {
    async fn on_deal_complete(&self, deal: &MinerDeal) -> Result<SectorNumber, BoxError> {
        Ok(self.allocate(deal.proposal.piece_size)?)
    }
}

#[cfg(test)]
mod tests {
    use primitives_proofs::SectorSize;

    use super::{AllocationError, BinPackingAllocator};

    #[test]
    fn packs_pieces_into_open_sectors() {
        let allocator = BinPackingAllocator::new(SectorSize::_2KiB, 1);

        assert_eq!(allocator.allocate(1024).unwrap(), 1);
        assert_eq!(allocator.allocate(2048).unwrap(), 2);
        assert_eq!(allocator.allocate(512).unwrap(), 1);
        assert_eq!(allocator.allocate(1024).unwrap(), 3);
        // Sector 1 still has room for it.
        assert_eq!(allocator.allocate(512).unwrap(), 1);
        assert_eq!(allocator.allocate(1024).unwrap(), 3);
        assert_eq!(allocator.allocate(128).unwrap(), 4);
    }

    #[test]
    fn rejects_invalid_pieces() {
        let allocator = BinPackingAllocator::new(SectorSize::_2KiB, 1);

        assert!(matches!(
            allocator.allocate(4096),
            Err(AllocationError::PieceTooLarge {
                piece_size: 4096,
                sector_size: 2048
            })
        ));
        assert!(matches!(
            allocator.allocate(1000),
            Err(AllocationError::InvalidPieceSize(_))
        ));
        // Rejected pieces do not open a sector.
        assert_eq!(allocator.allocate(2048).unwrap(), 1);
    }
}
