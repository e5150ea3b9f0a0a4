extern crate alloc;
use alloc::vec::Vec;

use sp_core::blake2_256;

/// Clears the two top bits of the last byte, keeping the value inside the BLS12-381 scalar field.
const FR_MASK: u8 = 0x3f;

/// What a draw of randomness is used for, two uses of the same block never collide.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
pub enum DomainSeparationTag {
    SealRandomness,
    InteractiveSealChallengeSeed,
}

impl DomainSeparationTag {
    fn value(self) -> i64 {
        match self {
            Self::SealRandomness => 1,
            Self::InteractiveSealChallengeSeed => 2,
        }
    }

    /// Big-endian encoding of the tag, as hashed by [`draw_randomness`].
    pub fn as_bytes(&self) -> [u8; 8] {
        self.value().to_be_bytes()
    }
}

/// Derives the sealing ticket or the interactive seed from the randomness of `block_number`.
///
/// The preimage is `tag || rbase || block_number || entropy`, numbers big-endian.
/// `entropy` binds the result to a single storage provider.
pub fn draw_randomness(
    rbase: &[u8; 32],
    pers: DomainSeparationTag,
    block_number: u64,
    entropy: &[u8],
) -> [u8; 32] {
    let preimage: Vec<u8> = pers
        .as_bytes()
        .iter()
        .chain(rbase)
        .chain(&block_number.to_be_bytes())
        .chain(entropy)
        .copied()
        .collect();

    let mut drawn = blake2_256(&preimage);
    drawn[31] &= FR_MASK;
    drawn
}
