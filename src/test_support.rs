// Test doubles shared between the module tests.
use crate::BlockCipher;

const MUL: u8 = 167;
const MUL_INV: u8 = 23;
const ROUNDS: usize = 2;

/// A keyed byte-mixing permutation with an `N` byte block.
///
/// It has no cryptographic strength. It exists to give the CBC and cracker
/// tests a block size other than AES's 16 bytes.
pub struct ToyCipher<const N: usize> {
    key: [u8; N],
}

impl<const N: usize> ToyCipher<N> {
    pub fn new(key: [u8; N]) -> Self {
        Self { key }
    }
}

impl<const N: usize> BlockCipher for ToyCipher<N> {
    fn block_size(&self) -> usize {
        N
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        for _ in 0..ROUNDS {
            for (i, byte) in block.iter_mut().enumerate() {
                *byte = (*byte ^ self.key[i]).wrapping_mul(MUL).wrapping_add(i as u8);
            }
            for i in 1..N {
                block[i] ^= block[i - 1];
            }
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        for _ in 0..ROUNDS {
            for i in (1..N).rev() {
                block[i] ^= block[i - 1];
            }
            for (i, byte) in block.iter_mut().enumerate() {
                *byte = byte.wrapping_sub(i as u8).wrapping_mul(MUL_INV) ^ self.key[i];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toy_cipher_round_trips() {
        let cipher = ToyCipher::new(*b"k3y!k3y?");
        let mut block = *b"abcdefgh";

        cipher.encrypt_block(&mut block);
        assert_ne!(&block, b"abcdefgh");
        cipher.decrypt_block(&mut block);

        assert_eq!(&block, b"abcdefgh");
    }
}
