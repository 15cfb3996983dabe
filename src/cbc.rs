// Cipher block chaining over any block cipher
use crate::CipherError;

/// A keyed block cipher transforming one block in place.
///
/// Callers always pass slices of exactly `block_size()` bytes.
pub trait BlockCipher {
    fn block_size(&self) -> usize;

    fn encrypt_block(&self, block: &mut [u8]);

    fn decrypt_block(&self, block: &mut [u8]);
}

/// CBC mode over an owned block cipher.
///
/// Ciphertexts handled here are "compound": the IV travels as the first
/// block, followed by the encrypted blocks.
#[derive(Clone)]
pub struct Cbc<C> {
    cipher: C,
}

impl<C: BlockCipher> Cbc<C> {
    pub fn new(cipher: C) -> Self {
        Self { cipher }
    }

    pub fn block_size(&self) -> usize {
        self.cipher.block_size()
    }

    /// Encrypt an already padded message, returning IV || ciphertext.
    pub fn encrypt(&self, iv: &[u8], padded: &[u8]) -> Result<Vec<u8>, CipherError> {
        let block_size = self.block_size();
        if iv.len() != block_size {
            return Err(CipherError::InvalidIv {
                expected: block_size,
                actual: iv.len(),
            });
        }
        if padded.is_empty() || padded.len() % block_size != 0 {
            return Err(CipherError::InvalidLength {
                len: padded.len(),
                block_size,
            });
        }

        let mut out = Vec::with_capacity(iv.len() + padded.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(padded);
        // Each block is XORed with the ciphertext block before it, the IV
        // being the ciphertext "block" before the first one.
        for start in (block_size..out.len()).step_by(block_size) {
            let (previous, rest) = out.split_at_mut(start);
            let block = &mut rest[..block_size];
            xor_in_place(block, &previous[start - block_size..]);
            self.cipher.encrypt_block(block);
        }
        Ok(out)
    }

    /// Decrypt IV || ciphertext, returning the still padded plaintext.
    pub fn decrypt(&self, compound: &[u8]) -> Result<Vec<u8>, CipherError> {
        let block_size = self.block_size();
        if compound.len() < 2 * block_size || compound.len() % block_size != 0 {
            return Err(CipherError::InvalidLength {
                len: compound.len(),
                block_size,
            });
        }

        let mut plaintext = compound[block_size..].to_vec();
        for (block, previous) in plaintext
            .chunks_exact_mut(block_size)
            .zip(compound.chunks_exact(block_size))
        {
            self.cipher.decrypt_block(block);
            xor_in_place(block, previous);
        }
        Ok(plaintext)
    }
}

fn xor_in_place(target: &mut [u8], other: &[u8]) {
    target
        .iter_mut()
        .zip(other)
        .for_each(|(t, o)| *t ^= o);
}
