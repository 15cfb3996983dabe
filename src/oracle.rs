// The padding oracle: decrypt a compound ciphertext and report only whether
// the result carries valid PKCS#7 padding.
use rand::Rng;
use zeroize::Zeroizing;

use crate::{pkcs7_pad, pkcs7_unpad, BlockCipher, Cbc, CipherError};

/// Something that answers "does this ciphertext decrypt to validly padded
/// plaintext?" and nothing more.
///
/// Any failure of the underlying decryption, malformed input included, is
/// reported as a plain `false`.
pub trait PaddingOracle {
    fn padding_valid(&self, candidate: &[u8], block_size: usize) -> bool;
}

impl<F> PaddingOracle for F
where
    F: Fn(&[u8], usize) -> bool,
{
    fn padding_valid(&self, candidate: &[u8], block_size: usize) -> bool {
        self(candidate, block_size)
    }
}

/// Owns the secret cipher and exposes it as a padding oracle.
pub struct CbcPaddingOracle<C> {
    cbc: Cbc<C>,
}

impl<C: BlockCipher> CbcPaddingOracle<C> {
    pub fn new(cipher: C) -> Self {
        Self {
            cbc: Cbc::new(cipher),
        }
    }

    pub fn block_size(&self) -> usize {
        self.cbc.block_size()
    }

    /// Pad `message`, encrypt it under a fresh random IV, and return
    /// IV || ciphertext.
    pub fn pad_and_encrypt<R: Rng + ?Sized>(
        &self,
        message: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, CipherError> {
        let block_size = self.block_size();
        let pad_size =
            u8::try_from(block_size).map_err(|_| CipherError::UnsupportedBlockSize(block_size))?;
        let padded = Zeroizing::new(pkcs7_pad(message, pad_size));
        let mut iv = vec![0u8; block_size];
        rng.fill(iv.as_mut_slice());
        self.cbc.encrypt(&iv, &padded)
    }

    /// Decrypt IV || ciphertext and strip its padding.
    pub fn decrypt_and_unpad(
        &self,
        compound: &[u8],
        block_size: usize,
    ) -> Result<Vec<u8>, CipherError> {
        let pad_size =
            u8::try_from(block_size).map_err(|_| CipherError::UnsupportedBlockSize(block_size))?;
        let decrypted = Zeroizing::new(self.cbc.decrypt(compound)?);
        let message = pkcs7_unpad(&decrypted, pad_size)?;
        Ok(message.to_vec())
    }
}

impl<C: BlockCipher> PaddingOracle for CbcPaddingOracle<C> {
    fn padding_valid(&self, candidate: &[u8], block_size: usize) -> bool {
        let Ok(pad_size) = u8::try_from(block_size) else {
            return false;
        };
        match self.cbc.decrypt(candidate) {
            Ok(decrypted) => {
                let decrypted = Zeroizing::new(decrypted);
                pkcs7_unpad(&decrypted, pad_size).is_ok()
            }
            Err(_) => false,
        }
    }
}
