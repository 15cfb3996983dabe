mod aes;
mod cbc;
mod crack;
mod error;
mod oracle;
mod pkcs7;
#[cfg(test)]
mod test_support;

pub use aes::{random_key, Aes128, AES_BLOCK_SIZE};
pub use cbc::{BlockCipher, Cbc};
pub use crack::{crack, CrackOptions, CrackResult, Cracker};
pub use error::{CipherError, CrackError, PaddingError};
pub use oracle::{CbcPaddingOracle, PaddingOracle};
pub use pkcs7::{pkcs7_pad, pkcs7_unpad};
