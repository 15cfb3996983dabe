use thiserror::Error;

/// The single reject signal of the padding check.
///
/// It deliberately carries no detail about which check failed, as that
/// would leak more than a padding oracle is supposed to.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PaddingError {
    #[error("invalid padding")]
    InvalidPadding,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("message length {len} is not a positive multiple of the block size {block_size}")]
    InvalidLength { len: usize, block_size: usize },
    #[error("block size {0} cannot be expressed in a PKCS#7 padding byte")]
    UnsupportedBlockSize(usize),
    #[error("initialization vector must be {expected} bytes, got {actual}")]
    InvalidIv { expected: usize, actual: usize },
    #[error(transparent)]
    Padding(#[from] PaddingError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrackError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("oracle accepted no guess for byte {position} of block {block}")]
    OracleInconsistency { block: usize, position: usize },
    #[error("recovered plaintext is not validly padded")]
    RecoveredPaddingInvalid(#[from] PaddingError),
    #[error("crack cancelled after {calls} oracle calls")]
    Cancelled { calls: usize },
}
