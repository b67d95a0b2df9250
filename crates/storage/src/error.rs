use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Engine(String),
    #[error(transparent)]
    Decode(#[from] rlp::DecoderError),
    #[error("unsupported sync state format version {0}")]
    UnsupportedFormat(u8),
    #[error("missing data for block {0}")]
    MissingBlock(u64),
}
