use thiserror::Error;

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected byte {0:?}")]
    UnexpectedByte(u8),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("trailing data after value")]
    TrailingData,
}
