// Copyright (c) 2022-2023 The MobileCoin Foundation

use calypso_apdu::response::CardStatus;

/// Transaction errors
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error {
    /// Argument outside of its allowed range
    #[error("{name} out of range ({value} not in {min}..={max})")]
    ArgumentRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation not allowed in the current state
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Operation not supported by the card, crypto module or transaction profile
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Communication with the reader failed
    #[error("reader communication failed: {0}")]
    ReaderIo(String),

    /// Communication with the card failed
    #[error("card communication failed: {0}")]
    CardIo(String),

    /// Communication with the crypto module failed
    #[error("crypto module communication failed: {0}")]
    CryptoIo(String),

    /// Card returned an unexpected status
    #[error("unexpected card status for {command}: {status}")]
    UnexpectedCardStatus {
        command: &'static str,
        status: CardStatus,
    },

    /// Crypto module returned an unexpected status
    #[error("unexpected crypto module status for {operation}: {status:04x}")]
    UnexpectedCryptoStatus {
        operation: &'static str,
        status: u16,
    },

    /// Response inconsistent with the request or previous responses
    #[error("inconsistent data: {0}")]
    InconsistentData(String),

    /// Session or SV key not authorized by the security setting
    #[error("unauthorized key (kif: {kif:02x?}, kvc: {kvc:02x})")]
    UnauthorizedKey { kif: Option<u8>, kvc: u8 },

    /// Crypto module unavailable while checking an intermediate session signature
    #[error("card signature could not be verified: {0}")]
    CardSignatureNotVerifiable(String),

    /// Card signature rejected
    #[error("invalid {0} card signature")]
    InvalidCardSignature(&'static str),

    /// Selected file not found
    #[error("file not found: {0}")]
    SelectFileNotFound(String),

    /// Session modifications buffer exhausted
    #[error("session buffer overflow ({required} required, {available} available)")]
    SessionBufferOverflow { required: usize, available: usize },
}

/// Card reader errors
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ReaderError {
    /// Reader unavailable or disconnected
    #[error("reader: {0}")]
    Reader(String),

    /// Card removed or not responding
    #[error("card: {0}")]
    Card(String),
}

/// Crypto module errors
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum CryptoError {
    /// Crypto module unavailable or not responding
    #[error("crypto module: {0}")]
    Io(String),

    /// Crypto module rejected an operation
    #[error("{operation} failed with status {status:04x}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
    },
}

impl From<ReaderError> for Error {
    fn from(e: ReaderError) -> Self {
        match e {
            ReaderError::Reader(s) => Error::ReaderIo(s),
            ReaderError::Card(s) => Error::CardIo(s),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Io(s) => Error::CryptoIo(s),
            CryptoError::UnexpectedStatus { operation, status } => {
                Error::UnexpectedCryptoStatus { operation, status }
            }
        }
    }
}

/// Check an argument is within `min..=max`
pub(crate) fn check_range(
    name: &'static str,
    value: impl Into<i64>,
    min: impl Into<i64>,
    max: impl Into<i64>,
) -> Result<(), Error> {
    let (value, min, max) = (value.into(), min.into(), max.into());

    match value >= min && value <= max {
        true => Ok(()),
        false => Err(Error::ArgumentRange {
            name,
            value,
            min,
            max,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_checks() {
        assert_eq!(check_range("sfi", 30u8, 0u8, 30u8), Ok(()));
        assert_eq!(
            check_range("sfi", 31u8, 0u8, 30u8),
            Err(Error::ArgumentRange {
                name: "sfi",
                value: 31,
                min: 0,
                max: 30
            })
        );
        assert!(check_range("amount", -8388609i32, -8388608i32, 8388607i32).is_err());
    }

    #[test]
    fn io_error_mapping() {
        assert_eq!(
            Error::from(ReaderError::Card("removed".into())),
            Error::CardIo("removed".into())
        );
        assert_eq!(
            Error::from(CryptoError::Io("timeout".into())),
            Error::CryptoIo("timeout".into())
        );
    }
}
