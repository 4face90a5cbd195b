// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Transaction audit records

use std::fmt::Display;

/// Raw APDU exchange, as reported by the reader or crypto module
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ApduExchange {
    /// Raw command APDU
    pub request: Vec<u8>,
    /// Raw response APDU, including status word
    pub response: Vec<u8>,
}

impl ApduExchange {
    pub fn new(request: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
        }
    }
}

impl Display for ApduExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}",
            hex::encode(&self.request),
            hex::encode(&self.response)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_hex() {
        let e = ApduExchange::new([0x00, 0xb2, 0x01, 0x3c], [0x90, 0x00]);
        assert_eq!(e.to_string(), "00b2013c -> 9000");
    }
}
