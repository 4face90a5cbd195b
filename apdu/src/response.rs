// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Typed card responses

use std::fmt::Display;

use crate::{
    audit::ApduExchange,
    file::{DirectoryHeader, FileHeader},
    sv::SvGetData,
};

/// Card status, decoded from the response status word by the reader
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CardStatus {
    /// Command successful
    Success,
    /// File, record, counter or offset not found
    NotFound,
    /// Security conditions not satisfied
    SecurityNotSatisfied,
    /// Incorrect PIN, remaining attempts
    PinIncorrect(u8),
    /// PIN blocked
    PinBlocked,
    /// Any other status word
    Other(u16),
}

impl Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NotFound => write!(f, "not found"),
            Self::SecurityNotSatisfied => write!(f, "security conditions not satisfied"),
            Self::PinIncorrect(n) => write!(f, "incorrect PIN ({} attempts remaining)", n),
            Self::PinBlocked => write!(f, "PIN blocked"),
            Self::Other(sw) => write!(f, "status {:04x}", sw),
        }
    }
}

impl CardStatus {
    /// Decode a status word
    pub fn from_sw(sw: u16) -> Self {
        match sw {
            0x9000 => Self::Success,
            0x6a82 | 0x6a83 | 0x6b00 => Self::NotFound,
            0x6982 => Self::SecurityNotSatisfied,
            0x6983 => Self::PinBlocked,
            0x63c0..=0x63cf => Self::PinIncorrect((sw & 0x0f) as u8),
            _ => Self::Other(sw),
        }
    }

    /// Encode to a status word
    pub fn sw(&self) -> u16 {
        match self {
            Self::Success => 0x9000,
            Self::NotFound => 0x6a83,
            Self::SecurityNotSatisfied => 0x6982,
            Self::PinIncorrect(n) => 0x63c0 | (*n as u16 & 0x0f),
            Self::PinBlocked => 0x6983,
            Self::Other(sw) => *sw,
        }
    }
}

/// Secure session opening data
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SessionOpening {
    /// Card challenge
    pub card_challenge: Vec<u8>,
    /// Previous session was ratified
    pub ratified: bool,
    /// Session key identifier, when returned by the card
    pub kif: Option<u8>,
    /// Session key version, when returned by the card
    pub kvc: Option<u8>,
    /// Card transaction counter
    pub transaction_counter: u32,
    /// Record read in the opening exchange, when requested
    pub record: Option<Vec<u8>>,
    /// Raw opening data, used to initialise the session MAC
    pub data: Vec<u8>,
}

/// Decoded response content
#[derive(Clone, PartialEq, Debug, Default)]
pub enum ResponseData {
    /// No response data
    #[default]
    None,
    /// Selected or described EF
    File { sfi: u8, header: FileHeader },
    /// Selected or described DF
    Directory(DirectoryHeader),
    /// EF list, `(sfi, header)`
    EfList(Vec<(u8, FileHeader)>),
    /// Traceability information
    Traceability(Vec<u8>),
    /// Record content (or partial content), `(record_number, data)`
    Records(Vec<(u8, Vec<u8>)>),
    /// Binary content
    Binary(Vec<u8>),
    /// Search results
    Search {
        matching: Vec<u8>,
        first_record: Option<Vec<u8>>,
    },
    /// New counter values, `(counter_number, value)`
    Counters(Vec<(u8, u32)>),
    /// Card challenge
    Challenge(Vec<u8>),
    /// SV status
    SvStatus(SvGetData),
    /// Card SV signature following reload / debit
    SvSignature(Vec<u8>),
    /// Secure session opened
    SessionOpened(SessionOpening),
    /// Session management response, with card MAC when authentication was requested
    SessionManaged { card_mac: Option<Vec<u8>> },
    /// Secure session closed
    SessionClosed { card_mac: Vec<u8> },
}

/// Card response, one per exchange
#[derive(Clone, PartialEq, Debug)]
pub struct CardResponse {
    pub status: CardStatus,
    pub data: ResponseData,
    /// Raw exchange for audit and session MAC computation
    pub exchange: ApduExchange,
}

impl CardResponse {
    pub fn new(status: CardStatus, data: ResponseData, exchange: ApduExchange) -> Self {
        Self {
            status,
            data,
            exchange,
        }
    }

    /// Check whether the card reported success
    pub fn is_success(&self) -> bool {
        self.status == CardStatus::Success
    }
}
