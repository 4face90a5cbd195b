// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Typed card requests
//!
//! Each [CardRequest] maps to exactly one physical APDU exchange with the card.

use std::fmt::Debug;

use strum::{Display, IntoStaticStr};

use crate::{
    access::WriteAccessLevel,
    file::{GetDataTag, SelectTarget},
    sv::{SvOperation, SvSecurity},
};

/// PIN payload for verify / change PIN commands
#[derive(Clone, PartialEq, Eq)]
pub enum PinData {
    /// No PIN, query the presentation status only
    Status,
    /// Plain PIN
    Plain([u8; 4]),
    /// PIN block ciphered by the crypto module
    Ciphered(Vec<u8>),
}

/// PIN values are not logged
impl Debug for PinData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status => write!(f, "Status"),
            Self::Plain(_) => write!(f, "Plain(****)"),
            Self::Ciphered(d) => write!(f, "Ciphered({} bytes)", d.len()),
        }
    }
}

/// Search record multiple parameters
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SearchRequest {
    pub sfi: u8,
    /// First record to search
    pub start: u8,
    /// Offset of the compared data within each record
    pub offset: u8,
    /// Compare at every offset from `offset` to the end of the record
    pub repeated_offset: bool,
    pub data: Vec<u8>,
    /// Bit mask applied to record content, `0xFF` padded to the data length
    pub mask: Vec<u8>,
    /// Return the content of the first matching record
    pub fetch_first: bool,
}

/// Calypso card request, one per APDU exchange
#[derive(Clone, PartialEq, Debug, Display, IntoStaticStr)]
pub enum CardRequest {
    /// Select a file by LID or navigation control
    SelectFile { target: SelectTarget },

    /// Read a data object
    GetData { tag: GetDataTag },

    /// Read a single record
    ReadRecord {
        sfi: u8,
        record_number: u8,
        /// Expected record length, when known
        expected_length: Option<u8>,
    },

    /// Read consecutive records in one exchange
    ReadRecords {
        sfi: u8,
        first: u8,
        last: u8,
        record_size: u8,
    },

    /// Read part of consecutive records
    ReadRecordMultiple {
        sfi: u8,
        first: u8,
        last: u8,
        offset: u8,
        length: u8,
    },

    /// Read bytes from a binary EF
    ReadBinary { sfi: u8, offset: u16, length: u8 },

    /// Search records matching the provided data
    SearchRecordMultiple(SearchRequest),

    AppendRecord { sfi: u8, data: Vec<u8> },

    UpdateRecord {
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    },

    /// Write (binary OR) a record
    WriteRecord {
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    },

    UpdateBinary { sfi: u8, offset: u16, data: Vec<u8> },

    /// Write (binary OR) bytes into a binary EF
    WriteBinary { sfi: u8, offset: u16, data: Vec<u8> },

    Increase { sfi: u8, counter: u8, value: u32 },

    Decrease { sfi: u8, counter: u8, value: u32 },

    /// Increase several counters of the same EF
    IncreaseMultiple { sfi: u8, counters: Vec<(u8, u32)> },

    /// Decrease several counters of the same EF
    DecreaseMultiple { sfi: u8, counters: Vec<(u8, u32)> },

    /// Fetch a card challenge
    GetChallenge,

    /// Present the PIN, or fetch its status
    VerifyPin { pin: PinData },

    ChangePin { pin: PinData },

    /// Load a new key, ciphered by the crypto module
    ChangeKey { key_index: u8, ciphered_key: Vec<u8> },

    /// Fetch SV status for the provided operation
    SvGet {
        operation: SvOperation,
        extended_log: bool,
    },

    SvReload {
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
        security: SvSecurity,
    },

    /// SV debit or undebit
    SvDebit {
        undo: bool,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        security: SvSecurity,
    },

    /// Invalidate the current DF
    Invalidate,

    /// Rehabilitate the current DF
    Rehabilitate,

    /// Open a secure session, optionally reading one record
    OpenSecureSession {
        level: WriteAccessLevel,
        terminal_challenge: Vec<u8>,
        /// Record to read in the same exchange, `(sfi, record_number)`
        read: Option<(u8, u8)>,
        extended: bool,
    },

    /// Extended mode session management (early authentication, encryption)
    ManageSecureSession {
        authenticate: bool,
        /// Activate (`Some(true)`) or deactivate (`Some(false)`) encryption
        encryption: Option<bool>,
        terminal_mac: Option<Vec<u8>>,
    },

    CloseSecureSession {
        terminal_mac: Vec<u8>,
        /// Ratify in the close exchange instead of a following ratification command
        ratify_now: bool,
    },

    /// Abort the current session, discarding pending modifications
    CancelSecureSession,

    /// Ratification command sent after a deferred ratification close
    Ratification,
}

impl CardRequest {
    /// Fetch the request name for logging and error reporting
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Check whether the request modifies card content
    pub fn is_modifying(&self) -> bool {
        use CardRequest::*;

        matches!(
            self,
            AppendRecord { .. }
                | UpdateRecord { .. }
                | WriteRecord { .. }
                | UpdateBinary { .. }
                | WriteBinary { .. }
                | Increase { .. }
                | Decrease { .. }
                | IncreaseMultiple { .. }
                | DecreaseMultiple { .. }
                | SvReload { .. }
                | SvDebit { .. }
                | Invalidate
                | Rehabilitate
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_names() {
        let r = CardRequest::ReadRecord {
            sfi: 7,
            record_number: 1,
            expected_length: None,
        };
        assert_eq!(r.name(), "ReadRecord");
        assert_eq!(r.to_string(), "ReadRecord");
        assert!(!r.is_modifying());

        let w = CardRequest::AppendRecord {
            sfi: 8,
            data: vec![0u8; 4],
        };
        assert!(w.is_modifying());
    }

    #[test]
    fn pin_redacted() {
        let p = CardRequest::VerifyPin {
            pin: PinData::Plain(*b"1234"),
        };
        let s = format!("{:?}", p);

        assert!(s.contains("****"));
        assert!(!s.contains("1234"));
        assert!(!s.contains("49, 50"));
    }
}
