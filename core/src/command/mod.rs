// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Prepared commands and the command queue

use std::{collections::BTreeMap, fmt::Debug};

use strum::IntoStaticStr;
use zeroize::Zeroize;

use calypso_apdu::{
    access::WriteAccessLevel,
    file::{GetDataTag, SelectTarget},
    sv::{SvAction, SvOperation},
    PIN_LENGTH,
};

use crate::{crypto::KeyReference, error::Error};

mod queue;
pub use queue::CommandQueue;

mod search;
pub use search::SearchCommandData;

/// Read mode, fixed when a read command is prepared
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReadMode {
    /// Prepared inside a secure session, missing data is an error
    Strict,
    /// Prepared outside a secure session, missing data is skipped
    BestEffort,
}

/// Outcome of a read command
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReadOutcome {
    /// Data read and stored in the card snapshot
    Read,
    /// Target missing, tolerated in best-effort mode
    NotFound,
}

/// PIN value, wiped on drop
#[derive(Clone, PartialEq, Eq)]
pub struct Pin([u8; PIN_LENGTH]);

impl Pin {
    /// Create a PIN from a 4-byte value
    pub fn new(b: &[u8]) -> Result<Self, Error> {
        let mut p = [0u8; PIN_LENGTH];

        if b.len() != PIN_LENGTH {
            return Err(Error::ArgumentRange {
                name: "pin length",
                value: b.len() as i64,
                min: PIN_LENGTH as i64,
                max: PIN_LENGTH as i64,
            });
        }
        p.copy_from_slice(b);

        Ok(Self(p))
    }

    pub fn as_bytes(&self) -> &[u8; PIN_LENGTH] {
        &self.0
    }
}

impl Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pin(****)")
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Card command awaiting processing
#[derive(Clone, PartialEq, Debug, IntoStaticStr)]
pub enum PreparedCommand {
    SelectFile(SelectTarget),
    GetData(GetDataTag),

    /// Single record read, may be merged with a session opening
    ReadRecord {
        sfi: u8,
        record_number: u8,
        mode: ReadMode,
    },
    ReadRecords {
        sfi: u8,
        first: u8,
        last: u8,
        record_size: u8,
        mode: ReadMode,
    },
    ReadRecordsPartially {
        sfi: u8,
        first: u8,
        last: u8,
        offset: u8,
        length: u8,
        mode: ReadMode,
    },
    ReadBinary {
        sfi: u8,
        offset: u16,
        length: u16,
        mode: ReadMode,
    },
    /// Counters EF read (record 1), may be merged with a session opening
    ReadCounters {
        sfi: u8,
        count: u8,
        mode: ReadMode,
    },
    SearchRecords(SearchCommandData),
    CheckPinStatus,

    AppendRecord {
        sfi: u8,
        data: Vec<u8>,
    },
    UpdateRecord {
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    },
    WriteRecord {
        sfi: u8,
        record_number: u8,
        data: Vec<u8>,
    },
    UpdateBinary {
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    },
    WriteBinary {
        sfi: u8,
        offset: u16,
        data: Vec<u8>,
    },
    IncreaseCounter {
        sfi: u8,
        counter: u8,
        value: u32,
    },
    DecreaseCounter {
        sfi: u8,
        counter: u8,
        value: u32,
    },
    IncreaseCounters {
        sfi: u8,
        counters: BTreeMap<u8, u32>,
    },
    DecreaseCounters {
        sfi: u8,
        counters: BTreeMap<u8, u32>,
    },

    SvGet {
        operation: SvOperation,
        action: SvAction,
    },
    SvReload {
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
    },
    SvDebit {
        action: SvAction,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    },

    Invalidate,
    Rehabilitate,

    VerifyPin(Pin),
    ChangePin(Pin),
    ChangeKey {
        key_index: u8,
        issuer: KeyReference,
        target: KeyReference,
    },

    OpenSession {
        level: WriteAccessLevel,
        pre_open: bool,
    },
    CloseSession,
    CancelSession,

    EarlyMutualAuthentication,
    ActivateEncryption,
    DeactivateEncryption,
}

impl PreparedCommand {
    /// Fetch the command name for logging and error reporting
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Check whether the command modifies card content
    pub fn is_modifying(&self) -> bool {
        use PreparedCommand::*;

        matches!(
            self,
            AppendRecord { .. }
                | UpdateRecord { .. }
                | WriteRecord { .. }
                | UpdateBinary { .. }
                | WriteBinary { .. }
                | IncreaseCounter { .. }
                | DecreaseCounter { .. }
                | IncreaseCounters { .. }
                | DecreaseCounters { .. }
                | SvReload { .. }
                | SvDebit { .. }
                | Invalidate
                | Rehabilitate
        )
    }

    /// Check whether the command is an SV reload or debit
    pub fn is_sv_modifying(&self) -> bool {
        matches!(self, Self::SvReload { .. } | Self::SvDebit { .. })
    }

    /// Single record read that may be merged with a session opening,
    /// `(sfi, record_number)`
    pub fn mergeable_read(&self) -> Option<(u8, u8)> {
        match self {
            Self::ReadRecord {
                sfi, record_number, ..
            } => Some((*sfi, *record_number)),
            Self::ReadCounters { sfi, .. } => Some((*sfi, 1)),
            _ => None,
        }
    }
}
