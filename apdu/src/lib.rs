// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Protocol definitions for Calypso card transactions
//!
//! This crate provides the objects exchanged between a terminal-side transaction
//! manager, the card reader and the card: typed [requests][request::CardRequest],
//! typed [responses][response::CardResponse] and the raw [audit records][audit::ApduExchange]
//! reported by the reader for every physical exchange.
//!
//! The byte-level Calypso command encoding (class, instruction and status words) is
//! owned by the reader implementation, which maps each [CardRequest][request::CardRequest]
//! to one APDU and reports the decoded outcome as a [CardStatus][response::CardStatus]
//! and [ResponseData][response::ResponseData].
//!

pub mod access;
pub mod audit;
pub mod file;
pub mod prelude;
pub mod product;
pub mod request;
pub mod response;
pub mod sv;

/// Calypso card API version implemented by this workspace
pub const API_VERSION: &str = "2.0";

/// Maximum number of records in an EF
pub const MAX_RECORD_NUMBER: u8 = 250;

/// Maximum SFI value (0 selects the current EF)
pub const MAX_SFI: u8 = 30;

/// Maximum counter number in a counters EF
pub const MAX_COUNTER_NUMBER: u8 = 83;

/// Maximum counter value (3-byte unsigned)
pub const MAX_COUNTER_VALUE: u32 = 0xFF_FFFF;

/// Size of an encoded counter value in a counters record
pub const COUNTER_SIZE: usize = 3;

/// SFI of the SV reload log file
pub const SV_RELOAD_LOG_SFI: u8 = 0x14;

/// SFI of the SV debit log file
pub const SV_DEBIT_LOG_SFI: u8 = 0x15;

/// Number of records in the SV debit log file
pub const SV_DEBIT_LOG_RECORDS: u8 = 3;

/// Maximum number of PIN presentation attempts
pub const PIN_MAX_ATTEMPTS: u8 = 3;

/// PIN length in bytes
pub const PIN_LENGTH: usize = 4;
