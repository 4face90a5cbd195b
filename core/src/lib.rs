// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Calypso card secure transaction engine
//!
//! This provides a [TransactionManager] driving transactions against Calypso cards through
//! a [CardReader][reader::CardReader], with secure session cryptography delegated to a
//! [CryptoModule][crypto::CryptoModule] (usually a SAM).
//!
//! Card commands and responses are described by [calypso_apdu], encoding to and from
//! the wire is the responsibility of the reader implementation.
//!
//! ## Operations
//!
//! Transactions are built by _preparing_ commands, each `prepare_*` method validating its
//! arguments against the card and transaction state and queueing the command on success.
//! A rejected preparation leaves the queue untouched.
//!
//! Queued commands are then executed in order via
//! [`process_commands`][TransactionManager::process_commands], updating the
//! [card snapshot][card::CalypsoCard] from card responses.
//!
//! ### Free transactions
//!
//! Managers created with [`TransactionManager::free`] support reads, writes, counters
//! and plain PIN operations, without secure sessions.
//!
//! ### Secure sessions
//!
//! Managers created with [`TransactionManager::secure_regular`] or
//! [`TransactionManager::secure_extended`] take a [SecuritySetting][security::SecuritySetting]
//! containing the crypto module and session options.
//!
//! 1. Issue [`prepare_open_secure_session`][TransactionManager::prepare_open_secure_session]
//!    with the required [write access level][apdu::access::WriteAccessLevel]
//! 2. Prepare reads and modifications, an immediately following record read is merged
//!    with the session opening
//! 3. Issue [`prepare_close_secure_session`][TransactionManager::prepare_close_secure_session]
//!    (or [`prepare_cancel_secure_session`][TransactionManager::prepare_cancel_secure_session]
//!    to abandon the session)
//! 4. Call [`process_commands`][TransactionManager::process_commands], the card signature
//!    is verified by the crypto module on close
//!
//! Modifications exceeding the card session buffer fail with
//! [Error::SessionBufferOverflow] unless multiple sessions are enabled, in which case
//! the session is closed and reopened as required.
//!
//! ### Stored value
//!
//! SV reloads and debits must directly follow an [`prepare_sv_get`][TransactionManager::prepare_sv_get]
//! for the same operation, and are the first modification of a session when used in one.
//!
//! ### Failures
//!
//! Processing stops at the first failing command. Any open session is cancelled, the
//! session state returns to closed, and the snapshot retains updates from commands
//! processed before the failure.
//!
//! ```no_run
//! use calypso_card_core::{
//!     apdu::access::{ChannelControl, WriteAccessLevel},
//!     card::CalypsoCard,
//!     reader::CardReader,
//!     security::SecuritySetting,
//!     Error, TransactionManager,
//! };
//!
//! fn debit<R: CardReader>(reader: R, card: CalypsoCard, setting: SecuritySetting) -> Result<(), Error> {
//!     let mut t = TransactionManager::secure_regular(reader, card, setting);
//!
//!     t.prepare_open_secure_session(WriteAccessLevel::Debit)?
//!         .prepare_read_record(0x07, 1)?
//!         .prepare_append_record(0x08, &[0u8; 29])?
//!         .prepare_close_secure_session()?
//!         .process_commands(ChannelControl::CloseAfter)?;
//!
//!     Ok(())
//! }
//! ```

pub use calypso_apdu::{self as apdu};

pub mod card;

pub mod command;

pub mod crypto;

pub mod error;
pub use error::Error;

pub mod reader;

pub mod security;

pub mod session;

pub mod transaction;
pub use transaction::{TransactionManager, TransactionProfile};
