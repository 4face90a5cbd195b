// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Card transaction manager
//!
//! A [TransactionManager] queues prepared commands (see `prepare_*` methods) and
//! executes them against the card on [TransactionManager::process_commands].

use std::any::Any;

use strum::{Display, EnumIter, EnumString, EnumVariantNames};

use calypso_apdu::{
    audit::ApduExchange,
    sv::{SvAction, SvGetData, SvOperation},
};

use crate::{
    card::CalypsoCard,
    command::{CommandQueue, Pin},
    error::Error,
    reader::CardReader,
    security::SecuritySetting,
    session::{ModificationBudget, SessionState, SessionStateMachine},
};

mod apply;
mod prepare;
mod process;

/// Transaction capability profile
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, EnumVariantNames, EnumIter)]
pub enum TransactionProfile {
    /// Plain commands only, no crypto module
    Free,
    /// Secure sessions with a symmetric crypto module
    SecureRegular,
    /// Secure sessions with extended mode (encryption, early authentication)
    SecureExtended,
}

/// Calypso card transaction manager
pub struct TransactionManager<R: CardReader> {
    reader: R,
    card: CalypsoCard,
    profile: TransactionProfile,
    security: Option<SecuritySetting>,

    queue: CommandQueue,
    session: SessionStateMachine,
    budget: ModificationBudget,
    audit: Vec<ApduExchange>,

    /// Prepare-time session tracking
    prepared: PreparedSession,
    /// Processing-time session tracking
    processed: ProcessedSession,

    /// Last SV get response
    sv_get: Option<SvGetData>,
    /// SV get awaiting its reload / debit, set when the last processed command was an SV get
    sv_pending: Option<(SvOperation, SvAction)>,
    /// Out-of-session SV status `(tnum, balance)` for in-session consistency checks
    sv_reference: Option<(u16, i32)>,

    /// Last PIN presented successfully
    pin: Option<Pin>,
}

/// Commands prepared in the pending or open session
#[derive(Copy, Clone, PartialEq, Debug, Default)]
struct PreparedSession {
    modifying: bool,
    sv: bool,
    encryption: bool,
}

/// Commands executed in the open session
#[derive(Copy, Clone, PartialEq, Debug, Default)]
struct ProcessedSession {
    modifying: bool,
    sv: bool,
    encryption: bool,
    authenticated: bool,
}

impl<R: CardReader> TransactionManager<R> {
    /// Create a manager without secure session support
    pub fn free(reader: R, card: CalypsoCard) -> Self {
        Self::new(reader, card, TransactionProfile::Free, None)
    }

    /// Create a manager with regular secure sessions
    pub fn secure_regular(reader: R, card: CalypsoCard, security: SecuritySetting) -> Self {
        Self::new(
            reader,
            card,
            TransactionProfile::SecureRegular,
            Some(security),
        )
    }

    /// Create a manager with extended mode secure sessions
    ///
    /// Fails with [Error::Unsupported] if either the card or the crypto module lacks extended mode.
    pub fn secure_extended(
        reader: R,
        card: CalypsoCard,
        security: SecuritySetting,
    ) -> Result<Self, Error> {
        if !card.is_extended_mode_supported() {
            return Err(Error::Unsupported("extended mode not supported by card"));
        }
        if !security.crypto_ref().is_extended_mode_supported() {
            return Err(Error::Unsupported(
                "extended mode not supported by crypto module",
            ));
        }

        Ok(Self::new(
            reader,
            card,
            TransactionProfile::SecureExtended,
            Some(security),
        ))
    }

    fn new(
        reader: R,
        card: CalypsoCard,
        profile: TransactionProfile,
        security: Option<SecuritySetting>,
    ) -> Self {
        log::debug!(
            "new {} transaction (card: {}, serial: {})",
            profile,
            card.product_type(),
            hex::encode(card.serial_number())
        );

        Self {
            budget: ModificationBudget::new(card.modifications_buffer()),
            reader,
            card,
            profile,
            security,
            queue: CommandQueue::new(),
            session: SessionStateMachine::new(),
            audit: vec![],
            prepared: PreparedSession::default(),
            processed: ProcessedSession::default(),
            sv_get: None,
            sv_pending: None,
            sv_reference: None,
            pin: None,
        }
    }

    /// Card snapshot, updated as commands are processed
    pub fn card(&self) -> &CalypsoCard {
        &self.card
    }

    pub fn profile(&self) -> TransactionProfile {
        self.profile
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Number of commands awaiting processing
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    pub fn security_setting(&self) -> Option<&SecuritySetting> {
        self.security.as_ref()
    }

    /// All exchanges with the card and crypto module since creation
    pub fn transaction_audit_data(&self) -> &[ApduExchange] {
        &self.audit
    }

    /// Access the crypto module as its concrete type
    pub fn crypto_extension<E: Any>(&mut self) -> Option<&mut E> {
        self.security
            .as_mut()
            .and_then(|s| s.crypto().as_any_mut().downcast_mut::<E>())
    }

    /// Prepare the crypto module ahead of the next transaction
    pub fn init_crypto_context_for_next_transaction(&mut self) -> Result<&mut Self, Error> {
        match self.security.as_mut() {
            Some(s) => s.init_crypto_context_for_next_transaction()?,
            None => return Err(Error::IllegalState("no security setting")),
        }
        Ok(self)
    }

    /// Borrow the underlying reader
    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Mutably borrow the underlying reader
    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Release the manager, returning the reader and card snapshot
    pub fn into_parts(self) -> (R, CalypsoCard) {
        (self.reader, self.card)
    }
}
