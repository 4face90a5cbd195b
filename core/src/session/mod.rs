// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Secure session state machine
//!
//! ```text
//! Closed --prepare open-----> OpenPrepared    --process--> Open
//! Closed --prepare pre-open-> PreOpenPrepared --process--> Open
//! Open | OpenPrepared | PreOpenPrepared --prepare close--> ClosePrepared  --process--> Closed
//! Open | OpenPrepared | PreOpenPrepared --prepare cancel-> CancelPrepared --process--> Closed
//! ```
//!
//! Processing failures always return the machine to [SessionState::Closed].

use strum::{Display, EnumIter, EnumString, EnumVariantNames};

use calypso_apdu::access::WriteAccessLevel;

use crate::{command::ReadMode, error::Error};

mod budget;
pub use budget::{ModificationBudget, COMMAND_OVERHEAD};

/// Secure session state
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, EnumVariantNames, EnumIter)]
pub enum SessionState {
    /// No session open or pending
    Closed,
    /// Pre-open prepared, opening sent on next processing
    PreOpenPrepared,
    /// Open prepared, opening sent on next processing
    OpenPrepared,
    /// Session open on the card
    Open,
    /// Close prepared
    ClosePrepared,
    /// Cancel prepared
    CancelPrepared,
}

/// Session physically open on the card
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CardSession {
    pub level: WriteAccessLevel,
    pub kif: u8,
    pub kvc: u8,
}

/// Tracks the logical (prepared) and physical (card) session state
#[derive(Clone, PartialEq, Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    card_session: Option<CardSession>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Closed,
            card_session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session physically open on the card, if any
    pub fn card_session(&self) -> Option<&CardSession> {
        self.card_session.as_ref()
    }

    /// Check whether a session is open or an opening is pending
    pub fn is_open_or_pending(&self) -> bool {
        matches!(
            self.state,
            SessionState::Open | SessionState::OpenPrepared | SessionState::PreOpenPrepared
        )
    }

    /// Read mode for reads prepared in the current state
    pub fn read_mode(&self) -> ReadMode {
        match self.is_open_or_pending() {
            true => ReadMode::Strict,
            false => ReadMode::BestEffort,
        }
    }

    /// Guard and apply an open (or pre-open) preparation
    pub fn prepare_open(&mut self, pre_open: bool) -> Result<(), Error> {
        match self.state {
            SessionState::Closed => (),
            SessionState::OpenPrepared | SessionState::PreOpenPrepared => {
                return Err(Error::IllegalState("secure session opening already prepared"))
            }
            _ => return Err(Error::IllegalState("secure session already open")),
        }

        self.state = match pre_open {
            true => SessionState::PreOpenPrepared,
            false => SessionState::OpenPrepared,
        };

        Ok(())
    }

    /// Guard and apply a close preparation
    pub fn prepare_close(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Open | SessionState::OpenPrepared | SessionState::PreOpenPrepared => {
                self.state = SessionState::ClosePrepared;
                Ok(())
            }
            SessionState::ClosePrepared | SessionState::CancelPrepared => Err(
                Error::IllegalState("secure session closing already prepared"),
            ),
            SessionState::Closed => Err(Error::IllegalState("no secure session open")),
        }
    }

    /// Apply a cancel preparation, never fails
    ///
    /// A closed session stays closed.
    pub fn prepare_cancel(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::CancelPrepared;
        }
    }

    /// Require a closed session for commands incompatible with secure sessions
    pub fn require_closed(&self, command: &'static str) -> Result<(), Error> {
        match self.state {
            SessionState::Closed => Ok(()),
            _ => {
                log::warn!("{} requested with session state {}", command, self.state);
                Err(Error::IllegalState("secure session open"))
            }
        }
    }

    /// Require an open or pending session
    pub fn require_open(&self) -> Result<(), Error> {
        match self.is_open_or_pending() {
            true => Ok(()),
            false => Err(Error::IllegalState("no secure session open")),
        }
    }

    /// Session opened on the card
    pub fn on_opened(&mut self, session: CardSession) {
        self.card_session = Some(session);

        if matches!(
            self.state,
            SessionState::OpenPrepared | SessionState::PreOpenPrepared
        ) {
            self.state = SessionState::Open;
        }
    }

    /// Session closed or cancelled on the card
    pub fn on_closed(&mut self) {
        self.card_session = None;

        if matches!(
            self.state,
            SessionState::ClosePrepared | SessionState::CancelPrepared
        ) {
            self.state = SessionState::Closed;
        }
    }

    /// Session closed on the card ahead of a reopening, the logical state is unchanged
    pub fn on_card_session_closed(&mut self) {
        self.card_session = None;
    }

    /// Processing failed, return to closed
    pub fn on_failure(&mut self) {
        self.card_session = None;
        self.state = SessionState::Closed;
    }
}
