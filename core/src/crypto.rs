// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Crypto module abstraction
//!
//! The [CryptoModule] trait covers the operations a symmetric key crypto module (SAM)
//! performs for the transaction manager: session MAC computation and verification,
//! SV security data, PIN and key ciphering, and extended mode encryption.

use std::any::Any;

use calypso_apdu::{
    audit::ApduExchange,
    sv::{SvAction, SvGetData, SvOperation, SvSecurity},
    PIN_LENGTH,
};

use crate::error::CryptoError;

/// Key reference, KIF and KVC
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct KeyReference {
    pub kif: u8,
    pub kvc: u8,
}

impl KeyReference {
    pub const fn new(kif: u8, kvc: u8) -> Self {
        Self { kif, kvc }
    }
}

/// SV reload / debit parameters passed to the crypto module
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SvCommandData {
    pub operation: SvOperation,
    pub action: SvAction,
    /// Amount as transmitted to the card, negated for a reload undo
    pub amount: i32,
    pub date: [u8; 2],
    pub time: [u8; 2],
    pub free: [u8; 2],
}

/// [`CryptoModule`] provides symmetric key cryptography for secure transactions
pub trait CryptoModule: Send {
    /// Start a new session context, returning the terminal challenge
    fn init_session_context(&mut self) -> Result<Vec<u8>, CryptoError>;

    /// Initialise the session MAC from the card opening data
    fn init_session_mac(&mut self, open_data: &[u8], kif: u8, kvc: u8)
        -> Result<(), CryptoError>;

    /// Update the session MAC with an exchange performed during the session
    fn update_session_mac(&mut self, exchange: &ApduExchange) -> Result<(), CryptoError>;

    /// Finalise the session MAC, returning the terminal session signature
    fn finalize_session_mac(&mut self) -> Result<Vec<u8>, CryptoError>;

    /// Verify the card session signature returned on close
    fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError>;

    /// Abandon the current session context
    fn abort_session(&mut self);

    /// Compute the intermediate terminal signature for early mutual authentication
    fn generate_authentication_mac(&mut self) -> Result<Vec<u8>, CryptoError>;

    /// Verify the intermediate card signature for early mutual authentication
    fn verify_card_authentication_mac(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError>;

    /// Start ciphering session exchanges
    fn activate_encryption(&mut self) -> Result<(), CryptoError>;

    /// Stop ciphering session exchanges
    fn deactivate_encryption(&mut self) -> Result<(), CryptoError>;

    /// Compute SV security data for a reload or debit following `sv_get`
    fn compute_sv_security_data(
        &mut self,
        sv_get: &SvGetData,
        cmd: &SvCommandData,
    ) -> Result<SvSecurity, CryptoError>;

    /// Verify the card SV signature for an operation performed outside a session
    fn verify_card_sv_mac(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError>;

    /// Cipher a PIN for presentation
    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        pin: &[u8; PIN_LENGTH],
        key: Option<KeyReference>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Cipher a new PIN for modification
    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        current_pin: &[u8; PIN_LENGTH],
        new_pin: &[u8; PIN_LENGTH],
        key: Option<KeyReference>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Generate the ciphered key block for a change key command
    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: &[u8],
        issuer: KeyReference,
        target: KeyReference,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Check whether the module supports extended mode sessions
    fn is_extended_mode_supported(&self) -> bool;

    /// Prepare the crypto context ahead of the next transaction
    fn prepare_next_transaction(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }

    /// Take exchanges performed with the crypto module since the last call
    fn take_audit_data(&mut self) -> Vec<ApduExchange> {
        vec![]
    }

    /// Access the concrete module for extension lookup
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
