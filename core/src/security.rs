// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Secure session configuration

use std::collections::{BTreeMap, BTreeSet};

use calypso_apdu::access::WriteAccessLevel;

use crate::{
    crypto::{CryptoModule, KeyReference},
    error::Error,
};

bitflags::bitflags! {
    /// Secure session options
    #[derive(Default)]
    pub struct SessionFlags: u16 {
        /// Split sessions exceeding the card modifications buffer
        const MULTIPLE_SESSION = 1 << 0;
        /// Ratify sessions with an explicit command on contactless readers
        const RATIFICATION = 1 << 1;
        /// Transmit PINs in plain text
        const PIN_PLAIN = 1 << 2;
        /// Return both SV logs on SV get
        const SV_LOAD_AND_DEBIT_LOG = 1 << 3;
        /// Allow SV debits leading to a negative balance
        const SV_NEGATIVE_BALANCE = 1 << 4;
        /// Never merge a record read into the session opening
        const NO_READ_ON_OPEN = 1 << 5;
    }
}

/// Secure transaction settings, consumed when creating a secure transaction manager
///
/// ```no_run
/// # use calypso_card_core::{apdu::access::WriteAccessLevel, crypto::CryptoModule, security::SecuritySetting};
/// # fn f(sam: impl CryptoModule + 'static) {
/// let s = SecuritySetting::new(sam)
///     .enable_multiple_session()
///     .assign_default_kif(WriteAccessLevel::Debit, 0x30)
///     .add_authorized_session_key(0x30, 0x79);
/// # }
/// ```
pub struct SecuritySetting {
    crypto: Box<dyn CryptoModule>,
    flags: SessionFlags,
    kifs: BTreeMap<(WriteAccessLevel, u8), u8>,
    default_kifs: BTreeMap<WriteAccessLevel, u8>,
    default_kvcs: BTreeMap<WriteAccessLevel, u8>,
    session_keys: BTreeSet<KeyReference>,
    sv_keys: BTreeSet<KeyReference>,
    pin_verification_key: Option<KeyReference>,
    pin_modification_key: Option<KeyReference>,
}

impl std::fmt::Debug for SecuritySetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySetting")
            .field("flags", &self.flags)
            .field("kifs", &self.kifs)
            .field("default_kifs", &self.default_kifs)
            .field("default_kvcs", &self.default_kvcs)
            .field("session_keys", &self.session_keys)
            .field("sv_keys", &self.sv_keys)
            .finish()
    }
}

impl SecuritySetting {
    /// Create a setting using the provided crypto module
    pub fn new(crypto: impl CryptoModule + 'static) -> Self {
        Self::from_boxed(Box::new(crypto))
    }

    /// Create a setting from a boxed crypto module
    pub fn from_boxed(crypto: Box<dyn CryptoModule>) -> Self {
        Self {
            crypto,
            flags: SessionFlags::empty(),
            kifs: BTreeMap::new(),
            default_kifs: BTreeMap::new(),
            default_kvcs: BTreeMap::new(),
            session_keys: BTreeSet::new(),
            sv_keys: BTreeSet::new(),
            pin_verification_key: None,
            pin_modification_key: None,
        }
    }

    pub fn enable_multiple_session(mut self) -> Self {
        self.flags |= SessionFlags::MULTIPLE_SESSION;
        self
    }

    pub fn enable_ratification_mechanism(mut self) -> Self {
        self.flags |= SessionFlags::RATIFICATION;
        self
    }

    pub fn enable_pin_plain_transmission(mut self) -> Self {
        self.flags |= SessionFlags::PIN_PLAIN;
        self
    }

    pub fn enable_sv_load_and_debit_log(mut self) -> Self {
        self.flags |= SessionFlags::SV_LOAD_AND_DEBIT_LOG;
        self
    }

    pub fn authorize_sv_negative_balance(mut self) -> Self {
        self.flags |= SessionFlags::SV_NEGATIVE_BALANCE;
        self
    }

    pub fn disable_read_on_session_opening(mut self) -> Self {
        self.flags |= SessionFlags::NO_READ_ON_OPEN;
        self
    }

    /// Set the KIF to use for a level when the card reports the provided KVC without a KIF
    pub fn assign_kif(mut self, level: WriteAccessLevel, kvc: u8, kif: u8) -> Self {
        self.kifs.insert((level, kvc), kif);
        self
    }

    /// Set the KIF to use for a level when no other KIF is available
    pub fn assign_default_kif(mut self, level: WriteAccessLevel, kif: u8) -> Self {
        self.default_kifs.insert(level, kif);
        self
    }

    /// Set the KVC to use for a level when the card does not report one
    pub fn assign_default_kvc(mut self, level: WriteAccessLevel, kvc: u8) -> Self {
        self.default_kvcs.insert(level, kvc);
        self
    }

    /// Authorize a session key, all keys are authorized when none is added
    pub fn add_authorized_session_key(mut self, kif: u8, kvc: u8) -> Self {
        self.session_keys.insert(KeyReference::new(kif, kvc));
        self
    }

    /// Authorize an SV key version, all versions are authorized when none is added
    pub fn add_authorized_sv_key(mut self, kif: u8, kvc: u8) -> Self {
        self.sv_keys.insert(KeyReference::new(kif, kvc));
        self
    }

    pub fn set_pin_verification_ciphering_key(mut self, kif: u8, kvc: u8) -> Self {
        self.pin_verification_key = Some(KeyReference::new(kif, kvc));
        self
    }

    pub fn set_pin_modification_ciphering_key(mut self, kif: u8, kvc: u8) -> Self {
        self.pin_modification_key = Some(KeyReference::new(kif, kvc));
        self
    }

    /// Prepare the crypto module ahead of the next transaction
    pub fn init_crypto_context_for_next_transaction(&mut self) -> Result<(), Error> {
        log::debug!("init crypto context for next transaction");
        self.crypto.prepare_next_transaction()?;
        Ok(())
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn is_enabled(&self, flag: SessionFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn kif(&self, level: WriteAccessLevel, kvc: u8) -> Option<u8> {
        self.kifs.get(&(level, kvc)).copied()
    }

    pub fn default_kif(&self, level: WriteAccessLevel) -> Option<u8> {
        self.default_kifs.get(&level).copied()
    }

    pub fn default_kvc(&self, level: WriteAccessLevel) -> Option<u8> {
        self.default_kvcs.get(&level).copied()
    }

    /// Check a session key against the authorized list
    pub fn is_session_key_authorized(&self, kif: u8, kvc: u8) -> bool {
        self.session_keys.is_empty() || self.session_keys.contains(&KeyReference::new(kif, kvc))
    }

    /// Check an SV key version against the authorized list
    ///
    /// Cards only report the SV key version, so keys are matched on KVC.
    pub fn is_sv_key_authorized(&self, kvc: u8) -> bool {
        self.sv_keys.is_empty() || self.sv_keys.iter().any(|k| k.kvc == kvc)
    }

    pub fn pin_verification_ciphering_key(&self) -> Option<KeyReference> {
        self.pin_verification_key
    }

    pub fn pin_modification_ciphering_key(&self) -> Option<KeyReference> {
        self.pin_modification_key
    }

    pub(crate) fn crypto(&mut self) -> &mut dyn CryptoModule {
        self.crypto.as_mut()
    }

    pub(crate) fn crypto_ref(&self) -> &dyn CryptoModule {
        self.crypto.as_ref()
    }
}
