// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Simulated SAM

use std::any::Any;

use rand_core::{OsRng, RngCore};

use calypso_apdu::{
    audit::ApduExchange,
    sv::{SvAction, SvGetData, SvOperation, SvSecurity},
    PIN_LENGTH,
};
use calypso_card_core::crypto::{CryptoModule, KeyReference, SvCommandData};
use calypso_card_core::error::CryptoError;

use crate::mac::{apply_keystream, sv_signature, SessionMac, SimKeys, SV_KIF};

/// Key used to cipher PINs when none is configured
pub const DEFAULT_PIN_KEY: KeyReference = KeyReference::new(0x30, 0x79);

/// Terminal challenge length
pub const TERMINAL_CHALLENGE_LEN: usize = 8;

/// Simulated SAM implementing [CryptoModule]
pub struct SimSam {
    keys: SimKeys,
    extended: bool,
    sam_id: [u8; 4],
    sam_tnum: u32,

    terminal_challenge: Option<Vec<u8>>,
    session: Option<SessionMac>,
    encryption: bool,
    /// Expected card SV signature following security data computation
    sv_expected: Option<Vec<u8>>,

    fail_verification: bool,
    prepared_transactions: usize,
    audit: Vec<ApduExchange>,
}

impl SimSam {
    pub fn new(keys: SimKeys) -> Self {
        Self {
            keys,
            extended: false,
            sam_id: [0x11, 0x22, 0x33, 0x44],
            sam_tnum: 0,
            terminal_challenge: None,
            session: None,
            encryption: false,
            sv_expected: None,
            fail_verification: false,
            prepared_transactions: 0,
            audit: vec![],
        }
    }

    /// Enable extended mode support
    pub fn with_extended_mode(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Fail card signature verifications with an I/O error
    pub fn with_verification_failure(mut self) -> Self {
        self.fail_verification = true;
        self
    }

    pub fn sam_id(&self) -> [u8; 4] {
        self.sam_id
    }

    /// Check whether exchange encryption is active
    pub fn is_encryption_active(&self) -> bool {
        self.encryption
    }

    /// Check whether a session context is in progress
    pub fn is_session_active(&self) -> bool {
        self.session.is_some()
    }

    /// Number of [CryptoModule::prepare_next_transaction] calls
    pub fn prepared_transactions(&self) -> usize {
        self.prepared_transactions
    }

    fn session(&mut self) -> Result<&mut SessionMac, CryptoError> {
        self.session
            .as_mut()
            .ok_or_else(|| CryptoError::Io("no session context".to_string()))
    }

    fn record(&mut self, ins: u8, request: &[u8], response: &[u8]) {
        let mut req = vec![0x80, ins, 0x00, 0x00, request.len() as u8];
        req.extend_from_slice(request);

        let mut resp = response.to_vec();
        resp.extend_from_slice(&[0x90, 0x00]);

        self.audit.push(ApduExchange::new(req, resp));
    }

    fn check_verification(&self) -> Result<(), CryptoError> {
        match self.fail_verification {
            true => Err(CryptoError::Io("SAM not responding".to_string())),
            false => Ok(()),
        }
    }
}

impl CryptoModule for SimSam {
    fn init_session_context(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut challenge = vec![0u8; TERMINAL_CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);

        self.session = None;
        self.encryption = false;
        self.terminal_challenge = Some(challenge.clone());

        self.record(0x84, &[], &challenge);

        Ok(challenge)
    }

    fn init_session_mac(&mut self, open_data: &[u8], kif: u8, kvc: u8) -> Result<(), CryptoError> {
        let challenge = self
            .terminal_challenge
            .take()
            .ok_or_else(|| CryptoError::Io("no terminal challenge".to_string()))?;

        log::debug!("SAM session init (kif: {:02x}, kvc: {:02x})", kif, kvc);

        self.session = Some(SessionMac::new(self.keys.key(kif, kvc), &challenge, open_data));
        self.record(0x8a, open_data, &[]);

        Ok(())
    }

    fn update_session_mac(&mut self, exchange: &ApduExchange) -> Result<(), CryptoError> {
        self.session()?.update(exchange);
        Ok(())
    }

    fn finalize_session_mac(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mac = self.session()?.sign(b"terminal");
        self.record(0x8e, &[], &mac);
        Ok(mac)
    }

    fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError> {
        self.check_verification()?;

        let expected = self.session()?.sign(b"card");
        self.session = None;
        self.encryption = false;

        self.record(0x82, card_mac, &[]);

        Ok(expected == card_mac)
    }

    fn abort_session(&mut self) {
        log::debug!("SAM session aborted");

        self.session = None;
        self.terminal_challenge = None;
        self.encryption = false;
    }

    fn generate_authentication_mac(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mac = self.session()?.sign(b"terminal-auth");
        self.record(0x8e, &[0x01], &mac);
        Ok(mac)
    }

    fn verify_card_authentication_mac(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError> {
        self.check_verification()?;

        let expected = self.session()?.sign(b"card-auth");
        self.record(0x82, card_mac, &[]);

        Ok(expected == card_mac)
    }

    fn activate_encryption(&mut self) -> Result<(), CryptoError> {
        self.session()?;
        self.encryption = true;
        Ok(())
    }

    fn deactivate_encryption(&mut self) -> Result<(), CryptoError> {
        self.encryption = false;
        Ok(())
    }

    fn compute_sv_security_data(
        &mut self,
        sv_get: &SvGetData,
        cmd: &SvCommandData,
    ) -> Result<SvSecurity, CryptoError> {
        let key = self.keys.key(SV_KIF, sv_get.kvc);
        let undo = cmd.operation == SvOperation::Debit && cmd.action == SvAction::Undo;

        self.sam_tnum = self.sam_tnum.wrapping_add(1);
        let sam_tnum = self.sam_tnum.to_be_bytes();

        let terminal_mac = sv_signature(
            &key,
            b"sv-terminal",
            &sv_get.challenge,
            sv_get.tnum,
            cmd.amount,
            undo,
            &cmd.date,
            &cmd.time,
        );
        self.sv_expected = Some(sv_signature(
            &key,
            b"sv-card",
            &sv_get.challenge,
            sv_get.tnum.wrapping_add(1),
            cmd.amount,
            undo,
            &cmd.date,
            &cmd.time,
        ));

        self.record(0x14, &sv_get.data, &terminal_mac);

        Ok(SvSecurity {
            sam_id: self.sam_id,
            sam_tnum: [sam_tnum[1], sam_tnum[2], sam_tnum[3]],
            terminal_mac,
        })
    }

    fn verify_card_sv_mac(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError> {
        self.check_verification()?;

        let expected = self
            .sv_expected
            .take()
            .ok_or_else(|| CryptoError::Io("no SV operation pending".to_string()))?;

        self.record(0x82, card_mac, &[]);

        Ok(expected == card_mac)
    }

    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: &[u8],
        pin: &[u8; PIN_LENGTH],
        key: Option<KeyReference>,
    ) -> Result<Vec<u8>, CryptoError> {
        let k = key.unwrap_or(DEFAULT_PIN_KEY);

        let mut block = vec![k.kif, k.kvc];
        block.extend(apply_keystream(
            &self.keys.key(k.kif, k.kvc),
            card_challenge,
            b"pin",
            pin,
        ));

        self.record(0x12, card_challenge, &block);

        Ok(block)
    }

    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: &[u8],
        current_pin: &[u8; PIN_LENGTH],
        new_pin: &[u8; PIN_LENGTH],
        key: Option<KeyReference>,
    ) -> Result<Vec<u8>, CryptoError> {
        let k = key.unwrap_or(DEFAULT_PIN_KEY);

        let mut pins = current_pin.to_vec();
        pins.extend_from_slice(new_pin);

        let mut block = vec![k.kif, k.kvc];
        block.extend(apply_keystream(
            &self.keys.key(k.kif, k.kvc),
            card_challenge,
            b"pin-change",
            &pins,
        ));

        self.record(0x12, card_challenge, &block);

        Ok(block)
    }

    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: &[u8],
        issuer: KeyReference,
        target: KeyReference,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut block = vec![issuer.kif, issuer.kvc, target.kif, target.kvc];
        block.extend(apply_keystream(
            &self.keys.key(issuer.kif, issuer.kvc),
            card_challenge,
            b"key",
            &self.keys.key(target.kif, target.kvc),
        ));

        self.record(0x12, card_challenge, &block);

        Ok(block)
    }

    fn is_extended_mode_supported(&self) -> bool {
        self.extended
    }

    fn prepare_next_transaction(&mut self) -> Result<(), CryptoError> {
        self.prepared_transactions += 1;
        Ok(())
    }

    fn take_audit_data(&mut self) -> Vec<ApduExchange> {
        std::mem::take(&mut self.audit)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
