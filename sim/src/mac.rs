// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Keyed digests shared by the simulated card and SAM
//!
//! These stand in for the DES / AES session computations of real devices, both sides
//! deriving identical values from shared key material.

use sha2::{Digest, Sha256};

use calypso_apdu::audit::ApduExchange;

/// Signature length, truncated from the digest output
pub const MAC_LEN: usize = 8;

/// KIF used to derive SV keys
pub const SV_KIF: u8 = 0x00;

/// Key material shared by a simulated card and SAM
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SimKeys {
    master: [u8; 32],
}

impl Default for SimKeys {
    fn default() -> Self {
        Self::new(b"calypso-sim")
    }
}

impl SimKeys {
    /// Derive key material from a seed
    pub fn new(seed: &[u8]) -> Self {
        Self {
            master: Sha256::digest(seed).into(),
        }
    }

    /// Derive the key for a `(kif, kvc)` pair
    pub fn key(&self, kif: u8, kvc: u8) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(self.master);
        h.update([kif, kvc]);
        h.finalize().into()
    }
}

/// Running session digest
#[derive(Clone)]
pub struct SessionMac {
    key: [u8; 32],
    hasher: Sha256,
}

impl SessionMac {
    pub fn new(key: [u8; 32], terminal_challenge: &[u8], open_data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key);
        update_framed(&mut hasher, terminal_challenge);
        update_framed(&mut hasher, open_data);

        Self { key, hasher }
    }

    /// Add an exchange to the digest
    pub fn update(&mut self, exchange: &ApduExchange) {
        update_framed(&mut self.hasher, &exchange.request);
        update_framed(&mut self.hasher, &exchange.response);
    }

    /// Compute a signature over the current digest, without consuming it
    pub fn sign(&self, label: &[u8]) -> Vec<u8> {
        let mut h = self.hasher.clone();
        h.update(label);
        h.update(self.key);

        h.finalize()[..MAC_LEN].to_vec()
    }
}

/// Compute a signature over the provided parts
pub fn sign(key: &[u8; 32], label: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(key);
    h.update(label);
    for p in parts {
        update_framed(&mut h, p);
    }

    h.finalize()[..MAC_LEN].to_vec()
}

/// XOR `data` with a keystream derived from the key and challenge
pub fn apply_keystream(key: &[u8; 32], challenge: &[u8], label: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());

    for (i, block) in data.chunks(32).enumerate() {
        let mut h = Sha256::new();
        h.update(key);
        h.update(label);
        update_framed(&mut h, challenge);
        h.update([i as u8]);
        let ks = h.finalize();

        out.extend(block.iter().zip(ks.iter()).map(|(d, k)| d ^ k));
    }

    out
}

/// SV signature, shared by terminal and card computations
#[allow(clippy::too_many_arguments)]
pub fn sv_signature(
    key: &[u8; 32],
    label: &[u8],
    challenge: &[u8],
    tnum: u16,
    amount: i32,
    undo: bool,
    date: &[u8; 2],
    time: &[u8; 2],
) -> Vec<u8> {
    sign(
        key,
        label,
        &[
            challenge,
            &tnum.to_be_bytes(),
            &amount.to_be_bytes(),
            &[undo as u8],
            date,
            time,
        ],
    )
}

fn update_framed(h: &mut Sha256, data: &[u8]) {
    h.update((data.len() as u32).to_be_bytes());
    h.update(data);
}
