// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Stored value log records

use byteorder::{BigEndian, ByteOrder};

/// SV load log record size
pub const SV_LOAD_LOG_SIZE: usize = 22;

/// SV debit log record size
pub const SV_DEBIT_LOG_SIZE: usize = 19;

/// SV load log record
///
/// ## Encoding
///
/// ```text
/// | date (2) | free1 | kvc | free2 | balance (3) | amount (3) | time (2) |
/// | sam id (4) | sam tnum (3) | sv tnum (2) |
/// ```
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SvLoadLogRecord([u8; SV_LOAD_LOG_SIZE]);

impl SvLoadLogRecord {
    /// Parse a load log record, `None` if too short
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let mut r = [0u8; SV_LOAD_LOG_SIZE];
        r.copy_from_slice(b.get(..SV_LOAD_LOG_SIZE)?);
        Some(Self(r))
    }

    pub fn raw(&self) -> &[u8] {
        &self.0
    }

    pub fn date(&self) -> [u8; 2] {
        [self.0[0], self.0[1]]
    }

    pub fn free_data(&self) -> [u8; 2] {
        [self.0[2], self.0[4]]
    }

    pub fn kvc(&self) -> u8 {
        self.0[3]
    }

    /// Balance after the load
    pub fn balance(&self) -> i32 {
        BigEndian::read_i24(&self.0[5..8])
    }

    pub fn amount(&self) -> i32 {
        BigEndian::read_i24(&self.0[8..11])
    }

    pub fn time(&self) -> [u8; 2] {
        [self.0[11], self.0[12]]
    }

    pub fn sam_id(&self) -> u32 {
        BigEndian::read_u32(&self.0[13..17])
    }

    pub fn sam_tnum(&self) -> u32 {
        BigEndian::read_u24(&self.0[17..20])
    }

    pub fn sv_tnum(&self) -> u16 {
        BigEndian::read_u16(&self.0[20..22])
    }
}

/// SV debit log record
///
/// ## Encoding
///
/// ```text
/// | amount (2) | date (2) | time (2) | kvc | sam id (4) | sam tnum (3) |
/// | balance (3) | sv tnum (2) |
/// ```
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SvDebitLogRecord([u8; SV_DEBIT_LOG_SIZE]);

impl SvDebitLogRecord {
    /// Parse a debit log record, `None` if too short
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let mut r = [0u8; SV_DEBIT_LOG_SIZE];
        r.copy_from_slice(b.get(..SV_DEBIT_LOG_SIZE)?);
        Some(Self(r))
    }

    pub fn raw(&self) -> &[u8] {
        &self.0
    }

    /// Signed debit amount (negative for an undebit)
    pub fn amount(&self) -> i16 {
        BigEndian::read_i16(&self.0[0..2])
    }

    pub fn date(&self) -> [u8; 2] {
        [self.0[2], self.0[3]]
    }

    pub fn time(&self) -> [u8; 2] {
        [self.0[4], self.0[5]]
    }

    pub fn kvc(&self) -> u8 {
        self.0[6]
    }

    pub fn sam_id(&self) -> u32 {
        BigEndian::read_u32(&self.0[7..11])
    }

    pub fn sam_tnum(&self) -> u32 {
        BigEndian::read_u24(&self.0[11..14])
    }

    /// Balance after the debit
    pub fn balance(&self) -> i32 {
        BigEndian::read_i24(&self.0[14..17])
    }

    pub fn sv_tnum(&self) -> u16 {
        BigEndian::read_u16(&self.0[17..19])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn load_log_fields() {
        let raw = [
            0x12, 0x34, 0xf1, 0x79, 0xf2, 0xff, 0xff, 0xfe, 0x00, 0x00, 0x64, 0x56, 0x78, 0xaa,
            0xbb, 0xcc, 0xdd, 0x00, 0x01, 0x02, 0x00, 0x2a,
        ];
        let l = SvLoadLogRecord::from_bytes(&raw).unwrap();

        assert_eq!(l.date(), [0x12, 0x34]);
        assert_eq!(l.free_data(), [0xf1, 0xf2]);
        assert_eq!(l.kvc(), 0x79);
        assert_eq!(l.balance(), -2);
        assert_eq!(l.amount(), 100);
        assert_eq!(l.time(), [0x56, 0x78]);
        assert_eq!(l.sam_id(), 0xaabbccdd);
        assert_eq!(l.sam_tnum(), 0x102);
        assert_eq!(l.sv_tnum(), 42);

        assert!(SvLoadLogRecord::from_bytes(&raw[..21]).is_none());
    }

    #[test]
    fn debit_log_fields() {
        let raw = [
            0xff, 0x9c, 0x12, 0x34, 0x56, 0x78, 0x7a, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x05,
            0x00, 0x01, 0x00, 0x00, 0x07,
        ];
        let d = SvDebitLogRecord::from_bytes(&raw).unwrap();

        assert_eq!(d.amount(), -100);
        assert_eq!(d.kvc(), 0x7a);
        assert_eq!(d.sam_id(), 1);
        assert_eq!(d.sam_tnum(), 5);
        assert_eq!(d.balance(), 256);
        assert_eq!(d.sv_tnum(), 7);
    }
}
