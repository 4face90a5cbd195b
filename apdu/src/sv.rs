// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Stored value definitions

use strum::{Display, EnumIter, EnumString, EnumVariantNames};

/// SV operation targeted by an SV get
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, EnumVariantNames, EnumIter)]
pub enum SvOperation {
    Reload,
    Debit,
}

/// SV action, normal or cancellation of a previous operation
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, EnumVariantNames, EnumIter)]
pub enum SvAction {
    Do,
    Undo,
}

/// SV get response content
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SvGetData {
    /// Operation requested in the SV get
    pub operation: SvOperation,
    /// Current SV balance
    pub balance: i32,
    /// Last SV transaction number
    pub tnum: u16,
    /// Version of the SV key
    pub kvc: u8,
    /// Card SV challenge
    pub challenge: Vec<u8>,
    /// Last load log record, when returned
    pub load_log: Option<Vec<u8>>,
    /// Last debit log record, when returned
    pub debit_log: Option<Vec<u8>>,
    /// Raw SV get response, used to compute SV security data
    pub data: Vec<u8>,
}

/// Terminal security data attached to SV reload / debit commands,
/// computed by the crypto module from the preceding SV get
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SvSecurity {
    /// Crypto module serial number
    pub sam_id: [u8; 4],
    /// Crypto module transaction number
    pub sam_tnum: [u8; 3],
    /// Terminal SV MAC
    pub terminal_mac: Vec<u8>,
}
