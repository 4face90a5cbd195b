// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Calypso card snapshot
//!
//! A [CalypsoCard] is produced by card selection (or by the simulator) and then
//! updated by the transaction manager as commands are processed.

use std::collections::BTreeMap;

use calypso_apdu::{
    file::{DirectoryHeader, FileHeader},
    product::{CardFeatures, ProductType},
};

mod file;
pub use file::{ElementaryFile, FileData};

mod sv;
pub use sv::{SvDebitLogRecord, SvLoadLogRecord, SV_DEBIT_LOG_SIZE, SV_LOAD_LOG_SIZE};

/// Default card payload capacity (bytes per command)
pub const DEFAULT_PAYLOAD_CAPACITY: usize = 250;

/// Unit used to account for session modifications
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BufferUnit {
    /// Buffer size in bytes, each command costs its payload plus an overhead
    Bytes,
    /// Buffer size in commands
    Commands,
}

/// Card session modifications buffer, from the startup information
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ModificationsBuffer {
    pub unit: BufferUnit,
    pub capacity: usize,
}

impl Default for ModificationsBuffer {
    fn default() -> Self {
        Self {
            unit: BufferUnit::Bytes,
            capacity: 430,
        }
    }
}

/// Snapshot of the selected Calypso card application
#[derive(Clone, PartialEq, Debug)]
pub struct CalypsoCard {
    product_type: ProductType,
    features: CardFeatures,
    df_name: Vec<u8>,
    serial_number: Vec<u8>,
    startup_info: Vec<u8>,
    modifications: ModificationsBuffer,
    payload_capacity: usize,

    traceability: Vec<u8>,
    directory: Option<DirectoryHeader>,
    files: BTreeMap<u8, ElementaryFile>,
    search_results: BTreeMap<u8, Vec<u8>>,

    df_invalidated: bool,
    df_ratified: Option<bool>,
    transaction_counter: Option<u32>,
    pin_attempts: Option<u8>,

    sv_balance: Option<i32>,
    sv_last_tnum: Option<u16>,
    sv_kvc: Option<u8>,
    sv_load_log: Option<SvLoadLogRecord>,
    sv_debit_logs: Vec<SvDebitLogRecord>,
}

impl CalypsoCard {
    /// Create a snapshot for a selected application
    pub fn new(product_type: ProductType, serial_number: &[u8]) -> Self {
        Self {
            product_type,
            features: CardFeatures::empty(),
            df_name: vec![],
            serial_number: serial_number.to_vec(),
            startup_info: vec![],
            modifications: ModificationsBuffer::default(),
            payload_capacity: DEFAULT_PAYLOAD_CAPACITY,
            traceability: vec![],
            directory: None,
            files: BTreeMap::new(),
            search_results: BTreeMap::new(),
            df_invalidated: false,
            df_ratified: None,
            transaction_counter: None,
            pin_attempts: None,
            sv_balance: None,
            sv_last_tnum: None,
            sv_kvc: None,
            sv_load_log: None,
            sv_debit_logs: vec![],
        }
    }

    pub fn with_features(mut self, features: CardFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_df_name(mut self, df_name: &[u8]) -> Self {
        self.df_name = df_name.to_vec();
        self
    }

    pub fn with_startup_info(mut self, startup_info: &[u8]) -> Self {
        self.startup_info = startup_info.to_vec();
        self
    }

    pub fn with_modifications_buffer(mut self, unit: BufferUnit, capacity: usize) -> Self {
        self.modifications = ModificationsBuffer { unit, capacity };
        self
    }

    pub fn with_payload_capacity(mut self, payload_capacity: usize) -> Self {
        self.payload_capacity = payload_capacity;
        self
    }

    /// Mark the DF as invalidated at selection
    pub fn with_df_invalidated(mut self, invalidated: bool) -> Self {
        self.df_invalidated = invalidated;
        self
    }

    pub fn with_directory(mut self, directory: DirectoryHeader) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    pub fn features(&self) -> CardFeatures {
        self.features
    }

    pub fn is_hce(&self) -> bool {
        self.features.contains(CardFeatures::HCE)
    }

    pub fn is_pin_feature_available(&self) -> bool {
        self.features.contains(CardFeatures::PIN)
    }

    pub fn is_sv_feature_available(&self) -> bool {
        self.features.contains(CardFeatures::SV)
    }

    pub fn is_extended_mode_supported(&self) -> bool {
        self.features.contains(CardFeatures::EXTENDED_MODE)
    }

    pub fn is_ratification_on_deselect_supported(&self) -> bool {
        self.features.contains(CardFeatures::RATIFICATION_ON_DESELECT)
    }

    pub fn df_name(&self) -> &[u8] {
        &self.df_name
    }

    pub fn serial_number(&self) -> &[u8] {
        &self.serial_number
    }

    pub fn startup_info(&self) -> &[u8] {
        &self.startup_info
    }

    pub fn modifications_buffer(&self) -> ModificationsBuffer {
        self.modifications
    }

    /// Maximum command payload accepted by the card
    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Traceability information, empty if not read
    pub fn traceability_information(&self) -> &[u8] {
        &self.traceability
    }

    pub fn directory_header(&self) -> Option<&DirectoryHeader> {
        self.directory.as_ref()
    }

    /// Fetch an EF by SFI
    pub fn file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
        self.files.get(&sfi)
    }

    /// Fetch an EF by LID, when its header is known
    pub fn file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
        self.files
            .values()
            .find(|f| f.header().map(|h| h.lid == lid).unwrap_or(false))
    }

    /// Fetch all known EFs
    pub fn files(&self) -> impl Iterator<Item = &ElementaryFile> {
        self.files.values()
    }

    /// Record numbers matching the last search on the provided EF
    pub fn search_result(&self, sfi: u8) -> Option<&[u8]> {
        self.search_results.get(&sfi).map(|r| r.as_slice())
    }

    pub fn is_df_invalidated(&self) -> bool {
        self.df_invalidated
    }

    /// Ratification status of the previous session, known once a session was opened
    pub fn is_df_ratified(&self) -> Option<bool> {
        self.df_ratified
    }

    /// Transaction counter, known once a session was opened
    pub fn transaction_counter(&self) -> Option<u32> {
        self.transaction_counter
    }

    /// Check whether the PIN is blocked, `None` if the PIN status is unknown
    pub fn is_pin_blocked(&self) -> Option<bool> {
        self.pin_attempts.map(|n| n == 0)
    }

    /// Remaining PIN presentation attempts, `None` if unknown
    pub fn pin_attempts_remaining(&self) -> Option<u8> {
        self.pin_attempts
    }

    pub fn sv_balance(&self) -> Option<i32> {
        self.sv_balance
    }

    pub fn sv_last_tnum(&self) -> Option<u16> {
        self.sv_last_tnum
    }

    pub fn sv_kvc(&self) -> Option<u8> {
        self.sv_kvc
    }

    pub fn sv_load_log_record(&self) -> Option<&SvLoadLogRecord> {
        self.sv_load_log.as_ref()
    }

    pub fn sv_debit_log_last_record(&self) -> Option<&SvDebitLogRecord> {
        self.sv_debit_logs.first()
    }

    /// All known debit log records, most recent first
    pub fn sv_debit_log_all_records(&self) -> &[SvDebitLogRecord] {
        &self.sv_debit_logs
    }

    pub(crate) fn file_mut(&mut self, sfi: u8) -> &mut ElementaryFile {
        self.files
            .entry(sfi)
            .or_insert_with(|| ElementaryFile::new(sfi))
    }

    pub(crate) fn data_mut(&mut self, sfi: u8) -> &mut FileData {
        self.file_mut(sfi).data_mut()
    }

    pub(crate) fn set_file_header(&mut self, sfi: u8, header: FileHeader) {
        self.file_mut(sfi).set_header(header);
    }

    pub(crate) fn set_directory(&mut self, directory: DirectoryHeader) {
        self.df_invalidated = directory.df_status & 0x01 != 0;
        self.directory = Some(directory);
    }

    pub(crate) fn set_traceability(&mut self, data: &[u8]) {
        self.traceability = data.to_vec();
    }

    pub(crate) fn set_search_result(&mut self, sfi: u8, matching: Vec<u8>) {
        self.search_results.insert(sfi, matching);
    }

    pub(crate) fn set_df_invalidated(&mut self, invalidated: bool) {
        self.df_invalidated = invalidated;
    }

    pub(crate) fn set_session_opening(&mut self, ratified: bool, transaction_counter: u32) {
        self.df_ratified = Some(ratified);
        self.transaction_counter = Some(transaction_counter);
    }

    pub(crate) fn set_pin_attempts(&mut self, attempts: u8) {
        self.pin_attempts = Some(attempts);
    }

    pub(crate) fn set_sv_status(&mut self, balance: i32, tnum: u16, kvc: u8) {
        self.sv_balance = Some(balance);
        self.sv_last_tnum = Some(tnum);
        self.sv_kvc = Some(kvc);
    }

    pub(crate) fn set_sv_load_log(&mut self, record: SvLoadLogRecord) {
        self.sv_load_log = Some(record);
    }

    /// Add a debit log record, `index` 0 being the most recent
    pub(crate) fn set_sv_debit_log(&mut self, index: usize, record: SvDebitLogRecord) {
        match index < self.sv_debit_logs.len() {
            true => self.sv_debit_logs[index] = record,
            false => self.sv_debit_logs.push(record),
        }
    }
}
