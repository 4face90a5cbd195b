// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Simulated Calypso card
//!
//! [SimCard] executes typed requests against in-memory files, with session
//! modifications discarded on cancel and committed on a verified close.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};
use rand_core::{OsRng, RngCore};

use calypso_apdu::{
    access::WriteAccessLevel,
    audit::ApduExchange,
    file::{DirectoryHeader, FileHeader, FileType, GetDataTag, SelectFileControl, SelectTarget},
    product::{CardFeatures, ProductType},
    request::{CardRequest, PinData, SearchRequest},
    response::{CardResponse, CardStatus, ResponseData, SessionOpening},
    sv::{SvGetData, SvOperation},
    COUNTER_SIZE, MAX_COUNTER_VALUE, PIN_LENGTH, PIN_MAX_ATTEMPTS, SV_DEBIT_LOG_RECORDS,
    SV_DEBIT_LOG_SFI, SV_RELOAD_LOG_SFI,
};
use calypso_card_core::{
    card::{BufferUnit, CalypsoCard, FileData, SV_DEBIT_LOG_SIZE, SV_LOAD_LOG_SIZE},
    error::ReaderError,
    reader::CardReader,
    session::COMMAND_OVERHEAD,
};

use crate::{
    encode::{encode_request, encode_response},
    mac::{apply_keystream, sv_signature, SessionMac, SimKeys, SV_KIF},
};

/// Status returned on session buffer overflow
pub const SW_BUFFER_OVERFLOW: u16 = 0x6400;

/// Status returned for commands not allowed in the current state
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;

/// Status returned for unsupported commands
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6d00;

/// Simulated card file
#[derive(Clone, PartialEq, Debug)]
struct SimFile {
    header: FileHeader,
    data: FileData,
}

/// Card content restored when a session is cancelled
#[derive(Clone, PartialEq, Debug)]
struct Content {
    files: BTreeMap<u8, SimFile>,
    directory: DirectoryHeader,
    sv_balance: i32,
    sv_tnum: u16,
}

/// Secure session in progress
struct Session {
    mac: SessionMac,
    backup: Content,
    used: usize,
}

/// Fault injection
#[derive(Clone, Debug, Default)]
struct Faults {
    /// Fail the exchange with this index
    fail_at: Option<usize>,
    /// Override the status of the next request with this name
    status: Option<(&'static str, CardStatus)>,
    tamper_session_mac: bool,
    fail_release: bool,
}

/// Simulated Calypso card implementing [CardReader]
pub struct SimCard {
    keys: SimKeys,
    product_type: ProductType,
    features: CardFeatures,
    serial_number: Vec<u8>,
    df_name: Vec<u8>,
    buffer: (BufferUnit, usize),
    payload_capacity: usize,
    traceability: Vec<u8>,
    contactless: bool,

    content: Content,
    selected: Option<u8>,

    pin: [u8; PIN_LENGTH],
    pin_attempts: u8,
    sv_kvc: u8,
    challenge: Vec<u8>,
    sv_challenge: Option<(SvOperation, Vec<u8>)>,

    session: Option<Session>,
    ratified: bool,
    transaction_counter: u32,

    faults: Faults,
    exchanges: usize,
    history: Vec<&'static str>,
    releases: usize,
}

impl SimCard {
    /// Create a card with an empty application
    pub fn new(product_type: ProductType, keys: SimKeys) -> Self {
        Self {
            keys,
            product_type,
            features: CardFeatures::default(),
            serial_number: vec![0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78],
            df_name: b"1TIC.ICA".to_vec(),
            buffer: (BufferUnit::Bytes, 430),
            payload_capacity: 250,
            traceability: vec![0x00; 8],
            contactless: true,
            content: Content {
                files: BTreeMap::new(),
                directory: DirectoryHeader {
                    lid: 0x2000,
                    access_conditions: [0x10, 0x10, 0x10, 0x10],
                    key_indexes: [0x01, 0x02, 0x03, 0x03],
                    df_status: 0x00,
                    kif: [0x21, 0x27, 0x30],
                    kvc: [0x79, 0x79, 0x79],
                },
                sv_balance: 0,
                sv_tnum: 0,
            },
            selected: None,
            pin: [0x30; PIN_LENGTH],
            pin_attempts: PIN_MAX_ATTEMPTS,
            sv_kvc: 0x79,
            challenge: vec![],
            sv_challenge: None,
            session: None,
            ratified: true,
            transaction_counter: 0x00_1000,
            faults: Faults::default(),
            exchanges: 0,
            history: vec![],
            releases: 0,
        }
    }

    pub fn with_features(mut self, features: CardFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_serial_number(mut self, serial_number: &[u8]) -> Self {
        self.serial_number = serial_number.to_vec();
        self
    }

    /// Set the session modifications buffer
    pub fn with_modifications_buffer(mut self, unit: BufferUnit, capacity: usize) -> Self {
        self.buffer = (unit, capacity);
        self
    }

    pub fn with_payload_capacity(mut self, payload_capacity: usize) -> Self {
        self.payload_capacity = payload_capacity;
        self
    }

    pub fn with_contactless(mut self, contactless: bool) -> Self {
        self.contactless = contactless;
        self
    }

    /// Set the session key for an access level
    pub fn with_session_key(mut self, level: WriteAccessLevel, kif: u8, kvc: u8) -> Self {
        let i = level.key_index() as usize - 1;
        self.content.directory.kif[i] = kif;
        self.content.directory.kvc[i] = kvc;
        self
    }

    /// Add an EF with the provided records
    pub fn with_file<R: AsRef<[u8]>>(
        mut self,
        sfi: u8,
        header: FileHeader,
        records: impl IntoIterator<Item = (u8, R)>,
    ) -> Self {
        let mut data = FileData::default();
        for (n, r) in records {
            data.set_content(n, r.as_ref());
        }

        self.content.files.insert(sfi, SimFile { header, data });
        self
    }

    /// Add a counters EF with the provided initial values
    pub fn with_counters(mut self, sfi: u8, lid: u16, values: &[u32]) -> Self {
        let mut data = FileData::default();
        for (i, v) in values.iter().enumerate() {
            data.set_counter(i as u8 + 1, *v);
        }

        let header = FileHeader::new(
            lid,
            FileType::Counters,
            (values.len() * COUNTER_SIZE) as u16,
            1,
        );
        self.content.files.insert(sfi, SimFile { header, data });
        self
    }

    /// Enable the PIN feature with the provided PIN
    pub fn with_pin(mut self, pin: [u8; PIN_LENGTH]) -> Self {
        self.features |= CardFeatures::PIN;
        self.pin = pin;
        self
    }

    /// Enable the SV feature with the provided balance and key version
    pub fn with_sv(mut self, balance: i32, kvc: u8) -> Self {
        self.features |= CardFeatures::SV;
        self.content.sv_balance = balance;
        self.sv_kvc = kvc;

        let log = |lid: u16, size: usize, records: u8| FileHeader::new(lid, FileType::Cyclic, size as u16, records);
        self.content.files.insert(
            SV_RELOAD_LOG_SFI,
            SimFile {
                header: log(0x1014, SV_LOAD_LOG_SIZE, 1),
                data: FileData::default(),
            },
        );
        self.content.files.insert(
            SV_DEBIT_LOG_SFI,
            SimFile {
                header: log(0x1015, SV_DEBIT_LOG_SIZE, SV_DEBIT_LOG_RECORDS),
                data: FileData::default(),
            },
        );

        self
    }

    /// Mark the DF as invalidated
    pub fn with_df_invalidated(mut self) -> Self {
        self.content.directory.df_status |= 0x01;
        self
    }

    /// Fail the exchange with the provided index (from zero) with a card I/O error
    pub fn fail_exchange_at(&mut self, index: usize) {
        self.faults.fail_at = Some(index);
    }

    /// Respond to the next request named `command` with `status`
    pub fn fail_command(&mut self, command: &'static str, status: CardStatus) {
        self.faults.status = Some((command, status));
    }

    /// Corrupt card session signatures returned on close
    pub fn tamper_session_mac(&mut self) {
        self.faults.tamper_session_mac = true;
    }

    /// Fail channel release
    pub fn fail_release(&mut self) {
        self.faults.fail_release = true;
    }

    /// Build the snapshot produced by selecting this card
    pub fn snapshot(&self) -> CalypsoCard {
        CalypsoCard::new(self.product_type, &self.serial_number)
            .with_features(self.features)
            .with_df_name(&self.df_name)
            .with_modifications_buffer(self.buffer.0, self.buffer.1)
            .with_payload_capacity(self.payload_capacity)
            .with_df_invalidated(self.is_df_invalidated())
            .with_directory(self.content.directory.clone())
    }

    /// Names of the requests received, in order
    pub fn history(&self) -> &[&'static str] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Record content as stored on the card
    pub fn record(&self, sfi: u8, record_number: u8) -> Option<&[u8]> {
        self.content
            .files
            .get(&sfi)
            .and_then(|f| f.data.content(record_number))
    }

    /// Counter value as stored on the card
    pub fn counter(&self, sfi: u8, counter_number: u8) -> Option<u32> {
        self.content
            .files
            .get(&sfi)
            .and_then(|f| f.data.counter(counter_number))
    }

    pub fn sv_balance(&self) -> i32 {
        self.content.sv_balance
    }

    pub fn sv_tnum(&self) -> u16 {
        self.content.sv_tnum
    }

    pub fn pin(&self) -> [u8; PIN_LENGTH] {
        self.pin
    }

    pub fn pin_attempts(&self) -> u8 {
        self.pin_attempts
    }

    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_ratified(&self) -> bool {
        self.ratified
    }

    pub fn is_df_invalidated(&self) -> bool {
        self.content.directory.df_status & 0x01 != 0
    }

    pub fn transaction_counter(&self) -> u32 {
        self.transaction_counter
    }

    /// Session key for an access level
    pub fn session_key(&self, level: WriteAccessLevel) -> (u8, u8) {
        (
            self.content.directory.kif(level),
            self.content.directory.kvc(level),
        )
    }

    /// Number of channel releases
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Execute a request, returning the status and response data
    fn execute(&mut self, req: &CardRequest) -> (CardStatus, ResponseData) {
        use CardRequest::*;

        // SV operations must directly follow an SV get
        let sv_challenge = match req {
            SvGet { .. } => None,
            _ => self.sv_challenge.take(),
        };

        match req {
            SelectFile { target } => self.select_file(*target),
            GetData { tag } => self.get_data(*tag),
            ReadRecord {
                sfi,
                record_number,
                expected_length,
            } => {
                let max = expected_length.map(|l| l as usize).unwrap_or(usize::MAX);
                self.read_records(*sfi, *record_number, *record_number, 0, max)
            }
            ReadRecords {
                sfi,
                first,
                last,
                record_size,
            } => self.read_records(*sfi, *first, *last, 0, *record_size as usize),
            ReadRecordMultiple {
                sfi,
                first,
                last,
                offset,
                length,
            } => self.read_records(*sfi, *first, *last, *offset as usize, *length as usize),
            ReadBinary {
                sfi,
                offset,
                length,
            } => self.read_binary(*sfi, *offset as usize, *length as usize),
            SearchRecordMultiple(s) => self.search(s),

            AppendRecord { sfi, data } => self.modify(*sfi, data.len(), |f| {
                let limit = f.header.records_number;
                f.data.add_cyclic_content(data, Some(limit));
                ResponseData::None
            }),
            UpdateRecord {
                sfi,
                record_number,
                data,
            } => self.modify(*sfi, data.len(), |f| {
                f.data.set_content(*record_number, data);
                ResponseData::None
            }),
            WriteRecord {
                sfi,
                record_number,
                data,
            } => self.modify(*sfi, data.len(), |f| {
                f.data.fill_content(*record_number, 0, data);
                ResponseData::None
            }),
            UpdateBinary { sfi, offset, data } => self.modify(*sfi, data.len(), |f| {
                f.data.set_content_at(1, *offset as usize, data);
                ResponseData::None
            }),
            WriteBinary { sfi, offset, data } => self.modify(*sfi, data.len(), |f| {
                f.data.fill_content(1, *offset as usize, data);
                ResponseData::None
            }),
            Increase {
                sfi,
                counter,
                value,
            } => self.change_counters(*sfi, &[(*counter, *value)], true, COUNTER_SIZE),
            Decrease {
                sfi,
                counter,
                value,
            } => self.change_counters(*sfi, &[(*counter, *value)], false, COUNTER_SIZE),
            IncreaseMultiple { sfi, counters } => {
                self.change_counters(*sfi, counters, true, counters.len() * (COUNTER_SIZE + 1))
            }
            DecreaseMultiple { sfi, counters } => {
                self.change_counters(*sfi, counters, false, counters.len() * (COUNTER_SIZE + 1))
            }

            GetChallenge => {
                let mut c = vec![0u8; 8];
                OsRng.fill_bytes(&mut c);
                self.challenge = c.clone();
                (CardStatus::Success, ResponseData::Challenge(c))
            }
            VerifyPin { pin } => self.verify_pin(pin),
            ChangePin { pin } => self.change_pin(pin),
            ChangeKey {
                key_index,
                ciphered_key,
            } => self.change_key(*key_index, ciphered_key),

            SvGet {
                operation,
                extended_log,
            } => self.sv_get(*operation, *extended_log),
            SvReload {
                amount,
                date,
                time,
                free,
                security,
            } => self.sv_operation(
                sv_challenge,
                SvOperation::Reload,
                *amount,
                false,
                date,
                time,
                &security.terminal_mac,
                |c, balance, tnum| {
                    let mut r = [0u8; SV_LOAD_LOG_SIZE];
                    r[0..2].copy_from_slice(date);
                    r[2] = free[0];
                    r[3] = c.sv_kvc;
                    r[4] = free[1];
                    BigEndian::write_i24(&mut r[5..8], balance);
                    BigEndian::write_i24(&mut r[8..11], *amount);
                    r[11..13].copy_from_slice(time);
                    r[13..17].copy_from_slice(&security.sam_id);
                    r[17..20].copy_from_slice(&security.sam_tnum);
                    BigEndian::write_u16(&mut r[20..22], tnum);
                    (SV_RELOAD_LOG_SFI, r.to_vec())
                },
            ),
            SvDebit {
                undo,
                amount,
                date,
                time,
                security,
            } => {
                let delta = match undo {
                    true => *amount,
                    false => -*amount,
                };
                self.sv_operation(
                    sv_challenge,
                    SvOperation::Debit,
                    delta,
                    *undo,
                    date,
                    time,
                    &security.terminal_mac,
                    |c, balance, tnum| {
                        let mut r = [0u8; SV_DEBIT_LOG_SIZE];
                        BigEndian::write_i16(&mut r[0..2], *amount as i16);
                        r[2..4].copy_from_slice(date);
                        r[4..6].copy_from_slice(time);
                        r[6] = c.sv_kvc;
                        r[7..11].copy_from_slice(&security.sam_id);
                        r[11..14].copy_from_slice(&security.sam_tnum);
                        BigEndian::write_i24(&mut r[14..17], balance);
                        BigEndian::write_u16(&mut r[17..19], tnum);
                        (SV_DEBIT_LOG_SFI, r.to_vec())
                    },
                )
            }

            Invalidate => self.set_df_status(true),
            Rehabilitate => self.set_df_status(false),

            OpenSecureSession {
                level,
                terminal_challenge,
                read,
                extended,
            } => self.open_session(*level, terminal_challenge, *read, *extended),
            ManageSecureSession {
                authenticate,
                encryption,
                terminal_mac,
            } => self.manage_session(*authenticate, *encryption, terminal_mac.as_deref()),
            CloseSecureSession {
                terminal_mac,
                ratify_now,
            } => self.close_session(terminal_mac, *ratify_now),
            CancelSecureSession => {
                if let Some(s) = self.session.take() {
                    log::debug!("card session cancelled");
                    self.content = s.backup;
                }
                (CardStatus::Success, ResponseData::None)
            }
            Ratification => {
                self.ratified = true;
                (CardStatus::Success, ResponseData::None)
            }
        }
    }

    fn select_file(&mut self, target: SelectTarget) -> (CardStatus, ResponseData) {
        let sfi = match target {
            SelectTarget::Lid(lid) if lid == self.content.directory.lid => {
                self.selected = None;
                return self.directory();
            }
            SelectTarget::Lid(lid) => self
                .content
                .files
                .iter()
                .find(|(_, f)| f.header.lid == lid)
                .map(|(sfi, _)| *sfi),
            SelectTarget::Control(SelectFileControl::CurrentDf) => return self.directory(),
            SelectTarget::Control(SelectFileControl::FirstEf) => {
                self.content.files.keys().next().copied()
            }
            SelectTarget::Control(SelectFileControl::NextEf) => {
                let current = self.selected.unwrap_or(0);
                self.content
                    .files
                    .range(current.saturating_add(1)..)
                    .next()
                    .map(|(sfi, _)| *sfi)
            }
        };

        match sfi {
            Some(sfi) => {
                self.selected = Some(sfi);
                self.file_info(sfi)
            }
            None => (CardStatus::NotFound, ResponseData::None),
        }
    }

    fn get_data(&mut self, tag: GetDataTag) -> (CardStatus, ResponseData) {
        match tag {
            GetDataTag::FcpForCurrentFile => match self.selected {
                Some(sfi) => self.file_info(sfi),
                None => (CardStatus::NotFound, ResponseData::None),
            },
            GetDataTag::FciForCurrentDf => self.directory(),
            GetDataTag::EfList => {
                let files = self
                    .content
                    .files
                    .iter()
                    .map(|(sfi, f)| (*sfi, f.header.clone()))
                    .collect();
                (CardStatus::Success, ResponseData::EfList(files))
            }
            GetDataTag::TraceabilityInformation => (
                CardStatus::Success,
                ResponseData::Traceability(self.traceability.clone()),
            ),
        }
    }

    fn directory(&self) -> (CardStatus, ResponseData) {
        (
            CardStatus::Success,
            ResponseData::Directory(self.content.directory.clone()),
        )
    }

    fn file_info(&self, sfi: u8) -> (CardStatus, ResponseData) {
        match self.content.files.get(&sfi) {
            Some(f) => (
                CardStatus::Success,
                ResponseData::File {
                    sfi,
                    header: f.header.clone(),
                },
            ),
            None => (CardStatus::NotFound, ResponseData::None),
        }
    }

    fn read_records(
        &self,
        sfi: u8,
        first: u8,
        last: u8,
        offset: usize,
        length: usize,
    ) -> (CardStatus, ResponseData) {
        let file = match self.content.files.get(&sfi) {
            Some(f) => f,
            None => return (CardStatus::NotFound, ResponseData::None),
        };

        let records: Vec<_> = (first..=last)
            .filter_map(|n| file.data.content(n).map(|r| (n, r)))
            .map(|(n, r)| {
                let start = offset.min(r.len());
                let end = start.saturating_add(length).min(r.len());
                (n, r[start..end].to_vec())
            })
            .collect();

        match records.is_empty() {
            true => (CardStatus::NotFound, ResponseData::None),
            false => (CardStatus::Success, ResponseData::Records(records)),
        }
    }

    fn read_binary(&self, sfi: u8, offset: usize, length: usize) -> (CardStatus, ResponseData) {
        let content = match self.content.files.get(&sfi) {
            Some(f) if f.header.file_type == FileType::Binary => {
                f.data.content(1).unwrap_or_default()
            }
            _ => return (CardStatus::NotFound, ResponseData::None),
        };

        if offset > content.len() {
            return (CardStatus::NotFound, ResponseData::None);
        }

        let end = (offset + length).min(content.len());
        (
            CardStatus::Success,
            ResponseData::Binary(content[offset..end].to_vec()),
        )
    }

    fn search(&self, s: &SearchRequest) -> (CardStatus, ResponseData) {
        let file = match self.content.files.get(&s.sfi) {
            Some(f) => f,
            None => return (CardStatus::NotFound, ResponseData::None),
        };

        let matches_at = |r: &[u8], o: usize| {
            r.len() >= o + s.data.len()
                && s
                    .data
                    .iter()
                    .zip(&s.mask)
                    .zip(&r[o..])
                    .all(|((d, m), b)| d & m == b & m)
        };

        let matching: Vec<u8> = file
            .data
            .all_content()
            .range(s.start..)
            .filter(|(_, r)| match s.repeated_offset {
                true => (s.offset as usize..r.len()).any(|o| matches_at(r, o)),
                false => matches_at(r, s.offset as usize),
            })
            .map(|(n, _)| *n)
            .collect();

        let first_record = match s.fetch_first {
            true => matching
                .first()
                .and_then(|n| file.data.content(*n))
                .map(|r| r.to_vec()),
            false => None,
        };

        (
            CardStatus::Success,
            ResponseData::Search {
                matching,
                first_record,
            },
        )
    }

    /// Account for a session modification, returning an overflow status when full
    fn reserve(&mut self, payload: usize) -> Result<(), CardStatus> {
        let (unit, capacity) = self.buffer;

        if let Some(s) = self.session.as_mut() {
            let cost = match unit {
                BufferUnit::Bytes => payload + COMMAND_OVERHEAD,
                BufferUnit::Commands => 1,
            };

            if s.used + cost > capacity {
                log::debug!("card session buffer overflow ({} + {} > {})", s.used, cost, capacity);
                return Err(CardStatus::Other(SW_BUFFER_OVERFLOW));
            }
            s.used += cost;
        }

        Ok(())
    }

    fn modify(
        &mut self,
        sfi: u8,
        payload: usize,
        f: impl FnOnce(&mut SimFile) -> ResponseData,
    ) -> (CardStatus, ResponseData) {
        if !self.content.files.contains_key(&sfi) {
            return (CardStatus::NotFound, ResponseData::None);
        }
        if let Err(status) = self.reserve(payload) {
            return (status, ResponseData::None);
        }

        match self.content.files.get_mut(&sfi) {
            Some(file) => (CardStatus::Success, f(file)),
            None => (CardStatus::NotFound, ResponseData::None),
        }
    }

    fn change_counters(
        &mut self,
        sfi: u8,
        changes: &[(u8, u32)],
        increase: bool,
        payload: usize,
    ) -> (CardStatus, ResponseData) {
        let file = match self.content.files.get(&sfi) {
            Some(f) => f,
            None => return (CardStatus::NotFound, ResponseData::None),
        };

        let mut values = vec![];
        for (n, v) in changes {
            let current = file.data.counter(*n).unwrap_or(0);
            let value = match increase {
                true => current.checked_add(*v).filter(|n| *n <= MAX_COUNTER_VALUE),
                false => current.checked_sub(*v),
            };

            match value {
                Some(value) => values.push((*n, value)),
                None => return (CardStatus::Other(SW_BUFFER_OVERFLOW), ResponseData::None),
            }
        }

        self.modify(sfi, payload, |f| {
            for (n, v) in &values {
                f.data.set_counter(*n, *v);
            }
            ResponseData::Counters(values)
        })
    }

    fn verify_pin(&mut self, pin: &PinData) -> (CardStatus, ResponseData) {
        if self.pin_attempts == 0 {
            return (CardStatus::PinBlocked, ResponseData::None);
        }

        let presented = match pin {
            PinData::Status => {
                let status = match self.pin_attempts {
                    PIN_MAX_ATTEMPTS => CardStatus::Success,
                    n => CardStatus::PinIncorrect(n),
                };
                return (status, ResponseData::None);
            }
            PinData::Plain(p) => p.to_vec(),
            PinData::Ciphered(c) => self.decipher(c, b"pin"),
        };

        match presented == self.pin {
            true => {
                self.pin_attempts = PIN_MAX_ATTEMPTS;
                (CardStatus::Success, ResponseData::None)
            }
            false => {
                self.pin_attempts -= 1;
                match self.pin_attempts {
                    0 => (CardStatus::PinBlocked, ResponseData::None),
                    n => (CardStatus::PinIncorrect(n), ResponseData::None),
                }
            }
        }
    }

    fn change_pin(&mut self, pin: &PinData) -> (CardStatus, ResponseData) {
        let new = match pin {
            PinData::Status => return (CardStatus::Other(SW_CONDITIONS_NOT_SATISFIED), ResponseData::None),
            PinData::Plain(p) => p.to_vec(),
            PinData::Ciphered(c) => {
                let pins = self.decipher(c, b"pin-change");
                if pins.len() != 2 * PIN_LENGTH || pins[..PIN_LENGTH] != self.pin {
                    return (CardStatus::SecurityNotSatisfied, ResponseData::None);
                }
                pins[PIN_LENGTH..].to_vec()
            }
        };

        self.pin.copy_from_slice(&new);
        self.pin_attempts = PIN_MAX_ATTEMPTS;

        (CardStatus::Success, ResponseData::None)
    }

    fn change_key(&mut self, key_index: u8, block: &[u8]) -> (CardStatus, ResponseData) {
        if block.len() != 4 + 32 || !(1..=3).contains(&key_index) {
            return (CardStatus::Other(SW_CONDITIONS_NOT_SATISFIED), ResponseData::None);
        }

        let (issuer, target) = ((block[0], block[1]), (block[2], block[3]));
        let key = apply_keystream(
            &self.keys.key(issuer.0, issuer.1),
            &self.challenge,
            b"key",
            &block[4..],
        );

        if key[..] != self.keys.key(target.0, target.1)[..] {
            return (CardStatus::SecurityNotSatisfied, ResponseData::None);
        }

        let i = key_index as usize - 1;
        self.content.directory.kif[i] = target.0;
        self.content.directory.kvc[i] = target.1;

        (CardStatus::Success, ResponseData::None)
    }

    /// Decipher a `[kif, kvc, data..]` block with the last card challenge
    fn decipher(&self, block: &[u8], label: &[u8]) -> Vec<u8> {
        match block {
            [kif, kvc, data @ ..] => {
                apply_keystream(&self.keys.key(*kif, *kvc), &self.challenge, label, data)
            }
            _ => vec![],
        }
    }

    fn sv_get(&mut self, operation: SvOperation, extended_log: bool) -> (CardStatus, ResponseData) {
        if !self.features.contains(CardFeatures::SV) {
            return (CardStatus::Other(SW_INS_NOT_SUPPORTED), ResponseData::None);
        }

        let mut challenge = vec![0u8; 2];
        OsRng.fill_bytes(&mut challenge);
        self.sv_challenge = Some((operation, challenge.clone()));

        let log = |sfi| {
            self.content
                .files
                .get(&sfi)
                .and_then(|f| f.data.content(1))
                .map(|r| r.to_vec())
        };
        let load_log = (operation == SvOperation::Reload || extended_log)
            .then(|| log(SV_RELOAD_LOG_SFI).unwrap_or_else(|| vec![0; SV_LOAD_LOG_SIZE]));
        let debit_log = (operation == SvOperation::Debit || extended_log)
            .then(|| log(SV_DEBIT_LOG_SFI).unwrap_or_else(|| vec![0; SV_DEBIT_LOG_SIZE]));

        let mut data = challenge.clone();
        data.extend_from_slice(&self.content.sv_tnum.to_be_bytes());
        data.extend_from_slice(&self.content.sv_balance.to_be_bytes()[1..]);
        data.push(self.sv_kvc);

        let sv = SvGetData {
            operation,
            balance: self.content.sv_balance,
            tnum: self.content.sv_tnum,
            kvc: self.sv_kvc,
            challenge,
            load_log,
            debit_log,
            data,
        };

        (CardStatus::Success, ResponseData::SvStatus(sv))
    }

    #[allow(clippy::too_many_arguments)]
    fn sv_operation(
        &mut self,
        sv_challenge: Option<(SvOperation, Vec<u8>)>,
        operation: SvOperation,
        delta: i32,
        undo: bool,
        date: &[u8; 2],
        time: &[u8; 2],
        terminal_mac: &[u8],
        log_record: impl FnOnce(&Self, i32, u16) -> (u8, Vec<u8>),
    ) -> (CardStatus, ResponseData) {
        let challenge = match sv_challenge {
            Some((o, c)) if o == operation => c,
            _ => return (CardStatus::Other(SW_CONDITIONS_NOT_SATISFIED), ResponseData::None),
        };

        // Reloads transmit the signed amount, debits the absolute amount
        let amount = match operation {
            SvOperation::Reload => delta,
            SvOperation::Debit => delta.abs(),
        };

        let key = self.keys.key(SV_KIF, self.sv_kvc);
        let tnum = self.content.sv_tnum;
        let expected = sv_signature(&key, b"sv-terminal", &challenge, tnum, amount, undo, date, time);

        if expected != terminal_mac {
            return (CardStatus::SecurityNotSatisfied, ResponseData::None);
        }

        let tnum = tnum.wrapping_add(1);
        let balance = self.content.sv_balance + delta;

        let (sfi, record) = log_record(self, balance, tnum);
        if let Some(f) = self.content.files.get_mut(&sfi) {
            let limit = f.header.records_number;
            f.data.add_cyclic_content(&record, Some(limit));
        }

        self.content.sv_balance = balance;
        self.content.sv_tnum = tnum;

        log::debug!("card SV {} ({}), balance {}", operation, delta, balance);

        let card_mac = sv_signature(&key, b"sv-card", &challenge, tnum, amount, undo, date, time);
        (CardStatus::Success, ResponseData::SvSignature(card_mac))
    }

    fn set_df_status(&mut self, invalidated: bool) -> (CardStatus, ResponseData) {
        if self.is_df_invalidated() == invalidated {
            return (CardStatus::Other(SW_CONDITIONS_NOT_SATISFIED), ResponseData::None);
        }
        if let Err(status) = self.reserve(0) {
            return (status, ResponseData::None);
        }

        match invalidated {
            true => self.content.directory.df_status |= 0x01,
            false => self.content.directory.df_status &= !0x01,
        }

        (CardStatus::Success, ResponseData::None)
    }

    fn open_session(
        &mut self,
        level: WriteAccessLevel,
        terminal_challenge: &[u8],
        read: Option<(u8, u8)>,
        extended: bool,
    ) -> (CardStatus, ResponseData) {
        if self.session.is_some() {
            return (CardStatus::Other(SW_CONDITIONS_NOT_SATISFIED), ResponseData::None);
        }
        if extended && !self.features.contains(CardFeatures::EXTENDED_MODE) {
            return (CardStatus::Other(SW_INS_NOT_SUPPORTED), ResponseData::None);
        }

        let (kif, kvc) = self.session_key(level);

        let record = match read {
            Some((sfi, n)) => self
                .content
                .files
                .get(&sfi)
                .and_then(|f| f.data.content(n))
                .map(|r| r.to_vec()),
            None => None,
        };

        self.transaction_counter = self.transaction_counter.saturating_sub(1);

        let mut card_challenge = vec![0u8; 4];
        OsRng.fill_bytes(&mut card_challenge);

        let mut data = card_challenge.clone();
        data.push(!self.ratified as u8);
        data.extend_from_slice(&self.transaction_counter.to_be_bytes()[1..]);
        data.extend_from_slice(&[kif, kvc]);
        if let Some(r) = &record {
            data.extend_from_slice(r);
        }

        log::debug!(
            "card session open (level: {}, kif: {:02x}, kvc: {:02x})",
            level,
            kif,
            kvc
        );

        self.session = Some(Session {
            mac: SessionMac::new(self.keys.key(kif, kvc), terminal_challenge, &data),
            backup: self.content.clone(),
            used: 0,
        });

        // Legacy cards do not return the KIF
        let kif = match self.product_type.is_legacy() {
            true => None,
            false => Some(kif),
        };

        let opening = SessionOpening {
            card_challenge,
            ratified: self.ratified,
            kif,
            kvc: Some(kvc),
            transaction_counter: self.transaction_counter,
            record,
            data,
        };

        self.ratified = false;

        (CardStatus::Success, ResponseData::SessionOpened(opening))
    }

    fn manage_session(
        &mut self,
        authenticate: bool,
        _encryption: Option<bool>,
        terminal_mac: Option<&[u8]>,
    ) -> (CardStatus, ResponseData) {
        if !self.features.contains(CardFeatures::EXTENDED_MODE) {
            return (CardStatus::Other(SW_INS_NOT_SUPPORTED), ResponseData::None);
        }

        let session = match self.session.as_ref() {
            Some(s) => s,
            None => return (CardStatus::Other(SW_CONDITIONS_NOT_SATISFIED), ResponseData::None),
        };

        if !authenticate {
            return (CardStatus::Success, ResponseData::SessionManaged { card_mac: None });
        }

        match terminal_mac {
            Some(m) if m == session.mac.sign(b"terminal-auth") => (
                CardStatus::Success,
                ResponseData::SessionManaged {
                    card_mac: Some(session.mac.sign(b"card-auth")),
                },
            ),
            _ => (CardStatus::SecurityNotSatisfied, ResponseData::None),
        }
    }

    fn close_session(&mut self, terminal_mac: &[u8], ratify_now: bool) -> (CardStatus, ResponseData) {
        let session = match self.session.take() {
            Some(s) => s,
            None => return (CardStatus::Other(SW_CONDITIONS_NOT_SATISFIED), ResponseData::None),
        };

        if session.mac.sign(b"terminal") != terminal_mac {
            log::debug!("card session close rejected, terminal signature mismatch");
            self.content = session.backup;
            return (CardStatus::SecurityNotSatisfied, ResponseData::None);
        }

        let mut card_mac = session.mac.sign(b"card");
        if self.faults.tamper_session_mac {
            card_mac[0] ^= 0xff;
        }

        self.ratified = ratify_now;

        log::debug!("card session closed (ratified: {})", ratify_now);

        (CardStatus::Success, ResponseData::SessionClosed { card_mac })
    }
}

impl CardReader for SimCard {
    fn transmit(&mut self, req: &CardRequest) -> Result<CardResponse, ReaderError> {
        let index = self.exchanges;
        self.exchanges += 1;
        self.history.push(req.name());

        if self.faults.fail_at == Some(index) {
            self.faults.fail_at = None;
            return Err(ReaderError::Card(format!("no response to {}", req.name())));
        }

        let (status, data) = match self.faults.status {
            Some((name, status)) if name == req.name() => {
                self.faults.status = None;
                (status, ResponseData::None)
            }
            _ => self.execute(req),
        };

        let exchange = ApduExchange::new(encode_request(req), encode_response(status, &data));

        // Session control commands are not part of the session digest
        let digested = !matches!(
            req,
            CardRequest::OpenSecureSession { .. }
                | CardRequest::CloseSecureSession { .. }
                | CardRequest::CancelSecureSession
                | CardRequest::Ratification
        );
        if let Some(s) = self.session.as_mut().filter(|_| digested) {
            s.mac.update(&exchange);
        }

        log::trace!("{} -> {}", hex::encode(&exchange.request), hex::encode(&exchange.response));

        Ok(CardResponse::new(status, data, exchange))
    }

    fn release_channel(&mut self) -> Result<(), ReaderError> {
        if self.faults.fail_release {
            return Err(ReaderError::Reader("channel release failed".to_string()));
        }

        self.releases += 1;
        self.session = None;

        Ok(())
    }

    fn is_contactless(&self) -> bool {
        self.contactless
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn card() -> SimCard {
        SimCard::new(ProductType::PrimeRevision3, SimKeys::default()).with_file(
            0x07,
            FileHeader::new(0x2010, FileType::Linear, 29, 3),
            [(1, [0x11; 29]), (2, [0x22; 29])],
        )
    }

    #[test]
    fn read_missing_record() -> anyhow::Result<()> {
        let mut c = card();

        let r = c
            .transmit(&CardRequest::ReadRecord {
                sfi: 0x07,
                record_number: 3,
                expected_length: None,
            })?;
        assert_eq!(r.status, CardStatus::NotFound);

        let r = c
            .transmit(&CardRequest::ReadRecords {
                sfi: 0x07,
                first: 1,
                last: 3,
                record_size: 29,
            })?;
        assert_eq!(r.status, CardStatus::Success);
        assert!(matches!(r.data, ResponseData::Records(r) if r.len() == 2));

        Ok(())
    }

    #[test]
    fn cancel_restores_content() -> anyhow::Result<()> {
        let mut c = card();

        c.transmit(&CardRequest::OpenSecureSession {
            level: WriteAccessLevel::Debit,
            terminal_challenge: vec![0; 8],
            read: None,
            extended: false,
        })?;

        let r = c
            .transmit(&CardRequest::UpdateRecord {
                sfi: 0x07,
                record_number: 1,
                data: vec![0xaa; 29],
            })?;
        assert_eq!(r.status, CardStatus::Success);
        assert_eq!(c.record(0x07, 1), Some(&[0xaa; 29][..]));

        c.transmit(&CardRequest::CancelSecureSession)?;
        assert_eq!(c.record(0x07, 1), Some(&[0x11; 29][..]));
        assert!(!c.is_session_open());

        Ok(())
    }

    #[test]
    fn session_buffer_overflow() -> anyhow::Result<()> {
        let mut c = card().with_modifications_buffer(BufferUnit::Commands, 1);

        c.transmit(&CardRequest::OpenSecureSession {
            level: WriteAccessLevel::Load,
            terminal_challenge: vec![0; 8],
            read: None,
            extended: false,
        })?;

        let update = CardRequest::UpdateRecord {
            sfi: 0x07,
            record_number: 2,
            data: vec![0xbb; 4],
        };
        assert_eq!(c.transmit(&update)?.status, CardStatus::Success);
        assert_eq!(
            c.transmit(&update)?.status,
            CardStatus::Other(SW_BUFFER_OVERFLOW)
        );

        Ok(())
    }

    #[test]
    fn injected_faults() -> anyhow::Result<()> {
        let mut c = card();
        c.fail_exchange_at(1);
        c.fail_command("GetChallenge", CardStatus::Other(0x6e00));

        let r = c.transmit(&CardRequest::GetChallenge)?;
        assert_eq!(r.status, CardStatus::Other(0x6e00));

        assert!(c.transmit(&CardRequest::GetChallenge).is_err());
        assert_eq!(
            c.transmit(&CardRequest::GetChallenge)?.status,
            CardStatus::Success
        );

        assert_eq!(c.history(), &["GetChallenge"; 3]);

        Ok(())
    }
}
