// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Batch processing
//!
//! [TransactionManager::process_commands] drains the queue and executes each command,
//! stopping at the first failure. Snapshot updates from commands executed before the
//! failure are kept, the remainder of the batch is discarded.

use std::collections::BTreeMap;

use zeroize::Zeroize;

use calypso_apdu::{
    access::{ChannelControl, WriteAccessLevel},
    file::{GetDataTag, SelectTarget},
    request::{CardRequest, PinData},
    response::{CardResponse, CardStatus, ResponseData, SessionOpening},
    sv::{SvAction, SvGetData, SvOperation},
    COUNTER_SIZE, PIN_LENGTH, PIN_MAX_ATTEMPTS,
};

use super::{apply::unexpected_data, prepare::SV_RELOAD_RANGE, TransactionManager, TransactionProfile};
use crate::{
    command::{Pin, PreparedCommand, ReadMode, ReadOutcome, SearchCommandData},
    crypto::{CryptoModule, KeyReference, SvCommandData},
    error::{check_range, CryptoError, Error},
    reader::CardReader,
    security::SessionFlags,
    session::{CardSession, SessionState},
};

impl<R: CardReader> TransactionManager<R> {
    /// Process all prepared commands, then apply the channel policy
    ///
    /// The channel is released on [ChannelControl::CloseAfter] whether or not
    /// processing succeeded.
    pub fn process_commands(&mut self, channel: ChannelControl) -> Result<&mut Self, Error> {
        let commands = self.queue.drain_all();

        log::debug!(
            "processing {} commands (session: {})",
            commands.len(),
            self.session.state()
        );

        let res = self.process_batch(commands);

        if let Err(e) = &res {
            log::warn!("command processing failed: {}", e);
            self.recover();
        }

        if channel == ChannelControl::CloseAfter {
            log::debug!("releasing channel");

            match (self.reader.release_channel(), &res) {
                (Ok(()), _) => (),
                (Err(e), Ok(_)) => return Err(e.into()),
                (Err(e), Err(_)) => log::warn!("channel release failed: {}", e),
            }
        }

        res.map(|_| self)
    }

    fn process_batch(&mut self, commands: Vec<PreparedCommand>) -> Result<(), Error> {
        let mut commands = commands.into_iter().peekable();

        while let Some(cmd) = commands.next() {
            // Only valid for the command immediately following the SV get
            let sv_pending = self.sv_pending.take();

            match cmd {
                PreparedCommand::OpenSession { level, pre_open } => {
                    let merge = !pre_open && !self.flag(SessionFlags::NO_READ_ON_OPEN);
                    let read = match merge {
                        true => commands.next_if(|c| c.mergeable_read().is_some()),
                        false => None,
                    };

                    self.open_session(level, read)?;
                }
                PreparedCommand::EarlyMutualAuthentication => {
                    let encrypt = commands
                        .next_if(|c| matches!(c, PreparedCommand::ActivateEncryption))
                        .is_some();

                    self.manage_session(true, encrypt.then_some(true))?;
                }
                cmd => self.process_command(cmd, sv_pending)?,
            }
        }

        Ok(())
    }

    fn process_command(
        &mut self,
        cmd: PreparedCommand,
        sv_pending: Option<(SvOperation, SvAction)>,
    ) -> Result<(), Error> {
        use PreparedCommand::*;

        log::debug!("process {}", cmd.name());

        match cmd {
            SelectFile(target) => self.select_file(target),
            GetData(tag) => self.get_data(tag),

            ReadRecord {
                sfi,
                record_number,
                mode,
            } => self.read_record(sfi, record_number, None, mode).map(|_| ()),
            ReadCounters { sfi, count, mode } => self
                .read_record(sfi, 1, Some(count * COUNTER_SIZE as u8), mode)
                .map(|_| ()),
            ReadRecords {
                sfi,
                first,
                last,
                record_size,
                mode,
            } => self.read_records(sfi, first, last, record_size, mode),
            ReadRecordsPartially {
                sfi,
                first,
                last,
                offset,
                length,
                mode,
            } => self.read_records_partially(sfi, first, last, offset, length, mode),
            ReadBinary {
                sfi,
                offset,
                length,
                mode,
            } => self.read_binary(sfi, offset, length, mode),
            SearchRecords(data) => self.search_records(&data),
            CheckPinStatus => self.check_pin_status(),

            AppendRecord { sfi, data } => {
                let req = CardRequest::AppendRecord {
                    sfi,
                    data: data.clone(),
                };
                self.modify(req, data.len())?;
                self.apply_append(sfi, &data);
                Ok(())
            }
            UpdateRecord {
                sfi,
                record_number,
                data,
            } => {
                let req = CardRequest::UpdateRecord {
                    sfi,
                    record_number,
                    data: data.clone(),
                };
                self.modify(req, data.len())?;
                self.card.data_mut(sfi).set_content(record_number, &data);
                Ok(())
            }
            WriteRecord {
                sfi,
                record_number,
                data,
            } => {
                let req = CardRequest::WriteRecord {
                    sfi,
                    record_number,
                    data: data.clone(),
                };
                self.modify(req, data.len())?;
                self.card.data_mut(sfi).fill_content(record_number, 0, &data);
                Ok(())
            }
            UpdateBinary { sfi, offset, data } => self.write_binary(sfi, offset, &data, false),
            WriteBinary { sfi, offset, data } => self.write_binary(sfi, offset, &data, true),

            IncreaseCounter {
                sfi,
                counter,
                value,
            } => self.change_counter(sfi, counter, value, true),
            DecreaseCounter {
                sfi,
                counter,
                value,
            } => self.change_counter(sfi, counter, value, false),
            IncreaseCounters { sfi, counters } => self.change_counters(sfi, counters, true),
            DecreaseCounters { sfi, counters } => self.change_counters(sfi, counters, false),

            SvGet { operation, action } => self.sv_get(operation, action),
            SvReload {
                amount,
                date,
                time,
                free,
            } => self.sv_reload(amount, date, time, free, sv_pending),
            SvDebit {
                action,
                amount,
                date,
                time,
            } => self.sv_debit(action, amount, date, time, sv_pending),

            Invalidate => {
                self.modify(CardRequest::Invalidate, 0)?;
                self.card.set_df_invalidated(true);
                Ok(())
            }
            Rehabilitate => {
                self.modify(CardRequest::Rehabilitate, 0)?;
                self.card.set_df_invalidated(false);
                Ok(())
            }

            VerifyPin(pin) => self.verify_pin(pin),
            ChangePin(pin) => self.change_pin(pin),
            ChangeKey {
                key_index,
                issuer,
                target,
            } => self.change_key(key_index, issuer, target),

            OpenSession { level, .. } => self.open_session(level, None),
            CloseSession => {
                if self.session.card_session().is_none() {
                    return Err(Error::IllegalState("no secure session open"));
                }
                self.close_session(false)?;
                self.session.on_closed();
                Ok(())
            }
            CancelSession => {
                self.cancel_session();
                Ok(())
            }

            EarlyMutualAuthentication => self.manage_session(true, None),
            ActivateEncryption => self.manage_session(false, Some(true)),
            DeactivateEncryption => self.manage_session(false, Some(false)),
        }
    }

    fn select_file(&mut self, target: SelectTarget) -> Result<(), Error> {
        let req = CardRequest::SelectFile { target };
        let resp = self.exchange(&req)?;

        match resp.status {
            CardStatus::Success => self.apply_file_info(req.name(), resp.data),
            CardStatus::NotFound => Err(Error::SelectFileNotFound(match target {
                SelectTarget::Lid(lid) => format!("lid {:04x}", lid),
                SelectTarget::Control(c) => c.to_string(),
            })),
            status => Err(Error::UnexpectedCardStatus {
                command: req.name(),
                status,
            }),
        }
    }

    fn get_data(&mut self, tag: GetDataTag) -> Result<(), Error> {
        let req = CardRequest::GetData { tag };
        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)?;

        self.apply_file_info(req.name(), resp.data)
    }

    fn read_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        expected_length: Option<u8>,
        mode: ReadMode,
    ) -> Result<ReadOutcome, Error> {
        match self.fetch_record(sfi, record_number, expected_length, mode)? {
            Some((name, data)) => {
                self.apply_records(name, sfi, (record_number, record_number), None, data)?;
                Ok(ReadOutcome::Read)
            }
            None => Ok(ReadOutcome::NotFound),
        }
    }

    fn fetch_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        expected_length: Option<u8>,
        mode: ReadMode,
    ) -> Result<Option<(&'static str, ResponseData)>, Error> {
        let req = CardRequest::ReadRecord {
            sfi,
            record_number,
            expected_length,
        };
        let resp = self.exchange(&req)?;

        match self.check_read(&req, mode, &resp)? {
            ReadOutcome::Read => Ok(Some((req.name(), resp.data))),
            ReadOutcome::NotFound => Ok(None),
        }
    }

    fn read_records(
        &mut self,
        sfi: u8,
        first: u8,
        last: u8,
        record_size: u8,
        mode: ReadMode,
    ) -> Result<(), Error> {
        let mut fetched = Vec::new();

        // Legacy cards read one record per command
        if self.card.product_type().is_legacy() {
            for n in first..=last {
                if let Some((name, data)) = self.fetch_record(sfi, n, Some(record_size), mode)? {
                    fetched.push((name, (n, n), data));
                }
            }
        } else {
            let per_exchange = (self.card.payload_capacity() / (record_size as usize + 2)).max(1);

            for (start, end) in chunk_range(first, last, per_exchange) {
                let req = CardRequest::ReadRecords {
                    sfi,
                    first: start,
                    last: end,
                    record_size,
                };
                let resp = self.exchange(&req)?;

                if self.check_read(&req, mode, &resp)? == ReadOutcome::NotFound {
                    break;
                }
                fetched.push((req.name(), (start, end), resp.data));
            }
        }

        for (name, range, data) in fetched {
            self.apply_records(name, sfi, range, None, data)?;
        }

        Ok(())
    }

    fn read_records_partially(
        &mut self,
        sfi: u8,
        first: u8,
        last: u8,
        offset: u8,
        length: u8,
        mode: ReadMode,
    ) -> Result<(), Error> {
        let per_exchange = (self.card.payload_capacity() / length as usize).max(1);
        let mut fetched = Vec::new();

        for (start, end) in chunk_range(first, last, per_exchange) {
            let req = CardRequest::ReadRecordMultiple {
                sfi,
                first: start,
                last: end,
                offset,
                length,
            };
            let resp = self.exchange(&req)?;

            if self.check_read(&req, mode, &resp)? == ReadOutcome::NotFound {
                break;
            }

            fetched.push((req.name(), (start, end), resp.data));
        }

        for (name, range, data) in fetched {
            self.apply_records(name, sfi, range, Some(offset), data)?;
        }

        Ok(())
    }

    fn read_binary(&mut self, sfi: u8, offset: u16, length: u16, mode: ReadMode) -> Result<(), Error> {
        let chunk = self.card.payload_capacity().clamp(1, u8::MAX as usize);
        let (mut offset, end) = (offset as usize, offset as usize + length as usize);
        let mut fetched = Vec::new();

        while offset < end {
            let n = (end - offset).min(chunk);
            let req = CardRequest::ReadBinary {
                sfi,
                offset: offset as u16,
                length: n as u8,
            };
            let resp = self.exchange(&req)?;

            if self.check_read(&req, mode, &resp)? == ReadOutcome::NotFound {
                break;
            }

            let data = match resp.data {
                ResponseData::Binary(d) => d,
                other => return Err(unexpected_data(req.name(), &other)),
            };

            // End of file
            let eof = data.len() < n;
            fetched.push((offset, data));
            if eof {
                break;
            }
            offset += n;
        }

        let file = self.card.data_mut(sfi);
        for (offset, data) in fetched {
            file.set_content_at(1, offset, &data);
        }

        Ok(())
    }

    fn search_records(&mut self, data: &SearchCommandData) -> Result<(), Error> {
        let req = CardRequest::SearchRecordMultiple(data.to_request());
        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)?;

        match resp.data {
            ResponseData::Search {
                matching,
                first_record,
            } => {
                if let (Some(n), Some(r)) = (matching.first(), first_record) {
                    self.card.data_mut(data.sfi()).set_content(*n, &r);
                }

                log::debug!("search sfi {:02x}: {} matches", data.sfi(), matching.len());
                self.card.set_search_result(data.sfi(), matching);

                Ok(())
            }
            other => Err(unexpected_data(req.name(), &other)),
        }
    }

    fn write_binary(&mut self, sfi: u8, offset: u16, data: &[u8], or: bool) -> Result<(), Error> {
        let chunk = self.card.payload_capacity().max(1);
        let mut written = Vec::new();

        for (i, part) in data.chunks(chunk).enumerate() {
            let offset = offset as usize + i * chunk;
            let req = match or {
                true => CardRequest::WriteBinary {
                    sfi,
                    offset: offset as u16,
                    data: part.to_vec(),
                },
                false => CardRequest::UpdateBinary {
                    sfi,
                    offset: offset as u16,
                    data: part.to_vec(),
                },
            };

            self.modify(req, part.len())?;
            written.push((offset, part));
        }

        // Snapshot only changes once every chunk is accepted
        let file = self.card.data_mut(sfi);
        for (offset, part) in written {
            match or {
                true => file.fill_content(1, offset, part),
                false => file.set_content_at(1, offset, part),
            }
        }

        Ok(())
    }

    fn change_counter(&mut self, sfi: u8, counter: u8, value: u32, increase: bool) -> Result<(), Error> {
        let data = self.send_counter(sfi, counter, value, increase)?;
        self.apply_counters(sfi, &[(counter, value)], increase, data);

        Ok(())
    }

    fn send_counter(&mut self, sfi: u8, counter: u8, value: u32, increase: bool) -> Result<ResponseData, Error> {
        let req = match increase {
            true => CardRequest::Increase {
                sfi,
                counter,
                value,
            },
            false => CardRequest::Decrease {
                sfi,
                counter,
                value,
            },
        };

        let resp = self.modify(req, COUNTER_SIZE)?;

        Ok(resp.data)
    }

    fn change_counters(
        &mut self,
        sfi: u8,
        counters: BTreeMap<u8, u32>,
        increase: bool,
    ) -> Result<(), Error> {
        let counters: Vec<_> = counters.into_iter().collect();
        let mut changed = Vec::new();

        // Multiple counter commands are not available on legacy cards
        let legacy = !self.card.product_type().is_rev3();
        let per_command = match legacy {
            true => 1,
            false => (self.card.payload_capacity() / (COUNTER_SIZE + 1)).max(1),
        };

        for part in counters.chunks(per_command) {
            let data = match (legacy, part) {
                (true, &[(counter, value)]) => self.send_counter(sfi, counter, value, increase)?,
                _ => {
                    let req = match increase {
                        true => CardRequest::IncreaseMultiple {
                            sfi,
                            counters: part.to_vec(),
                        },
                        false => CardRequest::DecreaseMultiple {
                            sfi,
                            counters: part.to_vec(),
                        },
                    };
                    self.modify(req, part.len() * (COUNTER_SIZE + 1))?.data
                }
            };
            changed.push((part, data));
        }

        // Counters are applied once every exchange succeeded
        for (part, data) in changed {
            self.apply_counters(sfi, part, increase, data);
        }

        Ok(())
    }

    fn check_pin_status(&mut self) -> Result<(), Error> {
        let req = CardRequest::VerifyPin {
            pin: PinData::Status,
        };
        let resp = self.exchange(&req)?;

        let attempts = match resp.status {
            CardStatus::Success => PIN_MAX_ATTEMPTS,
            CardStatus::PinIncorrect(n) => n,
            CardStatus::PinBlocked => 0,
            status => {
                return Err(Error::UnexpectedCardStatus {
                    command: req.name(),
                    status,
                })
            }
        };

        self.card.set_pin_attempts(attempts);

        Ok(())
    }

    fn verify_pin(&mut self, pin: Pin) -> Result<(), Error> {
        let data = match self.is_pin_plain() {
            true => PinData::Plain(*pin.as_bytes()),
            false => {
                let challenge = self.get_challenge()?;
                let key = self
                    .security
                    .as_ref()
                    .and_then(|s| s.pin_verification_ciphering_key());

                let ciphered = self.with_crypto(|c| {
                    c.cipher_pin_for_presentation(&challenge, pin.as_bytes(), key)
                })?;
                PinData::Ciphered(ciphered)
            }
        };

        let req = CardRequest::VerifyPin { pin: data };
        let resp = self.exchange(&req)?;

        match resp.status {
            CardStatus::Success => {
                self.card.set_pin_attempts(PIN_MAX_ATTEMPTS);
                self.pin = Some(pin);
                Ok(())
            }
            status => {
                match status {
                    CardStatus::PinIncorrect(n) => self.card.set_pin_attempts(n),
                    CardStatus::PinBlocked => self.card.set_pin_attempts(0),
                    _ => (),
                }

                Err(Error::UnexpectedCardStatus {
                    command: req.name(),
                    status,
                })
            }
        }
    }

    fn change_pin(&mut self, pin: Pin) -> Result<(), Error> {
        let data = match self.is_pin_plain() {
            true => PinData::Plain(*pin.as_bytes()),
            false => {
                let challenge = self.get_challenge()?;
                let key = self
                    .security
                    .as_ref()
                    .and_then(|s| s.pin_modification_ciphering_key());

                // Zeros when no PIN was presented in this transaction
                let mut current = self
                    .pin
                    .as_ref()
                    .map(|p| *p.as_bytes())
                    .unwrap_or([0u8; PIN_LENGTH]);

                let ciphered = self.with_crypto(|c| {
                    c.cipher_pin_for_modification(&challenge, &current, pin.as_bytes(), key)
                });
                current.zeroize();

                PinData::Ciphered(ciphered?)
            }
        };

        let req = CardRequest::ChangePin { pin: data };
        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)?;

        self.card.set_pin_attempts(PIN_MAX_ATTEMPTS);
        self.pin = Some(pin);

        Ok(())
    }

    fn change_key(&mut self, key_index: u8, issuer: KeyReference, target: KeyReference) -> Result<(), Error> {
        let challenge = self.get_challenge()?;
        let ciphered_key =
            self.with_crypto(|c| c.generate_ciphered_card_key(&challenge, issuer, target))?;

        let req = CardRequest::ChangeKey {
            key_index,
            ciphered_key,
        };
        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)
    }

    fn sv_get(&mut self, operation: SvOperation, action: SvAction) -> Result<(), Error> {
        let req = CardRequest::SvGet {
            operation,
            extended_log: self.flag(SessionFlags::SV_LOAD_AND_DEBIT_LOG),
        };
        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)?;

        let sv = match resp.data {
            ResponseData::SvStatus(sv) => sv,
            other => return Err(unexpected_data(req.name(), &other)),
        };

        if sv.operation != operation {
            return Err(Error::InconsistentData(format!(
                "SV get operation mismatch (requested {}, returned {})",
                operation, sv.operation
            )));
        }

        let authorized = self
            .security
            .as_ref()
            .map(|s| s.is_sv_key_authorized(sv.kvc))
            .unwrap_or(false);
        if !authorized {
            return Err(Error::UnauthorizedKey {
                kif: None,
                kvc: sv.kvc,
            });
        }

        let in_session = self.session.card_session().is_some();
        match self.sv_reference {
            Some((tnum, balance)) if in_session && (tnum, balance) != (sv.tnum, sv.balance) => {
                return Err(Error::InconsistentData(format!(
                    "SV status mismatch (tnum {} balance {}, expected tnum {} balance {})",
                    sv.tnum, sv.balance, tnum, balance
                )));
            }
            _ if !in_session => self.sv_reference = Some((sv.tnum, sv.balance)),
            _ => (),
        }

        self.apply_sv_get(&sv);

        self.sv_get = Some(sv);
        self.sv_pending = Some((operation, action));

        Ok(())
    }

    /// Check an SV operation follows its SV get, returning the SV action and status
    fn sv_context(
        &self,
        operation: SvOperation,
        sv_pending: Option<(SvOperation, SvAction)>,
    ) -> Result<(SvAction, SvGetData), Error> {
        let action = match sv_pending {
            Some((o, a)) if o == operation => a,
            _ => return Err(Error::IllegalState("SV command does not follow SV get")),
        };

        let sv = self
            .sv_get
            .clone()
            .ok_or(Error::IllegalState("SV command does not follow SV get"))?;

        if self.session.card_session().is_some() {
            if self.processed.sv {
                return Err(Error::IllegalState("SV command already processed in session"));
            }
            if self.processed.modifying {
                return Err(Error::IllegalState(
                    "SV command not first modification in session",
                ));
            }
        }

        Ok((action, sv))
    }

    fn check_new_sv_balance(&self, balance: i32) -> Result<(), Error> {
        match balance < 0 && !self.flag(SessionFlags::SV_NEGATIVE_BALANCE) {
            true => Err(Error::IllegalState("negative SV balance not authorized")),
            false => Ok(()),
        }
    }

    fn sv_reload(
        &mut self,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
        sv_pending: Option<(SvOperation, SvAction)>,
    ) -> Result<(), Error> {
        let (action, sv) = self.sv_context(SvOperation::Reload, sv_pending)?;

        let amount = match action {
            SvAction::Do => amount,
            SvAction::Undo => -amount,
        };
        check_range("amount", amount, SV_RELOAD_RANGE.0, SV_RELOAD_RANGE.1)?;

        let balance = sv.balance + amount;
        self.check_new_sv_balance(balance)?;

        let data = SvCommandData {
            operation: SvOperation::Reload,
            action,
            amount,
            date,
            time,
            free,
        };
        let security = self.with_crypto(|c| c.compute_sv_security_data(&sv, &data))?;

        let req = CardRequest::SvReload {
            amount,
            date,
            time,
            free,
            security,
        };
        self.sv_execute(req, balance, &sv)
    }

    fn sv_debit(
        &mut self,
        action: SvAction,
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        sv_pending: Option<(SvOperation, SvAction)>,
    ) -> Result<(), Error> {
        let (sv_action, sv) = self.sv_context(SvOperation::Debit, sv_pending)?;
        if sv_action != action {
            return Err(Error::IllegalState(
                "SV command inconsistent with SV get action",
            ));
        }

        let balance = match action {
            SvAction::Do => sv.balance - amount,
            SvAction::Undo => sv.balance + amount,
        };
        self.check_new_sv_balance(balance)?;

        let data = SvCommandData {
            operation: SvOperation::Debit,
            action,
            amount,
            date,
            time,
            free: [0u8; 2],
        };
        let security = self.with_crypto(|c| c.compute_sv_security_data(&sv, &data))?;

        let req = CardRequest::SvDebit {
            undo: action == SvAction::Undo,
            amount,
            date,
            time,
            security,
        };
        self.sv_execute(req, balance, &sv)
    }

    fn sv_execute(&mut self, req: CardRequest, balance: i32, sv: &SvGetData) -> Result<(), Error> {
        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)?;

        let card_mac = match resp.data {
            ResponseData::SvSignature(m) => m,
            other => return Err(unexpected_data(req.name(), &other)),
        };

        // In session the card signature is covered by the session MAC
        if self.session.card_session().is_some() {
            self.processed.sv = true;
            self.processed.modifying = true;
        } else if !self.with_crypto(|c| c.verify_card_sv_mac(&card_mac))? {
            return Err(Error::InvalidCardSignature("SV"));
        }

        self.card
            .set_sv_status(balance, sv.tnum.wrapping_add(1), sv.kvc);
        self.sv_reference = None;
        self.sv_get = None;

        Ok(())
    }

    fn open_session(
        &mut self,
        level: WriteAccessLevel,
        read: Option<PreparedCommand>,
    ) -> Result<(), Error> {
        let terminal_challenge = self.with_crypto(|c| c.init_session_context())?;
        let target = read.as_ref().and_then(|c| c.mergeable_read());

        let req = CardRequest::OpenSecureSession {
            level,
            terminal_challenge,
            read: target,
            extended: self.profile == TransactionProfile::SecureExtended,
        };
        let resp = self.transmit(&req)?;
        self.expect_success(&req, &resp)?;

        let opening = match resp.data {
            ResponseData::SessionOpened(o) => o,
            other => return Err(unexpected_data(req.name(), &other)),
        };

        let (kif, kvc) = self.session_key(level, &opening)?;

        self.card
            .set_session_opening(opening.ratified, opening.transaction_counter);
        self.with_crypto(|c| c.init_session_mac(&opening.data, kif, kvc))?;

        self.session.on_opened(CardSession { level, kif, kvc });
        self.budget.reset();
        self.processed = Default::default();

        log::debug!(
            "session open (level: {}, kif: {:02x}, kvc: {:02x}, counter: {})",
            level,
            kif,
            kvc,
            opening.transaction_counter
        );

        if let (Some(cmd), Some((sfi, record_number))) = (read, target) {
            let mode = match &cmd {
                PreparedCommand::ReadRecord { mode, .. }
                | PreparedCommand::ReadCounters { mode, .. } => *mode,
                _ => ReadMode::Strict,
            };

            match opening.record {
                Some(r) => {
                    self.card.data_mut(sfi).set_content(record_number, &r);
                    self.refresh_sv_logs(sfi);
                }
                None if mode == ReadMode::Strict => {
                    return Err(Error::UnexpectedCardStatus {
                        command: cmd.name(),
                        status: CardStatus::NotFound,
                    })
                }
                None => log::debug!("record {} of sfi {:02x} not found", record_number, sfi),
            }
        }

        Ok(())
    }

    /// Resolve and authorize the session key
    fn session_key(&self, level: WriteAccessLevel, opening: &SessionOpening) -> Result<(u8, u8), Error> {
        let s = self
            .security
            .as_ref()
            .ok_or(Error::IllegalState("no security setting"))?;

        let kvc = opening
            .kvc
            .or_else(|| s.default_kvc(level))
            .ok_or(Error::IllegalState("session KVC unknown"))?;

        // 0xff indicates the card did not report a KIF
        let kif = match opening.kif {
            Some(kif) if kif != 0xff => kif,
            _ => s
                .kif(level, kvc)
                .or_else(|| s.default_kif(level))
                .ok_or(Error::IllegalState("session KIF unknown"))?,
        };

        if !s.is_session_key_authorized(kif, kvc) {
            return Err(Error::UnauthorizedKey {
                kif: Some(kif),
                kvc,
            });
        }

        Ok((kif, kvc))
    }

    fn close_session(&mut self, intermediate: bool) -> Result<(), Error> {
        let terminal_mac = self.with_crypto(|c| c.finalize_session_mac())?;
        let deferred = self.flag(SessionFlags::RATIFICATION) && self.reader.is_contactless();

        let req = CardRequest::CloseSecureSession {
            terminal_mac,
            ratify_now: !deferred,
        };
        let resp = self.transmit(&req)?;
        self.expect_success(&req, &resp)?;

        let card_mac = match resp.data {
            ResponseData::SessionClosed { card_mac } => card_mac,
            other => return Err(unexpected_data(req.name(), &other)),
        };

        self.session.on_card_session_closed();

        if deferred {
            match self.reader.transmit(&CardRequest::Ratification) {
                Ok(r) => self.audit.push(r.exchange),
                Err(e) => log::debug!("ratification failed: {}", e),
            }
        }

        let verified = match self.with_crypto(|c| c.verify_card_session_mac(&card_mac)) {
            Err(Error::CryptoIo(e)) if intermediate => {
                return Err(Error::CardSignatureNotVerifiable(e))
            }
            r => r?,
        };

        if self.processed.encryption {
            self.with_crypto(|c| c.deactivate_encryption())?;
        }
        self.processed = Default::default();

        match verified {
            true => {
                log::debug!("session closed");
                Ok(())
            }
            false => Err(Error::InvalidCardSignature("session")),
        }
    }

    /// Close the current session and reopen one at the same level
    fn split_session(&mut self) -> Result<(), Error> {
        let level = self
            .session
            .card_session()
            .map(|s| s.level)
            .ok_or(Error::IllegalState("no secure session open"))?;

        log::debug!("modifications buffer full, splitting session");

        self.close_session(true)?;
        self.open_session(level, None)
    }

    fn cancel_session(&mut self) {
        match self.transmit(&CardRequest::CancelSecureSession) {
            Ok(r) => log::debug!("session cancelled: {}", r.status),
            Err(e) => log::debug!("session cancel failed: {}", e),
        }

        if self.session.card_session().is_some() {
            if let Some(s) = self.security.as_mut() {
                let c = s.crypto();
                c.abort_session();
                self.audit.extend(c.take_audit_data());
            }
        }

        self.session.on_closed();
        self.processed = Default::default();
    }

    fn manage_session(&mut self, authenticate: bool, encryption: Option<bool>) -> Result<(), Error> {
        if self.session.card_session().is_none() {
            return Err(Error::IllegalState("no secure session open"));
        }

        let terminal_mac = match authenticate {
            true => Some(self.with_crypto(|c| c.generate_authentication_mac())?),
            false => None,
        };

        let req = CardRequest::ManageSecureSession {
            authenticate,
            encryption,
            terminal_mac,
        };
        let resp = self.transmit(&req)?;
        self.expect_success(&req, &resp)?;

        if authenticate {
            let card_mac = match &resp.data {
                ResponseData::SessionManaged {
                    card_mac: Some(m),
                } => m.clone(),
                other => return Err(unexpected_data(req.name(), other)),
            };

            if !self.with_crypto(|c| c.verify_card_authentication_mac(&card_mac))? {
                return Err(Error::InvalidCardSignature("authentication"));
            }
            self.processed.authenticated = true;
        }

        // Card signature is verified before the exchange enters the session MAC
        let exchange = resp.exchange;
        self.with_crypto(|c| c.update_session_mac(&exchange))?;

        match encryption {
            Some(true) => {
                self.with_crypto(|c| c.activate_encryption())?;
                self.processed.encryption = true;
            }
            Some(false) => {
                self.with_crypto(|c| c.deactivate_encryption())?;
                self.processed.encryption = false;
            }
            None => (),
        }

        Ok(())
    }

    /// Execute a modifying command, accounting for the session buffer
    fn modify(&mut self, req: CardRequest, payload: usize) -> Result<CardResponse, Error> {
        self.reserve(payload)?;

        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)?;

        if self.session.card_session().is_some() {
            self.processed.modifying = true;
        }

        Ok(resp)
    }

    /// Reserve session buffer space, splitting the session when enabled
    fn reserve(&mut self, payload: usize) -> Result<(), Error> {
        if self.session.card_session().is_none() {
            return Ok(());
        }

        let cost = self.budget.cost(payload);

        if let Err(e) = self.budget.check(cost) {
            if !self.flag(SessionFlags::MULTIPLE_SESSION) || !self.budget.fits_empty(cost) {
                return Err(e);
            }
            self.split_session()?;
        }

        self.budget.consume(cost);

        Ok(())
    }

    fn get_challenge(&mut self) -> Result<Vec<u8>, Error> {
        let req = CardRequest::GetChallenge;
        let resp = self.exchange(&req)?;
        self.expect_success(&req, &resp)?;

        match resp.data {
            ResponseData::Challenge(c) => Ok(c),
            other => Err(unexpected_data(req.name(), &other)),
        }
    }

    fn is_pin_plain(&self) -> bool {
        self.profile == TransactionProfile::Free || self.flag(SessionFlags::PIN_PLAIN)
    }

    /// Exchange a request, updating the session MAC while a session is open
    fn exchange(&mut self, req: &CardRequest) -> Result<CardResponse, Error> {
        let resp = self.transmit(req)?;

        if self.session.card_session().is_some() {
            let exchange = &resp.exchange;
            self.with_crypto(|c| c.update_session_mac(exchange))?;
        }

        Ok(resp)
    }

    /// Exchange a request without session MAC update
    fn transmit(&mut self, req: &CardRequest) -> Result<CardResponse, Error> {
        let resp = self.reader.transmit(req)?;

        log::debug!("{}: {} ({})", req.name(), resp.status, resp.exchange);
        self.audit.push(resp.exchange.clone());

        Ok(resp)
    }

    fn expect_success(&self, req: &CardRequest, resp: &CardResponse) -> Result<(), Error> {
        match resp.status {
            CardStatus::Success => Ok(()),
            status => Err(Error::UnexpectedCardStatus {
                command: req.name(),
                status,
            }),
        }
    }

    fn check_read(&self, req: &CardRequest, mode: ReadMode, resp: &CardResponse) -> Result<ReadOutcome, Error> {
        match (resp.status, mode) {
            (CardStatus::Success, _) => Ok(ReadOutcome::Read),
            (CardStatus::NotFound, ReadMode::BestEffort) => {
                log::debug!("{}: not found, skipped", req.name());
                Ok(ReadOutcome::NotFound)
            }
            (status, _) => Err(Error::UnexpectedCardStatus {
                command: req.name(),
                status,
            }),
        }
    }

    /// Run a crypto module operation, collecting its audit data
    fn with_crypto<T>(
        &mut self,
        f: impl FnOnce(&mut dyn CryptoModule) -> Result<T, CryptoError>,
    ) -> Result<T, Error> {
        let s = self
            .security
            .as_mut()
            .ok_or(Error::IllegalState("no security setting"))?;

        let c = s.crypto();
        let r = f(&mut *c);
        self.audit.extend(c.take_audit_data());

        r.map_err(Error::from)
    }

    /// Restore a closed session after a failure
    fn recover(&mut self) {
        if self.session.state() != SessionState::Closed || self.session.card_session().is_some() {
            log::debug!("cancelling secure session");

            match self.reader.transmit(&CardRequest::CancelSecureSession) {
                Ok(r) => self.audit.push(r.exchange),
                Err(e) => log::debug!("session cancel failed: {}", e),
            }

            if let Some(s) = self.security.as_mut() {
                let c = s.crypto();
                c.abort_session();
                self.audit.extend(c.take_audit_data());
            }
        }

        self.session.on_failure();
        self.prepared = Default::default();
        self.processed = Default::default();
        self.sv_pending = None;
    }
}

/// Split `first..=last` into ranges of at most `n` records
fn chunk_range(first: u8, last: u8, n: usize) -> impl Iterator<Item = (u8, u8)> {
    (first as usize..=last as usize)
        .step_by(n)
        .map(move |start| (start as u8, (start + n - 1).min(last as usize) as u8))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_chunks() {
        let c: Vec<_> = chunk_range(1, 10, 4).collect();
        assert_eq!(c, vec![(1, 4), (5, 8), (9, 10)]);

        let c: Vec<_> = chunk_range(3, 3, 8).collect();
        assert_eq!(c, vec![(3, 3)]);

        let c: Vec<_> = chunk_range(1, 250, 250).collect();
        assert_eq!(c, vec![(1, 250)]);
    }
}
