// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Command preparation
//!
//! Each `prepare_*` call validates its arguments and the current state,
//! then enqueues a [PreparedCommand]. Rejected calls leave the queue untouched.

use std::collections::BTreeMap;

use calypso_apdu::{
    access::WriteAccessLevel,
    file::{GetDataTag, SelectFileControl, SelectTarget},
    product::ProductType,
    sv::{SvAction, SvOperation},
    MAX_COUNTER_NUMBER, MAX_COUNTER_VALUE, MAX_RECORD_NUMBER, MAX_SFI, SV_DEBIT_LOG_RECORDS,
    SV_DEBIT_LOG_SFI, SV_RELOAD_LOG_SFI,
};

use super::{TransactionManager, TransactionProfile};
use crate::{
    card::{SV_DEBIT_LOG_SIZE, SV_LOAD_LOG_SIZE},
    command::{Pin, PreparedCommand, SearchCommandData},
    crypto::KeyReference,
    error::{check_range, Error},
    reader::CardReader,
    security::SessionFlags,
};

/// Maximum binary EF offset / length
pub const MAX_BINARY_OFFSET: u16 = 32767;

/// SV reload amount range
pub const SV_RELOAD_RANGE: (i32, i32) = (-8388608, 8388607);

/// Maximum SV debit amount, the undebit maximum is one higher
pub const SV_DEBIT_MAX: i32 = 32767;

impl<R: CardReader> TransactionManager<R> {
    /// Select a file by LID
    pub fn prepare_select_file(&mut self, lid: u16) -> Result<&mut Self, Error> {
        self.enqueue(PreparedCommand::SelectFile(SelectTarget::Lid(lid)))
    }

    /// Select a file using a navigation control
    pub fn prepare_select_file_control(
        &mut self,
        control: SelectFileControl,
    ) -> Result<&mut Self, Error> {
        self.enqueue(PreparedCommand::SelectFile(SelectTarget::Control(control)))
    }

    /// Read a data object
    pub fn prepare_get_data(&mut self, tag: GetDataTag) -> Result<&mut Self, Error> {
        self.require_rev3("get data")?;
        self.enqueue(PreparedCommand::GetData(tag))
    }

    /// Read a single record
    ///
    /// Inside a session, a missing record fails the processing (strict mode),
    /// outside a session it is skipped (best-effort mode).
    pub fn prepare_read_record(&mut self, sfi: u8, record_number: u8) -> Result<&mut Self, Error> {
        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_range("record number", record_number, 1, MAX_RECORD_NUMBER)?;

        if self.session.is_open_or_pending() && !self.reader.is_contactless() {
            return Err(Error::IllegalState(
                "record read in contact mode secure session",
            ));
        }

        let mode = self.session.read_mode();
        self.enqueue(PreparedCommand::ReadRecord {
            sfi,
            record_number,
            mode,
        })
    }

    /// Read consecutive records of the provided size
    pub fn prepare_read_records(
        &mut self,
        sfi: u8,
        from: u8,
        to: u8,
        record_size: u8,
    ) -> Result<&mut Self, Error> {
        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_range("from record number", from, 1, MAX_RECORD_NUMBER)?;
        check_range("to record number", to, from, MAX_RECORD_NUMBER)?;
        check_range("record size", record_size, 1, MAX_RECORD_NUMBER)?;

        let mode = self.session.read_mode();
        let cmd = match from == to {
            true => PreparedCommand::ReadRecord {
                sfi,
                record_number: from,
                mode,
            },
            false => PreparedCommand::ReadRecords {
                sfi,
                first: from,
                last: to,
                record_size,
                mode,
            },
        };

        self.enqueue(cmd)
    }

    /// Read part of consecutive records
    pub fn prepare_read_records_partially(
        &mut self,
        sfi: u8,
        from: u8,
        to: u8,
        offset: u8,
        length: u8,
    ) -> Result<&mut Self, Error> {
        self.require_rev3("read records partially")?;

        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_range("from record number", from, 1, MAX_RECORD_NUMBER)?;
        check_range("to record number", to, from, MAX_RECORD_NUMBER)?;
        check_range("offset", offset, 0, MAX_RECORD_NUMBER - 1)?;
        check_range("length", length, 1, MAX_RECORD_NUMBER - offset)?;

        let mode = self.session.read_mode();
        self.enqueue(PreparedCommand::ReadRecordsPartially {
            sfi,
            first: from,
            last: to,
            offset,
            length,
            mode,
        })
    }

    /// Read bytes from a binary EF
    pub fn prepare_read_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        length: u16,
    ) -> Result<&mut Self, Error> {
        self.require_rev3("read binary")?;

        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_range("offset", offset, 0, MAX_BINARY_OFFSET)?;
        check_range("length", length, 1, MAX_BINARY_OFFSET)?;

        let mode = self.session.read_mode();
        self.enqueue(PreparedCommand::ReadBinary {
            sfi,
            offset,
            length,
            mode,
        })
    }

    /// Read the first counters of a counters EF
    pub fn prepare_read_counter(&mut self, sfi: u8, count: u8) -> Result<&mut Self, Error> {
        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_range("number of counters", count, 1, MAX_COUNTER_NUMBER)?;

        let mode = self.session.read_mode();
        self.enqueue(PreparedCommand::ReadCounters { sfi, count, mode })
    }

    /// Search records, results are available via
    /// [`CalypsoCard::search_result`][crate::card::CalypsoCard::search_result]
    pub fn prepare_search_records(&mut self, data: SearchCommandData) -> Result<&mut Self, Error> {
        self.require_rev3("search records")?;
        data.validate()?;

        self.enqueue(PreparedCommand::SearchRecords(data))
    }

    /// Fetch the PIN status
    pub fn prepare_check_pin_status(&mut self) -> Result<&mut Self, Error> {
        self.require_pin()?;
        self.enqueue(PreparedCommand::CheckPinStatus)
    }

    pub fn prepare_append_record(&mut self, sfi: u8, data: &[u8]) -> Result<&mut Self, Error> {
        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_record_data(data)?;

        self.enqueue(PreparedCommand::AppendRecord {
            sfi,
            data: data.to_vec(),
        })
    }

    pub fn prepare_update_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        data: &[u8],
    ) -> Result<&mut Self, Error> {
        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_range("record number", record_number, 1, MAX_RECORD_NUMBER)?;
        check_record_data(data)?;

        self.enqueue(PreparedCommand::UpdateRecord {
            sfi,
            record_number,
            data: data.to_vec(),
        })
    }

    /// Write a record, the card combines existing and new content with a binary OR
    pub fn prepare_write_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        data: &[u8],
    ) -> Result<&mut Self, Error> {
        check_range("sfi", sfi, 0, MAX_SFI)?;
        check_range("record number", record_number, 1, MAX_RECORD_NUMBER)?;
        check_record_data(data)?;

        self.enqueue(PreparedCommand::WriteRecord {
            sfi,
            record_number,
            data: data.to_vec(),
        })
    }

    pub fn prepare_update_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        data: &[u8],
    ) -> Result<&mut Self, Error> {
        self.require_rev3("update binary")?;
        check_binary(sfi, offset, data)?;

        self.enqueue(PreparedCommand::UpdateBinary {
            sfi,
            offset,
            data: data.to_vec(),
        })
    }

    /// Write bytes into a binary EF, the card combines existing and new content with a binary OR
    pub fn prepare_write_binary(
        &mut self,
        sfi: u8,
        offset: u16,
        data: &[u8],
    ) -> Result<&mut Self, Error> {
        self.require_rev3("write binary")?;
        check_binary(sfi, offset, data)?;

        self.enqueue(PreparedCommand::WriteBinary {
            sfi,
            offset,
            data: data.to_vec(),
        })
    }

    /// Increase a counter, counter 0 addresses a simulated counter EF
    pub fn prepare_increase_counter(
        &mut self,
        sfi: u8,
        counter: u8,
        value: u32,
    ) -> Result<&mut Self, Error> {
        check_counter(sfi, counter, 0, value)?;
        self.enqueue(PreparedCommand::IncreaseCounter {
            sfi,
            counter,
            value,
        })
    }

    /// Decrease a counter, counter 0 addresses a simulated counter EF
    pub fn prepare_decrease_counter(
        &mut self,
        sfi: u8,
        counter: u8,
        value: u32,
    ) -> Result<&mut Self, Error> {
        check_counter(sfi, counter, 0, value)?;
        self.enqueue(PreparedCommand::DecreaseCounter {
            sfi,
            counter,
            value,
        })
    }

    /// Increase several counters of the same EF
    pub fn prepare_increase_counters(
        &mut self,
        sfi: u8,
        counters: &BTreeMap<u8, u32>,
    ) -> Result<&mut Self, Error> {
        check_counters(sfi, counters)?;
        self.enqueue(PreparedCommand::IncreaseCounters {
            sfi,
            counters: counters.clone(),
        })
    }

    /// Decrease several counters of the same EF
    pub fn prepare_decrease_counters(
        &mut self,
        sfi: u8,
        counters: &BTreeMap<u8, u32>,
    ) -> Result<&mut Self, Error> {
        check_counters(sfi, counters)?;
        self.enqueue(PreparedCommand::DecreaseCounters {
            sfi,
            counters: counters.clone(),
        })
    }

    /// Set a counter to the provided value, using its value in the card snapshot
    ///
    /// Enqueues an increase or decrease, or nothing when the value is unchanged.
    pub fn prepare_set_counter(
        &mut self,
        sfi: u8,
        counter: u8,
        value: u32,
    ) -> Result<&mut Self, Error> {
        check_counter(sfi, counter, 0, value)?;

        let current = self
            .card
            .file_by_sfi(sfi)
            .and_then(|f| f.data().counter(counter))
            .ok_or(Error::IllegalState("counter value unknown"))?;

        match value {
            v if v > current => self.prepare_increase_counter(sfi, counter, v - current),
            v if v < current => self.prepare_decrease_counter(sfi, counter, current - v),
            _ => {
                log::debug!("counter {} of sfi {:02x} unchanged", counter, sfi);
                Ok(self)
            }
        }
    }

    /// Read the SV load log and the three SV debit logs
    pub fn prepare_sv_read_all_logs(&mut self) -> Result<&mut Self, Error> {
        self.require_sv()?;

        let mode = self.session.read_mode();
        self.enqueue(PreparedCommand::ReadRecord {
            sfi: SV_RELOAD_LOG_SFI,
            record_number: 1,
            mode,
        })?;
        self.enqueue(PreparedCommand::ReadRecords {
            sfi: SV_DEBIT_LOG_SFI,
            first: 1,
            last: SV_DEBIT_LOG_RECORDS,
            record_size: SV_LOAD_LOG_SIZE.max(SV_DEBIT_LOG_SIZE) as u8,
            mode,
        })
    }

    /// Present the PIN, ciphered unless plain transmission is enabled
    pub fn prepare_verify_pin(&mut self, pin: &[u8]) -> Result<&mut Self, Error> {
        self.require_pin()?;
        let pin = Pin::new(pin)?;

        self.enqueue(PreparedCommand::VerifyPin(pin))
    }

    /// Replace the PIN, only outside a secure session
    pub fn prepare_change_pin(&mut self, new_pin: &[u8]) -> Result<&mut Self, Error> {
        self.require_pin()?;
        let pin = Pin::new(new_pin)?;
        self.session.require_closed("change pin")?;

        self.enqueue(PreparedCommand::ChangePin(pin))
    }

    /// Replace a card key with a key from the crypto module, only outside a secure session
    pub fn prepare_change_key(
        &mut self,
        key_index: u8,
        new_kif: u8,
        new_kvc: u8,
        issuer_kif: u8,
        issuer_kvc: u8,
    ) -> Result<&mut Self, Error> {
        self.require_secure("change key")?;

        if self.card.product_type() == ProductType::Basic {
            return Err(Error::Unsupported("change key not supported by card"));
        }
        WriteAccessLevel::try_from(key_index).map_err(|_| Error::ArgumentRange {
            name: "key index",
            value: key_index as i64,
            min: 1,
            max: 3,
        })?;
        self.session.require_closed("change key")?;

        self.enqueue(PreparedCommand::ChangeKey {
            key_index,
            issuer: KeyReference::new(issuer_kif, issuer_kvc),
            target: KeyReference::new(new_kif, new_kvc),
        })
    }

    /// Invalidate the current DF
    pub fn prepare_invalidate(&mut self) -> Result<&mut Self, Error> {
        self.require_secure("invalidate")?;

        if self.card.is_df_invalidated() {
            return Err(Error::IllegalState("DF already invalidated"));
        }

        self.enqueue(PreparedCommand::Invalidate)
    }

    /// Rehabilitate the current DF
    pub fn prepare_rehabilitate(&mut self) -> Result<&mut Self, Error> {
        self.require_secure("rehabilitate")?;

        if !self.card.is_df_invalidated() {
            return Err(Error::IllegalState("DF not invalidated"));
        }

        self.enqueue(PreparedCommand::Rehabilitate)
    }

    /// Open a secure session at the provided access level
    ///
    /// A single record read prepared immediately after is merged into the opening
    /// unless disabled by the security setting.
    pub fn prepare_open_secure_session(
        &mut self,
        level: WriteAccessLevel,
    ) -> Result<&mut Self, Error> {
        self.prepare_open(level, false)
    }

    /// Open a secure session without merging a record read into the opening
    pub fn prepare_pre_open_secure_session(
        &mut self,
        level: WriteAccessLevel,
    ) -> Result<&mut Self, Error> {
        self.prepare_open(level, true)
    }

    fn prepare_open(&mut self, level: WriteAccessLevel, pre_open: bool) -> Result<&mut Self, Error> {
        if self.security.is_none() {
            return Err(Error::IllegalState("no security setting"));
        }

        self.session.prepare_open(pre_open)?;
        self.prepared = Default::default();

        self.queue
            .enqueue(PreparedCommand::OpenSession { level, pre_open });

        Ok(self)
    }

    /// Close the current (or pending) secure session
    pub fn prepare_close_secure_session(&mut self) -> Result<&mut Self, Error> {
        self.session.prepare_close()?;
        self.prepared = Default::default();

        self.queue.enqueue(PreparedCommand::CloseSession);

        Ok(self)
    }

    /// Cancel the current secure session, never fails
    ///
    /// Pending modifications are discarded by the card. A cancel is sent even when
    /// no session is known to be open.
    pub fn prepare_cancel_secure_session(&mut self) -> &mut Self {
        self.session.prepare_cancel();
        self.prepared = Default::default();

        self.queue.enqueue(PreparedCommand::CancelSession);

        self
    }

    /// Fetch SV status ahead of a reload or debit
    pub fn prepare_sv_get(
        &mut self,
        operation: SvOperation,
        action: SvAction,
    ) -> Result<&mut Self, Error> {
        self.require_secure("sv get")?;
        self.require_sv()?;

        self.enqueue(PreparedCommand::SvGet { operation, action })
    }

    /// Reload the SV balance, free data set to zero
    pub fn prepare_sv_reload(&mut self, amount: i32) -> Result<&mut Self, Error> {
        self.prepare_sv_reload_with_data(amount, &[0; 2], &[0; 2], &[0; 2])
    }

    /// Reload the SV balance with the provided date, time and free data
    pub fn prepare_sv_reload_with_data(
        &mut self,
        amount: i32,
        date: &[u8],
        time: &[u8],
        free: &[u8],
    ) -> Result<&mut Self, Error> {
        self.require_secure("sv reload")?;
        self.require_sv()?;

        check_range("amount", amount, SV_RELOAD_RANGE.0, SV_RELOAD_RANGE.1)?;
        let date = sv_field("date", date)?;
        let time = sv_field("time", time)?;
        let free = sv_field("free", free)?;

        let action = self.check_sv_sequence(SvOperation::Reload)?;
        if action == SvAction::Undo {
            self.check_sv_balance(-(amount as i64))?;
        }

        self.enqueue(PreparedCommand::SvReload {
            amount,
            date,
            time,
            free,
        })
    }

    /// Debit (or undebit) the SV balance, free data set to zero
    pub fn prepare_sv_debit(&mut self, amount: i32) -> Result<&mut Self, Error> {
        self.prepare_sv_debit_with_data(amount, &[0; 2], &[0; 2])
    }

    /// Debit (or undebit) the SV balance with the provided date and time
    pub fn prepare_sv_debit_with_data(
        &mut self,
        amount: i32,
        date: &[u8],
        time: &[u8],
    ) -> Result<&mut Self, Error> {
        self.require_secure("sv debit")?;
        self.require_sv()?;

        let date = sv_field("date", date)?;
        let time = sv_field("time", time)?;

        let action = self.check_sv_sequence(SvOperation::Debit)?;
        match action {
            SvAction::Do => {
                check_range("amount", amount, 0, SV_DEBIT_MAX)?;
                self.check_sv_balance(-(amount as i64))?;
            }
            SvAction::Undo => check_range("amount", amount, 0, SV_DEBIT_MAX + 1)?,
        }

        self.enqueue(PreparedCommand::SvDebit {
            action,
            amount,
            date,
            time,
        })
    }

    /// Mutually authenticate card and crypto module before the session closes
    pub fn prepare_early_mutual_authentication(&mut self) -> Result<&mut Self, Error> {
        self.require_extended("early mutual authentication")?;

        self.enqueue(PreparedCommand::EarlyMutualAuthentication)
    }

    /// Cipher session exchanges from this point
    pub fn prepare_activate_encryption(&mut self) -> Result<&mut Self, Error> {
        self.require_extended("activate encryption")?;

        if self.prepared.encryption {
            return Err(Error::IllegalState("encryption already active"));
        }
        self.enqueue(PreparedCommand::ActivateEncryption)?;
        self.prepared.encryption = true;

        Ok(self)
    }

    /// Stop ciphering session exchanges
    pub fn prepare_deactivate_encryption(&mut self) -> Result<&mut Self, Error> {
        self.require_extended("deactivate encryption")?;

        if !self.prepared.encryption {
            return Err(Error::IllegalState("encryption not active"));
        }
        self.enqueue(PreparedCommand::DeactivateEncryption)?;
        self.prepared.encryption = false;

        Ok(self)
    }

    /// Enqueue a validated command, tracking session modifications
    fn enqueue(&mut self, cmd: PreparedCommand) -> Result<&mut Self, Error> {
        if self.session.is_open_or_pending() && cmd.is_modifying() {
            self.prepared.modifying = true;
            self.prepared.sv |= cmd.is_sv_modifying();
        }

        self.queue.enqueue(cmd);

        Ok(self)
    }

    /// Check an SV reload / debit follows a consistent SV get, returning the SV action
    fn check_sv_sequence(&self, operation: SvOperation) -> Result<SvAction, Error> {
        let previous = match self.queue.peek_last() {
            Some(PreparedCommand::SvGet { operation, action }) => Some((*operation, *action)),
            Some(_) => None,
            None => self.sv_pending,
        };

        let action = match previous {
            Some((o, a)) if o == operation => a,
            Some(_) => {
                return Err(Error::IllegalState(
                    "SV command inconsistent with SV get operation",
                ))
            }
            None => return Err(Error::IllegalState("SV command does not follow SV get")),
        };

        if self.session.is_open_or_pending() {
            if self.prepared.sv {
                return Err(Error::IllegalState("SV command already prepared in session"));
            }
            if self.prepared.modifying {
                return Err(Error::IllegalState(
                    "SV command not first modification in session",
                ));
            }
        }

        Ok(action)
    }

    /// Check a balance change against the known SV balance,
    /// deferred to processing while the SV get is pending
    fn check_sv_balance(&self, delta: i64) -> Result<(), Error> {
        if self.flag(SessionFlags::SV_NEGATIVE_BALANCE) || !self.queue.is_empty() {
            return Ok(());
        }

        match self.card.sv_balance() {
            Some(b) if (b as i64) + delta < 0 => {
                Err(Error::IllegalState("negative SV balance not authorized"))
            }
            _ => Ok(()),
        }
    }

    pub(super) fn flag(&self, flag: SessionFlags) -> bool {
        self.security
            .as_ref()
            .map(|s| s.is_enabled(flag))
            .unwrap_or(false)
    }

    fn require_rev3(&self, operation: &'static str) -> Result<(), Error> {
        match self.card.product_type().is_rev3() {
            true => Ok(()),
            false => {
                log::warn!(
                    "{} not supported by {}",
                    operation,
                    self.card.product_type()
                );
                Err(Error::Unsupported(operation))
            }
        }
    }

    fn require_pin(&self) -> Result<(), Error> {
        match self.card.is_pin_feature_available() {
            true => Ok(()),
            false => Err(Error::Unsupported("PIN feature not available")),
        }
    }

    fn require_sv(&self) -> Result<(), Error> {
        match self.card.is_sv_feature_available() {
            true => Ok(()),
            false => Err(Error::Unsupported("SV feature not available")),
        }
    }

    fn require_secure(&self, operation: &'static str) -> Result<(), Error> {
        match self.profile {
            TransactionProfile::Free => Err(Error::Unsupported(operation)),
            _ => Ok(()),
        }
    }

    fn require_extended(&self, operation: &'static str) -> Result<(), Error> {
        if self.profile != TransactionProfile::SecureExtended {
            return Err(Error::Unsupported(operation));
        }

        self.session.require_open()
    }
}

fn check_record_data(data: &[u8]) -> Result<(), Error> {
    check_range("data length", data.len() as i64, 1, MAX_RECORD_NUMBER)
}

fn check_binary(sfi: u8, offset: u16, data: &[u8]) -> Result<(), Error> {
    check_range("sfi", sfi, 0, MAX_SFI)?;
    check_range("offset", offset, 0, MAX_BINARY_OFFSET)?;
    check_range(
        "data length",
        data.len() as i64,
        1,
        MAX_BINARY_OFFSET as i64,
    )
}

fn check_counter(sfi: u8, counter: u8, min: u8, value: u32) -> Result<(), Error> {
    check_range("sfi", sfi, 0, MAX_SFI)?;
    check_range("counter number", counter, min, MAX_COUNTER_NUMBER)?;
    check_range("counter value", value, 0, MAX_COUNTER_VALUE)
}

fn check_counters(sfi: u8, counters: &BTreeMap<u8, u32>) -> Result<(), Error> {
    if counters.is_empty() {
        return Err(Error::InvalidArgument("empty counter map"));
    }

    for (counter, value) in counters {
        check_counter(sfi, *counter, 1, *value)?;
    }

    Ok(())
}

fn sv_field(name: &'static str, v: &[u8]) -> Result<[u8; 2], Error> {
    match v {
        [a, b] => Ok([*a, *b]),
        _ => Err(Error::ArgumentRange {
            name,
            value: v.len() as i64,
            min: 2,
            max: 2,
        }),
    }
}
