// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Card snapshot updates from card responses

use calypso_apdu::{
    file::FileType, response::ResponseData, sv::SvGetData, MAX_COUNTER_VALUE, SV_DEBIT_LOG_RECORDS,
    SV_DEBIT_LOG_SFI, SV_RELOAD_LOG_SFI,
};

use super::TransactionManager;
use crate::{
    card::{SvDebitLogRecord, SvLoadLogRecord},
    error::Error,
    reader::CardReader,
};

impl<R: CardReader> TransactionManager<R> {
    /// Apply file selection or get data content
    pub(super) fn apply_file_info(&mut self, command: &'static str, data: ResponseData) -> Result<(), Error> {
        match data {
            ResponseData::File { sfi, header } => self.card.set_file_header(sfi, header),
            ResponseData::Directory(d) => self.card.set_directory(d),
            ResponseData::EfList(files) => {
                for (sfi, header) in files {
                    self.card.set_file_header(sfi, header);
                }
            }
            ResponseData::Traceability(t) => self.card.set_traceability(&t),
            ResponseData::None => (),
            other => return Err(unexpected_data(command, &other)),
        }

        Ok(())
    }

    /// Apply record content for records `first..=last`, from `offset` for partial reads
    pub(super) fn apply_records(
        &mut self,
        command: &'static str,
        sfi: u8,
        (first, last): (u8, u8),
        offset: Option<u8>,
        data: ResponseData,
    ) -> Result<(), Error> {
        let records = match data {
            ResponseData::Records(r) => r,
            other => return Err(unexpected_data(command, &other)),
        };

        if let Some((n, _)) = records.iter().find(|(n, _)| *n < first || *n > last) {
            return Err(Error::InconsistentData(format!(
                "{}: record {} outside requested range {}..={}",
                command, n, first, last
            )));
        }

        let file = self.card.data_mut(sfi);
        for (n, r) in &records {
            match offset {
                Some(o) => file.set_content_at(*n, o as usize, r),
                None => file.set_content(*n, r),
            }
        }

        self.refresh_sv_logs(sfi);

        Ok(())
    }

    /// Apply an appended record, shifting cyclic content
    pub(super) fn apply_append(&mut self, sfi: u8, data: &[u8]) {
        let limit = self
            .card
            .file_by_sfi(sfi)
            .and_then(|f| f.header())
            .filter(|h| h.file_type == FileType::Cyclic)
            .map(|h| h.records_number);

        self.card.data_mut(sfi).add_cyclic_content(data, limit);
    }

    /// Apply counter changes, from the card response when available
    pub(super) fn apply_counters(
        &mut self,
        sfi: u8,
        changes: &[(u8, u32)],
        increase: bool,
        data: ResponseData,
    ) {
        let file = self.card.data_mut(sfi);

        if let ResponseData::Counters(values) = data {
            for (n, v) in values {
                file.set_counter(n, v);
            }
            return;
        }

        // Otherwise compute new values from known ones
        for (n, v) in changes {
            let value = match (file.counter(*n), increase) {
                (Some(c), true) => c.saturating_add(*v).min(MAX_COUNTER_VALUE),
                (Some(c), false) => c.saturating_sub(*v),
                (None, _) => {
                    log::debug!("counter {} of sfi {:02x} unknown", n, sfi);
                    continue;
                }
            };
            file.set_counter(*n, value);
        }
    }

    /// Apply SV status and logs returned by an SV get
    pub(super) fn apply_sv_get(&mut self, sv: &SvGetData) {
        self.card.set_sv_status(sv.balance, sv.tnum, sv.kvc);

        if let Some(r) = sv.load_log.as_deref().and_then(SvLoadLogRecord::from_bytes) {
            self.card.set_sv_load_log(r);
        }
        if let Some(r) = sv.debit_log.as_deref().and_then(SvDebitLogRecord::from_bytes) {
            self.card.set_sv_debit_log(0, r);
        }
    }

    /// Refresh SV log records after a read of the SV log files
    pub(super) fn refresh_sv_logs(&mut self, sfi: u8) {
        if !self.card.is_sv_feature_available() {
            return;
        }

        let file = match self.card.file_by_sfi(sfi) {
            Some(f) => f.data().clone(),
            None => return,
        };

        match sfi {
            SV_RELOAD_LOG_SFI => {
                if let Some(r) = file.content(1).and_then(SvLoadLogRecord::from_bytes) {
                    self.card.set_sv_load_log(r);
                }
            }
            SV_DEBIT_LOG_SFI => {
                for n in 1..=SV_DEBIT_LOG_RECORDS {
                    if let Some(r) = file.content(n).and_then(SvDebitLogRecord::from_bytes) {
                        self.card.set_sv_debit_log(n as usize - 1, r);
                    }
                }
            }
            _ => (),
        }
    }
}

/// Build an error for response data not matching the command
pub(super) fn unexpected_data(command: &'static str, data: &ResponseData) -> Error {
    Error::InconsistentData(format!("{}: unexpected response data {:?}", command, data))
}
