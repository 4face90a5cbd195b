// Copyright (c) 2022-2023 The MobileCoin Foundation

use calypso_apdu::{request::SearchRequest, MAX_RECORD_NUMBER, MAX_SFI};

use crate::error::{check_range, Error};

/// Search record multiple parameters
///
/// Matching record numbers are stored in the card snapshot once processed,
/// see [`CalypsoCard::search_result`][crate::card::CalypsoCard::search_result].
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SearchCommandData {
    sfi: u8,
    start: u8,
    offset: u8,
    repeated_offset: bool,
    data: Vec<u8>,
    mask: Vec<u8>,
    fetch_first: bool,
}

impl SearchCommandData {
    /// Create a search from record 1 at offset 0
    pub fn new() -> Self {
        Self {
            sfi: 1,
            start: 1,
            ..Default::default()
        }
    }

    pub fn set_sfi(mut self, sfi: u8) -> Self {
        self.sfi = sfi;
        self
    }

    pub fn start_at_record(mut self, record_number: u8) -> Self {
        self.start = record_number;
        self
    }

    pub fn set_offset(mut self, offset: u8) -> Self {
        self.offset = offset;
        self
    }

    /// Compare at every offset from the provided one to the end of the record
    pub fn enable_repeated_offset(mut self) -> Self {
        self.repeated_offset = true;
        self
    }

    pub fn set_search_data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    /// Bit mask applied to record content, padded with `0xff`
    pub fn set_mask(mut self, mask: &[u8]) -> Self {
        self.mask = mask.to_vec();
        self
    }

    /// Read the first matching record in the same exchange
    pub fn fetch_first_matching_result(mut self) -> Self {
        self.fetch_first = true;
        self
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn is_fetch_first(&self) -> bool {
        self.fetch_first
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        check_range("sfi", self.sfi, 1, MAX_SFI)?;
        check_range("record number", self.start, 1, MAX_RECORD_NUMBER)?;
        check_range("offset", self.offset, 0, MAX_RECORD_NUMBER - 1)?;
        check_range(
            "search data length",
            self.data.len() as i64,
            1,
            (MAX_RECORD_NUMBER - self.offset) as i64,
        )?;

        if self.mask.len() > self.data.len() {
            return Err(Error::ArgumentRange {
                name: "mask length",
                value: self.mask.len() as i64,
                min: 0,
                max: self.data.len() as i64,
            });
        }

        Ok(())
    }

    pub(crate) fn to_request(&self) -> SearchRequest {
        let mut mask = self.mask.clone();
        mask.resize(self.data.len(), 0xff);

        SearchRequest {
            sfi: self.sfi,
            start: self.start,
            offset: self.offset,
            repeated_offset: self.repeated_offset,
            data: self.data.clone(),
            mask,
            fetch_first: self.fetch_first,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn search_validation() {
        let s = SearchCommandData::new()
            .set_sfi(7)
            .set_offset(2)
            .set_search_data(&[0x12, 0x34])
            .set_mask(&[0xf0]);
        assert_eq!(s.validate(), Ok(()));

        let r = s.to_request();
        assert_eq!(r.mask, vec![0xf0, 0xff]);
        assert_eq!(r.start, 1);

        assert!(SearchCommandData::new().validate().is_err());
        assert!(SearchCommandData::new()
            .set_sfi(0)
            .set_search_data(&[1])
            .validate()
            .is_err());
        assert!(SearchCommandData::new()
            .set_search_data(&[1])
            .set_mask(&[1, 2])
            .validate()
            .is_err());
        assert!(SearchCommandData::new()
            .set_offset(249)
            .set_search_data(&[1, 2])
            .validate()
            .is_err());
    }
}
