// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Elementary file content

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};

use calypso_apdu::{file::FileHeader, COUNTER_SIZE};

/// Elementary file known to the card snapshot
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ElementaryFile {
    sfi: u8,
    header: Option<FileHeader>,
    data: FileData,
}

impl ElementaryFile {
    pub fn new(sfi: u8) -> Self {
        Self {
            sfi,
            header: None,
            data: FileData::default(),
        }
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    /// File header, when the EF was selected or described by the card
    pub fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    pub fn data(&self) -> &FileData {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut FileData {
        &mut self.data
    }

    pub(crate) fn set_header(&mut self, header: FileHeader) {
        self.header = Some(header);
    }
}

/// Record content of an EF
///
/// Binary EFs are stored as record 1, counters EFs as the 3-byte big-endian
/// counter values packed in record 1.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct FileData {
    records: BTreeMap<u8, Vec<u8>>,
}

impl FileData {
    /// Fetch record content
    pub fn content(&self, record_number: u8) -> Option<&[u8]> {
        self.records.get(&record_number).map(|r| r.as_slice())
    }

    /// Fetch all known records
    pub fn all_content(&self) -> &BTreeMap<u8, Vec<u8>> {
        &self.records
    }

    /// Fetch a counter value
    ///
    /// Counter `0` addresses the single value of a simulated counter EF.
    pub fn counter(&self, counter_number: u8) -> Option<u32> {
        let offset = Self::counter_offset(counter_number);

        self.records
            .get(&1)
            .and_then(|r| r.get(offset..offset + COUNTER_SIZE))
            .map(BigEndian::read_u24)
    }

    /// Fetch all known counter values
    pub fn all_counters(&self) -> BTreeMap<u8, u32> {
        let mut counters = BTreeMap::new();

        if let Some(r) = self.records.get(&1) {
            for (i, c) in r.chunks_exact(COUNTER_SIZE).enumerate() {
                counters.insert(i as u8 + 1, BigEndian::read_u24(c));
            }
        }

        counters
    }

    /// Replace record content
    pub fn set_content(&mut self, record_number: u8, data: &[u8]) {
        self.records.insert(record_number, data.to_vec());
    }

    /// Replace record content from the provided offset, padding with zeros where required
    pub fn set_content_at(&mut self, record_number: u8, offset: usize, data: &[u8]) {
        let r = self.records.entry(record_number).or_default();

        if r.len() < offset + data.len() {
            r.resize(offset + data.len(), 0);
        }
        r[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Combine record content with the provided data (binary OR) from the provided offset
    pub fn fill_content(&mut self, record_number: u8, offset: usize, data: &[u8]) {
        let r = self.records.entry(record_number).or_default();

        if r.len() < offset + data.len() {
            r.resize(offset + data.len(), 0);
        }
        for (d, s) in r[offset..].iter_mut().zip(data) {
            *d |= *s;
        }
    }

    /// Insert a new record 1 in a cyclic EF, shifting older records
    ///
    /// Records beyond `records_number` are dropped when a limit is provided.
    pub fn add_cyclic_content(&mut self, data: &[u8], records_number: Option<u8>) {
        let shifted = self
            .records
            .iter()
            .filter(|(n, _)| **n < u8::MAX)
            .map(|(n, r)| (n + 1, r.clone()))
            .filter(|(n, _)| records_number.map(|max| *n <= max).unwrap_or(true));

        let mut records: BTreeMap<u8, Vec<u8>> = shifted.collect();
        records.insert(1, data.to_vec());

        self.records = records;
    }

    /// Set a counter value
    pub fn set_counter(&mut self, counter_number: u8, value: u32) {
        let mut buff = [0u8; COUNTER_SIZE];
        BigEndian::write_u24(&mut buff, value);

        self.set_content_at(1, Self::counter_offset(counter_number), &buff);
    }

    fn counter_offset(counter_number: u8) -> usize {
        (counter_number.max(1) as usize - 1) * COUNTER_SIZE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters() {
        let mut d = FileData::default();

        d.set_content(1, &[0x00, 0x00, 0x0a, 0xff, 0xff, 0xff]);
        assert_eq!(d.counter(1), Some(10));
        assert_eq!(d.counter(2), Some(0xff_ffff));
        assert_eq!(d.counter(3), None);

        d.set_counter(3, 0x010203);
        assert_eq!(d.content(1), Some(&[0, 0, 10, 0xff, 0xff, 0xff, 1, 2, 3][..]));
        assert_eq!(d.all_counters().len(), 3);

        // Simulated counters use counter 0
        let mut s = FileData::default();
        s.set_counter(0, 7);
        assert_eq!(s.counter(0), Some(7));
        assert_eq!(s.counter(1), Some(7));
    }

    #[test]
    fn partial_content() {
        let mut d = FileData::default();

        d.set_content_at(2, 2, &[0xaa, 0xbb]);
        assert_eq!(d.content(2), Some(&[0, 0, 0xaa, 0xbb][..]));

        d.fill_content(2, 1, &[0x01, 0x44, 0x00, 0x10]);
        assert_eq!(d.content(2), Some(&[0, 0x01, 0xee, 0xbb, 0x10][..]));
    }

    #[test]
    fn cyclic_content() {
        let mut d = FileData::default();

        d.add_cyclic_content(&[1], Some(3));
        d.add_cyclic_content(&[2], Some(3));
        d.add_cyclic_content(&[3], Some(3));
        d.add_cyclic_content(&[4], Some(3));

        assert_eq!(d.all_content().len(), 3);
        assert_eq!(d.content(1), Some(&[4][..]));
        assert_eq!(d.content(3), Some(&[2][..]));
    }
}
