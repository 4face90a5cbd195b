#![allow(unused)]

use calypso_card_core::{
    apdu::{
        file::{FileHeader, FileType},
        product::{CardFeatures, ProductType},
    },
    security::SecuritySetting,
    TransactionManager,
};
use calypso_card_sim::{SimCard, SimKeys, SimSam};

/// Environment and holder, linear, one record
pub const SFI_ENV: u8 = 0x07;
/// Event log, cyclic, three records
pub const SFI_EVENTS: u8 = 0x08;
/// Contracts, linear, four records
pub const SFI_CONTRACTS: u8 = 0x09;
/// Counters
pub const SFI_COUNTERS: u8 = 0x0a;
/// Binary EF
pub const SFI_BINARY: u8 = 0x01;

pub const RECORD_SIZE: usize = 29;
pub const BINARY_SIZE: usize = 600;

pub const PIN: [u8; 4] = *b"1234";

pub fn init_logging() {
    let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, Default::default());
}

pub fn binary_content() -> Vec<u8> {
    (0..BINARY_SIZE).map(|i| i as u8).collect()
}

/// Card with the standard test application
pub fn sim_card(product_type: ProductType) -> SimCard {
    SimCard::new(product_type, SimKeys::default())
        .with_file(
            SFI_ENV,
            FileHeader::new(0x2001, FileType::Linear, RECORD_SIZE as u16, 1),
            [(1, [0x11; RECORD_SIZE])],
        )
        .with_file(
            SFI_EVENTS,
            FileHeader::new(0x2010, FileType::Cyclic, RECORD_SIZE as u16, 3),
            [
                (1, [0x21; RECORD_SIZE]),
                (2, [0x22; RECORD_SIZE]),
                (3, [0x23; RECORD_SIZE]),
            ],
        )
        .with_file(
            SFI_CONTRACTS,
            FileHeader::new(0x2020, FileType::Linear, RECORD_SIZE as u16, 4),
            [
                (1, [0x31; RECORD_SIZE]),
                (2, [0x32; RECORD_SIZE]),
                (3, [0x33; RECORD_SIZE]),
                (4, [0x34; RECORD_SIZE]),
            ],
        )
        .with_file(
            SFI_BINARY,
            FileHeader::new(0x2f10, FileType::Binary, BINARY_SIZE as u16, 1),
            [(1, binary_content())],
        )
        .with_counters(SFI_COUNTERS, 0x2069, &[10, 20, 30])
}

/// Revision 3 card with the standard test application
pub fn card() -> SimCard {
    sim_card(ProductType::PrimeRevision3)
}

pub fn sam() -> SimSam {
    SimSam::new(SimKeys::default())
}

pub fn setting() -> SecuritySetting {
    SecuritySetting::new(sam())
}

/// Manager without secure session support over the provided card
pub fn free(card: &mut SimCard) -> TransactionManager<&mut SimCard> {
    let snapshot = card.snapshot();
    TransactionManager::free(card, snapshot)
}

/// Manager with regular secure sessions over the provided card
pub fn secure(card: &mut SimCard, setting: SecuritySetting) -> TransactionManager<&mut SimCard> {
    let snapshot = card.snapshot();
    TransactionManager::secure_regular(card, snapshot, setting)
}

/// Record content from the manager snapshot
pub fn record<R: calypso_card_core::reader::CardReader>(
    t: &TransactionManager<R>,
    sfi: u8,
    record_number: u8,
) -> Option<Vec<u8>> {
    t.card()
        .file_by_sfi(sfi)
        .and_then(|f| f.data().content(record_number))
        .map(|r| r.to_vec())
}

/// Counter value from the manager snapshot
pub fn counter<R: calypso_card_core::reader::CardReader>(
    t: &TransactionManager<R>,
    counter_number: u8,
) -> Option<u32> {
    t.card()
        .file_by_sfi(SFI_COUNTERS)
        .and_then(|f| f.data().counter(counter_number))
}

/// Manager with extended mode secure sessions over the provided card
pub fn extended(
    card: &mut SimCard,
    setting: SecuritySetting,
) -> Result<TransactionManager<&mut SimCard>, calypso_card_core::Error> {
    let snapshot = card.snapshot();
    TransactionManager::secure_extended(card, snapshot, setting)
}
