// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Calypso card and SAM simulators
//!
//! [SimCard] implements [CardReader][calypso_card_core::reader::CardReader] over an
//! in-memory card application, and [SimSam] implements
//! [CryptoModule][calypso_card_core::crypto::CryptoModule]. Both derive their keys
//! from shared [SimKeys] so session signatures computed on either side match.
//!
//! ```
//! use calypso_card_core::{apdu::product::ProductType, security::SecuritySetting, TransactionManager};
//! use calypso_card_sim::{SimCard, SimKeys, SimSam};
//!
//! let keys = SimKeys::default();
//! let mut card = SimCard::new(ProductType::PrimeRevision3, keys.clone());
//! let setting = SecuritySetting::new(SimSam::new(keys));
//!
//! let snapshot = card.snapshot();
//! let t = TransactionManager::secure_regular(&mut card, snapshot, setting);
//! ```
//!
//! Faults can be injected on the card (I/O failures, status overrides, corrupted
//! signatures) and on the SAM (verification failures).

mod card;
pub use card::{SimCard, SW_BUFFER_OVERFLOW, SW_CONDITIONS_NOT_SATISFIED, SW_INS_NOT_SUPPORTED};

mod encode;
pub use encode::{encode_request, encode_response};

mod mac;
pub use mac::{SimKeys, MAC_LEN, SV_KIF};

mod sam;
pub use sam::{SimSam, DEFAULT_PIN_KEY, TERMINAL_CHALLENGE_LEN};
