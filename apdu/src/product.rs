// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Card product metadata

use strum::{Display, EnumIter, EnumString, EnumVariantNames};

/// Calypso product type, determined at selection
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Default, EnumString, Display, EnumVariantNames, EnumIter,
)]
pub enum ProductType {
    PrimeRevision1,
    PrimeRevision2,
    PrimeRevision3,
    Light,
    Basic,
    #[default]
    Unknown,
}

impl ProductType {
    /// Check whether the product supports the revision 3 command set
    /// (get data, binary files, multiple record / counter commands, search)
    pub fn is_rev3(&self) -> bool {
        matches!(self, Self::PrimeRevision3 | Self::Light | Self::Basic)
    }

    /// Check whether the product is a legacy revision 1 or 2 card
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::PrimeRevision1 | Self::PrimeRevision2)
    }
}

bitflags::bitflags! {
    /// Optional card features, from the startup information
    #[derive(Default)]
    pub struct CardFeatures: u16 {
        /// Card is a host card emulation
        const HCE = 1 << 0;
        /// PIN feature available
        const PIN = 1 << 1;
        /// Stored value feature available
        const SV = 1 << 2;
        /// Extended mode (encryption, early authentication) available
        const EXTENDED_MODE = 1 << 3;
        /// PKI mode available
        const PKI_MODE = 1 << 4;
        /// Ratification is performed on deselect
        const RATIFICATION_ON_DESELECT = 1 << 5;
    }
}
