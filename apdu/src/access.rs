// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Session access levels and channel control

use num_enum::TryFromPrimitive;
use strum::{Display, EnumIter, EnumString, EnumVariantNames};

/// Write access level requested when opening a secure session
///
/// Selects the session key (KIF / KVC) used by both card and crypto module.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    EnumString,
    Display,
    EnumVariantNames,
    EnumIter,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum WriteAccessLevel {
    /// Personalization key (index 1)
    Personalization = 0x01,
    /// Load key (index 2)
    Load = 0x02,
    /// Debit key (index 3)
    Debit = 0x03,
}

impl WriteAccessLevel {
    /// Key index of the session key associated with this level
    pub fn key_index(&self) -> u8 {
        *self as u8
    }
}

/// Physical channel policy applied once a batch of commands has been processed
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Default, EnumString, Display, EnumVariantNames, EnumIter,
)]
pub enum ChannelControl {
    /// Keep the logical channel open for further exchanges
    #[default]
    KeepOpen,
    /// Release the channel after the last exchange
    CloseAfter,
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn access_level_key_index() {
        for level in WriteAccessLevel::iter() {
            let index = level.key_index();
            assert_eq!(WriteAccessLevel::try_from(index).ok(), Some(level));
        }

        assert!(WriteAccessLevel::try_from(0u8).is_err());
        assert!(WriteAccessLevel::try_from(4u8).is_err());
    }

    #[test]
    fn access_level_names() {
        assert_eq!(WriteAccessLevel::Debit.to_string(), "Debit");
        assert_eq!(
            "Personalization".parse::<WriteAccessLevel>().ok(),
            Some(WriteAccessLevel::Personalization)
        );
    }
}
