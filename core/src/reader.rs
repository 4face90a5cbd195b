// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Card reader abstraction

use calypso_apdu::{request::CardRequest, response::CardResponse};

use crate::error::ReaderError;

/// [`CardReader`] provides blocking request / response exchanges with a selected card
///
/// Implementations own the byte-level command encoding, mapping each [`CardRequest`]
/// to one APDU and decoding the answer into a [`CardResponse`].
pub trait CardReader {
    /// Exchange a single request with the card
    fn transmit(&mut self, req: &CardRequest) -> Result<CardResponse, ReaderError>;

    /// Release the logical channel once the transaction completes
    fn release_channel(&mut self) -> Result<(), ReaderError>;

    /// Check whether the card is connected via a contactless interface
    fn is_contactless(&self) -> bool;
}

impl<T: CardReader> CardReader for &mut T {
    fn transmit(&mut self, req: &CardRequest) -> Result<CardResponse, ReaderError> {
        T::transmit(self, req)
    }

    fn release_channel(&mut self) -> Result<(), ReaderError> {
        T::release_channel(self)
    }

    fn is_contactless(&self) -> bool {
        T::is_contactless(self)
    }
}
