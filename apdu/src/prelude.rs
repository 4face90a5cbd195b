//! Prelude to simplify downstream use of protocol objects
//!

pub use crate::{
    access::{ChannelControl, WriteAccessLevel},
    audit::ApduExchange,
    file::{DirectoryHeader, FileHeader, FileType, GetDataTag, SelectFileControl, SelectTarget},
    product::{CardFeatures, ProductType},
    request::{CardRequest, PinData, SearchRequest},
    response::{CardResponse, CardStatus, ResponseData, SessionOpening},
    sv::{SvAction, SvGetData, SvOperation, SvSecurity},
};
