//! Reads and authenticates signed NFC badges.
//!
//! A badge is an NXP NTAG21x memory tag carrying a short run of
//! tag-length-value records from page 0x10 onwards. One of those records is
//! an ECDSA P-256 signature over a canonical JSON rendition of the others;
//! checking it only needs the issuer's public key, so cards can be validated
//! offline once the key is known.

pub mod canonical;
pub mod codec;
pub mod config;
pub mod definition;
pub mod events;
pub mod ntag;
pub mod pcsc;
pub mod reader;
pub mod service;
pub mod session;
pub mod tags;
pub mod util;
pub mod validator;
pub mod verify;

use crate::tags::TagId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("PC/SC error: {0}")]
    PCSC(#[from] ::pcsc::Error),
    #[error("APDU error: {0:02X} {1:02X}")]
    APDU(u8, u8),
    #[error("response too short: {0} bytes")]
    ShortResponse(usize),
    #[error("vendor command failed: {0}")]
    Vendor(String),
    #[error("short read at page {page:#04X}: got {len} bytes")]
    ShortRead { page: u8, len: usize },
    #[error("no terminator before page {0:#06X}")]
    ScanLimit(usize),
    #[error("no card present")]
    NoCard,
    #[error("unsupported card: {0}")]
    UnsupportedCard(String),
    #[error("card is still locked")]
    Locked,

    #[error("{id:?} tag data is not {expected} bytes long (got {actual})")]
    Length {
        id: TagId,
        expected: &'static str,
        actual: usize,
    },
    #[error("{0:?} tag not found")]
    MissingTag(TagId),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("can't encode tag: {0}")]
    Encode(String),
    #[error("parse error: {0:?}")]
    Parse(nom::error::ErrorKind),

    #[error("tag is not registered")]
    NotRegistered,

    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("key service error: {0}")]
    Service(String),
    #[error("JSON error: {0}")]
    JSON(#[from] serde_json::Error),
}

impl<I> From<nom::Err<nom::error::Error<I>>> for Error {
    fn from(err: nom::Err<nom::error::Error<I>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Self::Parse(nom::error::ErrorKind::Eof),
            nom::Err::Error(e) | nom::Err::Failure(e) => Self::Parse(e.code),
        }
    }
}

/// Broad classes of failure. Callers react differently to each: a transport
/// error means "try again", a format error means "this isn't one of ours",
/// an unregistered card should be sent to the help desk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The card couldn't be read: removed, unsupported, locked, reader fault.
    Transport,
    /// The card was read, but its contents don't make sense.
    Format,
    /// The key service has no record of this card.
    Unregistered,
    /// The verification key is unusable. Server and client disagree.
    Configuration,
    /// The key service couldn't be reached or answered nonsense.
    Service,
}

impl Error {
    pub fn kind(&self) -> Kind {
        match self {
            Self::PCSC(_)
            | Self::APDU(..)
            | Self::ShortResponse(_)
            | Self::Vendor(_)
            | Self::ShortRead { .. }
            | Self::ScanLimit(_)
            | Self::NoCard
            | Self::UnsupportedCard(_)
            | Self::Locked => Kind::Transport,
            Self::Length { .. }
            | Self::MissingTag(_)
            | Self::MalformedSignature(_)
            | Self::Encode(_)
            | Self::Parse(_) => Kind::Format,
            Self::NotRegistered => Kind::Unregistered,
            Self::UnsupportedCurve(_) | Self::UnsupportedKeyType(_) | Self::InvalidKey(_) => {
                Kind::Configuration
            }
            Self::Service(_) | Self::JSON(_) => Kind::Service,
        }
    }
}
