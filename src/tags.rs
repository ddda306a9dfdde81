//! Tag records and their typed values.
//!
//! Each record on a badge is an id byte, a length byte and that many bytes
//! of payload. The payload's meaning depends on the id; integers are always
//! big-endian, and the integer-valued records may be either 4 or 8 bytes wide
//! depending on which tool issued the card.

use base64::Engine as _;
use byteorder::{BigEndian, ByteOrder};
use chrono::{TimeZone, Utc};
use nom::combinator::map;
use nom::number::complete::{be_u32, be_u64};
use nom::sequence::pair;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::{Error, Result};

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// Id byte which ends the record list. Never a real tag.
pub const TERMINATOR: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum TagId {
    /// 0x01: Attendee ID and Convention ID, as two u32s.
    AttendeeConventionId = 0x01,
    /// 0x02: DER-encoded ECDSA signature over the canonical record.
    Signature = 0x02,
    /// 0x03: Issuance counter; bumped every time a badge is reissued.
    Issuance = 0x03,
    /// 0x04: Unix time the badge was issued.
    Timestamp = 0x04,
    /// 0x05: Unix time the badge stops being valid.
    Expiration = 0x05,

    /// Something newer than us. Kept around, but otherwise ignored.
    #[num_enum(catch_all)]
    Unknown(u8) = 0xFF,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: TagId,
    pub data: Vec<u8>,
}

fn parse_paired_u32(data: &[u8]) -> IResult<(u32, u32)> {
    pair(be_u32, be_u32)(data)
}

fn parse_u32_as_u64(data: &[u8]) -> IResult<u64> {
    map(be_u32, u64::from)(data)
}

fn parse_u64(data: &[u8]) -> IResult<u64> {
    be_u64(data)
}

impl Tag {
    pub fn new<D: Into<Vec<u8>>>(id: TagId, data: D) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    pub fn attendee(user_id: u32, convention_id: u32) -> Self {
        let mut data = [0; 8];
        BigEndian::write_u32(&mut data[..4], user_id);
        BigEndian::write_u32(&mut data[4..], convention_id);
        Self::new(TagId::AttendeeConventionId, data)
    }

    pub fn issuance(count: u32) -> Self {
        let mut data = [0; 4];
        BigEndian::write_u32(&mut data, count);
        Self::new(TagId::Issuance, data)
    }

    pub fn timestamp(unix: u64) -> Self {
        let mut data = [0; 8];
        BigEndian::write_u64(&mut data, unix);
        Self::new(TagId::Timestamp, data)
    }

    pub fn expiration(unix: u64) -> Self {
        let mut data = [0; 8];
        BigEndian::write_u64(&mut data, unix);
        Self::new(TagId::Expiration, data)
    }

    pub fn signature<D: Into<Vec<u8>>>(der: D) -> Self {
        Self::new(TagId::Signature, der)
    }

    /// Two big-endian u32s, eg. (attendee, convention).
    pub fn as_paired_u32(&self) -> Result<(u32, u32)> {
        if self.data.len() != 8 {
            return Err(self.length_error("8"));
        }
        let (_, v) = parse_paired_u32(&self.data)?;
        Ok(v)
    }

    /// A big-endian u32 or u64, depending on the payload's length.
    pub fn as_uint(&self) -> Result<u64> {
        let (_, v) = match self.data.len() {
            4 => parse_u32_as_u64(&self.data)?,
            8 => parse_u64(&self.data)?,
            _ => return Err(self.length_error("4 or 8")),
        };
        Ok(v)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn length_error(&self, expected: &'static str) -> Error {
        Error::Length {
            id: self.id,
            expected,
            actual: self.data.len(),
        }
    }
}

fn fmt_unix(f: &mut std::fmt::Formatter<'_>, label: &str, unix: u64) -> std::fmt::Result {
    match i64::try_from(unix).ok().and_then(|v| Utc.timestamp_opt(v, 0).single()) {
        Some(dt) => write!(f, "{}={}", label, dt.to_rfc3339()),
        None => write!(f, "{}={}", label, unix),
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            TagId::AttendeeConventionId => match self.as_paired_u32() {
                Ok((user, convention)) => {
                    write!(f, "UserID={} ConventionID={}", user, convention)
                }
                Err(err) => write!(f, "{}", err),
            },
            TagId::Signature => write!(
                f,
                "Value={}",
                base64::engine::general_purpose::STANDARD.encode(&self.data)
            ),
            TagId::Issuance => match self.as_uint() {
                Ok(v) => write!(f, "Value={}", v),
                Err(err) => write!(f, "{}", err),
            },
            TagId::Timestamp => match self.as_uint() {
                Ok(v) => fmt_unix(f, "Issued", v),
                Err(err) => write!(f, "{}", err),
            },
            TagId::Expiration => match self.as_uint() {
                Ok(v) => fmt_unix(f, "Expiration", v),
                Err(err) => write!(f, "{}", err),
            },
            TagId::Unknown(_) => write!(f, "Raw={}", hex::encode_upper(&self.data)),
        }
    }
}

/// All records read off a card, in card order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagArray {
    tags: Vec<Tag>,
}

impl TagArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: Tag) {
        self.tags.push(tag)
    }

    /// Returns the first tag with the given id. Duplicates are legal, but
    /// only the first one counts.
    pub fn get(&self, id: TagId) -> Option<&Tag> {
        self.tags.iter().find(|tag| tag.id == id)
    }

    pub fn require(&self, id: TagId) -> Result<&Tag> {
        self.get(id).ok_or(Error::MissingTag(id))
    }

    pub fn attendee_and_convention(&self) -> Result<(u32, u32)> {
        self.require(TagId::AttendeeConventionId)?.as_paired_u32()
    }

    pub fn signature(&self) -> Result<&[u8]> {
        Ok(self.require(TagId::Signature)?.as_bytes())
    }

    pub fn issuance(&self) -> Result<u64> {
        self.require(TagId::Issuance)?.as_uint()
    }

    pub fn timestamp(&self) -> Result<u64> {
        self.require(TagId::Timestamp)?.as_uint()
    }

    /// Expiration is optional; `Ok(None)` if the card doesn't carry one.
    pub fn expiration(&self) -> Result<Option<u64>> {
        self.get(TagId::Expiration).map(Tag::as_uint).transpose()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl FromIterator<Tag> for TagArray {
    fn from_iter<T: IntoIterator<Item = Tag>>(iter: T) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a TagArray {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}
