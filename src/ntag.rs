//! NXP NTAG21x specifics.
//!
//! Commands and layouts are from the NTAG213/215/216 datasheet (NXP rev. 3.2),
//! Section 10: "NTAG commands". These are native tag commands; over a USB
//! reader they have to be tunnelled, see `pcsc`.

use byteorder::{BigEndian, ByteOrder};
use nom::number::complete::be_u8;
use nom::sequence::tuple;
use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::warn;

use crate::{Error, Result};

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// GET_VERSION: returns 8 bytes identifying the product.
pub const GET_VERSION: u8 = 0x60;
/// PWD_AUTH: followed by a 4-byte password.
pub const PWD_AUTH: u8 = 0x1B;

/// First page of user memory. Pages 0-3 hold the UID, lock bits and CC.
pub const FIRST_USER_PAGE: u8 = 0x04;

/// GET_VERSION vendor ID for NXP.
pub const VENDOR_NXP: u8 = 0x04;

/// Storage size byte from GET_VERSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Product {
    NTAG213 = 0x0F,
    NTAG215 = 0x11,
    NTAG216 = 0x13,
    #[num_enum(catch_all)]
    Unknown(u8) = 0xFF,
}

impl Product {
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::NTAG213 => Some("NTAG213"),
            Self::NTAG215 => Some("NTAG215"),
            Self::NTAG216 => Some("NTAG216"),
            Self::Unknown(_) => None,
        }
    }

    /// User memory, in bytes.
    pub fn user_memory(&self) -> Option<usize> {
        match self {
            Self::NTAG213 => Some(144),
            Self::NTAG215 => Some(504),
            Self::NTAG216 => Some(888),
            Self::Unknown(_) => None,
        }
    }

    /// Total number of pages, including the header and config pages.
    pub fn total_pages(&self) -> Option<usize> {
        match self {
            Self::NTAG213 => Some(0x2D),
            Self::NTAG215 => Some(0x87),
            Self::NTAG216 => Some(0xE7),
            Self::Unknown(_) => None,
        }
    }

    /// One past the last page of user memory.
    pub fn user_page_limit(&self) -> Option<u8> {
        self.user_memory()
            .map(|mem| FIRST_USER_PAGE as usize + mem / 4)
            .and_then(|v| u8::try_from(v).ok())
    }

    /// Page holding CFG0 (MIRROR, AUTH0).
    pub fn cfg_page(&self) -> Option<u8> {
        match self {
            Self::NTAG213 => Some(0x29),
            Self::NTAG215 => Some(0x83),
            Self::NTAG216 => Some(0xE3),
            Self::Unknown(_) => None,
        }
    }

    /// Page holding PWD. Write-only; reads back as zeroes.
    pub fn pwd_page(&self) -> Option<u8> {
        self.cfg_page().map(|p| p + 2)
    }
}

/// GET_VERSION response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub header: u8,
    pub vendor: u8,
    pub product_type: u8,
    pub product_subtype: u8,
    pub major: u8,
    pub minor: u8,
    pub storage: Product,
    pub protocol: u8,
}

impl Version {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (_, v) = parse_version(data)?;
        Ok(v)
    }
}

fn parse_version(data: &[u8]) -> IResult<Version> {
    let (data, (header, vendor, product_type, product_subtype, major, minor, storage, protocol)) =
        tuple((be_u8, be_u8, be_u8, be_u8, be_u8, be_u8, be_u8, be_u8))(data)?;
    Ok((
        data,
        Version {
            header,
            vendor,
            product_type,
            product_subtype,
            major,
            minor,
            storage: storage.into(),
            protocol,
        },
    ))
}

/// What we know about a card, from its GET_VERSION response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub memory_bytes: Option<usize>,
    pub product: Option<Product>,
}

impl CardInfo {
    /// Only NTAG21x cards support PWD_AUTH.
    pub fn supports_password(&self) -> bool {
        self.manufacturer.as_deref().is_some_and(|m| m.starts_with("NXP"))
            && self
                .product_name
                .as_deref()
                .is_some_and(|p| p.starts_with("NTAG21"))
    }

    pub fn page_limit(&self) -> Option<u8> {
        self.product.and_then(|p| p.user_page_limit())
    }
}

impl TryFrom<&Version> for CardInfo {
    type Error = Error;

    fn try_from(v: &Version) -> Result<Self> {
        let mut info = Self::default();
        match v.vendor {
            VENDOR_NXP => info.manufacturer = Some("NXP Semiconductors".into()),
            vendor => {
                return Err(Error::UnsupportedCard(format!(
                    "unknown vendor {:02X}",
                    vendor
                )))
            }
        }
        // NTAG, 50pF, v1.
        if (v.product_type, v.product_subtype, v.major) != (0x04, 0x02, 0x01) {
            return Err(Error::UnsupportedCard(format!(
                "not an NTAG21x: {:02X} {:02X} {:02X}",
                v.product_type, v.product_subtype, v.major
            )));
        }
        if v.minor != 0x00 {
            warn!(minor = v.minor, "Unknown NTAG minor version, size unknown");
            return Ok(info);
        }
        match v.storage {
            Product::Unknown(size) => Err(Error::UnsupportedCard(format!(
                "unknown storage size {:02X}",
                size
            ))),
            product => {
                info.product_name = product.name().map(Into::into);
                info.memory_bytes = product.user_memory();
                info.product = Some(product);
                Ok(info)
            }
        }
    }
}

/// PWD_AUTH command frame.
pub fn pwd_auth(password: u32) -> [u8; 5] {
    let mut cmd = [PWD_AUTH, 0, 0, 0, 0];
    BigEndian::write_u32(&mut cmd[1..], password);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_ntag215() {
        let v = Version::parse(&[0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x11, 0x03]).unwrap();
        assert_eq!(v.storage, Product::NTAG215);
        assert_eq!(
            CardInfo::try_from(&v).unwrap(),
            CardInfo {
                manufacturer: Some("NXP Semiconductors".into()),
                product_name: Some("NTAG215".into()),
                memory_bytes: Some(504),
                product: Some(Product::NTAG215),
            }
        );
    }

    #[test]
    fn test_card_info_sizes() {
        for (storage, name, mem, limit) in [
            (0x0F, "NTAG213", 144, 0x28),
            (0x11, "NTAG215", 504, 0x82),
            (0x13, "NTAG216", 888, 0xE2),
        ] {
            let v = Version::parse(&[0x00, 0x04, 0x04, 0x02, 0x01, 0x00, storage, 0x03]).unwrap();
            let info = CardInfo::try_from(&v).unwrap();
            assert_eq!(info.product_name.as_deref(), Some(name));
            assert_eq!(info.memory_bytes, Some(mem));
            assert_eq!(info.page_limit(), Some(limit));
            assert!(info.supports_password());
        }
    }

    #[test]
    fn test_card_info_unsupported() {
        // Not NXP.
        let v = Version::parse(&[0x00, 0x05, 0x04, 0x02, 0x01, 0x00, 0x11, 0x03]).unwrap();
        assert!(matches!(CardInfo::try_from(&v), Err(Error::UnsupportedCard(_))));
        // MIFARE Ultralight EV1, not an NTAG.
        let v = Version::parse(&[0x00, 0x04, 0x03, 0x01, 0x01, 0x00, 0x0B, 0x03]).unwrap();
        assert!(matches!(CardInfo::try_from(&v), Err(Error::UnsupportedCard(_))));
        // NTAG with a size we don't know.
        let v = Version::parse(&[0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x42, 0x03]).unwrap();
        assert!(matches!(CardInfo::try_from(&v), Err(Error::UnsupportedCard(_))));
    }

    #[test]
    fn test_card_info_unknown_minor() {
        let v = Version::parse(&[0x00, 0x04, 0x04, 0x02, 0x01, 0x01, 0x11, 0x03]).unwrap();
        let info = CardInfo::try_from(&v).unwrap();
        assert_eq!(info.manufacturer.as_deref(), Some("NXP Semiconductors"));
        assert_eq!(info.product_name, None);
        assert_eq!(info.page_limit(), None);
        assert!(!info.supports_password());
    }

    #[test]
    fn test_parse_version_truncated() {
        assert!(matches!(
            Version::parse(&[0x00, 0x04, 0x04]),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_product_pages() {
        assert_eq!(Product::NTAG213.pwd_page(), Some(0x2B));
        assert_eq!(Product::NTAG215.pwd_page(), Some(0x85));
        assert_eq!(Product::NTAG216.pwd_page(), Some(0xE5));
        assert_eq!(Product::Unknown(0).total_pages(), None);
    }

    #[test]
    fn test_pwd_auth() {
        assert_eq!(pwd_auth(0x12345678), [0x1B, 0x12, 0x34, 0x56, 0x78]);
    }
}
