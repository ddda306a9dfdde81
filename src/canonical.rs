//! The signed rendition of a badge's records.
//!
//! Issuers sign a compact JSON object built from the badge's fields, not the
//! raw bytes on the card: keys sorted, no whitespace. The timestamp is a
//! JSON string, every other field a bare integer; signatures already in the
//! field depend on that.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::tags::TagArray;
use crate::Result;

/// The fields covered by a badge's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub user_id: u32,
    pub convention_id: u32,
    pub issuance_count: u64,
    pub timestamp: u64,
    pub expiration: Option<u64>,
}

impl CanonicalRecord {
    pub fn from_tags(tags: &TagArray) -> Result<Self> {
        let (user_id, convention_id) = tags.attendee_and_convention()?;
        Ok(Self {
            user_id,
            convention_id,
            issuance_count: tags.issuance()?,
            timestamp: tags.timestamp()?,
            expiration: tags.expiration()?,
        })
    }

    pub fn to_map(&self) -> BTreeMap<&'static str, Value> {
        let mut map = BTreeMap::new();
        map.insert("userId", Value::from(self.user_id));
        map.insert("conventionId", Value::from(self.convention_id));
        map.insert("issuanceCount", Value::from(self.issuance_count));
        map.insert("timestamp", Value::String(self.timestamp.to_string()));
        if let Some(expiration) = self.expiration {
            map.insert("expiration", Value::from(expiration));
        }
        map
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_map())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_map())?)
    }
}

/// What a verifier needs: the bytes that were signed, and the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPayload {
    pub record: CanonicalRecord,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

pub fn signing_payload(tags: &TagArray) -> Result<SigningPayload> {
    let signature = tags.signature()?.to_vec();
    let record = CanonicalRecord::from_tags(tags)?;
    Ok(SigningPayload {
        payload: record.to_bytes()?,
        record,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{Tag, TagId};
    use crate::Error;

    fn tags() -> TagArray {
        vec![
            Tag::attendee(7, 3),
            Tag::issuance(1),
            Tag::timestamp(1_700_000_000),
            Tag::expiration(1_800_000_000),
            Tag::signature(vec![0x30, 0x00]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_to_json() {
        let record = CanonicalRecord::from_tags(&tags()).unwrap();
        assert_eq!(
            record.to_json().unwrap(),
            r#"{"conventionId":3,"expiration":1800000000,"issuanceCount":1,"timestamp":"1700000000","userId":7}"#
        );
    }

    #[test]
    fn test_to_json_without_expiration() {
        let record = CanonicalRecord {
            user_id: 1,
            convention_id: 2,
            issuance_count: 3,
            timestamp: 4,
            expiration: None,
        };
        assert_eq!(
            record.to_json().unwrap(),
            r#"{"conventionId":2,"issuanceCount":3,"timestamp":"4","userId":1}"#
        );
    }

    #[test]
    fn test_card_order_is_irrelevant() {
        let mut shuffled: Vec<Tag> = tags().iter().cloned().collect();
        shuffled.reverse();
        let shuffled: TagArray = shuffled.into_iter().collect();
        assert_eq!(
            CanonicalRecord::from_tags(&shuffled).unwrap().to_json().unwrap(),
            CanonicalRecord::from_tags(&tags()).unwrap().to_json().unwrap()
        );
    }

    #[test]
    fn test_wide_integers() {
        let tags: TagArray = vec![
            Tag::attendee(u32::MAX, 0),
            Tag::new(TagId::Issuance, [0xFF; 8]),
            Tag::timestamp(u64::MAX),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            CanonicalRecord::from_tags(&tags).unwrap().to_json().unwrap(),
            r#"{"conventionId":0,"issuanceCount":18446744073709551615,"timestamp":"18446744073709551615","userId":4294967295}"#
        );
    }

    #[test]
    fn test_signing_payload() {
        let p = signing_payload(&tags()).unwrap();
        assert_eq!(p.signature, vec![0x30, 0x00]);
        assert_eq!(p.payload, p.record.to_json().unwrap().into_bytes());
    }

    #[test]
    fn test_missing_fields() {
        let unsigned: TagArray = tags()
            .iter()
            .filter(|t| t.id != TagId::Signature)
            .cloned()
            .collect();
        assert!(matches!(
            signing_payload(&unsigned),
            Err(Error::MissingTag(TagId::Signature))
        ));

        let anonymous: TagArray = tags()
            .iter()
            .filter(|t| t.id != TagId::AttendeeConventionId)
            .cloned()
            .collect();
        assert!(matches!(
            CanonicalRecord::from_tags(&anonymous),
            Err(Error::MissingTag(TagId::AttendeeConventionId))
        ));
    }
}
