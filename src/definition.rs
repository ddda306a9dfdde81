//! Badge contents as JSON, the way the registration service hands them out.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::tags::{Tag, TagArray, TagId};
use crate::{Error, Result};

/// Zero and empty fields mean "not set".
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardDefinition {
    #[serde(skip_serializing_if = "is_zero")]
    pub attendee_id: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub convention_id: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub issuance: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub timestamp: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub expiration: u64,
    /// Base64, standard alphabet.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

fn is_zero<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

impl CardDefinition {
    pub fn from_tags(tags: &TagArray) -> Result<Self> {
        let mut def = Self::default();
        for tag in tags {
            match tag.id {
                TagId::AttendeeConventionId => {
                    (def.attendee_id, def.convention_id) = tag.as_paired_u32()?
                }
                TagId::Issuance => {
                    def.issuance = u32::try_from(tag.as_uint()?).map_err(|_| Error::Length {
                        id: tag.id,
                        expected: "4",
                        actual: tag.data.len(),
                    })?
                }
                TagId::Timestamp => def.timestamp = tag.as_uint()?,
                TagId::Expiration => def.expiration = tag.as_uint()?,
                TagId::Signature => def.signature = B64.encode(tag.as_bytes()),
                TagId::Unknown(_) => {}
            }
        }
        Ok(def)
    }

    fn signature_bytes(&self) -> Result<Vec<u8>> {
        B64.decode(&self.signature)
            .map_err(|err| Error::MalformedSignature(format!("base64: {}", err)))
    }

    fn attendee_tag(&self) -> Result<Tag> {
        if self.attendee_id == 0 || self.convention_id == 0 {
            return Err(Error::Encode(
                "attendee_id and convention_id must both be set".into(),
            ));
        }
        Ok(Tag::attendee(self.attendee_id, self.convention_id))
    }

    /// A fresh set of records for a blank card.
    pub fn to_tags(&self) -> Result<TagArray> {
        let mut tags = TagArray::new();
        tags.push(self.attendee_tag()?);
        tags.push(Tag::issuance(self.issuance));
        tags.push(Tag::timestamp(self.timestamp));
        if self.expiration != 0 {
            tags.push(Tag::expiration(self.expiration));
        }
        if self.signature.is_empty() {
            return Err(Error::MissingTag(TagId::Signature));
        }
        tags.push(Tag::signature(self.signature_bytes()?));
        Ok(tags)
    }

    /// Overwrites the records this definition sets, and keeps the rest.
    /// Fields with no record on the card yet are appended.
    pub fn apply(&self, tags: &TagArray) -> Result<TagArray> {
        let mut replacements: Vec<Tag> = Vec::new();
        if self.attendee_id != 0 || self.convention_id != 0 {
            replacements.push(self.attendee_tag()?);
        }
        if self.issuance != 0 {
            replacements.push(Tag::issuance(self.issuance));
        }
        if self.timestamp != 0 {
            replacements.push(Tag::timestamp(self.timestamp));
        }
        if self.expiration != 0 {
            replacements.push(Tag::expiration(self.expiration));
        }
        if !self.signature.is_empty() {
            replacements.push(Tag::signature(self.signature_bytes()?));
        }

        let mut out: TagArray = tags
            .iter()
            .map(|tag| match replacements.iter().position(|r| r.id == tag.id) {
                Some(i) => replacements.remove(i),
                None => tag.clone(),
            })
            .collect();
        for tag in replacements {
            out.push(tag);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def() -> CardDefinition {
        serde_json::from_str(
            r#"{"attendee_id":7,"convention_id":3,"issuance":1,"timestamp":1700000000,"signature":"MAYCAQECAQE="}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_to_tags() {
        let tags = def().to_tags().unwrap();
        assert_eq!(tags.attendee_and_convention().unwrap(), (7, 3));
        assert_eq!(tags.issuance().unwrap(), 1);
        assert_eq!(tags.timestamp().unwrap(), 1_700_000_000);
        assert_eq!(tags.expiration().unwrap(), None);
        assert_eq!(
            tags.signature().unwrap(),
            &[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01]
        );
    }

    #[test]
    fn test_to_tags_incomplete() {
        let mut d = def();
        d.signature.clear();
        assert!(matches!(
            d.to_tags(),
            Err(Error::MissingTag(TagId::Signature))
        ));

        let mut d = def();
        d.convention_id = 0;
        assert!(matches!(d.to_tags(), Err(Error::Encode(_))));

        let mut d = def();
        d.signature = "%%%".into();
        assert!(matches!(d.to_tags(), Err(Error::MalformedSignature(_))));
    }

    #[test]
    fn test_from_tags() {
        let tags = def().to_tags().unwrap();
        assert_eq!(CardDefinition::from_tags(&tags).unwrap(), def());
        assert_eq!(
            serde_json::to_string(&def()).unwrap(),
            r#"{"attendee_id":7,"convention_id":3,"issuance":1,"timestamp":1700000000,"signature":"MAYCAQECAQE="}"#
        );
    }

    #[test]
    fn test_apply() {
        let tags: TagArray = vec![
            Tag::new(TagId::Unknown(0x42), [0xAA]),
            Tag::attendee(7, 3),
            Tag::issuance(1),
        ]
        .into_iter()
        .collect();
        let update = CardDefinition {
            issuance: 2,
            expiration: 1_800_000_000,
            ..Default::default()
        };
        let out = update.apply(&tags).unwrap();
        let ids: Vec<TagId> = out.iter().map(|t| t.id).collect();
        assert_eq!(
            ids,
            vec![
                TagId::Unknown(0x42),
                TagId::AttendeeConventionId,
                TagId::Issuance,
                TagId::Expiration
            ]
        );
        assert_eq!(out.issuance().unwrap(), 2);
        assert_eq!(out.attendee_and_convention().unwrap(), (7, 3));
    }
}
