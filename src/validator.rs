//! Reads a badge, and decides whether it's genuine.

use chrono::{DateTime, TimeZone, Utc};
use p256::ecdsa::VerifyingKey;
use tap::TapFallible;
use tracing::{debug, info, trace_span, warn};

use crate::canonical::{signing_payload, CanonicalRecord};
use crate::codec;
use crate::config::Config;
use crate::reader::{PageReader, Protected};
use crate::service::KeyService;
use crate::session::Session;
use crate::tags::TagArray;
use crate::verify::verify;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Signed by the issuer.
    Authentic,
    /// Well-formed, but the signature doesn't match.
    Forged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub tags: TagArray,
    pub record: CanonicalRecord,
    pub verdict: Verdict,
}

impl Validation {
    pub fn is_authentic(&self) -> bool {
        self.verdict == Verdict::Authentic
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.record
            .expiration
            .and_then(|v| i64::try_from(v).ok())
            .and_then(|v| Utc.timestamp_opt(v, 0).single())
    }

    /// Cards without an expiration never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(false, |at| at <= now)
    }
}

pub struct Validator<S: KeyService> {
    service: S,
    config: Config,
    key: Option<VerifyingKey>,
}

impl<S: KeyService> Validator<S> {
    pub fn new(service: S, config: Config) -> Self {
        Self {
            service,
            config,
            key: None,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The issuer's key. Fetched once, then cached.
    pub fn verifying_key(&mut self) -> Result<VerifyingKey> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        let key = self.service.public_key()?.verifying_key()?;
        debug!("Fetched issuer key");
        self.key = Some(key.clone());
        Ok(key)
    }

    /// Checks records that have already been read.
    pub fn check(&mut self, tags: TagArray) -> Result<Validation> {
        let span = trace_span!("check");
        let _enter = span.enter();

        let payload = signing_payload(&tags)?;
        let key = self.verifying_key()?;
        let verdict = match verify(&payload.payload, &payload.signature, &key)? {
            true => Verdict::Authentic,
            false => Verdict::Forged,
        };
        info!(
            user_id = payload.record.user_id,
            convention_id = payload.record.convention_id,
            ?verdict,
            "Checked badge"
        );
        Ok(Validation {
            tags,
            record: payload.record,
            verdict,
        })
    }

    /// Reads a card and checks it.
    pub fn validate<R: PageReader + ?Sized>(&mut self, reader: &mut R) -> Result<Validation> {
        let tags = self.read(reader)?;
        self.check(tags)
    }

    /// Unlocks a card if needed, then reads and checks it.
    pub fn validate_protected<R: Protected + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Validation> {
        self.preflight(reader)?;
        self.validate(reader)
    }

    pub fn read<R: PageReader + ?Sized>(&self, reader: &mut R) -> Result<TagArray> {
        let mut session = Session::new(reader).with_base(self.config.base_page);
        if let Some(limit) = self.config.page_limit {
            session = session.with_limit(limit);
        }
        codec::decode_session(&mut session)
    }

    /// Makes sure the record area is readable, unlocking the card if it isn't.
    pub fn preflight<R: Protected + ?Sized>(&mut self, reader: &mut R) -> Result<()> {
        let span = trace_span!("preflight");
        let _enter = span.enter();

        if self.can_read(reader)? {
            return Ok(());
        }
        if !self.config.unlock {
            return Err(Error::Locked);
        }

        let uid = reader.uid()?;
        debug!(uid = hex::encode_upper(&uid), "Card is locked, looking up password");
        let password = self.service.password(&uid)?;
        let _ = reader
            .unlock(password)
            .tap_err(|err| warn!(%err, "Couldn't unlock card"));

        match self.can_read(reader)? {
            true => Ok(()),
            false => Err(Error::Locked),
        }
    }

    /// Can we read the first record page? Only a NAK from the tag means
    /// locked; anything else is passed on.
    fn can_read<R: PageReader + ?Sized>(&self, reader: &mut R) -> Result<bool> {
        if !reader.card_present() {
            return Err(Error::NoCard);
        }
        if !reader.card_supported() {
            return Err(Error::UnsupportedCard("not an NTAG21x".into()));
        }
        match reader.read_pages(self.config.base_page) {
            Ok(_) => Ok(true),
            Err(err @ (Error::APDU(..) | Error::Vendor(_))) => {
                debug!(%err, "First record page refused, assuming locked");
                Ok(false)
            }
            Err(Error::PCSC(pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard)) => {
                Err(Error::NoCard)
            }
            Err(err) => Err(err),
        }
    }
}
