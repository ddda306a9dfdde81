//! The registration service: issuer public key and per-card passwords.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace_span, warn};
use url::Url;

use crate::verify::Jwk;
use crate::{Error, Result};

pub const KEY_PATH: &str = "api/nfc/key";
pub const PASSWORD_PATH: &str = "api/badge/nfc/password";

/// Where keys and passwords come from.
pub trait KeyService {
    /// The issuer's signing key.
    fn public_key(&self) -> Result<Jwk>;

    /// PWD_AUTH password for a card, by UID. `Error::NotRegistered` if the
    /// service has never seen the card.
    fn password(&self, uid: &[u8]) -> Result<u32>;
}

impl<K: KeyService + ?Sized> KeyService for Box<K> {
    fn public_key(&self) -> Result<Jwk> {
        (**self).public_key()
    }

    fn password(&self, uid: &[u8]) -> Result<u32> {
        (**self).password(uid)
    }
}

#[derive(Debug, Deserialize)]
struct PasswordResponse {
    password: Option<u32>,
}

/// Talks to the registration server over HTTP.
#[derive(Debug, Clone)]
pub struct HttpKeyService {
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpKeyService {
    pub fn new(base: &str) -> Result<Self> {
        // Url::join() replaces the last path segment unless there's a trailing slash.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };
        Ok(Self {
            base: Url::parse(&base).map_err(|err| Error::Service(format!("{}: {}", base, err)))?,
            token: None,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_token<S: Into<String>>(mut self, token: Option<S>) -> Self {
        self.token = token.map(Into::into);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn key_url(&self) -> Result<Url> {
        self.join(KEY_PATH)
    }

    pub fn password_url(&self, uid: &[u8]) -> Result<Url> {
        let mut url = self.join(PASSWORD_PATH)?;
        url.query_pairs_mut().append_pair("uuid", &hex::encode(uid));
        Ok(url)
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|err| Error::Service(format!("{}: {}", path, err)))
    }

    fn get(&self, url: &Url) -> std::result::Result<ureq::Response, ureq::Error> {
        let mut req = ureq::get(url.as_str())
            .set("Accept", "application/json")
            .timeout(self.timeout);
        if let Some(token) = self.token.as_deref() {
            req = req.set("Authorization", &format!("Bearer {}", token));
        }
        req.call()
    }
}

/// Maps a non-2xx response. Only the password lookup treats 404 as "this
/// card isn't ours"; anywhere else it's a misconfigured URL.
fn status_error(code: u16, body: String, not_found_is_unregistered: bool) -> Error {
    match code {
        404 if not_found_is_unregistered => Error::NotRegistered,
        code => Error::Service(format!("HTTP {}: {}", code, body.trim())),
    }
}

fn transport_error(err: ureq::Error, not_found_is_unregistered: bool) -> Error {
    match err {
        ureq::Error::Status(code, rsp) => status_error(
            code,
            rsp.into_string().unwrap_or_default(),
            not_found_is_unregistered,
        ),
        err => Error::Service(err.to_string()),
    }
}

impl KeyService for HttpKeyService {
    fn public_key(&self) -> Result<Jwk> {
        let span = trace_span!("public_key");
        let _enter = span.enter();

        let url = self.key_url()?;
        debug!(%url, "Fetching public key");
        self.get(&url)
            .map_err(|err| transport_error(err, false))?
            .into_json()
            .map_err(|err| Error::Service(format!("bad key response: {}", err)))
    }

    fn password(&self, uid: &[u8]) -> Result<u32> {
        let span = trace_span!("password", uid = hex::encode(uid));
        let _enter = span.enter();

        let url = self.password_url(uid)?;
        debug!(%url, "Fetching card password");
        let rsp: PasswordResponse = self
            .get(&url)
            .map_err(|err| transport_error(err, true))?
            .into_json()
            .map_err(|err| Error::Service(format!("bad password response: {}", err)))?;
        rsp.password.ok_or_else(|| {
            warn!("Password response has no password");
            Error::Service("no password in response".into())
        })
    }
}

/// Fixed key and passwords, eg. for offline use.
#[derive(Debug, Clone)]
pub struct StaticKeyService {
    pub key: Jwk,
    pub passwords: HashMap<Vec<u8>, u32>,
}

impl StaticKeyService {
    pub fn new(key: Jwk) -> Self {
        Self {
            key,
            passwords: HashMap::new(),
        }
    }

    pub fn with_password<U: Into<Vec<u8>>>(mut self, uid: U, password: u32) -> Self {
        self.passwords.insert(uid.into(), password);
        self
    }
}

impl KeyService for StaticKeyService {
    fn public_key(&self) -> Result<Jwk> {
        Ok(self.key.clone())
    }

    fn password(&self, uid: &[u8]) -> Result<u32> {
        self.passwords.get(uid).copied().ok_or(Error::NotRegistered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwk() -> Jwk {
        Jwk {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: "AQ".into(),
            y: "Ag".into(),
        }
    }

    #[test]
    fn test_urls() {
        for base in ["https://demo.example.org", "https://demo.example.org/"] {
            let svc = HttpKeyService::new(base).unwrap();
            assert_eq!(
                svc.key_url().unwrap().as_str(),
                "https://demo.example.org/api/nfc/key"
            );
            assert_eq!(
                svc.password_url(&[0x04, 0xA1, 0xB2]).unwrap().as_str(),
                "https://demo.example.org/api/badge/nfc/password?uuid=04a1b2"
            );
        }
    }

    #[test]
    fn test_urls_with_prefix() {
        let svc = HttpKeyService::new("https://example.org/con/2024").unwrap();
        assert_eq!(
            svc.key_url().unwrap().as_str(),
            "https://example.org/con/2024/api/nfc/key"
        );
    }

    #[test]
    fn test_bad_base() {
        assert!(matches!(
            HttpKeyService::new("not a url"),
            Err(Error::Service(_))
        ));
    }

    #[test]
    fn test_status_error() {
        assert!(matches!(
            status_error(404, String::new(), true),
            Error::NotRegistered
        ));
        assert!(matches!(
            status_error(404, String::new(), false),
            Error::Service(_)
        ));
        match status_error(500, "oops\n".into(), true) {
            Error::Service(msg) => assert_eq!(msg, "HTTP 500: oops"),
            err => panic!("wrong error: {:?}", err),
        }
    }

    #[test]
    fn test_password_response() {
        let rsp: PasswordResponse = serde_json::from_str(r#"{"password":3735928559}"#).unwrap();
        assert_eq!(rsp.password, Some(0xDEADBEEF));
        let rsp: PasswordResponse = serde_json::from_str(r#"{"password":null}"#).unwrap();
        assert_eq!(rsp.password, None);
        let rsp: PasswordResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(rsp.password, None);
    }

    #[test]
    fn test_static() {
        let svc = StaticKeyService::new(jwk()).with_password(vec![0x04, 0x01], 42);
        assert_eq!(svc.public_key().unwrap(), jwk());
        assert_eq!(svc.password(&[0x04, 0x01]).unwrap(), 42);
        assert!(matches!(
            svc.password(&[0x04, 0x02]),
            Err(Error::NotRegistered)
        ));
    }
}
