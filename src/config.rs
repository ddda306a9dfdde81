use std::time::Duration;

use crate::service::HttpKeyService;
use crate::session::BASE_PAGE;
use crate::Result;

/// Validator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// First page of the record area.
    pub base_page: u8,

    /// Don't read at or past this page. Default: whatever the card says.
    pub page_limit: Option<u8>,

    /// Try to unlock password-protected cards.
    pub unlock: bool,

    /// Registration server, for keys and passwords.
    pub service_url: Option<String>,

    /// Bearer token for the registration server.
    pub token: Option<String>,

    /// HTTP timeout.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_page: BASE_PAGE,
            page_limit: None,
            unlock: true,
            service_url: None,
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_page(mut self, page: u8) -> Self {
        self.base_page = page;
        self
    }

    pub fn with_page_limit(mut self, limit: Option<u8>) -> Self {
        self.page_limit = limit;
        self
    }

    pub fn with_unlock(mut self, unlock: bool) -> Self {
        self.unlock = unlock;
        self
    }

    pub fn with_service_url<S: Into<String>>(mut self, url: Option<S>) -> Self {
        self.service_url = url.map(Into::into);
        self
    }

    pub fn with_token<S: Into<String>>(mut self, token: Option<S>) -> Self {
        self.token = token.map(Into::into);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// An HTTP key service, if a URL is configured.
    pub fn key_service(&self) -> Result<Option<HttpKeyService>> {
        self.service_url
            .as_deref()
            .map(|url| {
                Ok(HttpKeyService::new(url)?
                    .with_token(self.token.clone())
                    .with_timeout(self.timeout))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::new();
        assert_eq!(cfg.base_page, 0x10);
        assert_eq!(cfg.page_limit, None);
        assert!(cfg.unlock);
        assert!(cfg.key_service().unwrap().is_none());
    }

    #[test]
    fn test_key_service() {
        let cfg = Config::new()
            .with_service_url(Some("https://demo.example.org"))
            .with_token(Some("hunter2"));
        let svc = cfg.key_service().unwrap().unwrap();
        assert_eq!(svc.base().as_str(), "https://demo.example.org/");

        let cfg = Config::new().with_service_url(Some("::"));
        assert!(cfg.key_service().is_err());
    }
}
