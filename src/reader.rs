//! Page-level access to a tag's memory.

use tracing::{debug, trace};

use crate::ntag;
use crate::{Error, Result};

/// Size of one memory page, in bytes.
pub const PAGE_SIZE: usize = 4;

/// Anything that can read pages off a memory tag.
pub trait PageReader {
    /// Reads one or more consecutive pages, starting at `page`. The response
    /// must be a non-empty multiple of PAGE_SIZE; transports may return more
    /// than one page (NTAG READ returns four).
    fn read_pages(&mut self, page: u8) -> Result<Vec<u8>>;

    /// Is there a card in the field?
    fn card_present(&self) -> bool;

    /// Is the card something we know how to read?
    fn card_supported(&self) -> bool;

    /// One past the last readable page, if the transport knows it.
    fn page_limit(&self) -> Option<u8> {
        None
    }
}

pub trait PageWriter: PageReader {
    fn write_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) -> Result<()>;
}

/// Cards with password-protected pages.
pub trait Protected: PageReader {
    /// Unique ID of the physical card.
    fn uid(&mut self) -> Result<Vec<u8>>;

    /// Sends PWD_AUTH. Succeeding doesn't mean the pages are readable now;
    /// read again to find out.
    fn unlock(&mut self, password: u32) -> Result<()>;
}

/// An in-memory tag image, eg. a memory dump.
///
/// Reads behave like an NTAG21x: four pages per READ, wrapping is not
/// emulated, and reads at or past `protect_from` fail until the right
/// password has been presented.
#[derive(Debug, Clone)]
pub struct Image {
    memory: Vec<u8>,
    uid: Vec<u8>,
    pages_per_read: usize,
    present: bool,
    password: Option<u32>,
    protect_from: u8,
    authenticated: bool,
    reads: usize,
}

impl Image {
    /// Wraps a memory image. Trailing bytes that don't fill a page are dropped.
    pub fn new<M: Into<Vec<u8>>>(memory: M) -> Self {
        let mut memory = memory.into();
        memory.truncate(memory.len() - memory.len() % PAGE_SIZE);
        Self {
            memory,
            uid: Vec::new(),
            pages_per_read: 4,
            present: true,
            password: None,
            protect_from: 0xFF,
            authenticated: false,
            reads: 0,
        }
    }

    /// A full NTAG21x memory dump, eg. from `nfc-mfultralight r`. The UID is
    /// taken from the first two pages: UID0-2, BCC0, UID3-6.
    pub fn from_dump<M: Into<Vec<u8>>>(dump: M) -> Self {
        let img = Self::new(dump);
        let uid = match img.memory.get(..8) {
            Some(hdr) => [&hdr[..3], &hdr[4..8]].concat(),
            None => Vec::new(),
        };
        img.with_uid(uid)
    }

    /// A blank card of the given product's size, user memory zeroed.
    pub fn blank(product: ntag::Product) -> Self {
        Self::new(vec![0; product.total_pages().unwrap_or(0) * PAGE_SIZE])
    }

    pub fn with_uid<U: Into<Vec<u8>>>(mut self, uid: U) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_pages_per_read(mut self, n: usize) -> Self {
        self.pages_per_read = n.max(1);
        self
    }

    /// Protects everything from `page` onwards behind `password`.
    pub fn with_password(mut self, password: u32, page: u8) -> Self {
        self.password = Some(password);
        self.protect_from = page;
        self.authenticated = false;
        self
    }

    /// Writes raw bytes starting at a page, growing nothing.
    pub fn with_bytes_at(mut self, page: u8, data: &[u8]) -> Self {
        let start = page as usize * PAGE_SIZE;
        let end = (start + data.len()).min(self.memory.len());
        if start < end {
            self.memory[start..end].copy_from_slice(&data[..end - start]);
        }
        self
    }

    pub fn remove(&mut self) {
        self.present = false;
        self.authenticated = false;
    }

    pub fn insert(&mut self) {
        self.present = true;
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Number of read_pages() calls served so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    fn total_pages(&self) -> usize {
        self.memory.len() / PAGE_SIZE
    }

    fn is_locked(&self, page: u8) -> bool {
        self.password.is_some() && !self.authenticated && page >= self.protect_from
    }
}

impl PageReader for Image {
    fn read_pages(&mut self, page: u8) -> Result<Vec<u8>> {
        if !self.present {
            return Err(Error::NoCard);
        }
        self.reads += 1;
        if page as usize >= self.total_pages() {
            return Err(Error::ShortRead { page, len: 0 });
        }
        if self.is_locked(page) {
            // NTAG NAKs; the ACR122U reports that as 63 00.
            return Err(Error::APDU(0x63, 0x00));
        }

        let start = page as usize * PAGE_SIZE;
        let end = (start + self.pages_per_read * PAGE_SIZE).min(self.memory.len());
        trace!(page, len = end - start, "Image::read_pages()");
        Ok(self.memory[start..end].to_vec())
    }

    fn card_present(&self) -> bool {
        self.present
    }

    fn card_supported(&self) -> bool {
        true
    }

    fn page_limit(&self) -> Option<u8> {
        u8::try_from(self.total_pages()).ok()
    }
}

impl PageWriter for Image {
    fn write_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if !self.present {
            return Err(Error::NoCard);
        }
        if page as usize >= self.total_pages() {
            return Err(Error::ShortRead { page, len: 0 });
        }
        if self.is_locked(page) {
            return Err(Error::APDU(0x63, 0x00));
        }
        let start = page as usize * PAGE_SIZE;
        self.memory[start..start + PAGE_SIZE].copy_from_slice(data);
        Ok(())
    }
}

impl Protected for Image {
    fn uid(&mut self) -> Result<Vec<u8>> {
        if !self.present {
            return Err(Error::NoCard);
        }
        Ok(self.uid.clone())
    }

    fn unlock(&mut self, password: u32) -> Result<()> {
        if !self.present {
            return Err(Error::NoCard);
        }
        match self.password {
            Some(expected) if expected != password => {
                debug!("PWD_AUTH rejected");
                Err(Error::Vendor("authentication failed".into()))
            }
            _ => {
                self.authenticated = true;
                Ok(())
            }
        }
    }
}
