//! Byte-granular reads over a page-granular transport.

use std::collections::BTreeMap;

use tracing::{debug, trace, trace_span};

use crate::reader::{PageReader, PAGE_SIZE};
use crate::{Error, Result};

/// Records start at page 0x10 (byte 0x40). Pages before that are the tag
/// header, the NDEF capability container and whatever else a vendor put there.
pub const BASE_PAGE: u8 = 0x10;

/// Scan limit when the transport doesn't know better: one past the last user
/// page of the largest NTAG21x (NTAG216).
pub const DEFAULT_PAGE_LIMIT: u8 = 0xE2;

/// One card session: a page cache plus a read cursor.
///
/// Cached pages are never re-read or overwritten. The cache is dropped as
/// soon as the card is seen leaving the field.
#[derive(Debug)]
pub struct Session<'r, R: PageReader + ?Sized> {
    reader: &'r mut R,
    pages: BTreeMap<u8, [u8; PAGE_SIZE]>,
    base: u8,
    limit: u8,
    cursor: usize,
}

impl<'r, R: PageReader + ?Sized> Session<'r, R> {
    pub fn new(reader: &'r mut R) -> Self {
        let limit = reader.page_limit().unwrap_or(DEFAULT_PAGE_LIMIT);
        Self {
            reader,
            pages: BTreeMap::new(),
            base: BASE_PAGE,
            limit,
            cursor: 0,
        }
    }

    pub fn with_base(mut self, base: u8) -> Self {
        self.base = base;
        self
    }

    /// Never read at or past this page.
    pub fn with_limit(mut self, limit: u8) -> Self {
        self.limit = limit;
        self
    }

    pub fn reader(&mut self) -> &mut R {
        self.reader
    }

    /// Byte offset from the base page.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Forgets everything read so far.
    pub fn invalidate(&mut self) {
        debug!(pages = self.pages.len(), "Invalidating page cache");
        self.pages.clear();
        self.cursor = 0;
    }

    pub fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    /// Returns a page, reading it from the card if it's not cached yet.
    pub fn page(&mut self, addr: u8) -> Result<[u8; PAGE_SIZE]> {
        if let Some(page) = self.pages.get(&addr) {
            return Ok(*page);
        }
        if addr >= self.limit {
            return Err(Error::ScanLimit(addr as usize));
        }
        if !self.reader.card_present() {
            self.invalidate();
            return Err(Error::NoCard);
        }
        if !self.reader.card_supported() {
            return Err(Error::UnsupportedCard("reader reports unsupported card".into()));
        }

        let span = trace_span!("read_pages", addr);
        let _enter = span.enter();

        let data = match self.reader.read_pages(addr) {
            Ok(data) => data,
            Err(
                err @ (Error::NoCard
                | Error::PCSC(pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard)),
            ) => {
                self.invalidate();
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        trace!(data = hex::encode_upper(&data), "<< pages");
        if data.is_empty() || data.len() % PAGE_SIZE != 0 {
            return Err(Error::ShortRead {
                page: addr,
                len: data.len(),
            });
        }
        for (i, chunk) in data.chunks_exact(PAGE_SIZE).enumerate() {
            let Some(a) = u8::try_from(addr as usize + i).ok().filter(|a| *a < self.limit) else {
                break;
            };
            let mut page = [0; PAGE_SIZE];
            page.copy_from_slice(chunk);
            self.pages.entry(a).or_insert(page);
        }
        self.pages
            .get(&addr)
            .copied()
            .ok_or(Error::ShortRead { page: addr, len: 0 })
    }

    /// Reads the byte under the cursor, and advances it.
    pub fn read_byte(&mut self) -> Result<u8> {
        let page = self.base as usize + self.cursor / PAGE_SIZE;
        let addr = u8::try_from(page).map_err(|_| Error::ScanLimit(page))?;
        let byte = self.page(addr)?[self.cursor % PAGE_SIZE];
        self.cursor += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        (0..len).map(|_| self.read_byte()).collect()
    }
}
