//! NTAG21x cards on USB CCID readers (ACR122U and friends), through PC/SC.
//!
//! Reads and writes use the reader's storage card pseudo-APDUs; everything
//! else is tunnelled to the tag through the PN533's InCommunicateThru.

use std::ffi::CStr;

use tap::TapFallible;
use tracing::{debug, trace_span, warn};

use crate::ntag::{self, CardInfo, Version};
use crate::reader::{PageReader, PageWriter, Protected, PAGE_SIZE};
use crate::util::{call_le, call_payload, call_vendor};
use crate::{Error, Result};

/// PC/SC Part 3 ATR for a contactless storage card, with card name 00 03
/// (MIFARE Ultralight, which NTAG21x cards identify as).
pub const SUPPORTED_ATR: [u8; 15] = [
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x03,
];

pub fn is_supported_atr(atr: &[u8]) -> bool {
    atr.starts_with(&SUPPORTED_ATR)
}

/// LED and buzzer settings for `Reader::signal()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signal {
    pub red: bool,
    pub green: bool,
    pub duration_ms: u32,
    pub repeat: u8,
}

impl Signal {
    pub fn success() -> Self {
        Self {
            green: true,
            duration_ms: 100,
            repeat: 1,
            ..Default::default()
        }
    }

    pub fn failure() -> Self {
        Self {
            red: true,
            duration_ms: 100,
            repeat: 3,
            ..Default::default()
        }
    }

    /// ACR122U "Bi-Color LED and Buzzer Control" payload, after P2: state
    /// control, T1 and T2 in 100ms units, repetitions, buzzer link.
    pub fn apdu_params(&self) -> (u8, [u8; 4]) {
        let mut led = 0;
        if self.red {
            led |= 0x05;
        }
        if self.green {
            led |= 0x0A;
        }
        let t = u8::try_from(self.duration_ms / 100).unwrap_or(u8::MAX);
        (led, [t, t, self.repeat, 0x01])
    }
}

/// A card, as seen through a PC/SC reader.
pub struct Reader {
    card: pcsc::Card,
    wbuf: [u8; pcsc::MAX_BUFFER_SIZE],
    rbuf: [u8; pcsc::MAX_BUFFER_SIZE],
    atr: Vec<u8>,
    info: Option<CardInfo>,
    present: bool,
    supported: bool,
}

impl Reader {
    pub fn connect(ctx: &pcsc::Context, name: &CStr) -> Result<Self> {
        let span = trace_span!("connect", ?name);
        let _enter = span.enter();

        let card = ctx.connect(name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
        Self::wrap(card)
    }

    /// Identifies a connected card: ATR first, then GET_VERSION.
    pub fn wrap(card: pcsc::Card) -> Result<Self> {
        let mut rdr = Self {
            card,
            wbuf: [0; pcsc::MAX_BUFFER_SIZE],
            rbuf: [0; pcsc::MAX_BUFFER_SIZE],
            atr: Vec::new(),
            info: None,
            present: true,
            supported: false,
        };
        rdr.atr = rdr
            .card
            .get_attribute(pcsc::Attribute::AtrString, &mut rdr.rbuf)?
            .to_vec();
        debug!(atr = hex::encode_upper(&rdr.atr), "Card ATR");

        if !is_supported_atr(&rdr.atr) {
            warn!(atr = hex::encode_upper(&rdr.atr), "Not a storage card");
            return Ok(rdr);
        }
        match rdr.version().and_then(|v| CardInfo::try_from(&v)) {
            Ok(info) => {
                debug!(?info, "Identified card");
                rdr.info = Some(info);
                rdr.supported = true;
            }
            Err(err @ Error::UnsupportedCard(_)) => warn!(%err, "Unsupported card"),
            Err(err) => return Err(err),
        }
        Ok(rdr)
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    pub fn info(&self) -> Option<&CardInfo> {
        self.info.as_ref()
    }

    /// GET_VERSION, tunnelled to the tag.
    pub fn version(&mut self) -> Result<Version> {
        let rsp = self.vendor(&[ntag::GET_VERSION])?;
        Version::parse(&rsp)
    }

    /// Sends a native tag command, returns the tag's answer.
    pub fn vendor(&mut self, cmd: &[u8]) -> Result<Vec<u8>> {
        let rsp = call_vendor(&mut self.card, &mut self.wbuf, &mut self.rbuf, cmd)
            .map(|rsp| rsp.to_vec());
        self.track(rsp)
    }

    /// Blinks and beeps.
    pub fn signal(&mut self, signal: Signal) -> Result<()> {
        let (led, params) = signal.apdu_params();
        let rsp = call_payload(
            &mut self.card,
            &mut self.wbuf,
            &mut self.rbuf,
            0xFF,
            0x00,
            0x40,
            led,
            &params,
        )
        .map(|_| ());
        self.track(rsp)
    }

    /// Notices when a failure was the card leaving the field.
    fn track<T>(&mut self, rsp: Result<T>) -> Result<T> {
        rsp.tap_err(|err| {
            if let Error::PCSC(pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard) = err {
                debug!("Card removed");
                self.present = false;
            }
        })
    }
}

impl PageReader for Reader {
    fn read_pages(&mut self, page: u8) -> Result<Vec<u8>> {
        let span = trace_span!("READ", page);
        let _enter = span.enter();

        let rsp = call_le(
            &mut self.card,
            &mut self.wbuf,
            &mut self.rbuf,
            0xFF,
            0xB0,
            0x00,
            page,
            PAGE_SIZE as u16,
        )
        .map(|rsp| rsp.to_vec());
        self.track(rsp)
    }

    fn card_present(&self) -> bool {
        self.present
    }

    fn card_supported(&self) -> bool {
        self.supported
    }

    fn page_limit(&self) -> Option<u8> {
        self.info.as_ref().and_then(CardInfo::page_limit)
    }
}

impl PageWriter for Reader {
    fn write_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let span = trace_span!("WRITE", page);
        let _enter = span.enter();

        let rsp = call_payload(
            &mut self.card,
            &mut self.wbuf,
            &mut self.rbuf,
            0xFF,
            0xD6,
            0x00,
            page,
            data,
        )
        .map(|_| ());
        self.track(rsp)
    }
}

impl Protected for Reader {
    fn uid(&mut self) -> Result<Vec<u8>> {
        let rsp = call_le(
            &mut self.card,
            &mut self.wbuf,
            &mut self.rbuf,
            0xFF,
            0xCA,
            0x00,
            0x00,
            0x00,
        )
        .map(|rsp| rsp.to_vec());
        self.track(rsp)
    }

    fn unlock(&mut self, password: u32) -> Result<()> {
        let span = trace_span!("PWD_AUTH");
        let _enter = span.enter();

        let pack = self.vendor(&ntag::pwd_auth(password))?;
        debug!(pack = hex::encode_upper(pack), "Authenticated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_supported_atr() {
        // ACR122U with an NTAG215 on it; trailing byte is the TCK.
        let atr = hex::decode("3B8F8001804F0CA0000003060300030000000068").unwrap();
        assert!(is_supported_atr(&atr));
        // Same, but a MIFARE Classic 1K.
        let atr = hex::decode("3B8F8001804F0CA000000306030001000000006A").unwrap();
        assert!(!is_supported_atr(&atr));
        assert!(!is_supported_atr(&SUPPORTED_ATR[..10]));
    }

    #[test]
    fn test_signal_params() {
        assert_eq!(Signal::success().apdu_params(), (0x0A, [1, 1, 1, 1]));
        assert_eq!(Signal::failure().apdu_params(), (0x05, [1, 1, 3, 1]));
        let long = Signal {
            red: true,
            green: true,
            duration_ms: 60_000,
            repeat: 2,
        };
        assert_eq!(long.apdu_params(), (0x0F, [255, 255, 2, 1]));
    }
}
