use crate::{Error, Result};
use tracing::{trace, trace_span};

// PN533 frame identifiers, and InCommunicateThru.
const TFI_HOST: u8 = 0xD4;
const TFI_PN533: u8 = 0xD5;
const IN_COMMUNICATE_THRU: u8 = 0x42;

pub(crate) fn call_le<'a>(
    card: &mut pcsc::Card,
    wbuf: &'a mut [u8],
    rbuf: &'a mut [u8],
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    le: u16,
) -> Result<&'a [u8]> {
    call_apdu(
        card,
        wbuf,
        rbuf,
        apdu::Command::new_with_le(cla, ins, p1, p2, le),
    )
}

pub(crate) fn call_payload<'a>(
    card: &mut pcsc::Card,
    wbuf: &'a mut [u8],
    rbuf: &'a mut [u8],
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    payload: &[u8],
) -> Result<&'a [u8]> {
    call_apdu(
        card,
        wbuf,
        rbuf,
        apdu::Command::new_with_payload(cla, ins, p1, p2, payload),
    )
}

pub(crate) fn call_apdu<'a>(
    card: &mut pcsc::Card,
    wbuf: &'a mut [u8],
    rbuf: &'a mut [u8],
    cmd: apdu::Command,
) -> Result<&'a [u8]> {
    let span = trace_span!("call_apdu");
    let _enter = span.enter();

    cmd.write(wbuf);
    let req = &wbuf[..cmd.len()];
    trace!(req = hex::encode_upper(req), ">> TX");

    let rsp = card.transmit(req, rbuf)?;
    trace!(rsp = hex::encode_upper(rsp), "<< RX");
    check_sw(rsp)
}

/// Splits off and checks the status word.
pub(crate) fn check_sw(rsp: &[u8]) -> Result<&[u8]> {
    let l = rsp.len();
    if l < 2 {
        return Err(Error::ShortResponse(l));
    }
    let (sw1, sw2, data) = (rsp[l - 2], rsp[l - 1], &rsp[..l - 2]);

    if (sw1, sw2) != (0x90, 0x00) {
        Err(Error::APDU(sw1, sw2))
    } else {
        Ok(data)
    }
}

/// Sends a native command straight to the tag, through the reader's
/// PN533. See the PN533 user manual, section 8.4.9.
pub(crate) fn call_vendor<'a>(
    card: &mut pcsc::Card,
    wbuf: &'a mut [u8],
    rbuf: &'a mut [u8],
    cmd: &[u8],
) -> Result<&'a [u8]> {
    let span = trace_span!("call_vendor", cmd = cmd.first().copied());
    let _enter = span.enter();

    let payload = vendor_payload(cmd)?;
    let rsp = call_payload(card, wbuf, rbuf, 0xFF, 0x00, 0x00, 0x00, &payload)?;
    check_vendor(rsp)
}

pub(crate) fn vendor_payload(cmd: &[u8]) -> Result<Vec<u8>> {
    if cmd.len() + 2 > 0xFF {
        return Err(Error::Vendor(format!(
            "command too large ({} bytes)",
            cmd.len() + 2
        )));
    }
    let mut payload = Vec::with_capacity(cmd.len() + 2);
    payload.extend_from_slice(&[TFI_HOST, IN_COMMUNICATE_THRU]);
    payload.extend_from_slice(cmd);
    Ok(payload)
}

/// Checks an InCommunicateThru response: D5 43, status, then the tag's answer.
pub(crate) fn check_vendor(rsp: &[u8]) -> Result<&[u8]> {
    match rsp {
        [TFI_PN533, 0x43, 0x00, data @ ..] => Ok(data),
        [TFI_PN533, 0x43, status, ..] => {
            Err(Error::Vendor(format!("tag error status {:02X}", status)))
        }
        [a, b, _, ..] => Err(Error::Vendor(format!(
            "unexpected response header {:02X} {:02X}",
            a, b
        ))),
        _ => Err(Error::ShortResponse(rsp.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_sw() {
        assert_eq!(check_sw(&[0x01, 0x02, 0x90, 0x00]).unwrap(), &[0x01, 0x02]);
        assert_eq!(check_sw(&[0x90, 0x00]).unwrap(), &[] as &[u8]);
        assert!(matches!(check_sw(&[0x63, 0x00]), Err(Error::APDU(0x63, 0x00))));
        assert!(matches!(check_sw(&[0x90]), Err(Error::ShortResponse(1))));
    }

    #[test]
    fn test_vendor_payload() {
        assert_eq!(vendor_payload(&[0x60]).unwrap(), vec![0xD4, 0x42, 0x60]);
        assert!(vendor_payload(&[0; 253]).is_ok());
        assert!(matches!(vendor_payload(&[0; 254]), Err(Error::Vendor(_))));
    }

    #[test]
    fn test_check_vendor() {
        assert_eq!(
            check_vendor(&[0xD5, 0x43, 0x00, 0x00, 0x04, 0x04]).unwrap(),
            &[0x00, 0x04, 0x04]
        );
        assert!(matches!(
            check_vendor(&[0xD5, 0x43, 0x01]),
            Err(Error::Vendor(_))
        ));
        assert!(matches!(
            check_vendor(&[0xD5, 0x41, 0x00]),
            Err(Error::Vendor(_))
        ));
        assert!(matches!(check_vendor(&[0xD5, 0x43]), Err(Error::ShortResponse(2))));
    }
}
