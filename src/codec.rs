//! Tag records on the card, in and out.

use tracing::{debug, trace_span, warn};

use crate::reader::{PageReader, PageWriter, PAGE_SIZE};
use crate::session::{Session, BASE_PAGE};
use crate::tags::{Tag, TagArray, TagId, TERMINATOR};
use crate::{Error, Result};

/// Reads all records off a card, up to the terminator.
pub fn decode<R: PageReader + ?Sized>(reader: &mut R) -> Result<TagArray> {
    decode_session(&mut Session::new(reader))
}

/// Decodes from the start of a session. Pages the session has already
/// cached aren't read again.
pub fn decode_session<R: PageReader + ?Sized>(session: &mut Session<'_, R>) -> Result<TagArray> {
    let span = trace_span!("decode");
    let _enter = span.enter();

    session.rewind();
    let mut tags = TagArray::new();
    loop {
        let id = session.read_byte()?;
        if id == TERMINATOR {
            break;
        }
        let len = session.read_byte()? as usize;
        let data = session.read_bytes(len)?;
        let tag = Tag::new(TagId::from(id), data);
        if let TagId::Unknown(id) = tag.id {
            warn!(id, len, "Unknown tag, keeping");
        }
        tags.push(tag);
    }
    debug!(tags = tags.len(), bytes = session.cursor(), "Decoded tags");
    Ok(tags)
}

/// Serializes records the way they're laid out on a card: id, length,
/// payload, then a terminator, zero-padded to a whole page.
pub fn encode<'a, I: IntoIterator<Item = &'a Tag>>(tags: I) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for tag in tags {
        let id = u8::from(tag.id);
        if id == TERMINATOR {
            return Err(Error::Encode("tag id 0 is reserved".into()));
        }
        let len = u8::try_from(tag.data.len()).map_err(|_| {
            Error::Encode(format!(
                "{:?} tag is {} bytes long, max is 255",
                tag.id,
                tag.data.len()
            ))
        })?;
        buf.push(id);
        buf.push(len);
        buf.extend_from_slice(&tag.data);
    }
    buf.push(TERMINATOR);
    buf.resize(buf.len().div_ceil(PAGE_SIZE) * PAGE_SIZE, 0);
    Ok(buf)
}

/// Writes records to a card, starting at the base page.
pub fn write<'a, W, I>(writer: &mut W, tags: I) -> Result<()>
where
    W: PageWriter + ?Sized,
    I: IntoIterator<Item = &'a Tag>,
{
    let span = trace_span!("write");
    let _enter = span.enter();

    let data = encode(tags)?;
    let limit = writer.page_limit().unwrap_or(crate::session::DEFAULT_PAGE_LIMIT) as usize;
    let pages = data.len() / PAGE_SIZE;
    if BASE_PAGE as usize + pages > limit {
        return Err(Error::ScanLimit(BASE_PAGE as usize + pages));
    }
    for (i, chunk) in data.chunks_exact(PAGE_SIZE).enumerate() {
        let mut page = [0; PAGE_SIZE];
        page.copy_from_slice(chunk);
        writer.write_page(BASE_PAGE + i as u8, &page)?;
    }
    debug!(pages, "Wrote tags");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntag::Product;
    use crate::reader::Image;

    fn badge() -> TagArray {
        vec![
            Tag::attendee(7, 3),
            Tag::issuance(1),
            Tag::timestamp(1_700_000_000),
            Tag::signature(vec![0x30; 70]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_encode() {
        let tags: TagArray = vec![Tag::issuance(1)].into_iter().collect();
        assert_eq!(
            encode(&tags).unwrap(),
            vec![0x03, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(encode(&TagArray::new()).unwrap(), vec![0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_rejects() {
        let tags = [Tag::new(TagId::from(0x00), [1])];
        assert!(matches!(encode(&tags), Err(Error::Encode(_))));
        let tags = [Tag::signature(vec![0; 256])];
        assert!(matches!(encode(&tags), Err(Error::Encode(_))));
        let tags = [Tag::signature(vec![0; 255])];
        assert_eq!(encode(&tags).unwrap().len(), 260);
    }

    #[test]
    fn test_decode_layout() {
        let mut img = Image::blank(Product::NTAG213).with_bytes_at(
            0x10,
            &[
                0x01, 0x08, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x03, // attendee
                0x03, 0x04, 0x00, 0x00, 0x00, 0x01, // issuance
                0x42, 0x01, 0xAA, // unknown
                0x00,
            ],
        );
        let tags = decode(&mut img).unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags.attendee_and_convention().unwrap(), (7, 3));
        assert_eq!(tags.issuance().unwrap(), 1);
        assert_eq!(tags.get(TagId::Unknown(0x42)).unwrap().data, vec![0xAA]);
    }

    #[test]
    fn test_decode_empty() {
        let mut img = Image::blank(Product::NTAG213);
        assert!(decode(&mut img).unwrap().is_empty());
        assert_eq!(img.reads(), 1);
    }

    #[test]
    fn test_decode_zero_length_tag() {
        let mut img = Image::blank(Product::NTAG213).with_bytes_at(0x10, &[0x02, 0x00, 0x00]);
        let tags = decode(&mut img).unwrap();
        assert_eq!(tags.signature().unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_write_then_decode() {
        let mut img = Image::blank(Product::NTAG215);
        write(&mut img, &badge()).unwrap();
        assert_eq!(decode(&mut img).unwrap(), badge());
        // Nothing below the base page was touched.
        assert!(img.memory()[..0x40].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_write_then_decode_edge_cases() {
        let tags: TagArray = vec![
            Tag::new(TagId::Unknown(0x42), [0xAA, 0xBB]),
            Tag::new(TagId::Issuance, Vec::new()),
            Tag::signature(vec![0x5A; 255]),
            Tag::new(TagId::Unknown(0xFE), Vec::new()),
            Tag::attendee(7, 3),
        ]
        .into_iter()
        .collect();
        let mut img = Image::blank(Product::NTAG215);
        write(&mut img, &tags).unwrap();
        let decoded = decode(&mut img).unwrap();
        assert_eq!(decoded, tags);
        assert_eq!(decoded.signature().unwrap().len(), 255);
    }

    #[test]
    fn test_write_too_big() {
        let mut img = Image::blank(Product::NTAG213);
        let tags: Vec<Tag> = (0..2).map(|_| Tag::signature(vec![0xAB; 200])).collect();
        assert!(matches!(write(&mut img, &tags), Err(Error::ScanLimit(_))));
    }

    #[test]
    fn test_decode_no_terminator() {
        // 0xFF everywhere: every record claims 255 bytes and nothing ends.
        let mut img = Image::new(vec![0xFF; 0x2D * 4]);
        assert!(matches!(decode(&mut img), Err(Error::ScanLimit(_))));
    }

    #[test]
    fn test_decode_no_terminator_bounded_by_limit() {
        let mut img = Image::new(vec![0x09; 0xE7 * 4]);
        let mut session = Session::new(&mut img).with_limit(0x20);
        assert!(matches!(
            decode_session(&mut session),
            Err(Error::ScanLimit(0x20))
        ));
    }

    #[test]
    fn test_decode_card_removed() {
        let mut img = Image::blank(Product::NTAG215);
        write(&mut img, &badge()).unwrap();

        let mut session = Session::new(&mut img);
        session.read_bytes(8).unwrap();
        session.reader().remove();
        // The first four pages are cached; the rest aren't there any more.
        assert!(matches!(decode_session(&mut session), Err(Error::NoCard)));
        assert_eq!(session.cached_pages(), 0);
    }

    #[test]
    fn test_decode_session_reuses_cache() {
        let mut img = Image::blank(Product::NTAG215);
        write(&mut img, &badge()).unwrap();

        let mut session = Session::new(&mut img);
        let first = decode_session(&mut session).unwrap();
        let reads = session.reader().reads();
        assert_eq!(decode_session(&mut session).unwrap(), first);
        assert_eq!(session.reader().reads(), reads);
    }
}
