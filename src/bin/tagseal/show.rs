use std::ffi::CStr;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use owo_colors::{colors, OwoColorize};
use pad::{Alignment, PadStr};
use tagseal::pcsc::Reader;
use tagseal::reader::{Image, PageReader, Protected, PAGE_SIZE};
use tagseal::tags::{TagArray, TagId};
use tagseal::validator::Validation;
use tagseal::{Error, Kind};
use tap::TapOptional;

type TagColorId = colors::Cyan;
type TagColorLen = colors::Yellow;
type InfoColorLabel = colors::BrightBlack;

const ID_WIDTH: usize = 22;
const LEN_WIDTH: usize = 4;

pub fn dim(s: &str) -> String {
    s.fg::<InfoColorLabel>().to_string()
}

fn tag_name(id: TagId) -> String {
    match id {
        TagId::Unknown(v) => format!("Unknown({:02X})", v),
        id => format!("{:?}", id),
    }
}

/// One line per record, in card order.
pub fn tags(tags: &TagArray) {
    println!(
        "┏╸{}╺ {} record(s)",
        "Records".italic(),
        tags.len().fg::<TagColorLen>()
    );
    for (i, tag) in tags.iter().enumerate() {
        let corner = if i + 1 == tags.len() { "┗" } else { "┠" };
        println!(
            "{}╴{} {} {}",
            corner,
            tag_name(tag.id)
                .pad_to_width(ID_WIDTH)
                .fg::<TagColorId>(),
            tag.data
                .len()
                .to_string()
                .pad_to_width_with_alignment(LEN_WIDTH, Alignment::Right)
                .fg::<TagColorLen>(),
            tag
        );
    }
}

pub fn validation(v: &Validation, now: DateTime<Utc>) {
    if v.is_authentic() {
        println!("{} {}", "✔".green(), "Authentic".green().bold());
    } else {
        println!("{} {}", "✘".red(), "FORGED: signature doesn't match".red().bold());
    }
    println!(
        "  {} {}  {} {}",
        dim("user"),
        v.record.user_id,
        dim("convention"),
        v.record.convention_id
    );
    match v.expires_at() {
        Some(at) if v.is_expired(now) => {
            println!("  {} {}", "expired".yellow().bold(), at.to_rfc3339().yellow())
        }
        Some(at) => println!("  {} {}", dim("expires"), at.to_rfc3339()),
        None => println!("  {} {}", dim("expires"), "never"),
    }
}

pub fn error(err: &Error) {
    let label = match err.kind() {
        Kind::Transport => "Couldn't read card",
        Kind::Format => "Not a valid badge",
        Kind::Unregistered => "Card is not registered",
        Kind::Configuration => "Bad issuer key",
        Kind::Service => "Key service unavailable",
    };
    println!("{} {}: {}", "✘".red(), label.red().bold(), err);
}

pub fn card_info(name: &CStr, rdr: &Reader, uid: Option<&[u8]>) {
    println!("┏╸{}╺ {}", "Reader".italic(), name.to_string_lossy());
    println!("┠╴{} {}", dim("ATR"), hex::encode_upper(rdr.atr()));
    uid.tap_some(|uid| println!("┠╴{} {}", dim("UID"), hex::encode_upper(uid)));
    match rdr.info() {
        Some(info) => {
            info.manufacturer
                .as_deref()
                .tap_some(|v| println!("┠╴{} {}", dim("Manufacturer"), v));
            info.product_name
                .as_deref()
                .tap_some(|v| println!("┠╴{} {}", dim("Product"), v));
            info.memory_bytes
                .tap_some(|v| println!("┠╴{} {} bytes", dim("Memory"), v));
            println!(
                "┗╴{} {}",
                dim("Password"),
                if info.supports_password() { "supported" } else { "no" }
            );
        }
        None => println!("┗╴{}", "Unsupported card".red()),
    }
}

pub fn image_info(path: &Path, img: &mut Image) -> Result<()> {
    println!("┏╸{}╺ {}", "Image".italic(), path.display());
    println!("┠╴{} {}", dim("UID"), hex::encode_upper(img.uid()?));
    println!(
        "┗╴{} {} bytes, {} pages",
        dim("Memory"),
        img.memory().len(),
        img.page_limit().map_or(img.memory().len() / PAGE_SIZE, usize::from)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_name() {
        assert_eq!(tag_name(TagId::Signature), "Signature");
        assert_eq!(tag_name(TagId::Unknown(0x42)), "Unknown(42)");
    }
}
