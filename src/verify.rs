//! ECDSA P-256 signature checks against a JWK public key.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::{Error, Result};

/// Size of a P-256 field element.
const COORDINATE_SIZE: usize = 32;

/// Base64url, with or without padding. JWKs aren't supposed to be padded,
/// but some encoders do it anyway.
const B64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// An EC public key as a JSON Web Key (RFC 7517). Only the fields we need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        match self.crv.as_str() {
            "P-256" | "secp256r1" => {}
            crv => return Err(Error::UnsupportedCurve(crv.into())),
        }
        if self.kty != "EC" {
            return Err(Error::UnsupportedKeyType(self.kty.clone()));
        }
        let x = decode_coordinate("x", &self.x)?;
        let y = decode_coordinate("y", &self.y)?;
        let point =
            EncodedPoint::from_affine_coordinates(&FieldBytes::from(x), &FieldBytes::from(y), false);
        VerifyingKey::from_encoded_point(&point)
            .map_err(|_| Error::InvalidKey("point is not on the curve".into()))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let coord = |c: Option<&FieldBytes>| c.map(|c| B64URL.encode(c)).unwrap_or_default();
        Self {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: coord(point.x()),
            y: coord(point.y()),
        }
    }
}

/// Decodes a base64url big-endian integer into a fixed-width coordinate.
/// Encoders disagree on whether to keep leading zeroes, so they're stripped
/// and the value is padded back out to full width.
fn decode_coordinate(name: &str, value: &str) -> Result<[u8; COORDINATE_SIZE]> {
    let raw = B64URL
        .decode(value)
        .map_err(|err| Error::InvalidKey(format!("{}: {}", name, err)))?;
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    let digits = &raw[start..];
    if digits.len() > COORDINATE_SIZE {
        return Err(Error::InvalidKey(format!(
            "{}: {} bytes long, max is {}",
            name,
            digits.len(),
            COORDINATE_SIZE
        )));
    }
    let mut out = [0; COORDINATE_SIZE];
    out[COORDINATE_SIZE - digits.len()..].copy_from_slice(digits);
    Ok(out)
}

/// Checks a DER-encoded ECDSA signature over SHA-256(payload).
///
/// A signature that parses but doesn't match is `Ok(false)`, not an error.
pub fn verify(payload: &[u8], signature: &[u8], key: &VerifyingKey) -> Result<bool> {
    let sig = Signature::from_der(signature)
        .map_err(|err| Error::MalformedSignature(err.to_string()))?;
    let digest = Sha256::digest(payload);
    trace!(digest = hex::encode(digest), "SHA-256(payload)");
    let ok = key.verify_prehash(&digest, &sig).is_ok();
    debug!(ok, "Verified signature");
    Ok(ok)
}
