//! signify-style signed file lists.
//!
//! ```text
//! untrusted comment: <anything>
//! <base64 of "Ed" || key id (8 bytes) || ed25519 signature (64 bytes)>
//! <hex blake2b-256>  <file name>
//! ...
//! ```
//!
//! The signature covers everything after the second newline.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::signature::{ED25519, UnparsedPublicKey};
use std::collections::BTreeMap;

pub type FileList = BTreeMap<String, [u8; 32]>;

const ALGORITHM: &[u8; 2] = b"Ed";
const KEY_ID_LENGTH: usize = 8;
const HEADER_LENGTH: usize = ALGORITHM.len() + KEY_ID_LENGTH;
const PUBLIC_KEY_LENGTH: usize = 32;
const SIGNATURE_LENGTH: usize = 64;
const UNTRUSTED_COMMENT: &str = "untrusted comment: ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Signature input has too few lines")]
    TooFewLines,
    #[error("Signature input is missing untrusted comment")]
    MissingComment,
    #[error("Signature input is not valid base64")]
    InvalidBase64,
    #[error("Signature input bytes are incorrect length, type, or keyID")]
    SignatureMismatch,
    #[error("Signature is invalid")]
    InvalidSignature,
    #[error("File hash line has too few components")]
    MalformedLine,
    #[error("File hash is invalid hex or incorrect number of bytes")]
    InvalidHash,
    #[error("No file hashes found in signed input")]
    Empty,
}

fn decode_public_key(public_key_base64: &str) -> Result<Vec<u8>, ManifestError> {
    let key = STANDARD
        .decode(public_key_base64)
        .map_err(|_| ManifestError::InvalidPublicKey)?;
    if key.len() != HEADER_LENGTH + PUBLIC_KEY_LENGTH || !key.starts_with(ALGORITHM) {
        return Err(ManifestError::InvalidPublicKey);
    }
    Ok(key)
}

/// Verifies `input` against the public key and returns its entries keyed by
/// file name. Nothing in the body is looked at before the signature checks
/// out.
pub fn read_file_list(input: &[u8], public_key_base64: &str) -> Result<FileList, ManifestError> {
    let public_key = decode_public_key(public_key_base64)?;

    let mut lines = input.splitn(3, |b| *b == b'\n');
    let (Some(comment), Some(signature_line), Some(body)) = (lines.next(), lines.next(), lines.next())
    else {
        return Err(ManifestError::TooFewLines);
    };

    if !comment.starts_with(UNTRUSTED_COMMENT.as_bytes()) {
        return Err(ManifestError::MissingComment);
    }

    let signature = STANDARD
        .decode(signature_line)
        .map_err(|_| ManifestError::InvalidBase64)?;
    if signature.len() != HEADER_LENGTH + SIGNATURE_LENGTH
        || signature[..HEADER_LENGTH] != public_key[..HEADER_LENGTH]
    {
        return Err(ManifestError::SignatureMismatch);
    }

    UnparsedPublicKey::new(&ED25519, &public_key[HEADER_LENGTH..])
        .verify(body, &signature[HEADER_LENGTH..])
        .map_err(|_| ManifestError::InvalidSignature)?;

    let body = std::str::from_utf8(body).map_err(|_| ManifestError::MalformedLine)?;
    let lines: Vec<&str> = body.split('\n').collect();
    let mut files = FileList::new();
    for (index, line) in lines.iter().enumerate() {
        if line.is_empty() && index == lines.len() - 1 {
            break;
        }
        let (hash, name) = line.split_once("  ").ok_or(ManifestError::MalformedLine)?;
        let hash: [u8; 32] = hex::decode(hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(ManifestError::InvalidHash)?;
        files.insert(name.to_string(), hash);
    }

    if files.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(files)
}
