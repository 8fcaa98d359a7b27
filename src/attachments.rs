//! # Attachment Preprocessing
//!
//! Attachments arrive inline in `_attachments`, either as base64 text (from
//! JSON) or as raw bytes (from [`put_attachment`](crate::SofaDB::put_attachment)).
//! Before a document is written every non-stub attachment is:
//!
//! 1. decoded to bytes,
//! 2. digested as `md5-<base64(md5(bytes))>`,
//! 3. measured,
//! 4. re-encoded into the storage encoding.
//!
//! A malformed payload fails with [`Error::BadArg`] and the owning write is
//! aborted before anything is stored.
//!
//! ## Streaming Digest
//!
//! The digest is fed in [`DIGEST_CHUNK_SIZE`] pieces so that hashing a large
//! payload never needs a second full-size buffer. Chunking never changes the
//! result: MD5 is a streaming hash.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bytes fed to the hasher per step.
pub const DIGEST_CHUNK_SIZE: usize = 32 * 1024;

// =============================================================================
// Attachment Types
// =============================================================================

/// Encoding attachments are converted to before storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentEncoding {
    /// Keep the payload as base64 text.
    Base64,
    /// Keep the payload as raw bytes.
    Binary,
}

/// Attachment payload in one of the two supported encodings.
///
/// Both variants serialize as a base64 string; deserializing always yields
/// [`AttachmentData::Base64`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentData {
    /// Base64 text, as found in JSON documents.
    Base64(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl AttachmentData {
    /// Decodes the payload into bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            AttachmentData::Base64(text) => STANDARD
                .decode(text.as_bytes())
                .map_err(|_| Error::BadArg("attachment is not a valid base64 string".to_string())),
            AttachmentData::Binary(bytes) => Ok(bytes.clone()),
        }
    }

    /// Re-encodes `bytes` into `encoding`.
    pub fn encode(bytes: Vec<u8>, encoding: AttachmentEncoding) -> Self {
        match encoding {
            AttachmentEncoding::Base64 => AttachmentData::Base64(STANDARD.encode(bytes)),
            AttachmentEncoding::Binary => AttachmentData::Binary(bytes),
        }
    }
}

impl Serialize for AttachmentData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AttachmentData::Base64(text) => serializer.serialize_str(text),
            AttachmentData::Binary(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
        }
    }
}

impl<'de> Deserialize<'de> for AttachmentData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct Base64Visitor;

        impl<'de> Visitor<'de> for Base64Visitor {
            type Value = AttachmentData;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64 string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Ok(AttachmentData::Base64(v.to_string()))
            }
        }

        deserializer.deserialize_str(Base64Visitor)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One entry of a document's `_attachments` map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Inline payload; absent for stubs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<AttachmentData>,
    /// `md5-<base64>` content digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Payload length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Generation of the revision that introduced this content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,
    /// True if the entry refers to content already stored.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stub: bool,
}

impl Attachment {
    /// An inline attachment from raw bytes.
    pub fn from_bytes(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            data: Some(AttachmentData::Binary(bytes)),
            ..Self::default()
        }
    }

    /// The stub that replaces this attachment once its bytes are stored.
    pub fn to_stub(&self, revpos: u64) -> Self {
        Self {
            content_type: self.content_type.clone(),
            data: None,
            digest: self.digest.clone(),
            length: self.length,
            revpos: Some(self.revpos.unwrap_or(revpos)),
            stub: true,
        }
    }
}

/// A document's attachments, by name.
pub type AttachmentMap = BTreeMap<String, Attachment>;

// =============================================================================
// Digest
// =============================================================================

/// Computes `md5-<base64>` over a sequence of chunks.
pub fn digest_chunks<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Md5::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    format!("md5-{}", STANDARD.encode(hasher.finalize()))
}

/// Computes the digest of `bytes`, streaming [`DIGEST_CHUNK_SIZE`] at a time.
pub fn md5_digest(bytes: &[u8]) -> String {
    digest_chunks(bytes.chunks(DIGEST_CHUNK_SIZE))
}

// =============================================================================
// Preprocessing
// =============================================================================

/// Decodes, digests, measures and re-encodes every non-stub attachment.
///
/// Stubs are left as they are. Fails on the first malformed payload.
pub fn preprocess(attachments: &mut AttachmentMap, target: AttachmentEncoding) -> Result<()> {
    for (name, att) in attachments.iter_mut() {
        if att.stub {
            continue;
        }
        let data = att
            .data
            .take()
            .ok_or_else(|| Error::BadArg(format!("attachment '{name}' has no data")))?;
        let bytes = data.to_bytes()?;
        att.digest = Some(md5_digest(&bytes));
        att.length = Some(bytes.len() as u64);
        att.data = Some(AttachmentData::encode(bytes, target));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert_eq!(md5_digest(b"hello"), "md5-XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn test_digest_independent_of_chunking() {
        let payload: Vec<u8> = (0..(DIGEST_CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let whole = digest_chunks(std::iter::once(payload.as_slice()));
        let quarter = payload.len() / 4 + 1;
        let four = digest_chunks(payload.chunks(quarter));
        assert_eq!(payload.chunks(quarter).count(), 4);
        assert_eq!(whole, four);
        assert_eq!(whole, md5_digest(&payload));
    }

    #[test]
    fn test_preprocess_base64_to_binary() {
        let mut atts = AttachmentMap::new();
        atts.insert(
            "a.txt".to_string(),
            Attachment {
                content_type: Some("text/plain".to_string()),
                data: Some(AttachmentData::Base64(STANDARD.encode(b"hello"))),
                ..Attachment::default()
            },
        );
        preprocess(&mut atts, AttachmentEncoding::Binary).unwrap();
        let att = &atts["a.txt"];
        assert_eq!(att.length, Some(5));
        assert_eq!(att.digest.as_deref(), Some("md5-XUFAKrxLKna5cZ2REBfFkg=="));
        assert_eq!(att.data, Some(AttachmentData::Binary(b"hello".to_vec())));
    }

    #[test]
    fn test_preprocess_binary_to_base64() {
        let mut atts = AttachmentMap::new();
        atts.insert("b".to_string(), Attachment::from_bytes("application/octet-stream", vec![1, 2, 3]));
        preprocess(&mut atts, AttachmentEncoding::Base64).unwrap();
        assert_eq!(atts["b"].data, Some(AttachmentData::Base64("AQID".to_string())));
    }

    #[test]
    fn test_preprocess_rejects_bad_base64() {
        let mut atts = AttachmentMap::new();
        atts.insert(
            "bad".to_string(),
            Attachment {
                data: Some(AttachmentData::Base64("not base64!!".to_string())),
                ..Attachment::default()
            },
        );
        let err = preprocess(&mut atts, AttachmentEncoding::Binary).unwrap_err();
        assert!(matches!(err, Error::BadArg(_)));
    }

    #[test]
    fn test_stubs_untouched() {
        let stub = Attachment {
            digest: Some("md5-x".to_string()),
            stub: true,
            revpos: Some(1),
            ..Attachment::default()
        };
        let mut atts = AttachmentMap::new();
        atts.insert("s".to_string(), stub.clone());
        preprocess(&mut atts, AttachmentEncoding::Binary).unwrap();
        assert_eq!(atts["s"], stub);
    }

    #[test]
    fn test_binary_serializes_as_base64() {
        let att = Attachment::from_bytes("text/plain", b"hi".to_vec());
        let json = serde_json::to_value(&att).unwrap();
        assert_eq!(json["data"], "aGk=");
        let back: Attachment = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, Some(AttachmentData::Base64("aGk=".to_string())));
    }
}
