//! Canonical documents and content fingerprints.
//!
//! The document loader (PDF/spreadsheet/image normalization) lives outside
//! this crate; the pipeline only requires canonical text plus a stable
//! fingerprint over the normalized bytes. Two loads of the same content
//! always produce the same fingerprint, which is what makes the result
//! cache and request deduplication work.

use std::fmt;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable 32-byte content hash, displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hash arbitrary bytes into a fingerprint.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Combine multiple byte segments with length framing, so that
    /// ("ab", "c") and ("a", "bc") hash differently.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell fingerprints apart in logs.
        write!(f, "Fingerprint({}…)", &self.to_hex()[..12])
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// A canonicalized input document. Immutable once constructed; the content
/// is whatever normalized representation the loader produced (text with
/// layout markers, CSV-ified spreadsheet, OCR output).
#[derive(Debug, Clone)]
pub struct Document {
    id: Uuid,
    content: String,
    fingerprint: Fingerprint,
}

impl Document {
    /// Build a document from canonical text. The fingerprint covers the
    /// normalized bytes, so identical content yields identical identity.
    pub fn from_text(content: impl Into<String>) -> Self {
        let content = content.into();
        let fingerprint = Fingerprint::of_bytes(content.as_bytes());
        Self {
            id: Uuid::new_v4(),
            content,
            fingerprint,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}
