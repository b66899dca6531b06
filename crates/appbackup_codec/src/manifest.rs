//! Manifest and metadata record bodies.
//!
//! A manifest is a sequence of newline-terminated text lines in fixed order:
//!
//! ```text
//! format version
//! package name
//! version code
//! platform version
//! installer package name (empty if unknown)
//! 1 if the package file follows, else 0
//! signature count
//! one hex-encoded signature per line
//! ```
//!
//! A metadata record starts with the format version and package name lines,
//! followed by tagged binary blobs (`u32 BE tag | u32 BE length | bytes`).

use crate::error::{CodecError, CodecResult};
use sha2::{Digest, Sha256};

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Current metadata record format version.
pub const METADATA_VERSION: u32 = 1;

/// Tag of the side-channel widget state blob in a metadata record.
pub const WIDGET_METADATA_TOKEN: u32 = 0x01FF_ED01;

/// Upper bound on signatures a manifest may declare.
const MAX_SIGNATURES: usize = 64;

/// Per-package manifest written at the head of each archive segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Format version the manifest was written with.
    pub format_version: u32,
    /// Package the segment belongs to.
    pub package_name: String,
    /// Version code of the application that produced the data.
    pub version_code: i64,
    /// Platform version of the producing device.
    pub platform_version: i32,
    /// Package that installed the application, if known.
    pub installer: Option<String>,
    /// Whether the application package file follows the manifest.
    pub has_apk: bool,
    /// Raw signing certificates of the producing application.
    pub signatures: Vec<Vec<u8>>,
}

impl Manifest {
    /// Creates a manifest at the current format version.
    pub fn new(package_name: impl Into<String>, version_code: i64, platform_version: i32) -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            package_name: package_name.into(),
            version_code,
            platform_version,
            installer: None,
            has_apk: false,
            signatures: Vec::new(),
        }
    }

    /// Sets the installer package name.
    #[must_use]
    pub fn with_installer(mut self, installer: impl Into<String>) -> Self {
        self.installer = Some(installer.into());
        self
    }

    /// Sets the signing certificates.
    #[must_use]
    pub fn with_signatures(mut self, signatures: Vec<Vec<u8>>) -> Self {
        self.signatures = signatures;
        self
    }

    /// Marks whether the package file follows.
    #[must_use]
    pub fn with_apk(mut self, has_apk: bool) -> Self {
        self.has_apk = has_apk;
        self
    }

    /// Encodes the manifest body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("{}\n", self.format_version));
        out.push_str(&format!("{}\n", self.package_name));
        out.push_str(&format!("{}\n", self.version_code));
        out.push_str(&format!("{}\n", self.platform_version));
        out.push_str(&format!("{}\n", self.installer.as_deref().unwrap_or("")));
        out.push_str(if self.has_apk { "1\n" } else { "0\n" });
        out.push_str(&format!("{}\n", self.signatures.len()));
        for sig in &self.signatures {
            out.push_str(&hex::encode(sig));
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Decodes a manifest body.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| CodecError::malformed_manifest("body is not UTF-8"))?;
        let mut lines = Lines::new(text, |m| CodecError::malformed_manifest(m));

        let format_version: u32 = lines.parse("format version")?;
        if format_version != MANIFEST_VERSION {
            return Err(CodecError::malformed_manifest(format!(
                "unsupported format version {format_version}"
            )));
        }
        let package_name = lines.next("package name")?.to_string();
        if package_name.is_empty() {
            return Err(CodecError::malformed_manifest("empty package name"));
        }
        let version_code: i64 = lines.parse("version code")?;
        let platform_version: i32 = lines.parse("platform version")?;
        let installer = match lines.next("installer")? {
            "" => None,
            name => Some(name.to_string()),
        };
        let has_apk = match lines.next("apk flag")? {
            "1" => true,
            "0" => false,
            other => {
                return Err(CodecError::malformed_manifest(format!("bad apk flag {other:?}")))
            }
        };
        let count: usize = lines.parse("signature count")?;
        if count > MAX_SIGNATURES {
            return Err(CodecError::malformed_manifest(format!(
                "{count} signatures exceeds limit of {MAX_SIGNATURES}"
            )));
        }
        let mut signatures = Vec::with_capacity(count);
        for _ in 0..count {
            let line = lines.next("signature")?;
            let sig = hex::decode(line)
                .map_err(|e| CodecError::malformed_manifest(format!("bad signature: {e}")))?;
            signatures.push(sig);
        }

        Ok(Self {
            format_version,
            package_name,
            version_code,
            platform_version,
            installer,
            has_apk,
            signatures,
        })
    }

    /// SHA-256 hashes of the signatures, in declaration order.
    #[must_use]
    pub fn signature_hashes(&self) -> Vec<[u8; 32]> {
        self.signatures.iter().map(|s| hash_signature(s)).collect()
    }
}

/// Hashes one signing certificate.
#[must_use]
pub fn hash_signature(signature: &[u8]) -> [u8; 32] {
    Sha256::digest(signature).into()
}

/// Metadata record carrying opaque side-channel blobs for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Owning package.
    pub package_name: String,
    /// Tagged blobs in stream order. Unknown tags are kept.
    pub blobs: Vec<(u32, Vec<u8>)>,
}

impl MetadataRecord {
    /// Creates a metadata record carrying widget state.
    pub fn with_widget_state(package_name: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            package_name: package_name.into(),
            blobs: vec![(WIDGET_METADATA_TOKEN, blob)],
        }
    }

    /// Returns the widget state blob, if present.
    #[must_use]
    pub fn widget_state(&self) -> Option<&[u8]> {
        self.blobs
            .iter()
            .find(|(tag, _)| *tag == WIDGET_METADATA_TOKEN)
            .map(|(_, blob)| blob.as_slice())
    }

    /// Encodes the record body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{}\n{}\n", METADATA_VERSION, self.package_name).into_bytes();
        for (tag, blob) in &self.blobs {
            out.extend_from_slice(&tag.to_be_bytes());
            out.extend_from_slice(&(blob.len() as u32).to_be_bytes());
            out.extend_from_slice(blob);
        }
        out
    }

    /// Decodes a record body.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (version, rest) = split_line(data)
            .ok_or_else(|| CodecError::malformed_metadata("missing version line"))?;
        let version: u32 = version
            .parse()
            .map_err(|_| CodecError::malformed_metadata(format!("bad version {version:?}")))?;
        if version != METADATA_VERSION {
            return Err(CodecError::malformed_metadata(format!(
                "unsupported format version {version}"
            )));
        }
        let (package_name, mut rest) = split_line(rest)
            .ok_or_else(|| CodecError::malformed_metadata("missing package line"))?;

        let mut blobs = Vec::new();
        while !rest.is_empty() {
            if rest.len() < 8 {
                return Err(CodecError::malformed_metadata("truncated blob header"));
            }
            let tag = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
            rest = &rest[8..];
            if rest.len() < len {
                return Err(CodecError::malformed_metadata(format!(
                    "blob {tag:#010x} declares {len} bytes, {} remain",
                    rest.len()
                )));
            }
            if tag != WIDGET_METADATA_TOKEN {
                tracing::debug!(tag, len, "keeping unknown metadata blob");
            }
            blobs.push((tag, rest[..len].to_vec()));
            rest = &rest[len..];
        }

        Ok(Self {
            package_name: package_name.to_string(),
            blobs,
        })
    }
}

fn split_line(data: &[u8]) -> Option<(&str, &[u8])> {
    let nl = data.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&data[..nl]).ok()?;
    Some((line, &data[nl + 1..]))
}

/// Line cursor that reports which field was missing.
struct Lines<'a> {
    inner: std::str::Split<'a, char>,
    error: fn(String) -> CodecError,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str, error: fn(String) -> CodecError) -> Self {
        Self {
            inner: text.split('\n'),
            error,
        }
    }

    fn next(&mut self, field: &str) -> CodecResult<&'a str> {
        self.inner
            .next()
            .ok_or_else(|| (self.error)(format!("missing {field}")))
    }

    fn parse<T: std::str::FromStr>(&mut self, field: &str) -> CodecResult<T> {
        let line = self.next(field)?;
        line.trim()
            .parse()
            .map_err(|_| (self.error)(format!("bad {field}: {line:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest::new("com.example.notes", 42, 33)
            .with_installer("com.android.vending")
            .with_apk(true)
            .with_signatures(vec![vec![0xde, 0xad, 0xbe, 0xef], vec![1, 2, 3]])
    }

    #[test]
    fn manifest_text_layout() {
        let text = String::from_utf8(sample().encode()).unwrap();
        assert_eq!(
            text,
            "1\ncom.example.notes\n42\n33\ncom.android.vending\n1\n2\ndeadbeef\n010203\n"
        );
        assert_eq!(Manifest::decode(text.as_bytes()).unwrap(), sample());
    }

    #[test]
    fn manifest_without_installer_or_signatures() {
        let manifest = Manifest::new("a.b", -1, 30);
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded.installer, None);
        assert!(decoded.signatures.is_empty());
        assert!(!decoded.has_apk);
    }

    #[test]
    fn manifest_rejects_truncation() {
        let full = sample().encode();
        // Cut inside the signature list.
        let cut = &full[..full.len() - 8];
        assert!(Manifest::decode(cut).is_err());
        assert!(Manifest::decode(b"2\na.b\n1\n1\n\n0\n0\n").is_err());
        assert!(Manifest::decode(b"1\na.b\nseven\n1\n\n0\n0\n").is_err());
        assert!(Manifest::decode(b"1\na.b\n7\n1\n\nyes\n0\n").is_err());
    }

    #[test]
    fn signature_hashes_are_stable() {
        let m = sample();
        let hashes = m.signature_hashes();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hash_signature(&[0xde, 0xad, 0xbe, 0xef]));
        assert_ne!(hashes[0], hashes[1]);
    }

    #[test]
    fn metadata_keeps_unknown_tags() {
        let record = MetadataRecord {
            package_name: "com.example".into(),
            blobs: vec![(0x7777_0001, vec![9, 9]), (WIDGET_METADATA_TOKEN, b"widgets".to_vec())],
        };
        let decoded = MetadataRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.widget_state(), Some(&b"widgets"[..]));
    }

    #[test]
    fn metadata_truncated_blob() {
        let mut body = MetadataRecord::with_widget_state("p", vec![1, 2, 3, 4]).encode();
        body.truncate(body.len() - 2);
        assert!(MetadataRecord::decode(&body).is_err());
    }
}
