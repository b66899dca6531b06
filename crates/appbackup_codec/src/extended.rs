//! Extended header records.
//!
//! An extended header block carries `"<len> <key>=<value>\n"` records where
//! `len` is the decimal byte length of the whole record, itself included.
//! The records override fields of the header that follows.

use crate::error::{CodecError, CodecResult};

/// Key overriding the path of the next header.
pub const KEY_PATH: &str = "path";
/// Key overriding the size of the next header.
pub const KEY_SIZE: &str = "size";
/// Key overriding the modification time of the next header.
pub const KEY_MTIME: &str = "mtime";

/// Encodes one extended record.
#[must_use]
pub fn encode_record(key: &str, value: &str) -> Vec<u8> {
    // " key=value\n" plus the digits of the total length.
    let body = key.len() + value.len() + 3;
    let mut len = body + 1;
    loop {
        let total = body + len.to_string().len();
        if total == len {
            break;
        }
        len = total;
    }
    format!("{len} {key}={value}\n").into_bytes()
}

/// Encodes a list of records into one extended block body.
#[must_use]
pub fn encode_records(records: &[(&str, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in records {
        out.extend_from_slice(&encode_record(key, value));
    }
    out
}

/// Parses an extended block body into key/value pairs, in order.
///
/// Trailing NUL bytes are ignored.
pub fn parse_records(data: &[u8]) -> CodecResult<Vec<(String, String)>> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        if data[pos] == 0 {
            if data[pos..].iter().all(|&b| b == 0) {
                break;
            }
            return Err(CodecError::malformed_extended("NUL byte between records"));
        }

        let space = data[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| CodecError::malformed_extended("record length not terminated"))?;
        let len_text = std::str::from_utf8(&data[pos..pos + space])
            .map_err(|_| CodecError::malformed_extended("record length is not ASCII"))?;
        let len: usize = len_text
            .parse()
            .map_err(|_| CodecError::malformed_extended(format!("bad record length {len_text:?}")))?;

        let end = pos
            .checked_add(len)
            .filter(|&end| len > space + 1 && end <= data.len())
            .ok_or_else(|| {
                CodecError::malformed_extended(format!("record length {len} out of bounds at offset {pos}"))
            })?;

        let record = &data[pos + space + 1..end];
        let Some((&b'\n', body)) = record.split_last() else {
            return Err(CodecError::malformed_extended("record not newline-terminated"));
        };
        let body = std::str::from_utf8(body)
            .map_err(|_| CodecError::malformed_extended("record is not UTF-8"))?;
        let (key, value) = body
            .split_once('=')
            .ok_or_else(|| CodecError::malformed_extended("record has no '='"))?;
        records.push((key.to_string(), value.to_string()));

        pos = end;
    }

    Ok(records)
}

/// Header field overrides collected from one extended block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Replacement path.
    pub path: Option<String>,
    /// Replacement size.
    pub size: Option<u64>,
    /// Replacement modification time.
    pub mtime: Option<u64>,
}

impl Overrides {
    /// Builds overrides from parsed records. Unknown keys are ignored.
    pub fn from_records(records: Vec<(String, String)>) -> CodecResult<Self> {
        let mut overrides = Self::default();
        for (key, value) in records {
            match key.as_str() {
                KEY_PATH => overrides.path = Some(value),
                KEY_SIZE => {
                    overrides.size = Some(value.parse().map_err(|_| {
                        CodecError::malformed_extended(format!("bad size {value:?}"))
                    })?);
                }
                KEY_MTIME => {
                    // Fractional seconds are allowed by the format; keep the integer part.
                    let whole = value.split('.').next().unwrap_or_default();
                    overrides.mtime = Some(whole.parse().map_err(|_| {
                        CodecError::malformed_extended(format!("bad mtime {value:?}"))
                    })?);
                }
                _ => tracing::debug!(key = %key, "ignoring unknown extended header key"),
            }
        }
        Ok(overrides)
    }

    /// Returns true if no field is overridden.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.size.is_none() && self.mtime.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_length_counts_itself() {
        let record = encode_record("path", "a");
        assert_eq!(record, b"9 path=a\n");
        assert_eq!(record.len(), 9);

        // Length crossing a digit boundary.
        let value = "x".repeat(93);
        let record = encode_record("path", &value);
        let text = String::from_utf8(record.clone()).unwrap();
        let len: usize = text.split(' ').next().unwrap().parse().unwrap();
        assert_eq!(len, record.len());
    }

    #[test]
    fn parse_multiple_records() {
        let mut body = encode_records(&[(KEY_PATH, "apps/pkg/f/long".into()), (KEY_SIZE, "42".into())]);
        body.extend_from_slice(&[0u8; 20]);
        let overrides = Overrides::from_records(parse_records(&body).unwrap()).unwrap();
        assert_eq!(overrides.path.as_deref(), Some("apps/pkg/f/long"));
        assert_eq!(overrides.size, Some(42));
    }

    #[test]
    fn rejects_bad_length() {
        assert!(parse_records(b"99 path=a\n").is_err());
        assert!(parse_records(b"3 path=a\n").is_err());
        assert!(parse_records(b"x path=a\n").is_err());
        assert!(parse_records(b"8 patha\n\n").is_err());
    }

    #[test]
    fn huge_record_length_is_malformed() {
        let err = parse_records(b"5 a=\n18446744073709551615 path=x\n").unwrap_err();
        assert!(err.is_malformed());
        assert!(parse_records(b"18446744073709551615 path=x\n").unwrap_err().is_malformed());
    }

    #[test]
    fn utf8_values() {
        let body = encode_record(KEY_PATH, "apps/pkg/f/caf\u{e9}");
        let records = parse_records(&body).unwrap();
        assert_eq!(records[0].1, "apps/pkg/f/caf\u{e9}");
    }

    #[test]
    fn fractional_mtime() {
        let records = vec![(KEY_MTIME.to_string(), "1700000000.25".to_string())];
        assert_eq!(Overrides::from_records(records).unwrap().mtime, Some(1_700_000_000));
    }

    proptest! {
        #[test]
        fn record_length_is_exact(key in "[a-z]{1,12}", value in "\\PC{0,300}") {
            let record = encode_record(&key, &value);
            let parsed = parse_records(&record).unwrap();
            prop_assert_eq!(parsed, vec![(key, value)]);
        }

        #[test]
        fn arbitrary_bodies_never_panic(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = parse_records(&body);
        }
    }
}
