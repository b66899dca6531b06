//! Key-value data blob format.
//!
//! A key-value backup produces a flat sequence of entities:
//!
//! ```text
//! | key_len: u32 BE | key: UTF-8 | value_len: i32 BE (-1 = delete) | value |
//! ```

use crate::error::{CodecError, CodecResult};
use std::io::{self, Read, Write};

/// Key under which side-channel widget state rides along with agent data.
pub const WIDGET_KEY: &str = "\u{ffed}\u{ffed}widget";

/// Longest key accepted by the reader.
const MAX_KEY_LEN: u32 = 64 * 1024;

/// One key-value entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Record key.
    pub key: String,
    /// Record value, or `None` for a deletion.
    pub value: Option<Vec<u8>>,
}

impl Entity {
    /// Creates an entity carrying a value.
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Creates a deletion entity.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// Returns true if an agent is not allowed to emit this key.
///
/// Keys starting with a character in `U+FF00..=U+FFFF` are reserved for
/// the service's own piggyback records.
#[must_use]
pub fn is_protected_key(key: &str) -> bool {
    key.chars()
        .next()
        .map_or(false, |c| ('\u{ff00}'..='\u{ffff}').contains(&c))
}

/// Writes entities to a sink.
pub struct KeyValueWriter<W: Write> {
    inner: W,
}

impl<W: Write> KeyValueWriter<W> {
    /// Wraps a sink.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one entity.
    pub fn write_entity(&mut self, entity: &Entity) -> io::Result<()> {
        let key = entity.key.as_bytes();
        let key_len = u32::try_from(key.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "key too long"))?;
        self.inner.write_all(&key_len.to_be_bytes())?;
        self.inner.write_all(key)?;
        match &entity.value {
            Some(value) => {
                let len = i32::try_from(value.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "value too long"))?;
                self.inner.write_all(&len.to_be_bytes())?;
                self.inner.write_all(value)?;
            }
            None => self.inner.write_all(&(-1i32).to_be_bytes())?,
        }
        Ok(())
    }

    /// Flushes and returns the sink.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads entities from a source.
pub struct KeyValueReader<R: Read> {
    inner: R,
}

impl<R: Read> KeyValueReader<R> {
    /// Wraps a source.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next entity, or `None` at a clean end of input.
    pub fn next_entity(&mut self) -> CodecResult<Option<Entity>> {
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.inner, &mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(CodecError::malformed_kv("truncated key length")),
        }
        let key_len = u32::from_be_bytes(len_buf);
        if key_len > MAX_KEY_LEN {
            return Err(CodecError::malformed_kv(format!("key length {key_len} too large")));
        }
        let mut key = vec![0u8; key_len as usize];
        if read_full(&mut self.inner, &mut key)? != key.len() {
            return Err(CodecError::malformed_kv("truncated key"));
        }
        let key = String::from_utf8(key).map_err(|_| CodecError::malformed_kv("key is not UTF-8"))?;

        if read_full(&mut self.inner, &mut len_buf)? != 4 {
            return Err(CodecError::malformed_kv("truncated value length"));
        }
        let value_len = i32::from_be_bytes(len_buf);
        let value = match value_len {
            -1 => None,
            n if n < 0 => {
                return Err(CodecError::malformed_kv(format!("negative value length {n}")))
            }
            n => {
                let mut value = Vec::new();
                let read = (&mut self.inner).take(n as u64).read_to_end(&mut value)?;
                if read != n as usize {
                    return Err(CodecError::malformed_kv("truncated value"));
                }
                Some(value)
            }
        };
        Ok(Some(Entity { key, value }))
    }

    /// Reads every remaining entity.
    pub fn read_all(&mut self) -> CodecResult<Vec<Entity>> {
        let mut out = Vec::new();
        while let Some(entity) = self.next_entity()? {
            out.push(entity);
        }
        Ok(out)
    }
}

/// Encodes entities into a blob.
pub fn encode_entities(entities: &[Entity]) -> Vec<u8> {
    let mut writer = KeyValueWriter::new(Vec::new());
    for entity in entities {
        // Writing to a Vec only fails on oversize keys, which cannot be read back anyway.
        if let Err(e) = writer.write_entity(entity) {
            tracing::warn!(key = %entity.key, error = %e, "dropping unencodable entity");
        }
    }
    writer.inner
}

/// Decodes a blob into entities.
pub fn decode_entities(blob: &[u8]) -> CodecResult<Vec<Entity>> {
    KeyValueReader::new(blob).read_all()
}

/// Returns the first protected key in a blob, if any.
pub fn find_protected_key(blob: &[u8]) -> CodecResult<Option<String>> {
    let mut reader = KeyValueReader::new(blob);
    while let Some(entity) = reader.next_entity()? {
        if is_protected_key(&entity.key) {
            return Ok(Some(entity.key));
        }
    }
    Ok(None)
}

/// Separates the widget piggyback entity from agent data.
///
/// Returns the widget blob (if any) and the agent entities re-encoded
/// without it.
pub fn split_side_channel(blob: &[u8]) -> CodecResult<(Option<Vec<u8>>, Vec<u8>)> {
    let mut widget = None;
    let mut rest = Vec::new();
    for entity in decode_entities(blob)? {
        if entity.key == WIDGET_KEY {
            widget = entity.value;
        } else {
            rest.push(entity);
        }
    }
    Ok((widget, encode_entities(&rest)))
}

/// Reads until `buf` is full or the source ends. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
