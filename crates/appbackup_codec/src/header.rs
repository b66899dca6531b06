//! Fixed 512-byte header block layout.
//!
//! The layout is the POSIX ustar header. Numeric fields are ASCII octal,
//! left-justified and NUL-terminated; string fields are NUL-padded.
//!
//! ```text
//! | name (100) | mode (8) | uid (8) | gid (8) | size (12) | mtime (12) | chksum (8) | type (1) |
//! | linkname (100) | magic (6) | version (2) | uname (32) | gname (32) | devmajor (8) |
//! | devminor (8) | prefix (155) | pad (12) |
//! ```

use crate::error::{CodecError, CodecResult};

/// Size of a header block and of the content padding unit.
pub const BLOCK_SIZE: usize = 512;

/// Type flag of a regular file.
pub const TYPE_FILE: u8 = b'0';
/// Type flag used by pre-POSIX writers for regular files.
pub const TYPE_FILE_LEGACY: u8 = 0;
/// Type flag of a directory.
pub const TYPE_DIRECTORY: u8 = b'5';
/// Type flag of a per-entry extended header block.
pub const TYPE_EXTENDED: u8 = b'x';
/// Type flag of a global extended header block.
pub const TYPE_GLOBAL_EXTENDED: u8 = b'g';

/// Largest size representable in the 12-byte octal size field.
pub const MAX_OCTAL_SIZE: u64 = 0o77_777_777_777;

const NAME: std::ops::Range<usize> = 0..100;
const MODE: std::ops::Range<usize> = 100..108;
const UID: std::ops::Range<usize> = 108..116;
const GID: std::ops::Range<usize> = 116..124;
const SIZE: std::ops::Range<usize> = 124..136;
const MTIME: std::ops::Range<usize> = 136..148;
const CHKSUM: std::ops::Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const MAGIC: std::ops::Range<usize> = 257..263;
const VERSION: std::ops::Range<usize> = 263..265;
const PREFIX: std::ops::Range<usize> = 345..500;

const USTAR_MAGIC: &[u8; 6] = b"ustar\0";
const USTAR_VERSION: &[u8; 2] = b"00";

/// Kind of object a header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory. Directory records carry no content.
    Directory,
}

impl EntryKind {
    /// Returns the type flag written for this kind.
    #[must_use]
    pub const fn type_flag(self) -> u8 {
        match self {
            EntryKind::File => TYPE_FILE,
            EntryKind::Directory => TYPE_DIRECTORY,
        }
    }

    /// Maps a type flag to an entry kind, if it names one.
    #[must_use]
    pub fn from_type_flag(flag: u8) -> Option<Self> {
        match flag {
            TYPE_FILE | TYPE_FILE_LEGACY => Some(EntryKind::File),
            TYPE_DIRECTORY => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

/// A decoded or to-be-encoded header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Full path of the record.
    pub path: String,
    /// Content size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
    /// Raw type flag.
    pub type_flag: u8,
}

impl Header {
    /// Creates a header for a file or directory record.
    pub fn new(path: impl Into<String>, kind: EntryKind, size: u64, mode: u32, mtime: u64) -> Self {
        Self {
            path: path.into(),
            size,
            mode,
            mtime,
            type_flag: kind.type_flag(),
        }
    }

    /// Returns the entry kind, or `None` for extended or unsupported types.
    #[must_use]
    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_type_flag(self.type_flag)
    }

    /// Returns true if this header introduces an extended header block.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.type_flag == TYPE_EXTENDED || self.type_flag == TYPE_GLOBAL_EXTENDED
    }

    /// Returns true if the path fits the fixed name field.
    #[must_use]
    pub fn path_fits(&self) -> bool {
        self.path.len() <= NAME.len()
    }

    /// Returns true if the size fits the fixed octal size field.
    #[must_use]
    pub fn size_fits(&self) -> bool {
        self.size <= MAX_OCTAL_SIZE
    }

    /// Encodes the header into one block.
    ///
    /// A path that does not fit the name field is truncated; callers that
    /// need the full path emit an extended header first (see
    /// [`crate::ArchiveWriter`]). The same applies to an oversized size,
    /// which is written as zero.
    pub fn encode(&self) -> CodecResult<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];

        let path = self.path.as_bytes();
        let name_len = path.len().min(NAME.len());
        block[NAME.start..NAME.start + name_len].copy_from_slice(&path[..name_len]);

        write_octal(&mut block[MODE], u64::from(self.mode & 0o7_777_777), "mode")?;
        write_octal(&mut block[UID], 0, "uid")?;
        write_octal(&mut block[GID], 0, "gid")?;
        let size = if self.size_fits() { self.size } else { 0 };
        write_octal(&mut block[SIZE], size, "size")?;
        write_octal(&mut block[MTIME], self.mtime.min(MAX_OCTAL_SIZE), "mtime")?;
        block[TYPEFLAG] = self.type_flag;
        block[MAGIC].copy_from_slice(USTAR_MAGIC);
        block[VERSION].copy_from_slice(USTAR_VERSION);

        let checksum = checksum(&block);
        let text = format!("{checksum:06o}\0 ");
        block[CHKSUM].copy_from_slice(text.as_bytes());
        Ok(block)
    }

    /// Decodes one header block.
    ///
    /// The caller must have already ruled out the all-zero end marker.
    pub fn decode(block: &[u8; BLOCK_SIZE]) -> CodecResult<Self> {
        let stored = parse_octal(&block[CHKSUM], "chksum")?;
        let computed = checksum(block);
        if stored != computed {
            return Err(CodecError::malformed_header(format!(
                "checksum mismatch: stored {stored:o}, computed {computed:o}"
            )));
        }

        let name = parse_string(&block[NAME]);
        let path = if &block[MAGIC] == USTAR_MAGIC {
            let prefix = parse_string(&block[PREFIX]);
            if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            }
        } else {
            name
        };

        let mode = parse_octal(&block[MODE], "mode")?;
        Ok(Self {
            path,
            size: parse_octal(&block[SIZE], "size")?,
            mode: u32::try_from(mode)
                .map_err(|_| CodecError::malformed_header("mode out of range"))?,
            mtime: parse_octal(&block[MTIME], "mtime")?,
            type_flag: block[TYPEFLAG],
        })
    }
}

/// Returns true if every byte of the block is zero.
#[must_use]
pub fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Number of zero bytes that follow `size` bytes of content.
#[must_use]
pub const fn padding_for(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE as u64;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE as u64 - rem
    }
}

/// Header checksum: the byte sum of the block with the checksum field
/// taken as eight spaces.
fn checksum(block: &[u8; BLOCK_SIZE]) -> u64 {
    block
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if CHKSUM.contains(&i) {
                u64::from(b' ')
            } else {
                u64::from(b)
            }
        })
        .sum()
}

fn write_octal(field: &mut [u8], value: u64, name: &'static str) -> CodecResult<()> {
    let text = format!("{value:o}");
    // One byte is reserved for the terminator.
    if text.len() >= field.len() {
        return Err(CodecError::FieldOverflow {
            field: name,
            message: format!("{value} needs {} octal digits", text.len()),
        });
    }
    field[..text.len()].copy_from_slice(text.as_bytes());
    for b in &mut field[text.len()..] {
        *b = 0;
    }
    Ok(())
}

/// Parses a left-justified octal field terminated by NUL or space.
///
/// Leading spaces are tolerated so right-justified writers still decode.
pub(crate) fn parse_octal(field: &[u8], name: &'static str) -> CodecResult<u64> {
    let mut value: u64 = 0;
    let mut started = false;
    for &b in field {
        match b {
            b' ' if !started => continue,
            0 | b' ' => break,
            b'0'..=b'7' => {
                started = true;
                value = value
                    .checked_mul(8)
                    .and_then(|v| v.checked_add(u64::from(b - b'0')))
                    .ok_or_else(|| {
                        CodecError::malformed_header(format!("{name} field overflows"))
                    })?;
            }
            other => {
                return Err(CodecError::malformed_header(format!(
                    "{name} field has non-octal byte 0x{other:02x}"
                )))
            }
        }
    }
    Ok(value)
}

/// Reads a NUL-padded string field.
///
/// Invalid UTF-8 is replaced rather than rejected: the writer truncates
/// long names at a byte boundary and carries the full path in an extended
/// header instead.
fn parse_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_decode_file_header() {
        let header = Header::new("apps/com.example/f/notes.txt", EntryKind::File, 1234, 0o600, 1_700_000_000);
        let block = header.encode().unwrap();
        assert_eq!(&block[257..263], b"ustar\0");
        let decoded = Header::decode(&block).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.kind(), Some(EntryKind::File));
    }

    #[test]
    fn numeric_fields_are_left_justified() {
        let header = Header::new("x", EntryKind::File, 8, 0o644, 0);
        let block = header.encode().unwrap();
        assert_eq!(&block[124..127], b"10\0");
        assert_eq!(&block[100..104], b"644\0");
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let header = Header::new("a", EntryKind::File, 1, 0o600, 5);
        let mut block = header.encode().unwrap();
        block[0] = b'b';
        let err = Header::decode(&block).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn right_justified_octal_decodes() {
        assert_eq!(parse_octal(b"   644 \0", "mode").unwrap(), 0o644);
        assert_eq!(parse_octal(b"\0\0\0\0", "mode").unwrap(), 0);
        assert!(parse_octal(b"69\0", "mode").is_err());
    }

    #[test]
    fn ustar_prefix_is_joined() {
        let header = Header::new("name.txt", EntryKind::File, 0, 0o600, 0);
        let mut block = header.encode().unwrap();
        block[345..351].copy_from_slice(b"a/b/cd");
        for b in &mut block[148..156] {
            *b = b' ';
        }
        let sum = checksum(&block);
        block[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());
        assert_eq!(Header::decode(&block).unwrap().path, "a/b/cd/name.txt");
    }

    #[test]
    fn padding() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 511);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padding_for(513), 511);
    }

    proptest! {
        #[test]
        fn header_fields_survive(
            path in "[a-z/._]{1,100}",
            size in 0u64..=MAX_OCTAL_SIZE,
            mode in 0u32..0o7777,
            mtime in 0u64..=MAX_OCTAL_SIZE,
        ) {
            let header = Header::new(path, EntryKind::File, size, mode, mtime);
            let decoded = Header::decode(&header.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, header);
        }
    }
}
