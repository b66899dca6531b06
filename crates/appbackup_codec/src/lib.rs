//! # appbackup codec
//!
//! Wire formats for application backup archives.
//!
//! This crate provides:
//! - A streaming writer and reader for the tar-compatible archive stream
//! - Package manifests and metadata records
//! - The key-value entity format handed to key-value agents
//! - Restore admission policy evaluated from manifests
//!
//! ## Archive layout
//!
//! Each package segment starts with `apps/<pkg>/_manifest`, optionally
//! followed by `apps/<pkg>/_meta` and the package file under domain `a`,
//! then data records `apps/<pkg>/<domain>/<path>`. Records are 512-byte
//! headers followed by zero-padded content; two zero blocks end the stream.
//!
//! ## Usage
//!
//! ```
//! use appbackup_codec::{encode_package, ArchiveReader, FileInfo, Manifest, PackageSegment};
//!
//! let manifest = Manifest::new("com.example", 3, 33);
//! let files = vec![(FileInfo::file("com.example", "f", "notes.txt", 5), b"hello".to_vec())];
//! let bytes = encode_package(Vec::new(), PackageSegment::new(&manifest), files).unwrap();
//!
//! let mut reader = ArchiveReader::new(bytes.as_slice());
//! let first = reader.next_entry().unwrap().unwrap();
//! assert_eq!(first.package, "com.example");
//! assert_eq!(reader.read_manifest().unwrap(), manifest);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
pub mod extended;
pub mod header;
pub mod kv;
mod manifest;
pub mod path;
mod policy;

pub use decoder::{ArchiveEntry, ArchiveReader, Entries, RecordRole, DEFAULT_MAX_RECORD_SIZE};
pub use encoder::{encode_package, ArchiveWriter, FileInfo, PackageSegment};
pub use error::{CodecError, CodecResult};
pub use header::{EntryKind, Header, BLOCK_SIZE};
pub use kv::{Entity, KeyValueReader, KeyValueWriter};
pub use manifest::{
    hash_signature, Manifest, MetadataRecord, MANIFEST_VERSION, METADATA_VERSION, WIDGET_METADATA_TOKEN,
};
pub use policy::{
    evaluate_manifest, signature_hashes_match, signatures_match, AppInfo, PolicyDecision, PolicyReason,
    PolicyTable, RestorePolicy,
};
