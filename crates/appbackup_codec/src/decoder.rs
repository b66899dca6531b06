//! Streaming archive reader.
//!
//! The reader yields one [`ArchiveEntry`] per record and leaves the record
//! content in the stream until the caller copies, buffers or skips it.
//! Unconsumed content is skipped automatically before the next header is
//! read, so the cursor always lands on a block boundary.

use crate::error::{CodecError, CodecResult};
use crate::extended::{parse_records, Overrides};
use crate::header::{is_zero_block, padding_for, EntryKind, Header, BLOCK_SIZE, TYPE_GLOBAL_EXTENDED};
use crate::manifest::{Manifest, MetadataRecord};
use crate::path::{parse_record_path, RecordPath};
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Default cap on records the reader buffers in memory (manifests,
/// metadata, extended headers).
pub const DEFAULT_MAX_RECORD_SIZE: u64 = 64 * 1024;

const COPY_CHUNK: usize = 32 * 1024;

/// What a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRole {
    /// Package manifest.
    Manifest,
    /// Package metadata record.
    Metadata,
    /// Application data (including the package file).
    Data,
}

/// One decoded archive record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Owning package.
    pub package: String,
    /// Domain token; empty for manifest and metadata records.
    pub domain: String,
    /// Path relative to the domain root.
    pub path: String,
    /// Content size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Modification time in seconds.
    pub mtime: u64,
    /// File or directory.
    pub kind: EntryKind,
    /// Record role.
    pub role: RecordRole,
    /// Installer named by the package's manifest, once it has been read.
    pub installer_package: Option<String>,
}

/// Reads records from an archive stream.
pub struct ArchiveReader<R: Read> {
    inner: R,
    position: u64,
    remaining: u64,
    padding: u64,
    finished: bool,
    max_record_size: u64,
    installers: HashMap<String, String>,
}

impl<R: Read> ArchiveReader<R> {
    /// Wraps a stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            position: 0,
            remaining: 0,
            padding: 0,
            finished: false,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            installers: HashMap::new(),
        }
    }

    /// Sets the cap on records buffered in memory.
    #[must_use]
    pub fn with_max_record_size(mut self, limit: u64) -> Self {
        self.max_record_size = limit;
        self
    }

    /// Bytes consumed from the stream so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Content bytes of the current record not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Returns true once the end-of-archive marker has been read.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next record header.
    ///
    /// Returns `None` at the end-of-archive marker or at a clean end of
    /// stream on a block boundary.
    pub fn next_entry(&mut self) -> CodecResult<Option<ArchiveEntry>> {
        self.skip_content()?;
        if self.finished {
            return Ok(None);
        }

        let mut overrides = Overrides::default();
        loop {
            let Some(block) = self.read_block()? else {
                tracing::debug!(offset = self.position, "archive stream ended without end marker");
                self.finished = true;
                return Ok(None);
            };

            if is_zero_block(&block) {
                match self.read_block()? {
                    None => {}
                    Some(next) if is_zero_block(&next) => {}
                    Some(_) => {
                        return Err(CodecError::malformed_header(format!(
                            "lone zero block at offset {}",
                            self.position - 2 * BLOCK_SIZE as u64
                        )))
                    }
                }
                self.finished = true;
                return Ok(None);
            }

            let header = Header::decode(&block)?;

            if header.is_extended() {
                let body = self.read_body(header.size)?;
                let records = parse_records(&body)?;
                if header.type_flag == TYPE_GLOBAL_EXTENDED {
                    tracing::debug!(count = records.len(), "ignoring global extended header");
                } else {
                    overrides = Overrides::from_records(records)?;
                }
                continue;
            }

            let path = overrides.path.take().unwrap_or(header.path);
            let size = overrides.size.take().unwrap_or(header.size);
            let mtime = overrides.mtime.take().unwrap_or(header.mtime);

            self.remaining = size;
            self.padding = padding_for(size);

            let Some(kind) = EntryKind::from_type_flag(header.type_flag) else {
                tracing::warn!(path = %path, type_flag = header.type_flag, "skipping unsupported record type");
                self.skip_content()?;
                continue;
            };

            let Some(parsed) = parse_record_path(&path) else {
                tracing::warn!(path = %path, "skipping record outside known prefixes");
                self.skip_content()?;
                continue;
            };

            let (package, domain, rel, role) = match parsed {
                RecordPath::Manifest { package } => (package, String::new(), String::new(), RecordRole::Manifest),
                RecordPath::Metadata { package } => (package, String::new(), String::new(), RecordRole::Metadata),
                RecordPath::Data { package, domain, path } => (package, domain, path, RecordRole::Data),
            };

            return Ok(Some(ArchiveEntry {
                installer_package: self.installers.get(&package).cloned(),
                package,
                domain,
                path: rel,
                size,
                mode: header.mode,
                mtime,
                kind,
                role,
            }));
        }
    }

    /// Copies the current record's remaining content into `out`.
    ///
    /// On a write failure the unread content stays accounted for, so the
    /// next call to [`next_entry`](Self::next_entry) still lands on the
    /// following header.
    pub fn copy_content(&mut self, out: &mut dyn Write) -> CodecResult<u64> {
        let mut copied = 0u64;
        let mut buf = vec![0u8; COPY_CHUNK];
        while self.remaining > 0 {
            let want = self.remaining.min(COPY_CHUNK as u64) as usize;
            let n = self.read_some(&mut buf[..want])?;
            self.remaining -= n as u64;
            out.write_all(&buf[..n])?;
            copied += n as u64;
        }
        self.consume_padding()?;
        Ok(copied)
    }

    /// Buffers the current record's content, refusing records above the
    /// configured cap. A refused record is left to be skipped.
    pub fn read_content(&mut self) -> CodecResult<Vec<u8>> {
        if self.remaining > self.max_record_size {
            return Err(CodecError::RecordTooLarge {
                size: self.remaining,
                limit: self.max_record_size,
            });
        }
        let mut out = Vec::with_capacity(self.remaining as usize);
        self.copy_content(&mut out)?;
        Ok(out)
    }

    /// Reads the current record as a manifest and remembers its installer.
    pub fn read_manifest(&mut self) -> CodecResult<Manifest> {
        let body = self.read_content()?;
        let manifest = Manifest::decode(&body)?;
        if let Some(installer) = &manifest.installer {
            self.installers
                .insert(manifest.package_name.clone(), installer.clone());
        }
        Ok(manifest)
    }

    /// Reads the current record as a metadata record.
    pub fn read_metadata(&mut self) -> CodecResult<MetadataRecord> {
        let body = self.read_content()?;
        MetadataRecord::decode(&body)
    }

    /// Discards the remaining content and padding of the current record.
    pub fn skip_content(&mut self) -> CodecResult<()> {
        if self.remaining > 0 {
            let want = self.remaining;
            let skipped = io::copy(&mut (&mut self.inner).take(want), &mut io::sink())?;
            self.position += skipped;
            self.remaining -= skipped;
            if skipped != want {
                return Err(CodecError::UnexpectedEof {
                    offset: self.position,
                });
            }
        }
        self.consume_padding()
    }

    /// Returns an iterator over entries that skips every record's content.
    pub fn entries(&mut self) -> Entries<'_, R> {
        Entries { reader: self }
    }

    fn consume_padding(&mut self) -> CodecResult<()> {
        if self.padding > 0 {
            let want = self.padding;
            let skipped = io::copy(&mut (&mut self.inner).take(want), &mut io::sink())?;
            self.position += skipped;
            self.padding -= skipped;
            if skipped != want {
                return Err(CodecError::UnexpectedEof {
                    offset: self.position,
                });
            }
        }
        Ok(())
    }

    fn read_body(&mut self, size: u64) -> CodecResult<Vec<u8>> {
        self.remaining = size;
        self.padding = padding_for(size);
        self.read_content()
    }

    /// Reads one block. `None` means a clean end of stream at a block boundary.
    fn read_block(&mut self) -> CodecResult<Option<[u8; BLOCK_SIZE]>> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.inner.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.position += filled as u64;
        match filled {
            0 => Ok(None),
            BLOCK_SIZE => Ok(Some(block)),
            _ => Err(CodecError::UnexpectedEof {
                offset: self.position,
            }),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> CodecResult<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(0) => {
                    return Err(CodecError::UnexpectedEof {
                        offset: self.position,
                    })
                }
                Ok(n) => {
                    self.position += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Iterator over archive entries; content is skipped.
pub struct Entries<'a, R: Read> {
    reader: &'a mut ArchiveReader<R>,
}

impl<R: Read> Iterator for Entries<'_, R> {
    type Item = CodecResult<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                // A broken stream cannot be resynchronized.
                self.reader.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{encode_package, ArchiveWriter, FileInfo, PackageSegment};
    use crate::path::DOMAIN_FILES;

    fn archive_with(files: Vec<(FileInfo, Vec<u8>)>) -> Vec<u8> {
        let manifest = Manifest::new("com.example", 3, 33).with_installer("store");
        encode_package(
            Vec::new(),
            PackageSegment {
                manifest: &manifest,
                metadata: None,
                apk: None,
            },
            files,
        )
        .unwrap()
    }

    fn sized(n: usize) -> (FileInfo, Vec<u8>) {
        let content: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
        (FileInfo::file("com.example", DOMAIN_FILES, format!("blob{n}"), n as u64), content)
    }

    #[test]
    fn roundtrip_preserves_order_and_content() {
        let files = vec![
            (
                FileInfo::file("com.example", "db", "main.db", 3).with_mode(0o660).with_mtime(1_600_000_000),
                b"abc".to_vec(),
            ),
            (FileInfo::directory("com.example", "f", "dir"), Vec::new()),
            (FileInfo::file("com.example", "f", "dir/x", 0), Vec::new()),
        ];
        let archive = archive_with(files.clone());

        let mut reader = ArchiveReader::new(archive.as_slice());
        let head = reader.next_entry().unwrap().unwrap();
        assert_eq!(head.role, RecordRole::Manifest);
        assert_eq!(reader.read_manifest().unwrap().package_name, "com.example");

        for (info, content) in &files {
            let entry = reader.next_entry().unwrap().unwrap();
            assert_eq!(entry.installer_package.as_deref(), Some("store"));
            assert_eq!(
                (entry.domain.as_str(), entry.path.as_str(), entry.size, entry.mode, entry.mtime, entry.kind),
                (info.domain.as_str(), info.path.as_str(), if info.kind == EntryKind::File { info.size } else { 0 }, info.mode, info.mtime, info.kind)
            );
            let mut got = Vec::new();
            reader.copy_content(&mut got).unwrap();
            assert_eq!(&got, content);
        }
        assert!(reader.next_entry().unwrap().is_none());
        assert!(reader.is_finished());
        assert_eq!(reader.position(), archive.len() as u64);
    }

    #[test]
    fn skip_matches_full_read() {
        for n in [0usize, 1, 511, 512, 513, 1_000_000] {
            let archive = archive_with(vec![sized(n), sized(7)]);

            let mut skipping = ArchiveReader::new(archive.as_slice());
            skipping.next_entry().unwrap();
            skipping.next_entry().unwrap();
            skipping.skip_content().unwrap();

            let mut reading = ArchiveReader::new(archive.as_slice());
            reading.next_entry().unwrap();
            reading.next_entry().unwrap();
            let copied = reading.copy_content(&mut io::sink()).unwrap();
            assert_eq!(copied, n as u64);

            assert_eq!(skipping.position(), reading.position(), "size {n}");
            assert_eq!(skipping.position() % BLOCK_SIZE as u64, 0);

            let next = skipping.next_entry().unwrap().unwrap();
            assert_eq!(next.path, "blob7");
        }
    }

    #[test]
    fn unconsumed_content_is_skipped() {
        let archive = archive_with(vec![sized(1000), sized(3)]);
        let mut reader = ArchiveReader::new(archive.as_slice());
        let names: Vec<_> = reader
            .entries()
            .map(|e| e.unwrap().path)
            .collect();
        assert_eq!(names, vec!["", "blob1000", "blob3"]);
    }

    #[test]
    fn failed_write_keeps_stream_in_sync() {
        struct Failing(usize);
        impl Write for Failing {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "agent went away"));
                }
                let n = buf.len().min(self.0);
                self.0 -= n;
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let archive = archive_with(vec![sized(100_000), sized(5)]);
        let mut reader = ArchiveReader::new(archive.as_slice());
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        assert!(reader.copy_content(&mut Failing(40_000)).is_err());
        assert!(reader.remaining() > 0);
        let next = reader.next_entry().unwrap().unwrap();
        assert_eq!(next.path, "blob5");
    }

    #[test]
    fn extended_header_overrides_path() {
        let long = "n/".repeat(70) + "end.txt";
        let archive = archive_with(vec![(FileInfo::file("com.example", "f", long.clone(), 2), b"hi".to_vec())]);
        let mut reader = ArchiveReader::new(archive.as_slice());
        reader.next_entry().unwrap();
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.path, long);
        assert_eq!(entry.size, 2);
    }

    #[test]
    fn truncated_stream_reports_eof() {
        let archive = archive_with(vec![sized(2000)]);
        let cut = &archive[..512 * 3 + 100];
        let mut reader = ArchiveReader::new(cut);
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        let err = reader.copy_content(&mut io::sink()).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof { .. }));
    }

    #[test]
    fn missing_end_marker_is_clean_end() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer
            .write_file(&FileInfo::file("p", "f", "a", 1), &mut &b"z"[..])
            .unwrap();
        let bytes = writer.into_inner();
        let mut reader = ArchiveReader::new(bytes.as_slice());
        assert!(reader.next_entry().unwrap().is_some());
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn oversized_manifest_is_refused_but_skippable() {
        let mut writer = ArchiveWriter::new(Vec::new());
        let header = Header::new("apps/p/_manifest", EntryKind::File, 4096, 0o600, 0);
        writer.write_record(&header, &mut &vec![b'1'; 4096][..]).unwrap();
        writer.write_file(&FileInfo::file("p", "f", "a", 1), &mut &b"z"[..]).unwrap();
        writer.finish().unwrap();
        let bytes = writer.into_inner();

        let mut reader = ArchiveReader::new(bytes.as_slice()).with_max_record_size(1024);
        reader.next_entry().unwrap();
        assert!(matches!(reader.read_manifest(), Err(CodecError::RecordTooLarge { .. })));
        assert_eq!(reader.next_entry().unwrap().unwrap().path, "a");
    }
}
