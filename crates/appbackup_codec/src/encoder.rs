//! Archive stream writer.

use crate::error::{CodecError, CodecResult};
use crate::extended::{encode_records, KEY_MTIME, KEY_PATH, KEY_SIZE};
use crate::header::{padding_for, EntryKind, Header, BLOCK_SIZE, MAX_OCTAL_SIZE, TYPE_EXTENDED};
use crate::manifest::{Manifest, MetadataRecord};
use crate::path::{data_path, manifest_path, metadata_path, DOMAIN_APK};
use std::io::{self, Read, Write};

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Describes one file or directory record to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Owning package.
    pub package: String,
    /// Domain token.
    pub domain: String,
    /// Path relative to the domain root.
    pub path: String,
    /// Content size; ignored for directories.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Modification time in seconds.
    pub mtime: u64,
    /// Record kind.
    pub kind: EntryKind,
}

impl FileInfo {
    /// Describes a regular file.
    pub fn file(
        package: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            package: package.into(),
            domain: domain.into(),
            path: path.into(),
            size,
            mode: 0o600,
            mtime: 0,
            kind: EntryKind::File,
        }
    }

    /// Describes a directory.
    pub fn directory(
        package: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            domain: domain.into(),
            path: path.into(),
            size: 0,
            mode: 0o700,
            mtime: 0,
            kind: EntryKind::Directory,
        }
    }

    /// Sets the permission bits.
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the modification time.
    #[must_use]
    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = mtime;
        self
    }

    /// Full archive path of the record.
    #[must_use]
    pub fn archive_path(&self) -> String {
        data_path(&self.package, &self.domain, &self.path)
    }
}

/// Writes archive records to a sink.
///
/// Agents use the same writer to emit their file records; the service
/// wraps them with the manifest, metadata and end-of-archive marker.
pub struct ArchiveWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> ArchiveWriter<W> {
    /// Wraps a sink.
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Total bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Writes the manifest record of a package.
    pub fn write_manifest(&mut self, manifest: &Manifest) -> CodecResult<()> {
        let body = manifest.encode();
        let header = Header::new(manifest_path(&manifest.package_name), EntryKind::File, body.len() as u64, 0o600, 0);
        self.write_record(&header, &mut body.as_slice())
    }

    /// Writes the metadata record of a package.
    pub fn write_metadata(&mut self, metadata: &MetadataRecord) -> CodecResult<()> {
        let body = metadata.encode();
        let header = Header::new(metadata_path(&metadata.package_name), EntryKind::File, body.len() as u64, 0o600, 0);
        self.write_record(&header, &mut body.as_slice())
    }

    /// Writes the application package file.
    pub fn write_apk(&mut self, package: &str, size: u64, content: &mut dyn Read) -> CodecResult<()> {
        let header = Header::new(data_path(package, DOMAIN_APK, ""), EntryKind::File, size, 0o644, 0);
        self.write_record(&header, content)
    }

    /// Writes a file or directory record with its content.
    pub fn write_file(&mut self, info: &FileInfo, content: &mut dyn Read) -> CodecResult<()> {
        let size = match info.kind {
            EntryKind::File => info.size,
            EntryKind::Directory => 0,
        };
        let header = Header {
            path: info.archive_path(),
            size,
            mode: info.mode,
            mtime: info.mtime,
            type_flag: info.kind.type_flag(),
        };
        self.write_record(&header, content)
    }

    /// Writes the end-of-archive marker and flushes.
    pub fn finish(&mut self) -> CodecResult<()> {
        self.put(&ZERO_BLOCK)?;
        self.put(&ZERO_BLOCK)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Returns the sink.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Writes a header (with an extended header when needed), exactly
    /// `header.size` bytes of content, and the padding.
    pub fn write_record(&mut self, header: &Header, content: &mut dyn Read) -> CodecResult<()> {
        let mut records: Vec<(&str, String)> = Vec::new();
        if !header.path_fits() {
            records.push((KEY_PATH, header.path.clone()));
        }
        if !header.size_fits() {
            records.push((KEY_SIZE, header.size.to_string()));
        }
        if header.mtime > MAX_OCTAL_SIZE {
            records.push((KEY_MTIME, header.mtime.to_string()));
        }
        if !records.is_empty() {
            let body = encode_records(&records);
            let ext = Header {
                path: "PaxHeader".to_string(),
                size: body.len() as u64,
                mode: 0o644,
                mtime: 0,
                type_flag: TYPE_EXTENDED,
            };
            self.put(&ext.encode()?)?;
            self.put(&body)?;
            self.pad(body.len() as u64)?;
        }

        self.put(&header.encode()?)?;
        let copied = io::copy(&mut content.take(header.size), &mut CountingWriter(self))?;
        if copied != header.size {
            return Err(CodecError::SizeMismatch {
                declared: header.size,
                written: copied,
            });
        }
        self.pad(header.size)
    }

    fn pad(&mut self, size: u64) -> CodecResult<()> {
        let padding = padding_for(size) as usize;
        if padding > 0 {
            self.put(&ZERO_BLOCK[..padding])?;
        }
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

struct CountingWriter<'a, W: Write>(&'a mut ArchiveWriter<W>);

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.0.inner.write(buf)?;
        self.0.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.inner.flush()
    }
}

/// Everything needed to encode one package segment.
pub struct PackageSegment<'a> {
    /// Manifest at the head of the segment.
    pub manifest: &'a Manifest,
    /// Metadata record, written only when present.
    pub metadata: Option<&'a MetadataRecord>,
    /// Package file content, written only when present.
    pub apk: Option<&'a [u8]>,
}

impl<'a> PackageSegment<'a> {
    /// A segment with only a manifest.
    #[must_use]
    pub fn new(manifest: &'a Manifest) -> Self {
        Self {
            manifest,
            metadata: None,
            apk: None,
        }
    }
}

/// Encodes one package's files into a complete archive stream.
pub fn encode_package<W, I>(sink: W, segment: PackageSegment<'_>, files: I) -> CodecResult<W>
where
    W: Write,
    I: IntoIterator<Item = (FileInfo, Vec<u8>)>,
{
    let mut writer = ArchiveWriter::new(sink);
    writer.write_manifest(segment.manifest)?;
    if let Some(metadata) = segment.metadata {
        writer.write_metadata(metadata)?;
    }
    if let Some(apk) = segment.apk {
        let package = segment.manifest.package_name.as_str();
        writer.write_apk(package, apk.len() as u64, &mut &apk[..])?;
    }
    for (info, content) in files {
        writer.write_file(&info, &mut content.as_slice())?;
    }
    writer.finish()?;
    Ok(writer.into_inner())
}
