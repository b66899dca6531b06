//! Pack command implementation.

use appbackup_codec::path::is_sane_path;
use appbackup_codec::{ArchiveWriter, FileInfo, Manifest};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Manifest fields supplied on the command line.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Package name.
    pub package: String,
    /// Version code.
    pub version_code: i64,
    /// Platform version.
    pub platform_version: i32,
    /// Signing certificates.
    pub signatures: Vec<Vec<u8>>,
}

/// Summary of a written archive.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PackSummary {
    /// File records written.
    pub files: usize,
    /// Directory records written.
    pub directories: usize,
    /// Total bytes written, end marker included.
    pub bytes: u64,
}

/// Decodes `--signature` values.
pub fn parse_signatures(values: &[String]) -> Result<Vec<Vec<u8>>, Box<dyn std::error::Error>> {
    let mut signatures = Vec::with_capacity(values.len());
    for value in values {
        let bytes = hex::decode(value).map_err(|e| format!("invalid signature {value:?}: {e}"))?;
        signatures.push(bytes);
    }
    Ok(signatures)
}

/// Runs the pack command.
pub fn run(dir: &Path, options: &PackOptions, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(output).map_err(|e| format!("cannot create {}: {e}", output.display()))?;
    let mut sink = BufWriter::new(file);
    let summary = pack(dir, options, &mut sink)?;
    sink.flush()?;

    println!(
        "Packed {} files and {} directories for {} into {} ({} bytes)",
        summary.files,
        summary.directories,
        options.package,
        output.display(),
        summary.bytes
    );
    Ok(())
}

/// Encodes `dir` as a single-package archive into `sink`.
///
/// Each top-level subdirectory of `dir` names a domain; everything below
/// it is written in sorted path order.
pub fn pack<W: Write>(dir: &Path, options: &PackOptions, sink: W) -> Result<PackSummary, Box<dyn std::error::Error>> {
    let manifest = Manifest::new(&options.package, options.version_code, options.platform_version)
        .with_signatures(options.signatures.clone());
    let mut writer = ArchiveWriter::new(sink);
    writer.write_manifest(&manifest)?;

    let mut summary = PackSummary::default();
    for domain_dir in sorted_children(dir)? {
        if !domain_dir.is_dir() {
            tracing::warn!(path = %domain_dir.display(), "skipping file outside a domain directory");
            continue;
        }
        let domain = file_name(&domain_dir)?;
        pack_tree(&mut writer, options, &domain, &domain_dir, &domain_dir, &mut summary)?;
    }

    writer.finish()?;
    summary.bytes = writer.bytes_written();
    Ok(summary)
}

fn pack_tree<W: Write>(
    writer: &mut ArchiveWriter<W>,
    options: &PackOptions,
    domain: &str,
    root: &Path,
    current: &Path,
    summary: &mut PackSummary,
) -> Result<(), Box<dyn std::error::Error>> {
    for child in sorted_children(current)? {
        let relative = child
            .strip_prefix(root)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if !is_sane_path(&relative) {
            return Err(format!("refusing unsafe path {relative}").into());
        }
        let metadata = fs::symlink_metadata(&child)?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());

        if metadata.is_dir() {
            let info = FileInfo::directory(&options.package, domain, &relative)
                .with_mode(mode_of(&metadata, 0o700))
                .with_mtime(mtime);
            writer.write_file(&info, &mut std::io::empty())?;
            summary.directories += 1;
            pack_tree(writer, options, domain, root, &child, summary)?;
        } else if metadata.is_file() {
            let info = FileInfo::file(&options.package, domain, &relative, metadata.len())
                .with_mode(mode_of(&metadata, 0o600))
                .with_mtime(mtime);
            tracing::debug!(domain, path = %relative, size = metadata.len(), "packing file");
            writer.write_file(&info, &mut File::open(&child)?)?;
            summary.files += 1;
        } else {
            tracing::warn!(path = %child.display(), "skipping special file");
        }
    }
    Ok(())
}

fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut children = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    children.sort();
    Ok(children)
}

fn file_name(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("no file name in {}", path.display()).into())
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata, _default: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata, default: u32) -> u32 {
    default
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{inspect, verify};
    use tempfile::tempdir;

    fn options() -> PackOptions {
        PackOptions {
            package: "com.example".into(),
            version_code: 7,
            platform_version: 34,
            signatures: parse_signatures(&["c0ffee".into()]).unwrap(),
        }
    }

    #[test]
    fn packs_domains_in_sorted_order() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("f/sub")).unwrap();
        fs::create_dir_all(dir.path().join("db")).unwrap();
        fs::write(dir.path().join("f/b.txt"), b"bee").unwrap();
        fs::write(dir.path().join("f/sub/a.txt"), b"a").unwrap();
        fs::write(dir.path().join("db/main.db"), b"rows").unwrap();

        let mut out = Vec::new();
        let summary = pack(dir.path(), &options(), &mut out).unwrap();

        assert_eq!(summary.files, 3);
        assert_eq!(summary.directories, 1);
        assert_eq!(summary.bytes, out.len() as u64);
        assert!(verify::verify(out.as_slice()).is_ok());

        let listing = inspect::list(out.as_slice()).unwrap();
        let paths: Vec<_> = listing
            .records
            .iter()
            .map(|r| format!("{}/{}", r.domain, r.path))
            .collect();
        assert_eq!(paths, vec!["/", "db/main.db", "f/b.txt", "f/sub", "f/sub/a.txt"]);
        assert_eq!(listing.records[0].version_code, Some(7));
    }

    #[test]
    fn bad_signature_hex_is_rejected() {
        assert!(parse_signatures(&["not-hex".into()]).is_err());
    }
}
