//! Verify command implementation.

use appbackup_codec::path::{is_excluded_domain, is_sane_path};
use appbackup_codec::{ArchiveReader, RecordRole};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Records decoded.
    pub records_checked: usize,
    /// Package segments seen.
    pub packages: usize,
    /// Content bytes across data records.
    pub data_bytes: u64,
    /// Whether the end-of-archive marker was reached.
    pub finished: bool,
    /// Problems found.
    pub errors: Vec<String>,
    /// Non-fatal oddities.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    /// True when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying archive at: {}", path.display());
    println!();

    let file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let result = verify(BufReader::new(file));

    println!("Records checked: {}", result.records_checked);
    println!("Packages:        {}", result.packages);
    println!("Data bytes:      {}", result.data_bytes);
    println!();

    for warning in &result.warnings {
        println!("  ! {warning}");
    }

    if result.is_ok() {
        println!("✓ Archive verification passed");
        Ok(())
    } else {
        println!("✗ Archive verification failed:");
        for error in &result.errors {
            println!("  - {error}");
        }
        Err("Verification failed".into())
    }
}

/// Decodes the whole stream and collects problems.
///
/// Decoding stops at the first codec error since the stream position is
/// no longer trustworthy after it.
pub fn verify<R: Read>(source: R) -> VerifyResult {
    let mut result = VerifyResult::default();
    let mut reader = ArchiveReader::new(source);
    let mut current: Option<String> = None;
    let mut seen = HashSet::new();

    loop {
        let entry = match reader.next_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                result
                    .errors
                    .push(format!("decode error at offset {}: {e}", reader.position()));
                return result;
            }
        };
        result.records_checked += 1;

        match entry.role {
            RecordRole::Manifest => {
                if !seen.insert(entry.package.clone()) {
                    result
                        .warnings
                        .push(format!("{}: package appears in more than one segment", entry.package));
                }
                match reader.read_manifest() {
                    Ok(manifest) if manifest.package_name != entry.package => result.errors.push(format!(
                        "{}: manifest names package {}",
                        entry.package, manifest.package_name
                    )),
                    Ok(_) => {}
                    Err(e) if e.is_malformed() => {
                        result.errors.push(format!("{}: {e}", entry.package));
                    }
                    Err(e) => {
                        result.errors.push(format!("{}: {e}", entry.package));
                        return result;
                    }
                }
                result.packages += 1;
                current = Some(entry.package);
            }
            RecordRole::Metadata | RecordRole::Data if current.as_deref() != Some(entry.package.as_str()) => {
                result
                    .errors
                    .push(format!("{}: record before the package manifest", entry.package));
            }
            RecordRole::Metadata => {
                if let Err(e) = reader.read_metadata() {
                    result.errors.push(format!("{}: {e}", entry.package));
                    if !e.is_malformed() {
                        return result;
                    }
                }
            }
            RecordRole::Data => {
                if !is_sane_path(&entry.path) {
                    result.errors.push(format!(
                        "{}: unsafe path {}/{}",
                        entry.package, entry.domain, entry.path
                    ));
                }
                if is_excluded_domain(&entry.domain) {
                    result.warnings.push(format!(
                        "{}: record in excluded domain {}/{}",
                        entry.package, entry.domain, entry.path
                    ));
                }
                result.data_bytes += entry.size;
            }
        }
    }

    result.finished = reader.is_finished();
    result
}
