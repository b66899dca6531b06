//! Inspect command implementation.

use appbackup_codec::{ArchiveReader, EntryKind, RecordRole};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// One listed record.
#[derive(Debug, Serialize)]
pub struct RecordRow {
    /// Owning package.
    pub package: String,
    /// `manifest`, `metadata` or `data`.
    pub role: &'static str,
    /// Domain token.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// Path relative to the domain.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// `file` or `dir`.
    pub kind: &'static str,
    /// Content size.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Modification time in seconds.
    pub mtime: u64,
    /// Version code, for manifest records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_code: Option<i64>,
}

/// Archive listing.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Archive path.
    pub path: String,
    /// Bytes consumed, end marker included.
    pub bytes: u64,
    /// Records in stream order.
    pub records: Vec<RecordRow>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let mut result = list(BufReader::new(file))?;
    result.path = path.display().to_string();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

/// Decodes `source` into a listing.
pub fn list<R: Read>(source: R) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut reader = ArchiveReader::new(source);
    let mut records = Vec::new();
    while let Some(entry) = reader.next_entry()? {
        let version_code = match entry.role {
            RecordRole::Manifest => Some(reader.read_manifest()?.version_code),
            _ => None,
        };
        records.push(RecordRow {
            role: role_name(entry.role),
            kind: match entry.kind {
                EntryKind::File => "file",
                EntryKind::Directory => "dir",
            },
            package: entry.package,
            domain: entry.domain,
            path: entry.path,
            size: entry.size,
            mode: entry.mode,
            mtime: entry.mtime,
            version_code,
        });
    }
    Ok(InspectResult {
        path: String::new(),
        bytes: reader.position(),
        records,
    })
}

fn role_name(role: RecordRole) -> &'static str {
    match role {
        RecordRole::Manifest => "manifest",
        RecordRole::Metadata => "metadata",
        RecordRole::Data => "data",
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Archive: {}", result.path);
    println!("Size: {} bytes, {} records", result.bytes, result.records.len());
    println!();
    for row in &result.records {
        match row.role {
            "manifest" => println!(
                "{:<40} manifest  version {}",
                row.package,
                row.version_code.unwrap_or_default()
            ),
            "metadata" => println!("{:<40} metadata  {} bytes", row.package, row.size),
            _ => println!(
                "{:<40} {:<4} {:o} {:>10}  {}/{}",
                row.package, row.kind, row.mode, row.size, row.domain, row.path
            ),
        }
    }
}
