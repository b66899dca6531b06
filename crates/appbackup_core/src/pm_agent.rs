//! The package-manager pseudo-package.
//!
//! Its key-value data describes every eligible installed package (version
//! code and signature hashes) plus a global `@meta@` record with the
//! platform version. Restore sessions read it first to decide which
//! packages can take restored data. The agent runs in process, so its
//! calls complete synchronously.

use crate::error::{CoreError, CoreResult};
use crate::package_manager::PackageManager;
use appbackup_codec::kv::{Entity, KeyValueReader, KeyValueWriter};
use appbackup_codec::CodecError;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;

/// Name of the pseudo-package.
pub const PM_PACKAGE: &str = "@pm@";

/// Key of the global metadata record.
pub const META_KEY: &str = "@meta@";

/// What the dataset says about one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    /// Version code at backup time.
    pub version_code: i64,
    /// SHA-256 hashes of the signing certificates.
    pub signature_hashes: Vec<[u8; 32]>,
}

impl PackageMetadata {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + 32 * self.signature_hashes.len());
        out.extend_from_slice(&self.version_code.to_be_bytes());
        out.extend_from_slice(&(self.signature_hashes.len() as u32).to_be_bytes());
        for hash in &self.signature_hashes {
            out.extend_from_slice(hash);
        }
        out
    }

    fn decode(package: &str, bytes: &[u8]) -> CoreResult<Self> {
        let malformed = || CodecError::malformed_kv(format!("bad package metadata for {package}"));
        let version = bytes.get(..8).ok_or_else(malformed)?;
        let count = bytes.get(8..12).ok_or_else(malformed)?;
        let mut version_bytes = [0u8; 8];
        version_bytes.copy_from_slice(version);
        let mut count_bytes = [0u8; 4];
        count_bytes.copy_from_slice(count);
        let count = u32::from_be_bytes(count_bytes) as usize;

        let hashes = &bytes[12..];
        if hashes.len() != count.saturating_mul(32) {
            return Err(malformed().into());
        }
        let signature_hashes = hashes
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        Ok(Self {
            version_code: i64::from_be_bytes(version_bytes),
            signature_hashes,
        })
    }
}

/// Package metadata recovered from a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreMetadata {
    /// Platform version of the device that wrote the dataset.
    pub platform_version: i32,
    /// Per-package metadata.
    pub packages: HashMap<String, PackageMetadata>,
}

impl RestoreMetadata {
    /// Metadata for one package.
    #[must_use]
    pub fn get(&self, package: &str) -> Option<&PackageMetadata> {
        self.packages.get(package)
    }
}

/// Backs up and restores the package-manager pseudo-package.
pub struct PmAgent {
    packages: Arc<dyn PackageManager>,
}

impl PmAgent {
    /// Creates an agent reading from `packages`.
    #[must_use]
    pub fn new(packages: Arc<dyn PackageManager>) -> Self {
        Self { packages }
    }

    /// Writes the records that changed since `old_state` to `data` and the
    /// complete new state to `new_state`. Returns the number of records
    /// written.
    pub fn backup(
        &self,
        old_state: Option<&mut dyn Read>,
        data: &mut dyn Write,
        new_state: &mut dyn Write,
    ) -> CoreResult<usize> {
        let previous = match old_state {
            Some(reader) => parse_state(reader)?,
            None => BTreeMap::new(),
        };

        let platform = i64::from(self.packages.platform_version());
        let mut current = BTreeMap::new();
        current.insert(META_KEY.to_string(), platform);

        let mut writer = KeyValueWriter::new(data);
        let mut written = 0;
        if previous.get(META_KEY) != Some(&platform) {
            writer.write_entity(&Entity::put(META_KEY, platform.to_be_bytes().to_vec()))?;
            written += 1;
        }

        let mut apps = self.packages.installed_packages();
        apps.retain(|app| app.is_eligible());
        apps.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        for app in apps {
            current.insert(app.package_name.clone(), app.version_code);
            if previous.get(&app.package_name) == Some(&app.version_code) {
                continue;
            }
            let metadata = PackageMetadata {
                version_code: app.version_code,
                signature_hashes: app.signature_hashes(),
            };
            writer.write_entity(&Entity::put(app.package_name.as_str(), metadata.encode()))?;
            written += 1;
        }

        for gone in previous.keys().filter(|name| !current.contains_key(*name)) {
            tracing::debug!(package = %gone, "package no longer installed, deleting metadata");
            writer.write_entity(&Entity::delete(gone.as_str()))?;
            written += 1;
        }
        writer.into_inner()?;

        for (name, version) in &current {
            writeln!(new_state, "{name} {version}")?;
        }
        tracing::debug!(written, packages = current.len() - 1, "package metadata backed up");
        Ok(written)
    }

    /// Parses a dataset's package metadata.
    ///
    /// A dataset without the global record carries no usable metadata.
    pub fn restore(blob: &[u8]) -> CoreResult<RestoreMetadata> {
        let mut reader = KeyValueReader::new(blob);
        let mut platform = None;
        let mut packages = HashMap::new();
        while let Some(entity) = reader.next_entity()? {
            let Some(value) = entity.value else {
                packages.remove(&entity.key);
                continue;
            };
            if entity.key == META_KEY {
                let bytes: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| CodecError::malformed_kv("bad global metadata record"))?;
                platform = Some(i64::from_be_bytes(bytes));
            } else {
                let metadata = PackageMetadata::decode(&entity.key, &value)?;
                packages.insert(entity.key, metadata);
            }
        }
        let platform = platform
            .ok_or_else(|| CoreError::invalid_state("dataset carries no package metadata"))?;
        Ok(RestoreMetadata {
            platform_version: i32::try_from(platform).unwrap_or(i32::MAX),
            packages,
        })
    }
}

fn parse_state(reader: &mut dyn Read) -> CoreResult<BTreeMap<String, i64>> {
    let mut state = BTreeMap::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        let Some((name, version)) = line.rsplit_once(' ') else {
            continue;
        };
        if let Ok(version) = version.parse() {
            state.insert(name.to_string(), version);
        }
    }
    Ok(state)
}
