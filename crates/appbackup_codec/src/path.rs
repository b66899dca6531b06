//! Archive path layout and domain tokens.
//!
//! Application records live under `apps/<package>/<domain>/<path>`.
//! Shared-storage records live under `shared/<path>` and are attributed to
//! the [`SHARED_STORAGE_PACKAGE`] pseudo-package. Manifest and metadata
//! records sit directly under the package directory.

/// Prefix of application data records.
pub const APPS_PREFIX: &str = "apps/";
/// Prefix of shared-storage records.
pub const SHARED_PREFIX: &str = "shared/";
/// Pseudo-package that owns shared-storage records.
pub const SHARED_STORAGE_PACKAGE: &str = "com.android.sharedstoragebackup";

/// File name of the manifest record.
pub const MANIFEST_FILENAME: &str = "_manifest";
/// File name of the metadata record.
pub const METADATA_FILENAME: &str = "_meta";

/// Domain of the application package file.
pub const DOMAIN_APK: &str = "a";
/// Domain of expansion files.
pub const DOMAIN_OBB: &str = "obb";
/// Application root directory.
pub const DOMAIN_ROOT: &str = "r";
/// Application files directory.
pub const DOMAIN_FILES: &str = "f";
/// Application databases.
pub const DOMAIN_DATABASES: &str = "db";
/// Application shared preferences.
pub const DOMAIN_SHAREDPREFS: &str = "sp";
/// Application cache directory.
pub const DOMAIN_CACHE: &str = "c";
/// Legacy no-backup directory.
pub const DOMAIN_NO_BACKUP: &str = "nb";
/// External files directory.
pub const DOMAIN_EXTERNAL_FILES: &str = "ef";
/// Device-protected root directory.
pub const DOMAIN_DEVICE_ROOT: &str = "d_r";
/// Device-protected files directory.
pub const DOMAIN_DEVICE_FILES: &str = "d_f";
/// Device-protected databases.
pub const DOMAIN_DEVICE_DATABASES: &str = "d_db";
/// Device-protected shared preferences.
pub const DOMAIN_DEVICE_SHAREDPREFS: &str = "d_sp";
/// Device-protected cache directory.
pub const DOMAIN_DEVICE_CACHE: &str = "d_c";
/// Device-protected no-backup directory.
pub const DOMAIN_DEVICE_NO_BACKUP: &str = "d_nb";
/// Domain given to shared-storage records.
pub const DOMAIN_SHARED: &str = "shared";

/// Where a record belongs, derived from its archive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPath {
    /// The manifest record of a package.
    Manifest {
        /// Owning package.
        package: String,
    },
    /// The metadata record of a package.
    Metadata {
        /// Owning package.
        package: String,
    },
    /// A data record.
    Data {
        /// Owning package.
        package: String,
        /// Domain token.
        domain: String,
        /// Path relative to the domain root.
        path: String,
    },
}

impl RecordPath {
    /// Returns the owning package.
    #[must_use]
    pub fn package(&self) -> &str {
        match self {
            RecordPath::Manifest { package }
            | RecordPath::Metadata { package }
            | RecordPath::Data { package, .. } => package,
        }
    }
}

/// Splits an archive path into its owning package, domain and remainder.
///
/// Returns `None` for paths outside both known prefixes, and for
/// application paths too short to name a domain.
#[must_use]
pub fn parse_record_path(path: &str) -> Option<RecordPath> {
    if let Some(rest) = path.strip_prefix(SHARED_PREFIX) {
        return Some(RecordPath::Data {
            package: SHARED_STORAGE_PACKAGE.to_string(),
            domain: DOMAIN_SHARED.to_string(),
            path: rest.to_string(),
        });
    }

    let rest = path.strip_prefix(APPS_PREFIX)?;
    let (package, rest) = rest.split_once('/')?;
    if package.is_empty() {
        return None;
    }

    // Exact names first; a domain directory could otherwise swallow them.
    if rest == MANIFEST_FILENAME {
        return Some(RecordPath::Manifest {
            package: package.to_string(),
        });
    }
    if rest == METADATA_FILENAME {
        return Some(RecordPath::Metadata {
            package: package.to_string(),
        });
    }

    let (domain, remainder) = match rest.split_once('/') {
        Some((domain, remainder)) => (domain, remainder),
        None => (rest, ""),
    };
    if domain.is_empty() {
        return None;
    }
    Some(RecordPath::Data {
        package: package.to_string(),
        domain: domain.to_string(),
        path: remainder.to_string(),
    })
}

/// Builds the archive path of a data record.
#[must_use]
pub fn data_path(package: &str, domain: &str, path: &str) -> String {
    if package == SHARED_STORAGE_PACKAGE && domain == DOMAIN_SHARED {
        return format!("{SHARED_PREFIX}{path}");
    }
    if path.is_empty() {
        format!("{APPS_PREFIX}{package}/{domain}")
    } else {
        format!("{APPS_PREFIX}{package}/{domain}/{path}")
    }
}

/// Builds the archive path of a package manifest.
#[must_use]
pub fn manifest_path(package: &str) -> String {
    format!("{APPS_PREFIX}{package}/{MANIFEST_FILENAME}")
}

/// Builds the archive path of a package metadata record.
#[must_use]
pub fn metadata_path(package: &str) -> String {
    format!("{APPS_PREFIX}{package}/{METADATA_FILENAME}")
}

/// Rejects paths that could escape the domain root.
///
/// A path is unsafe when any segment is `..` or when it contains an empty
/// segment (`//`).
#[must_use]
pub fn is_sane_path(path: &str) -> bool {
    if path.contains("//") {
        return false;
    }
    !path.split('/').any(|segment| segment == "..")
}

/// Returns true if records in this domain are never restored.
#[must_use]
pub fn is_excluded_domain(domain: &str) -> bool {
    matches!(
        domain,
        DOMAIN_CACHE | DOMAIN_NO_BACKUP | DOMAIN_DEVICE_CACHE | DOMAIN_DEVICE_NO_BACKUP
    )
}
