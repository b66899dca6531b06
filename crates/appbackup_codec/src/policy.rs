//! Restore admission policy.
//!
//! A package's policy is decided once, from the manifest at the head of
//! its archive segment, and only ever moves in one direction afterwards:
//! `AcceptIfApk` resolves to `Accept` or `Ignore` after the package file is
//! installed, and anything can degrade to `Ignore`. Nothing leaves `Ignore`.

use crate::manifest::{hash_signature, Manifest};
use std::collections::HashMap;

/// An installed application as reported by the package manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    /// Package name.
    pub package_name: String,
    /// Installed version code.
    pub version_code: i64,
    /// Signing certificates of the installed application.
    pub signatures: Vec<Vec<u8>>,
    /// Whether the application allows its data to be backed up.
    pub allow_backup: bool,
    /// Whether the application declares a backup agent.
    pub has_agent: bool,
    /// Whether an application with an agent still wants full-data backup.
    pub full_backup_only: bool,
    /// Whether the application lives on the system partition.
    pub is_system: bool,
    /// Whether the application runs under a system uid.
    pub system_uid: bool,
    /// Whether the application accepts data from newer versions of itself.
    pub restore_any_version: bool,
    /// Whether the application is in the stopped state.
    pub stopped: bool,
    /// Package that installed the application.
    pub installer: Option<String>,
}

impl AppInfo {
    /// Creates a plain third-party application with a backup agent.
    pub fn new(package_name: impl Into<String>, version_code: i64) -> Self {
        Self {
            package_name: package_name.into(),
            version_code,
            signatures: Vec::new(),
            allow_backup: true,
            has_agent: true,
            full_backup_only: false,
            is_system: false,
            system_uid: false,
            restore_any_version: false,
            stopped: false,
            installer: None,
        }
    }

    /// Sets the signing certificates.
    #[must_use]
    pub fn with_signatures(mut self, signatures: Vec<Vec<u8>>) -> Self {
        self.signatures = signatures;
        self
    }

    /// Returns true if the application takes part in backup at all.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.allow_backup && !(self.system_uid && !self.has_agent)
    }

    /// Returns true if the application's data goes through key-value backup.
    #[must_use]
    pub fn wants_key_value(&self) -> bool {
        self.has_agent && !self.full_backup_only
    }

    /// Returns true if the application's data goes through full-data backup.
    #[must_use]
    pub fn wants_full_backup(&self) -> bool {
        !self.has_agent || self.full_backup_only
    }

    /// SHA-256 hashes of the installed signatures.
    #[must_use]
    pub fn signature_hashes(&self) -> Vec<[u8; 32]> {
        self.signatures.iter().map(|s| hash_signature(s)).collect()
    }
}

/// Per-package restore admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestorePolicy {
    /// Consume and discard every record.
    Ignore,
    /// Deliver records to the destination.
    Accept,
    /// Accept only after installing the package file carried in the archive.
    AcceptIfApk,
}

/// Why a policy was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyReason {
    /// Installed, signatures match, version acceptable.
    Accepted,
    /// Not installed; the archive carries a package file that may be installed.
    InstallFromArchive,
    /// Not installed and installation from the archive is not possible.
    NotInstalled,
    /// The installed application disallows backup.
    BackupDisallowed,
    /// System-uid application without an agent.
    SystemWithoutAgent,
    /// The archive declares no signatures.
    MissingSignatures,
    /// The archive signatures do not match the installed ones.
    SignatureMismatch,
    /// The archive comes from a newer version than the installed one.
    VersionTooNew,
}

/// A policy together with the reason it was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Chosen policy.
    pub policy: RestorePolicy,
    /// Reason for the choice.
    pub reason: PolicyReason,
}

impl PolicyDecision {
    const fn new(policy: RestorePolicy, reason: PolicyReason) -> Self {
        Self { policy, reason }
    }
}

/// Decides a package's policy from its manifest and the installed state.
#[must_use]
pub fn evaluate_manifest(manifest: &Manifest, installed: Option<&AppInfo>, allow_apks: bool) -> PolicyDecision {
    use PolicyReason as R;
    use RestorePolicy as P;

    if manifest.signatures.is_empty() {
        return PolicyDecision::new(P::Ignore, R::MissingSignatures);
    }

    let Some(app) = installed else {
        return if allow_apks && manifest.has_apk {
            PolicyDecision::new(P::AcceptIfApk, R::InstallFromArchive)
        } else {
            PolicyDecision::new(P::Ignore, R::NotInstalled)
        };
    };

    if !app.allow_backup {
        return PolicyDecision::new(P::Ignore, R::BackupDisallowed);
    }
    if app.system_uid && !app.has_agent {
        return PolicyDecision::new(P::Ignore, R::SystemWithoutAgent);
    }
    if !signatures_match(&manifest.signatures, app) {
        return PolicyDecision::new(P::Ignore, R::SignatureMismatch);
    }
    if manifest.version_code > app.version_code && !app.restore_any_version {
        return PolicyDecision::new(P::Ignore, R::VersionTooNew);
    }
    PolicyDecision::new(P::Accept, R::Accepted)
}

/// Returns true if every installed signature appears among the stored ones.
///
/// System-partition applications are exempt.
#[must_use]
pub fn signatures_match(stored: &[Vec<u8>], installed: &AppInfo) -> bool {
    if installed.is_system {
        return true;
    }
    if stored.is_empty() || installed.signatures.is_empty() {
        return false;
    }
    installed
        .signatures
        .iter()
        .all(|sig| stored.iter().any(|s| s == sig))
}

/// Same check as [`signatures_match`] against stored signature hashes.
#[must_use]
pub fn signature_hashes_match(stored: &[[u8; 32]], installed: &AppInfo) -> bool {
    if installed.is_system {
        return true;
    }
    if stored.is_empty() || installed.signatures.is_empty() {
        return false;
    }
    installed
        .signature_hashes()
        .iter()
        .all(|hash| stored.contains(hash))
}

/// Policies of every package seen in one decode pass.
#[derive(Debug, Default)]
pub struct PolicyTable {
    policies: HashMap<String, RestorePolicy>,
}

impl PolicyTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a package's policy. Packages whose manifest has not been
    /// seen are ignored.
    #[must_use]
    pub fn get(&self, package: &str) -> RestorePolicy {
        self.policies
            .get(package)
            .copied()
            .unwrap_or(RestorePolicy::Ignore)
    }

    /// Returns true if a manifest for the package has been admitted.
    #[must_use]
    pub fn contains(&self, package: &str) -> bool {
        self.policies.contains_key(package)
    }

    /// Records the policy decided from a manifest. A package already
    /// ignored in this pass stays ignored.
    pub fn admit(&mut self, package: &str, policy: RestorePolicy) -> RestorePolicy {
        let entry = self
            .policies
            .entry(package.to_string())
            .or_insert(policy);
        if *entry != RestorePolicy::Ignore {
            *entry = policy;
        }
        *entry
    }

    /// Resolves an `AcceptIfApk` package after its package file was handled.
    /// Has no effect on packages in any other state.
    pub fn resolve_install(&mut self, package: &str, accepted: bool) -> RestorePolicy {
        match self.policies.get_mut(package) {
            Some(policy) if *policy == RestorePolicy::AcceptIfApk => {
                *policy = if accepted {
                    RestorePolicy::Accept
                } else {
                    RestorePolicy::Ignore
                };
                *policy
            }
            Some(policy) => {
                tracing::warn!(package, ?policy, "install resolution outside AcceptIfApk ignored");
                *policy
            }
            None => RestorePolicy::Ignore,
        }
    }

    /// Drops a package to `Ignore` for the rest of the pass.
    pub fn degrade(&mut self, package: &str) {
        self.policies
            .insert(package.to_string(), RestorePolicy::Ignore);
    }

    /// Iterates over recorded policies.
    pub fn iter(&self) -> impl Iterator<Item = (&str, RestorePolicy)> {
        self.policies.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: &[u8] = b"cert-a";

    fn installed(version: i64) -> AppInfo {
        AppInfo::new("com.example", version).with_signatures(vec![SIG.to_vec()])
    }

    fn manifest(version: i64) -> Manifest {
        Manifest::new("com.example", version, 33).with_signatures(vec![SIG.to_vec()])
    }

    #[test]
    fn accept_when_everything_matches() {
        let d = evaluate_manifest(&manifest(5), Some(&installed(5)), false);
        assert_eq!(d.policy, RestorePolicy::Accept);
        let d = evaluate_manifest(&manifest(4), Some(&installed(5)), false);
        assert_eq!(d.policy, RestorePolicy::Accept);
    }

    #[test]
    fn unsigned_archive_is_ignored_before_anything_else() {
        let unsigned = Manifest::new("com.example", 5, 33).with_apk(true);
        let missing = PolicyDecision::new(RestorePolicy::Ignore, PolicyReason::MissingSignatures);

        let mut system = installed(5);
        system.is_system = true;
        assert_eq!(evaluate_manifest(&unsigned, Some(&system), true), missing);
        assert_eq!(evaluate_manifest(&unsigned, None, true), missing);
        assert_eq!(evaluate_manifest(&unsigned, Some(&installed(5)), false), missing);
    }

    #[test]
    fn signed_archive_for_system_app_is_accepted() {
        let mut system = AppInfo::new("com.example", 5);
        system.is_system = true;
        assert_eq!(evaluate_manifest(&manifest(5), Some(&system), false).policy, RestorePolicy::Accept);
    }

    #[test]
    fn newer_archive_version() {
        let d = evaluate_manifest(&manifest(6), Some(&installed(5)), true);
        assert_eq!(d, PolicyDecision::new(RestorePolicy::Ignore, PolicyReason::VersionTooNew));

        let mut any = installed(5);
        any.restore_any_version = true;
        assert_eq!(evaluate_manifest(&manifest(6), Some(&any), false).policy, RestorePolicy::Accept);
    }

    #[test]
    fn not_installed() {
        let with_apk = manifest(1).with_apk(true);
        assert_eq!(evaluate_manifest(&with_apk, None, true).policy, RestorePolicy::AcceptIfApk);
        assert_eq!(evaluate_manifest(&with_apk, None, false).policy, RestorePolicy::Ignore);
        assert_eq!(evaluate_manifest(&manifest(1), None, true).reason, PolicyReason::NotInstalled);
    }

    #[test]
    fn rejections() {
        let mut app = installed(5);
        app.allow_backup = false;
        assert_eq!(evaluate_manifest(&manifest(5), Some(&app), true).reason, PolicyReason::BackupDisallowed);

        let mut app = installed(5);
        app.system_uid = true;
        app.has_agent = false;
        assert_eq!(evaluate_manifest(&manifest(5), Some(&app), true).reason, PolicyReason::SystemWithoutAgent);

        let unsigned = Manifest::new("com.example", 5, 33);
        assert_eq!(evaluate_manifest(&unsigned, Some(&installed(5)), true).reason, PolicyReason::MissingSignatures);

        let other = Manifest::new("com.example", 5, 33).with_signatures(vec![b"cert-b".to_vec()]);
        assert_eq!(evaluate_manifest(&other, Some(&installed(5)), true).reason, PolicyReason::SignatureMismatch);
    }

    #[test]
    fn system_partition_skips_signature_check() {
        let mut app = installed(5);
        app.is_system = true;
        let other = Manifest::new("com.example", 5, 33).with_signatures(vec![b"cert-b".to_vec()]);
        assert_eq!(evaluate_manifest(&other, Some(&app), false).policy, RestorePolicy::Accept);
    }

    #[test]
    fn installed_signatures_must_all_be_stored() {
        let app = AppInfo::new("p", 1).with_signatures(vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(!signatures_match(&[b"a".to_vec()], &app));
        assert!(signatures_match(&[b"b".to_vec(), b"a".to_vec(), b"c".to_vec()], &app));
        assert!(signature_hashes_match(&[hash_signature(b"a"), hash_signature(b"b")], &app));
        assert!(!signature_hashes_match(&[], &app));
    }

    #[test]
    fn ignore_is_sticky() {
        let mut table = PolicyTable::new();
        assert_eq!(table.get("p"), RestorePolicy::Ignore);
        table.admit("p", RestorePolicy::Accept);
        table.degrade("p");
        assert_eq!(table.admit("p", RestorePolicy::Accept), RestorePolicy::Ignore);
        assert_eq!(table.resolve_install("p", true), RestorePolicy::Ignore);
    }

    #[test]
    fn install_resolution() {
        let mut table = PolicyTable::new();
        table.admit("p", RestorePolicy::AcceptIfApk);
        assert_eq!(table.resolve_install("p", true), RestorePolicy::Accept);
        // Already resolved: a second resolution is a no-op.
        assert_eq!(table.resolve_install("p", false), RestorePolicy::Accept);

        table.admit("q", RestorePolicy::AcceptIfApk);
        assert_eq!(table.resolve_install("q", false), RestorePolicy::Ignore);
    }

    #[test]
    fn app_routing() {
        let app = AppInfo::new("p", 1);
        assert!(app.wants_key_value());
        assert!(!app.wants_full_backup());
        let mut full = AppInfo::new("q", 1);
        full.has_agent = false;
        assert!(full.wants_full_backup());
        assert!(full.is_eligible());
        full.system_uid = true;
        assert!(!full.is_eligible());
    }
}
