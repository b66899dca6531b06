//! Local bookkeeping: pending requests, the full-data schedule and dataset
//! identity.
//!
//! Pending key-value requests live in memory and in an append-only journal,
//! so requests made before a crash are picked up on the next start. A pass
//! takes the pending set together with the journal that recorded it and
//! deletes that journal once every request in it has either been served or
//! re-queued (re-queued requests go to a fresh journal).
//!
//! Everything else is persisted as one JSON document.

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One package in the full-data round-robin schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBackupEntry {
    /// Package name.
    pub package_name: String,
    /// Milliseconds since the epoch of the last successful full backup.
    pub last_backup: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    current_token: u64,
    ancestral_token: u64,
    ancestral_packages: BTreeSet<String>,
    ever_stored: BTreeSet<String>,
    full_queue: Vec<FullBackupEntry>,
}

/// Journal file recording a batch of requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Location on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the journal. A journal that is already gone is fine.
    pub fn delete(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to delete journal");
            }
        }
    }
}

/// Persistent and in-memory scheduling state.
#[derive(Debug)]
pub struct Bookkeeping {
    path: PathBuf,
    journal_dir: PathBuf,
    pending: HashSet<String>,
    journal: Option<Journal>,
    next_journal: u64,
    persisted: Persisted,
}

impl Bookkeeping {
    /// Loads bookkeeping from `path`, recovering requests from every
    /// journal left in `journal_dir`.
    pub fn open(path: impl Into<PathBuf>, journal_dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let journal_dir = journal_dir.into();
        fs::create_dir_all(&journal_dir)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let persisted = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Persisted::default(),
            Err(e) => return Err(e.into()),
        };

        let mut book = Self {
            path,
            journal_dir,
            pending: HashSet::new(),
            journal: None,
            next_journal: 0,
            persisted,
        };
        book.recover_journals()?;
        Ok(book)
    }

    fn recover_journals(&mut self) -> CoreResult<()> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.journal_dir)? {
            let path = entry?.path();
            let Some(index) = journal_index(&path) else {
                continue;
            };
            self.next_journal = self.next_journal.max(index + 1);
            found.push(path);
        }
        found.sort();

        let mut recovered = Vec::new();
        for path in &found {
            for line in BufReader::new(File::open(path)?).lines() {
                let line = line?;
                let name = line.trim();
                if !name.is_empty() {
                    recovered.push(name.to_string());
                }
            }
        }
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "recovered pending backup requests from journal");
        }
        for name in recovered {
            self.enqueue(&name)?;
        }
        for path in found {
            Journal { path }.delete();
        }
        Ok(())
    }

    /// Records a key-value backup request. Returns true if the package was
    /// not already pending.
    pub fn enqueue(&mut self, package: &str) -> CoreResult<bool> {
        if !self.pending.insert(package.to_string()) {
            return Ok(false);
        }
        let journal = match &self.journal {
            Some(journal) => journal.clone(),
            None => {
                let journal = Journal {
                    path: self.journal_dir.join(format!("journal-{:06}", self.next_journal)),
                };
                self.next_journal += 1;
                self.journal = Some(journal.clone());
                journal
            }
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal.path())?;
        writeln!(file, "{package}")?;
        Ok(true)
    }

    /// Re-queues packages that did not get served.
    pub fn requeue<'a>(&mut self, packages: impl IntoIterator<Item = &'a String>) -> CoreResult<()> {
        for package in packages {
            self.enqueue(package)?;
        }
        Ok(())
    }

    /// Returns true if a request for `package` is pending.
    #[must_use]
    pub fn is_pending(&self, package: &str) -> bool {
        self.pending.contains(package)
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Takes every pending request, sorted by name, with the journal that
    /// recorded them.
    pub fn take_pending(&mut self) -> (Vec<String>, Option<Journal>) {
        let mut packages: Vec<String> = self.pending.drain().collect();
        packages.sort();
        (packages, self.journal.take())
    }

    /// Token of the dataset this device writes to; 0 before the first
    /// successful pass.
    #[must_use]
    pub fn current_token(&self) -> u64 {
        self.persisted.current_token
    }

    /// Records the dataset token.
    pub fn set_current_token(&mut self, token: u64) -> CoreResult<()> {
        self.persisted.current_token = token;
        self.save()
    }

    /// Token and packages of the last whole-device restore.
    #[must_use]
    pub fn ancestral(&self) -> (u64, &BTreeSet<String>) {
        (self.persisted.ancestral_token, &self.persisted.ancestral_packages)
    }

    /// Records the result of a whole-device restore.
    pub fn set_ancestral(&mut self, token: u64, packages: impl IntoIterator<Item = String>) -> CoreResult<()> {
        self.persisted.ancestral_token = token;
        self.persisted.ancestral_packages = packages.into_iter().collect();
        self.save()
    }

    /// Returns true if data for `package` was ever stored.
    #[must_use]
    pub fn ever_stored(&self, package: &str) -> bool {
        self.persisted.ever_stored.contains(package)
    }

    /// Marks `package` as stored.
    pub fn mark_stored(&mut self, package: &str) -> CoreResult<()> {
        if self.persisted.ever_stored.insert(package.to_string()) {
            self.save()?;
        }
        Ok(())
    }

    /// The full-data schedule, least recently backed up first.
    #[must_use]
    pub fn full_queue(&self) -> &[FullBackupEntry] {
        &self.persisted.full_queue
    }

    /// Adds a package to the full-data schedule. A package already
    /// scheduled keeps its place.
    pub fn schedule_full(&mut self, package: &str, last_backup: u64) -> CoreResult<bool> {
        if self
            .persisted
            .full_queue
            .iter()
            .any(|e| e.package_name == package)
        {
            return Ok(false);
        }
        self.persisted.full_queue.push(FullBackupEntry {
            package_name: package.to_string(),
            last_backup,
        });
        self.sort_full_queue();
        self.save()?;
        Ok(true)
    }

    /// Moves a package to the tail of the full-data schedule.
    pub fn mark_full_backed_up(&mut self, package: &str, when: u64) -> CoreResult<()> {
        self.persisted
            .full_queue
            .retain(|e| e.package_name != package);
        let tail = self
            .persisted
            .full_queue
            .last()
            .map_or(when, |e| e.last_backup.max(when));
        self.persisted.full_queue.push(FullBackupEntry {
            package_name: package.to_string(),
            last_backup: tail,
        });
        self.sort_full_queue();
        self.save()
    }

    /// Drops a package from the full-data schedule.
    pub fn unschedule_full(&mut self, package: &str) -> CoreResult<()> {
        let before = self.persisted.full_queue.len();
        self.persisted
            .full_queue
            .retain(|e| e.package_name != package);
        if self.persisted.full_queue.len() != before {
            self.save()?;
        }
        Ok(())
    }

    /// Forgets everything tied to the remote dataset after it was wiped.
    pub fn reset_dataset(&mut self) -> CoreResult<()> {
        self.persisted.current_token = 0;
        self.persisted.ever_stored.clear();
        for entry in &mut self.persisted.full_queue {
            entry.last_backup = 0;
        }
        self.save()
    }

    /// Writes the persisted document.
    pub fn save(&self) -> CoreResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.persisted)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn sort_full_queue(&mut self) {
        // Stable, so packages with equal timestamps keep insertion order.
        self.persisted.full_queue.sort_by_key(|e| e.last_backup);
    }
}

fn journal_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("journal-")?
        .parse()
        .ok()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
