//! Durable per-day completion ledger.
//!
//! The ledger answers one question: has this work unit already been done
//! for this account today? Entries live under
//! `<dir>/<date_key>/<account_key>.json`, so a new calendar day starts with
//! an empty directory and every unit becomes eligible again without any
//! expiry logic. Old day directories are removed by [`JobLedger::prune`].
//!
//! Writes are atomic (temp file + rename) under an exclusive `fs2` lock.
//! Partitioning guarantees that only one worker touches a given account at a
//! time, so the lock is rarely contended.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{DroverError, Result};

/// Date key format used for day directories.
pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// On-disk record of one account's completed units for one day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DayRecord {
    units: BTreeSet<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// File-backed store of completed work units.
#[derive(Debug, Clone)]
pub struct JobLedger {
    dir: PathBuf,
}

impl JobLedger {
    /// Creates a ledger rooted at `dir`. Nothing is touched until the first write.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Root directory of the ledger.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable storage key for an account identifier.
    ///
    /// Raw identifiers (usually e-mail addresses) never reach the disk.
    ///
    /// # Example
    ///
    /// ```
    /// use drover::ledger::JobLedger;
    ///
    /// let key = JobLedger::account_key("someone@example.com");
    /// assert_eq!(key.len(), 32);
    /// assert_eq!(key, JobLedger::account_key("someone@example.com"));
    /// ```
    #[must_use]
    pub fn account_key(account: &str) -> String {
        let digest = Sha256::digest(account.trim().to_lowercase().as_bytes());
        hex::encode(&digest[..16])
    }

    /// Date key for the local calendar day.
    #[must_use]
    pub fn today() -> String {
        Local::now().format(DATE_KEY_FORMAT).to_string()
    }

    /// Date key for an arbitrary date.
    #[must_use]
    pub fn date_key(date: NaiveDate) -> String {
        date.format(DATE_KEY_FORMAT).to_string()
    }

    /// Path of the record file for an account and day.
    #[must_use]
    pub fn entry_path(&self, account_key: &str, date_key: &str) -> PathBuf {
        self.dir.join(date_key).join(format!("{account_key}.json"))
    }

    fn lock_path(&self, account_key: &str, date_key: &str) -> PathBuf {
        self.dir
            .join(date_key)
            .join(format!("{account_key}.json{LOCK_SUFFIX}"))
    }

    fn tmp_path(&self, account_key: &str, date_key: &str) -> PathBuf {
        self.dir
            .join(date_key)
            .join(format!("{account_key}.json{TMP_SUFFIX}"))
    }

    /// Whether `work_unit` was marked done for the account on `date_key`.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed keys or unreadable storage.
    pub fn is_done(&self, account_key: &str, date_key: &str, work_unit: &str) -> Result<bool> {
        Ok(self.completed(account_key, date_key)?.contains(work_unit))
    }

    /// All units marked done for the account on `date_key`.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed keys or unreadable storage.
    pub fn completed(&self, account_key: &str, date_key: &str) -> Result<BTreeSet<String>> {
        validate_key("account_key", account_key)?;
        validate_key("date_key", date_key)?;

        let lock_path = self.lock_path(account_key, date_key);
        let _guard = if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file)
                .map_err(|e| DroverError::ledger(format!("Failed to acquire ledger lock: {e}")))?;
            Some(lock_file)
        } else {
            None
        };

        Ok(self.read_record(account_key, date_key)?.units)
    }

    /// Marks `work_unit` done. Idempotent: returns `true` only when the unit
    /// was not already present.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed keys or when the record cannot be written.
    pub fn mark_done(&self, account_key: &str, date_key: &str, work_unit: &str) -> Result<bool> {
        Ok(self.mark_all(account_key, date_key, [work_unit])? == 1)
    }

    /// Marks several units done in one write. Returns how many were new.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed keys or when the record cannot be written.
    pub fn mark_all<I, S>(&self, account_key: &str, date_key: &str, units: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        validate_key("account_key", account_key)?;
        validate_key("date_key", date_key)?;

        let day_dir = self.dir.join(date_key);
        fs::create_dir_all(&day_dir)?;

        let lock_file = File::create(self.lock_path(account_key, date_key))?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| DroverError::ledger(format!("Failed to acquire ledger lock: {e}")))?;

        let mut record = self.read_record(account_key, date_key)?;
        let before = record.units.len();
        record
            .units
            .extend(units.into_iter().map(|u| u.as_ref().to_string()));
        let added = record.units.len() - before;

        if added == 0 {
            return Ok(0);
        }

        record.updated_at = Some(Utc::now());
        let tmp_path = self.tmp_path(account_key, date_key);
        let json = serde_json::to_string_pretty(&record)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.entry_path(account_key, date_key))?;
        debug!(
            "Ledger: {} new unit(s) for {} on {}",
            added, account_key, date_key
        );

        Ok(added)
    }

    fn read_record(&self, account_key: &str, date_key: &str) -> Result<DayRecord> {
        let path = self.entry_path(account_key, date_key);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DayRecord::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(
                    "Corrupted ledger file at {}: {}. Treating as empty.",
                    path.display(),
                    e
                );
                Ok(DayRecord::default())
            }
        }
    }

    /// Date keys currently present, oldest first. Non-date entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger directory exists but cannot be listed.
    pub fn days(&self) -> Result<Vec<NaiveDate>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut days: Vec<NaiveDate> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                NaiveDate::parse_from_str(&entry.file_name().to_string_lossy(), DATE_KEY_FORMAT)
                    .ok()
            })
            .collect();
        days.sort();
        Ok(days)
    }

    /// Retention sweep: deletes day directories more than `keep_days` days
    /// older than `today`. Returns the removed days.
    ///
    /// # Errors
    ///
    /// Returns an error if a day directory cannot be removed.
    pub fn prune(&self, keep_days: u32, today: NaiveDate) -> Result<Vec<NaiveDate>> {
        let mut removed = Vec::new();
        for day in self.days()? {
            let age = (today - day).num_days();
            if age > i64::from(keep_days) {
                fs::remove_dir_all(self.dir.join(Self::date_key(day)))?;
                removed.push(day);
            }
        }
        if !removed.is_empty() {
            debug!("Ledger: pruned {} day(s)", removed.len());
        }
        Ok(removed)
    }
}

/// Keys become path components, so only a conservative alphabet is allowed.
fn validate_key(kind: &str, key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DroverError::ledger(format!("invalid {kind}: {key:?}")))
    }
}
