//! Wildcard ("tailx") source: many files matched by a glob, each tailed with
//! its own cursor.
//!
//! Rescan and expiry run on their own intervals, checked at the start of each
//! collect. Files found while every slot is taken wait in a deferred queue
//! and are opened as slots free up. Expired files leave a tombstone cursor
//! behind so that a later rescan neither rereads them nor resurrects them
//! until they grow again.

use crate::config::types::{TailxConfig, Whence};
use crate::source::cursor::{Cursor, FileTail};
use crate::source::identity::identity_of_path;
use crate::source::{CollectSource, SourceError, SourceOutput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

pub struct MultiFileSource {
    pattern: String,
    expire: Duration,
    stat_interval: Duration,
    max_open_files: usize,
    whence: Whence,
    max_lines: usize,

    active: BTreeMap<PathBuf, FileTail>,
    /// No longer matching the glob; closed once drained.
    stale: HashSet<PathBuf>,
    deferred: VecDeque<PathBuf>,
    /// Restored or expired positions, consulted when a path is (re)opened.
    saved: HashMap<PathBuf, Cursor>,
    last_rescan: Option<DateTime<Utc>>,
    scanned_once: bool,
    /// Matched by the first scan and not opened yet. These honour whence.
    preexisting: HashSet<PathBuf>,
    next_turn: usize,
}

impl MultiFileSource {
    pub fn new(
        pattern: String,
        config: &TailxConfig,
        whence: Whence,
        max_lines: usize,
    ) -> Result<Self, SourceError> {
        glob::Pattern::new(&pattern).map_err(|e| SourceError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;

        Ok(Self {
            pattern,
            expire: config.expire,
            stat_interval: config.stat_interval,
            max_open_files: config.max_open_files.max(1),
            whence,
            max_lines,
            active: BTreeMap::new(),
            stale: HashSet::new(),
            deferred: VecDeque::new(),
            saved: HashMap::new(),
            last_rescan: None,
            scanned_once: false,
            preexisting: HashSet::new(),
            next_turn: 0,
        })
    }

    pub fn active_paths(&self) -> Vec<PathBuf> {
        self.active.keys().cloned().collect()
    }

    pub fn deferred_paths(&self) -> Vec<PathBuf> {
        self.deferred.iter().cloned().collect()
    }

    fn matches(&self) -> Result<Vec<PathBuf>, SourceError> {
        let entries = glob::glob(&self.pattern).map_err(|e| SourceError::InvalidPattern {
            pattern: self.pattern.clone(),
            message: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => paths.push(path),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Skipping unreadable glob entry"),
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Re-evaluates the glob: opens new matches up to the open-file limit,
    /// defers the excess, and marks cursors whose path stopped matching.
    pub fn rescan(&mut self, now: DateTime<Utc>) -> Result<(), SourceError> {
        let matched = self.matches()?;
        let matched_set: HashSet<&PathBuf> = matched.iter().collect();

        for path in self.active.keys() {
            if !matched_set.contains(path) && self.stale.insert(path.clone()) {
                debug!(path = %path.display(), "File no longer matches pattern");
            }
        }
        self.deferred.retain(|p| matched_set.contains(p));
        self.saved.retain(|p, _| matched_set.contains(p));
        self.preexisting.retain(|p| matched_set.contains(p));
        if !self.scanned_once {
            self.preexisting.extend(matched.iter().cloned());
        }

        let cutoff = SystemTime::now()
            .checked_sub(self.expire)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for path in &matched {
            if self.active.contains_key(path) || self.deferred.contains(path) {
                continue;
            }
            let Ok(metadata) = std::fs::metadata(path) else {
                continue;
            };
            // Untouched for longer than the expiry: not worth a slot.
            if metadata.modified().map(|m| m < cutoff).unwrap_or(false) {
                continue;
            }
            if let Some(saved) = self.saved_for(path) {
                if metadata.len() <= saved.offset {
                    continue;
                }
            }
            self.deferred.push_back(path.clone());
        }

        self.fill_slots(now);
        self.last_rescan = Some(now);
        self.scanned_once = true;
        Ok(())
    }

    /// Closes every cursor idle for longer than the expiry.
    pub fn expire_idle(&mut self, now: DateTime<Utc>) {
        let max_idle = to_chrono(self.expire);
        let expired: Vec<PathBuf> = self
            .active
            .iter()
            .filter(|(_, tail)| now - tail.last_activity() > max_idle)
            .map(|(path, _)| path.clone())
            .collect();

        for path in expired {
            if let Some(tail) = self.active.remove(&path) {
                info!(path = %path.display(), "Closing idle file");
                self.saved.insert(path.clone(), tail.cursor().clone());
            }
            self.stale.remove(&path);
        }
        self.fill_slots(now);
    }

    fn fill_slots(&mut self, now: DateTime<Utc>) {
        while self.active.len() < self.max_open_files {
            let Some(path) = self.deferred.pop_front() else {
                break;
            };
            // Files present at the first scan honour whence, even when they
            // waited for a slot. Later arrivals are new and read in full.
            let whence = if self.preexisting.remove(&path) {
                self.whence
            } else {
                Whence::Oldest
            };
            let saved = self.take_saved(&path);
            let start = FileTail::resume(&path, saved.as_ref(), whence);
            match start {
                Ok(mut tail) => {
                    debug!(path = %path.display(), offset = tail.offset(), "Opened file");
                    tail.touch(now);
                    self.active.insert(path, tail);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to open matched file"),
            }
        }
    }

    /// The saved cursor describing the file currently at `path`, wherever it
    /// was recorded. Rotation may have moved it under another name.
    fn saved_for(&self, path: &Path) -> Option<&Cursor> {
        let identity = identity_of_path(path).ok()?;
        self.saved.values().find(|c| c.identity.same_file(&identity))
    }

    fn take_saved(&mut self, path: &Path) -> Option<Cursor> {
        let key = self.saved_for(path).map(|c| c.path.clone())?;
        self.saved.remove(&key)
    }

    fn evict(&mut self, path: &Path) {
        self.active.remove(path);
        self.stale.remove(path);
    }

    fn due_for_rescan(&self, now: DateTime<Utc>) -> bool {
        match self.last_rescan {
            None => true,
            Some(last) => now - last >= to_chrono(self.stat_interval),
        }
    }

    /// One round-robin pass over the open files, starting one file later than
    /// the previous pass so a busy file cannot starve the others.
    fn read_round(&mut self) -> Vec<String> {
        let paths: Vec<PathBuf> = self.active.keys().cloned().collect();
        if paths.is_empty() {
            return Vec::new();
        }
        let start = self.next_turn % paths.len();
        self.next_turn = self.next_turn.wrapping_add(1);

        let mut lines = Vec::new();
        let mut drained_stale = Vec::new();
        let mut failed = Vec::new();
        let mut rotated = Vec::new();

        for path in paths.iter().cycle().skip(start).take(paths.len()) {
            if lines.len() >= self.max_lines {
                break;
            }
            let Some(tail) = self.active.get_mut(path) else {
                continue;
            };
            match tail.read_lines(self.max_lines - lines.len()) {
                Ok(read) => {
                    let drained = read.is_empty();
                    lines.extend(read);
                    if drained && self.stale.contains(path) {
                        drained_stale.push(path.clone());
                    } else if drained {
                        if let Ok(id) = identity_of_path(path) {
                            if !id.same_file(tail.identity()) {
                                // Same name, new file: pick it up on the next rescan.
                                info!(path = %path.display(), "File rotated, reopening");
                                rotated.push(tail.cursor().clone());
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read file, dropping its cursor");
                    failed.push(path.clone());
                }
            }
        }

        for path in drained_stale.iter().chain(failed.iter()) {
            self.evict(path);
        }
        for cursor in rotated {
            let path = cursor.path.clone();
            self.evict(&path);
            self.saved.insert(path, cursor);
        }
        lines
    }

    #[cfg(test)]
    fn set_last_activity(&mut self, path: &std::path::Path, at: DateTime<Utc>) {
        if let Some(tail) = self.active.get_mut(path) {
            tail.touch(at);
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

#[async_trait]
impl CollectSource for MultiFileSource {
    fn kind(&self) -> &'static str {
        "tailx"
    }

    async fn collect(&mut self) -> Result<SourceOutput, SourceError> {
        let now = Utc::now();
        self.expire_idle(now);
        if self.due_for_rescan(now) {
            if let Err(e) = self.rescan(now) {
                warn!(pattern = %self.pattern, error = %e, "Rescan failed");
            }
        }

        let before = self.active.len();
        let lines = self.read_round();
        if self.active.len() < before {
            // Rotated files are reopened right away rather than a full interval later.
            if let Err(e) = self.rescan(now) {
                warn!(pattern = %self.pattern, error = %e, "Rescan failed");
            }
        }
        Ok(SourceOutput::Lines(lines))
    }

    fn cursors(&self) -> Vec<Cursor> {
        self.active
            .values()
            .map(|tail| tail.cursor().clone())
            .chain(self.saved.values().cloned())
            .collect()
    }

    fn restore_cursors(&mut self, cursors: Vec<Cursor>) {
        self.active.clear();
        self.stale.clear();
        self.deferred.clear();
        self.saved = cursors.into_iter().map(|c| (c.path.clone(), c)).collect();
        self.last_rescan = None;
    }

    fn reset(&mut self) {
        self.active.clear();
        self.stale.clear();
        self.deferred.clear();
        self.saved.clear();
        self.preexisting.clear();
        self.last_rescan = None;
        self.scanned_once = false;
        self.whence = Whence::Oldest;
    }
}
