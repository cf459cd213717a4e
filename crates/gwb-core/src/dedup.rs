//! Persisted record of members already welcomed per group.
//!
//! The backing file is JSON Lines, one `{"group_id", "member_id"}` object per
//! line. It is read fully once when the cache is opened and only appended to
//! afterwards.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{GroupId, MemberId},
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupEntry {
    pub group_id: GroupId,
    pub member_id: MemberId,
}

#[derive(Debug)]
pub struct DedupCache {
    path: Option<PathBuf>,
    entries: HashSet<DedupEntry>,
    skipped_lines: usize,
}

impl DedupCache {
    /// Cache that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: HashSet::new(),
            skipped_lines: 0,
        }
    }

    /// Load every entry from `path`. A missing file is an empty cache; lines
    /// that fail to parse are counted and skipped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashSet::new();
        let mut skipped_lines = 0usize;

        if path.exists() {
            let txt = fs::read_to_string(&path)?;
            for line in txt.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<DedupEntry>(line) {
                    Ok(entry) => {
                        entries.insert(entry);
                    }
                    Err(_) => skipped_lines += 1,
                }
            }
        }

        Ok(Self {
            path: Some(path),
            entries,
            skipped_lines,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn contains(&self, group: &GroupId, member: &MemberId) -> bool {
        self.entries.contains(&DedupEntry {
            group_id: group.clone(),
            member_id: member.clone(),
        })
    }

    /// Record `(group, member)`. Returns `Ok(false)` if it was already present,
    /// in which case nothing is written.
    ///
    /// The in-memory set is updated before the append so a failed write still
    /// prevents a second attempt during this run.
    pub fn insert(&mut self, group: &GroupId, member: &MemberId) -> Result<bool> {
        let entry = DedupEntry {
            group_id: group.clone(),
            member_id: member.clone(),
        };
        if !self.entries.insert(entry.clone()) {
            return Ok(false);
        }
        if let Some(path) = &self.path {
            append_entry(path, &entry)?;
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DedupEntry> {
        self.entries.iter()
    }
}

fn append_entry(path: &Path, entry: &DedupEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let line = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}
