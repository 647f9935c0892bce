use std::collections::HashMap;

use thiserror::Error;
use url::Url;

use crate::normalize::{is_valid_name, normalize_name};
use crate::{Entry, Group, Record};

/// First invariant a record violated during canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("empty id")]
    EmptyId,
    #[error("url is empty")]
    EmptyUrl,
    #[error("failed to parse url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("release date is zero time")]
    MissingReleaseDate,
    #[error("collection has no groups")]
    NoGroups,
    #[error("group #{index} has an empty name")]
    EmptyGroupName { index: usize },
    #[error("group #{index} has a bad name {name:?}")]
    BadGroupName { index: usize, name: String },
    #[error("group {group:?} has no entries")]
    EmptyGroup { group: String },
    #[error("bad card name {name:?} in group {group:?}")]
    BadEntryName { group: String, name: String },
    #[error("invalid count 0 for {name:?} in group {group:?}")]
    InvalidCount { group: String, name: String },
}

impl ValidationError {
    /// Stable label used to bucket validation failures in run statistics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::EmptyId => "empty_id",
            Self::EmptyUrl => "empty_url",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::MissingReleaseDate => "missing_release_date",
            Self::NoGroups => "no_groups",
            Self::EmptyGroupName { .. } => "empty_group_name",
            Self::BadGroupName { .. } => "bad_group_name",
            Self::EmptyGroup { .. } => "empty_group",
            Self::BadEntryName { .. } => "bad_entry_name",
            Self::InvalidCount { .. } => "invalid_count",
        }
    }
}

/// What canonicalization had to change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Canonicalized {
    /// Entry names rewritten by normalization.
    pub renamed: usize,
    /// Entries folded into an earlier entry with the same name.
    pub merged: usize,
}

impl Record {
    /// Normalizes names, merges duplicate entries (case-insensitive) and
    /// same-named groups, sorts entries and groups by name, then validates.
    ///
    /// All work happens on a copy: on error the record is left untouched.
    /// On success any cached fingerprint is dropped.
    pub fn canonicalize(&mut self) -> Result<Canonicalized, ValidationError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        let url = self.url.trim();
        if url.is_empty() {
            return Err(ValidationError::EmptyUrl);
        }
        Url::parse(url).map_err(|err| ValidationError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if self.release_date.is_none() {
            return Err(ValidationError::MissingReleaseDate);
        }
        if self.groups.is_empty() {
            return Err(ValidationError::NoGroups);
        }

        let mut outcome = Canonicalized::default();
        let mut groups: Vec<Group> = Vec::with_capacity(self.groups.len());
        let mut group_slots: HashMap<String, usize> = HashMap::new();
        let mut entry_slots: Vec<HashMap<String, usize>> = Vec::new();

        for (index, group) in self.groups.iter().enumerate() {
            let group_name = normalize_name(&group.name);
            if group_name.is_empty() {
                return Err(ValidationError::EmptyGroupName { index });
            }
            if !is_valid_name(&group.name) {
                return Err(ValidationError::BadGroupName {
                    index,
                    name: group.name.clone(),
                });
            }
            let slot = *group_slots.entry(group_name.clone()).or_insert_with(|| {
                groups.push(Group::new(group_name.clone(), Vec::new()));
                entry_slots.push(HashMap::new());
                groups.len() - 1
            });

            for entry in &group.entries {
                if !is_valid_name(&entry.name) {
                    return Err(ValidationError::BadEntryName {
                        group: group_name,
                        name: entry.name.clone(),
                    });
                }
                let name = normalize_name(&entry.name);
                if entry.count == 0 {
                    return Err(ValidationError::InvalidCount {
                        group: group_name,
                        name,
                    });
                }
                if name != entry.name {
                    outcome.renamed += 1;
                }

                let entries = &mut groups[slot].entries;
                match entry_slots[slot].get(&name.to_lowercase()) {
                    Some(&existing) => {
                        let kept = &mut entries[existing];
                        kept.count = kept.count.saturating_add(entry.count);
                        // Keep the smallest spelling: merged names must not depend on input order.
                        if name < kept.name {
                            kept.name = name;
                        }
                        outcome.merged += 1;
                    }
                    None => {
                        entry_slots[slot].insert(name.to_lowercase(), entries.len());
                        entries.push(Entry::new(name, entry.count));
                    }
                }
            }
        }

        if let Some(empty) = groups.iter().find(|g| g.entries.is_empty()) {
            return Err(ValidationError::EmptyGroup {
                group: empty.name.clone(),
            });
        }

        for group in &mut groups {
            group.entries.sort_by(|a, b| a.name.cmp(&b.name));
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        self.id = id.to_string();
        self.url = url.to_string();
        self.groups = groups;
        self.content_hash = None;
        Ok(outcome)
    }
}
