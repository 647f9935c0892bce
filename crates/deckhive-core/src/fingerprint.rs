use sha2::{Digest, Sha256};

use crate::Record;

/// SHA-256 (hex) over the record's group/entry content.
///
/// Each group renders as `name:entry:count,entry:count,...`; group strings are
/// sorted and joined with `|`, so neither group order, entry order nor the
/// originating source affect the result. Run on canonicalized records only:
/// names are hashed exactly as stored.
pub fn compute_fingerprint(record: &Record) -> String {
    let mut parts: Vec<String> = record
        .groups
        .iter()
        .map(|group| {
            let mut entries: Vec<String> = group
                .entries
                .iter()
                .map(|entry| format!("{}:{}", entry.name, entry.count))
                .collect();
            entries.sort();
            format!("{}:{}", group.name, entries.join(","))
        })
        .collect();
    parts.sort();

    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}
