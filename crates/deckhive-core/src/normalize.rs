use unicode_normalization::UnicodeNormalization;

/// Canonical text form of a card or group name.
///
/// Decodes HTML entities (repeatedly, so double-escaped markup settles),
/// applies Unicode canonical composition (NFC) and collapses every run of
/// whitespace into a single space, trimming both ends.
pub fn normalize_name(name: &str) -> String {
    let mut decoded = name.to_string();
    loop {
        let next = html_escape::decode_html_entities(&decoded);
        if next == decoded {
            break;
        }
        decoded = next.into_owned();
    }

    let composed: String = decoded.nfc().collect();
    composed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A name is usable when it normalizes to something non-empty without control characters.
pub fn is_valid_name(name: &str) -> bool {
    let normalized = normalize_name(name);
    !normalized.is_empty() && !normalized.chars().any(char::is_control)
}
