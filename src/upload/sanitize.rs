//! Filename handling for client-supplied upload metadata.

use std::collections::HashMap;

use base64::Engine;

const MAX_NAME_LEN: usize = 100;
const TRUNCATED_BASE_LEN: usize = 96;
const DEFAULT_EXTENSION: &str = "jpg";
const ILLEGAL: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// Decode a TUS `Upload-Metadata` header: comma-separated `key base64value`
/// pairs. Keys may appear without a value. Pairs whose value is not valid
/// base64 or UTF-8 are skipped.
pub fn parse_metadata(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split(',') {
        let mut parts = pair.trim().splitn(2, ' ');
        let key = match parts.next() {
            Some(k) if !k.is_empty() => k,
            _ => continue,
        };
        let value = match parts.next().map(str::trim) {
            None | Some("") => String::new(),
            Some(encoded) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok());
                match decoded {
                    Some(v) => v,
                    None => continue,
                }
            }
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Derive a safe on-disk filename from upload metadata.
///
/// Never fails: absent, malformed, or fully-stripped names fall back to
/// `photo_{first 8 chars of seed}.jpg`.
pub fn sanitize(raw_metadata: Option<&str>, fallback_seed: &str) -> String {
    let candidate = raw_metadata
        .map(parse_metadata)
        .and_then(|mut meta| meta.remove("filename"))
        .map(|name| clean(&name))
        .filter(|name| !name.is_empty());

    match candidate {
        Some(name) => with_extension_and_limit(&name),
        None => fallback_name(fallback_seed),
    }
}

pub fn fallback_name(seed: &str) -> String {
    let prefix: String = seed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("photo_{prefix}.{DEFAULT_EXTENSION}")
}

/// Extension of a sanitized filename including the leading dot, or "".
pub fn extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(i) if i > 0 && i + 1 < filename.len() => &filename[i..],
        _ => "",
    }
}

fn clean(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !c.is_control() && !ILLEGAL.contains(c))
        .collect();
    stripped
        .trim()
        .trim_start_matches('.')
        .trim_end_matches('.')
        .trim()
        .to_string()
}

fn with_extension_and_limit(name: &str) -> String {
    let (base, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i + 1..]),
        _ => (name, DEFAULT_EXTENSION),
    };

    let total = base.chars().count() + 1 + ext.chars().count();
    if total > MAX_NAME_LEN {
        let truncated: String = base.chars().take(TRUNCATED_BASE_LEN).collect();
        format!("{truncated}.{ext}")
    } else {
        format!("{base}.{ext}")
    }
}
