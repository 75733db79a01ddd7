//! Content-addressed keys for the fingerprint store
//!
//! Keys are derived from a normalized basename and the file size, so the
//! same release shared under slightly different names by different peers
//! lands on one row.

use sha2::{Digest, Sha256};

/// Version stamp of the normalization transformation. Bump when the rules
/// change; stored keys from older versions are then rebuilt, not compared.
pub const NORMALIZE_VERSION: u32 = 1;

/// Bracketed tags dropped during normalization: mastering/encoding variants
/// that do not change the audio content identity.
const VARIANT_TAGS: &[&str] = &[
    "remaster", "remastered", "flac", "mp3", "16bit", "16-bit", "24bit", "24-bit",
    "vinyl", "web", "lossless", "hi-res", "hires", "mono", "stereo",
];

/// Normalize a file name into its canonical lookup form.
///
/// Lowercases, strips directory components, removes leading track-index
/// prefixes ("07 ", "07. ", "07 - "), drops bracketed mastering-variant
/// tags, and collapses whitespace runs. The extension is preserved.
/// Idempotent: `normalize_basename(normalize_basename(s)) == normalize_basename(s)`.
pub fn normalize_basename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .to_lowercase();

    let untagged = strip_variant_tags(&base);
    let untracked = strip_track_prefix(&untagged);

    untracked.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The store key for a file: lowercase hex of
/// `SHA-256(normalize(basename) || ":" || size)`.
pub fn fingerprint_key(filename: &str, size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_basename(filename).as_bytes());
    hasher.update(b":");
    hasher.update(size.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable inventory key for a (peer, path, size) sighting.
pub fn file_id(peer: &str, path: &str, size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(peer.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(size.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn strip_variant_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let close = match c {
            '(' => Some(')'),
            '[' => Some(']'),
            _ => None,
        };
        if let Some(close) = close {
            if let Some(end) = chars[i + 1..].iter().position(|&c| c == close) {
                let inner: String = chars[i + 1..i + 1 + end].iter().collect();
                if inner
                    .split_whitespace()
                    .any(|word| VARIANT_TAGS.contains(&word))
                {
                    i += end + 2;
                    continue;
                }
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Strip leading track-index prefixes repeatedly until a fixpoint, so that
/// the transformation stays idempotent on names like "01 02 song.flac".
fn strip_track_prefix(s: &str) -> String {
    let mut cur = s.trim_start().to_string();
    loop {
        let digits = cur.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 || digits > 3 {
            return cur;
        }
        let rest = &cur[digits..];
        let stripped = rest
            .strip_prefix(". ")
            .or_else(|| rest.strip_prefix(" - "))
            .or_else(|| rest.strip_prefix("- "))
            .or_else(|| rest.strip_prefix(" "))
            .or_else(|| rest.strip_prefix("."))
            .or_else(|| rest.strip_prefix("_"));
        match stripped {
            // A bare "07.flac" would strip down to its extension; keep it.
            Some(next) if !next.trim_start().is_empty() => cur = next.trim_start().to_string(),
            _ => return cur,
        }
    }
}
