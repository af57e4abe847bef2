//! Identifier and keyspace-name utilities
//!
//! Keyspace names are limited to 48 `[A-Za-z0-9_]` characters by the store,
//! while storage-group names are dotted reverse domains of arbitrary length.
//! Long or non-alphanumeric names are squeezed into the limit by keeping a
//! readable prefix and appending characters from a SHA-1 digest.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use sha1::{Digest, Sha1};

/// Maximum length of a keyspace identifier
pub const MAX_KEYSPACE_LEN: usize = 48;

static VALID_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());
static VALID_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+").unwrap());

/// Quote a CQL identifier, doubling any embedded quotes
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Hash a name into identifier-safe characters: SHA-1, base64, with `+`/`/`
/// mapped to `_` and the zero-entropy padding stripped.
pub fn hash_name(name: &str) -> String {
    let digest = Sha1::digest(name.as_bytes());
    STANDARD
        .encode(digest)
        .replace(['+', '/'], "_")
        .trim_end_matches('=')
        .to_string()
}

/// The longest leading `[A-Za-z0-9_]` run of `name`
pub fn valid_prefix(name: &str) -> &str {
    VALID_PREFIX.find(name).map(|m| m.as_str()).unwrap_or("")
}

/// Squeeze `name` into a valid identifier of at most `max_len` characters.
///
/// `_` is doubled and `.` mapped to `_` first, so dotted names stay readable
/// and reversible. Names that are already valid and short enough pass
/// through; everything else keeps up to two thirds of its valid prefix and
/// is padded to `max_len` with hash characters.
pub fn make_valid_key(name: &str, max_len: usize) -> String {
    let key = name.replace('_', "__").replace('.', "_");
    if VALID_KEY.is_match(&key) && key.len() <= max_len {
        return key;
    }
    let mut prefix = valid_prefix(&key).to_string();
    prefix.truncate(max_len * 2 / 3);
    let hash = hash_name(&key);
    let need = (max_len - prefix.len()).min(hash.len());
    prefix.push_str(&hash[..need]);
    prefix
}

/// Lowercase a dotted domain and reverse its labels:
/// `en.wikipedia.org` becomes `org.wikipedia.en`.
pub fn reverse_domain(domain: &str) -> String {
    let mut labels: Vec<&str> = domain.split('.').collect();
    labels.reverse();
    labels.join(".").to_lowercase()
}

/// Derive the keyspace name for a logical table within a storage group.
///
/// The group name is reversed and squeezed first; whatever room remains
/// (minus the literal `_T_` separator) goes to the table name. The result is
/// at most [`MAX_KEYSPACE_LEN`] characters.
pub fn keyspace_name(group: &str, table: &str) -> String {
    let reversed = reverse_domain(group);
    let prefix_len = (MAX_KEYSPACE_LEN as isize - table.len() as isize - 3).max(26) as usize;
    let prefix = make_valid_key(&reversed, prefix_len);
    let table_len = MAX_KEYSPACE_LEN.saturating_sub(prefix.len() + 3);
    format!("{}_T_{}", prefix, make_valid_key(table, table_len))
}
