//! Content signatures for change detection
//!
//! A signature is a single SHA-1 over a sorted title collection (plus, for the
//! local archive, file count and latest modification time). Input order never
//! affects the result.

use std::path::PathBuf;

use reqwest::{Client, StatusCode};
use sha1::{Digest, Sha1};
use tracing::debug;

use super::archive::ArchiveFacts;

/// Lowercase hex SHA-1 of a string
pub fn sha1_hex(s: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Titles sorted and joined with `|`
fn sorted_join<S: AsRef<str>>(titles: &[S]) -> String {
    let mut sorted: Vec<&str> = titles.iter().map(|t| t.as_ref()).collect();
    sorted.sort_unstable();
    sorted.join("|")
}

/// Signature of the local archive under one or more roots.
///
/// `roots` may hold several paths, and each may itself be a `;`-delimited list.
/// Unreadable roots contribute nothing rather than failing.
pub fn local_signature<S: AsRef<str>>(roots: &[PathBuf], titles: &[S]) -> String {
    let facts = ArchiveFacts::collect(roots);
    local_signature_from_facts(&facts, titles)
}

/// `sha1("{file_count}|{latest_mtime}|{sorted titles}")`
pub fn local_signature_from_facts<S: AsRef<str>>(facts: &ArchiveFacts, titles: &[S]) -> String {
    let payload = format!(
        "{}|{}|{}",
        facts.file_count,
        facts.latest_mtime,
        sorted_join(titles)
    );
    sha1_hex(&payload)
}

/// `sha1(sorted titles joined by '|')`
pub fn remote_signature<S: AsRef<str>>(titles: &[S]) -> String {
    sha1_hex(&sorted_join(titles))
}

/// Stricter remote signature that also changes when the online count does
pub fn remote_signature_full<S: AsRef<str>>(titles: &[S], online_count: usize) -> String {
    sha1_hex(&format!("{}|{}", online_count, sorted_join(titles)))
}

/// Comparison key for titles: lowercase, punctuation runs collapsed to one space
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_space = false;

    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }

    out
}

/// Cheap existence probe for a catalogue URL.
///
/// Sends HEAD; servers that reject HEAD (403/405) get a full GET. Transport
/// failures count as unavailable and are never returned as errors.
pub async fn check_url_available(client: &Client, url: &str) -> bool {
    let status = match client.head(url).send().await {
        Ok(response) => response.status(),
        Err(e) => {
            debug!(url = %url, error = %e, "HEAD probe failed");
            return false;
        }
    };

    if status == StatusCode::FORBIDDEN || status == StatusCode::METHOD_NOT_ALLOWED {
        debug!(url = %url, status = %status, "HEAD rejected, retrying with GET");
        return match client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "GET probe failed");
                false
            }
        };
    }

    status.is_success()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_signature_ignores_order() {
        assert_eq!(
            remote_signature(&["B", "A", "C"]),
            remote_signature(&["A", "B", "C"])
        );
        assert_eq!(remote_signature(&["A", "B", "C"]), sha1_hex("A|B|C"));
        assert_ne!(remote_signature(&["A", "B"]), remote_signature(&["A", "B", "C"]));
    }

    #[test]
    fn test_remote_signature_full_tracks_count() {
        let titles = ["x", "y"];
        assert_ne!(
            remote_signature_full(&titles, 2),
            remote_signature_full(&titles, 3)
        );
        assert_eq!(remote_signature_full(&titles, 2), sha1_hex("2|x|y"));
    }

    #[test]
    fn test_local_signature_from_facts() {
        let facts = ArchiveFacts {
            file_count: 3,
            latest_mtime: 1_700_000_000,
            titles: Vec::new(),
        };
        assert_eq!(
            local_signature_from_facts(&facts, &["y", "x"]),
            sha1_hex("3|1700000000|x|y")
        );
    }

    #[test]
    fn test_local_signature_sensitive_to_recency() {
        let older = ArchiveFacts {
            file_count: 3,
            latest_mtime: 100,
            titles: Vec::new(),
        };
        let newer = ArchiveFacts {
            latest_mtime: 200,
            ..older.clone()
        };
        assert_ne!(
            local_signature_from_facts(&older, &["x"]),
            local_signature_from_facts(&newer, &["x"])
        );
    }

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  Hello,   World!! "), "hello world");
        assert_eq!(normalize_title("Part_2 - Final"), "part 2 final");
        assert_eq!(normalize_title("!!!"), "");
    }
}
