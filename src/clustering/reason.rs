//! Clusters failures by a normalized form of their primary failure reason.
//!
//! Volatile fragments (numbers, hex strings, pointers, base64 blobs) are
//! replaced by a `%` wildcard, so reasons differing only in such fragments
//! share a cluster. The reduced form is a valid `LIKE` pattern matching every
//! reason in the cluster.

use super::hash_id;
use crate::model::Failure;
use regex::Regex;
use std::sync::OnceLock;

pub const NAME: &str = "reason-v6";

fn volatile_fragments() -> &'static Regex {
    static VOLATILE: OnceLock<Regex> = OnceLock::new();
    VOLATILE.get_or_init(|| {
        Regex::new(r"[/+0-9a-zA-Z]{10,}=+|[\-0-9a-fA-F \t]{16,}|[0-9a-fA-Fx]{8,}|[0-9]+")
            .expect("volatile fragment pattern is valid")
    })
}

/// Reduce a failure reason to the `LIKE` pattern identifying its cluster.
pub fn pattern(reason: &str) -> String {
    let mut escaped = String::with_capacity(reason.len());
    for c in reason.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    volatile_fragments().replace_all(&escaped, "%").into_owned()
}

pub fn cluster(failure: &Failure) -> Option<String> {
    failure.primary_reason().map(|reason| hash_id(&pattern(reason)))
}
