//! Email address utilities shared by the delivery engine.
//!
//! Validation, repair of multi-address fields and domain handling live here so
//! the batch processor stays focused on delivery logic.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ADDRESS_RE: Regex =
        Regex::new(r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~.-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
            .unwrap();
}

/// Check whether an address is deliverable as-is.
pub fn is_valid(address: &str) -> bool {
    let address = address.trim();
    !address.is_empty() && !address.contains("..") && ADDRESS_RE.is_match(address)
}

/// Lowercased domain part of an address, if it has one.
pub fn domain_of(address: &str) -> Option<String> {
    let (_, domain) = address.trim().rsplit_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// Split a malformed multi-address field (`a@x.com,b@y.com;c@z.com`) into its
/// individual candidates. Single well-formed addresses come back as a
/// one-element vec; whitespace around separators is dropped.
pub fn split_joined(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Interleave items so consecutive entries target different domains where
/// possible. Buckets keep their original relative order; bucket order follows
/// first appearance.
pub fn interleave_by_domain<T, F>(items: Vec<T>, domain_of: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut order: Vec<String> = Vec::new();
    let mut buckets: std::collections::HashMap<String, std::collections::VecDeque<T>> =
        std::collections::HashMap::new();

    for item in items {
        let key = domain_of(&item);
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push_back(item);
    }

    let mut out = Vec::new();
    let mut exhausted = false;
    while !exhausted {
        exhausted = true;
        for key in &order {
            if let Some(item) = buckets.get_mut(key).and_then(|b| b.pop_front()) {
                out.push(item);
                exhausted = false;
            }
        }
    }

    out
}
