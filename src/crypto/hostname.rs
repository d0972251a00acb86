//! Hostname matching against certificate names.
//!
//! A wildcard is only honoured as the complete left-most label, and it
//! stands for exactly one label: `*.example.com` covers `a.example.com`
//! but neither `example.com` nor `a.b.example.com`.

use std::collections::BTreeSet;
use std::net::IpAddr;

/// Whether a single certificate name covers `host`
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = normalize(pattern);
    let host = normalize(host);

    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    // IP addresses never match wildcards
    if let Ok(host_ip) = host.parse::<IpAddr>() {
        return pattern.parse::<IpAddr>().map_or(false, |ip| ip == host_ip);
    }

    match pattern.strip_prefix("*.") {
        Some(suffix) => match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && !suffix.is_empty() && rest == suffix,
            None => false,
        },
        None => pattern == host,
    }
}

/// Whether any of `names` covers `host`
pub fn is_covered(names: &BTreeSet<String>, host: &str) -> bool {
    names.iter().any(|name| hostname_matches(name, host))
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}
