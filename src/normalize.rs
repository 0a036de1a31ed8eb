//! Config Normalizer (C3) — pure string transforms on VLESS client URLs.
//!
//! A VLESS URL has the shape `vless://UUID@HOST:PORT?params#fragment`. These
//! functions never allocate fabricated cryptographic material; they only
//! rewrite the host and fragment components, preserving userinfo, port,
//! IPv6 bracket syntax, and query parameters verbatim.

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

const VLESS_SCHEME: &str = "vless://";

/// Replace `HOST` in a VLESS URL with `preferred_domain`, falling back to the
/// host parsed out of `api_url` when `preferred_domain` is empty.
///
/// Idempotent: normalizing an already-normalized URL with the same
/// `preferred_domain`/`api_url` is a no-op.
pub fn normalize_host(url: &str, preferred_domain: &str, api_url: &str) -> String {
    if !url.contains(VLESS_SCHEME) {
        return url.to_string();
    }

    let host_override = if !preferred_domain.trim().is_empty() {
        preferred_domain.trim().to_string()
    } else {
        host_from_url(api_url).unwrap_or_default()
    };
    if host_override.is_empty() {
        return url.to_string();
    }

    let rest = &url[VLESS_SCHEME.len()..];
    let (authority_and_path, fragment) = split_fragment(rest);
    let (userinfo_and_hostport, query) = split_query(authority_and_path);

    let Some((userinfo, host_port)) = userinfo_and_hostport.split_once('@') else {
        return url.to_string();
    };
    if userinfo.is_empty() {
        return url.to_string();
    }

    let port = port_suffix(host_port);
    let new_host_port = format!("{host_override}{port}");

    let mut rebuilt = format!("{VLESS_SCHEME}{userinfo}@{new_host_port}");
    if let Some(q) = query {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    if let Some(f) = fragment {
        rebuilt.push('#');
        rebuilt.push_str(f);
    }
    rebuilt
}

/// Remove the `#fragment` suffix from a VLESS URL, if present.
///
/// Idempotent: stripping a fragment-less URL is a no-op.
pub fn strip_fragment(url: &str) -> String {
    if !url.contains(VLESS_SCHEME) {
        return url.to_string();
    }
    match url.rsplit_once('#') {
        Some((base, _)) => base.to_string(),
        None => url.to_string(),
    }
}

/// Percent-encode `display_name` and set it as the VLESS URL's fragment,
/// replacing any existing fragment. No-op if `display_name` is empty.
///
/// Idempotent: setting the same fragment twice produces the same string.
pub fn set_fragment(url: &str, display_name: &str) -> String {
    if !url.contains(VLESS_SCHEME) || display_name.is_empty() {
        return url.to_string();
    }
    let base = strip_fragment(url);
    let encoded = utf8_percent_encode(display_name, NON_ALPHANUMERIC).to_string();
    format!("{base}#{encoded}")
}

/// Percent-decode a previously `set_fragment`-encoded display name, for
/// round-trip tests and admin display.
pub fn decode_fragment(encoded: &str) -> String {
    percent_decode_str(encoded)
        .decode_utf8_lossy()
        .into_owned()
}

// ─── internal helpers ──────────────────────────────────────────────────────

fn split_fragment(s: &str) -> (&str, Option<&str>) {
    match s.split_once('#') {
        Some((base, frag)) => (base, Some(frag)),
        None => (s, None),
    }
}

fn split_query(s: &str) -> (&str, Option<&str>) {
    match s.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (s, None),
    }
}

/// Returns the `:port` suffix (or `""`), correctly skipping over an IPv6
/// literal's own colons.
fn port_suffix(host_port: &str) -> String {
    if let Some(rest) = host_port.strip_prefix('[') {
        // IPv6 literal: `[::1]:443` or bare `[::1]`.
        if let Some(close) = rest.find(']') {
            return rest[close + 1..].to_string();
        }
        return String::new();
    }
    match host_port.rsplit_once(':') {
        Some((_, port)) => format!(":{port}"),
        None => String::new(),
    }
}

/// Best-effort hostname extraction from an arbitrary API URL
/// (`https://host:port/path` → `host`).
fn host_from_url(api_url: &str) -> Option<String> {
    let without_scheme = api_url.split_once("://").map(|(_, r)| r).unwrap_or(api_url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().map(|h| h.to_string());
    }
    Some(authority.split(':').next().unwrap_or(authority).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "vless://abc-123@old-host.example:443?encryption=none&security=reality&sni=example.com&sid=abcd#old-frag";

    #[test]
    fn normalize_host_replaces_host_preserves_rest() {
        let out = normalize_host(SAMPLE, "new-host.example", "https://ignored");
        assert_eq!(
            out,
            "vless://abc-123@new-host.example:443?encryption=none&security=reality&sni=example.com&sid=abcd#old-frag"
        );
    }

    #[test]
    fn normalize_host_falls_back_to_api_url_host() {
        let out = normalize_host(SAMPLE, "", "https://fallback.example:8443/api");
        assert!(out.starts_with("vless://abc-123@fallback.example:443?"));
    }

    #[test]
    fn normalize_host_preserves_ipv6_brackets() {
        let url = "vless://abc@[::1]:443?x=1";
        let out = normalize_host(url, "new-host.example", "");
        assert_eq!(out, "vless://abc@new-host.example:443?x=1");
    }

    #[test]
    fn normalize_host_is_idempotent() {
        let once = normalize_host(SAMPLE, "new-host.example", "https://ignored");
        let twice = normalize_host(&once, "new-host.example", "https://ignored");
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_host_non_vless_is_untouched() {
        assert_eq!(normalize_host("not-a-vless-url", "x", "y"), "not-a-vless-url");
    }

    #[test]
    fn strip_fragment_removes_fragment() {
        assert_eq!(
            strip_fragment(SAMPLE),
            "vless://abc-123@old-host.example:443?encryption=none&security=reality&sni=example.com&sid=abcd"
        );
    }

    #[test]
    fn strip_fragment_is_idempotent() {
        let once = strip_fragment(SAMPLE);
        let twice = strip_fragment(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn strip_fragment_noop_without_fragment() {
        let no_frag = "vless://abc@host:443?a=1";
        assert_eq!(strip_fragment(no_frag), no_frag);
    }

    #[test]
    fn set_fragment_percent_encodes_display_name() {
        let base = "vless://abc@host:443?a=1";
        let out = set_fragment(base, "Server #1 (US)");
        assert!(out.starts_with("vless://abc@host:443?a=1#"));
        assert!(!out.contains(' '));
        let frag = out.rsplit_once('#').unwrap().1;
        assert_eq!(decode_fragment(frag), "Server #1 (US)");
    }

    #[test]
    fn set_fragment_replaces_existing_fragment() {
        let out = set_fragment(SAMPLE, "New Name");
        assert!(!out.contains("old-frag"));
    }

    #[test]
    fn set_fragment_is_idempotent() {
        let once = set_fragment(SAMPLE, "Frankfurt");
        let twice = set_fragment(&once, "Frankfurt");
        assert_eq!(once, twice);
    }

    #[test]
    fn set_fragment_noop_on_empty_name() {
        assert_eq!(set_fragment(SAMPLE, ""), SAMPLE);
    }
}
