//! Derives OCI-legal resource names from Kubernetes names.
//!
//! OCI limits most load-balancer resource names to 32 characters and a
//! restricted character set. Names that fit are sanitized and passed through;
//! longer names keep their head and tail around a CRC32 of the original name,
//! so distinct inputs stay distinct after truncation. Lengths are counted in
//! characters.

use once_cell::sync::Lazy;
use regex::Regex;

/// The length of the embedded hash.
pub const HASH_LEN: usize = 8;

/// OCI's limit for load balancer listener, backend set, routing policy and
/// certificate names.
pub const OCI_MAX_NAME_LEN: usize = 32;

/// Characters not allowed in routing policy and routing rule names.
pub static POLICY_INVALID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_]").expect("should compile"));

/// Characters not allowed in listener, backend set and certificate names.
pub static RESOURCE_INVALID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_\-]").expect("should compile"));

#[derive(Clone, Debug, Default)]
pub struct NameConfig {
    /// Zero disables the length limit.
    pub max_length: usize,
    pub invalid_chars: Option<Regex>,
}

// === impl NameConfig ===

impl NameConfig {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            invalid_chars: None,
        }
    }

    pub fn with_invalid_chars(mut self, pattern: &Regex) -> Self {
        self.invalid_chars = Some(pattern.clone());
        self
    }

    /// 32 characters of `[a-zA-Z0-9_]`.
    pub fn policy() -> Self {
        Self::new(OCI_MAX_NAME_LEN).with_invalid_chars(&POLICY_INVALID_CHARS)
    }

    /// 32 characters of `[a-zA-Z0-9_-]`.
    pub fn resource() -> Self {
        Self::new(OCI_MAX_NAME_LEN).with_invalid_chars(&RESOURCE_INVALID_CHARS)
    }
}

/// Returns the CRC32-IEEE of `input` as 8 lowercase hex characters.
pub fn hash(input: &str) -> String {
    format!("{:08x}", crc32fast::hash(input.as_bytes()))
}

pub fn sanitize(name: &str, pattern: Option<&Regex>) -> String {
    match pattern {
        Some(re) if !name.is_empty() => re.replace_all(name, "_").into_owned(),
        _ => name.to_string(),
    }
}

pub fn construct(original: &str, config: &NameConfig) -> String {
    let sanitized = sanitize(original, config.invalid_chars.as_ref());
    let max = config.max_length;
    if max == 0 {
        return sanitized;
    }

    let chars = sanitized.chars().collect::<Vec<_>>();
    let len = chars.len();
    if len <= max {
        return sanitized;
    }

    // The hash covers the original name so that inputs that sanitize to the
    // same string still produce different names.
    let hash = hash(original);
    if max <= HASH_LEN {
        return hash[..max].to_string();
    }

    let remaining = max - HASH_LEN;
    let start_len = remaining / 2;
    let end_len = remaining - start_len;

    let start = if start_len >= len {
        &chars[..]
    } else {
        &chars[..start_len]
    };
    let end = end_part(&chars, start_len, end_len);

    let mut name = start.iter().collect::<String>();
    name.push_str(&hash);
    name.extend(end.iter());
    if name.chars().count() > max {
        return name.chars().take(max).collect();
    }
    name
}

fn end_part(chars: &[char], start_len: usize, end_len: usize) -> &[char] {
    let len = chars.len();
    if end_len == 0 || start_len >= len {
        return &[];
    }
    if len < start_len + end_len {
        return &chars[start_len..];
    }
    &chars[len - end_len..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_names_pass_through() {
        let name = construct("my-perfectly-valid-name", &NameConfig::new(32));
        assert_eq!(name, "my-perfectly-valid-name");
        assert_eq!(name.len(), 23);
    }

    #[test]
    fn long_names_are_hashed_and_split() {
        let original = "this-is-a-very-long-name-that-will-be-hashed-and-split";
        let name = construct(original, &NameConfig::new(32));
        let expected = format!("this-is-a-ve{}ed-and-split", hash(original));
        assert_eq!(name, expected);
        assert_eq!(name.len(), 32);
    }

    #[test]
    fn hash_is_lowercase_crc32() {
        // crc32("hello") == 0x3610a686
        assert_eq!(hash("hello"), "3610a686");
        assert_eq!(hash(""), "00000000");
    }

    #[test]
    fn max_length_equal_to_hash_returns_hash() {
        let original = "a-name-longer-than-eight";
        assert_eq!(construct(original, &NameConfig::new(HASH_LEN)), hash(original));
    }

    #[test]
    fn max_length_below_hash_truncates_hash() {
        let original = "a-name-longer-than-eight";
        let name = construct(original, &NameConfig::new(5));
        assert_eq!(name, hash(original)[..5]);
    }

    #[test]
    fn unbounded_returns_sanitized() {
        let cfg = NameConfig::new(0).with_invalid_chars(&POLICY_INVALID_CHARS);
        assert_eq!(
            construct("ns-0/a.very.long.route.name.beyond.any.limit", &cfg),
            "ns_0_a_very_long_route_name_beyond_any_limit"
        );
        assert_eq!(construct("ns-0/x", &NameConfig::new(0)), "ns-0/x");
    }

    #[test]
    fn sanitizes_invalid_characters() {
        let name = construct("ns-0/gw.http", &NameConfig::policy());
        assert_eq!(name, "ns_0_gw_http");
        let name = construct("ns-0/gw.http", &NameConfig::resource());
        assert_eq!(name, "ns-0_gw_http");
    }

    #[test]
    fn hashes_original_not_sanitized() {
        let cfg = NameConfig::policy();
        let a = construct("namespace-a/some-really-long-resource-name-0", &cfg);
        let b = construct("namespace_a/some_really_long_resource_name_0", &cfg);
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
    }

    #[test]
    fn end_part_bounds() {
        let chars = "abcdef".chars().collect::<Vec<_>>();
        assert_eq!(end_part(&chars, 10, 4), &[] as &[char]);
        assert_eq!(end_part(&chars, 4, 4), &['e', 'f']);
        assert_eq!(end_part(&chars, 2, 3), &['d', 'e', 'f']);
        assert_eq!(end_part(&chars, 2, 0), &[] as &[char]);
    }

    #[test]
    fn respects_length_and_pattern_for_many_inputs() {
        let cfg = NameConfig::policy();
        for len in 0..80 {
            let original = (0..len)
                .map(|i| ['a', '-', '.', 'Z', '9', 'é'][i % 6])
                .collect::<String>();
            let name = construct(&original, &cfg);
            assert!(name.chars().count() <= OCI_MAX_NAME_LEN, "{name}");
            assert!(!POLICY_INVALID_CHARS.is_match(&name), "{name}");
            assert_eq!(name, construct(&original, &cfg));
        }
    }
}
