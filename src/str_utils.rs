/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Shortens `s` to `max_chars`, appending an ellipsis when something was cut.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    let prefix = prefix_chars(trimmed, max_chars);
    if prefix.len() == trimmed.len() {
        trimmed.to_string()
    } else {
        format!("{}…", prefix.trim_end())
    }
}

/// Host of an absolute URL without a leading `www.`.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// True when `url` parses as an absolute http(s) URL.
pub fn is_web_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_chars_respects_boundaries() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(prefix_chars("hi", 10), "hi");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("  short  ", 10), "short");
        assert_eq!(truncate_with_ellipsis("a longer title here", 8), "a longer…");
    }

    #[test]
    fn test_domain_of_strips_www() {
        assert_eq!(domain_of("https://www.nih.gov/x?y=1").as_deref(), Some("nih.gov"));
        assert_eq!(domain_of("not a url"), None);
        assert!(is_web_url("http://pubmed.ncbi.nlm.nih.gov/123"));
        assert!(!is_web_url("ftp://files.example.org"));
        assert!(!is_web_url("pubmed/123"));
    }
}
