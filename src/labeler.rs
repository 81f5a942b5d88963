use anyhow::{Context, Result};
use url::Url;

use crate::vocabulary::TagVocabulary;

/// Site root every clickstream in the default dataset shares.
pub const DEFAULT_SITE_ROOT: &str = "https://www.cosme.net.tw/";

/// Check that a configured site root is an absolute URL.
pub fn validate_site_root(root: &str) -> Result<()> {
    Url::parse(root).with_context(|| format!("Invalid site root URL '{}'", root))?;
    Ok(())
}

/// Exact string comparison; "https://host" and "https://host/" differ.
pub fn is_site_root(url: &str, site_root: &str) -> bool {
    url == site_root
}

/// The last two '/'-separated segments of a URL, or the only one.
pub fn trailing_segments(url: &str) -> Vec<&str> {
    let parts: Vec<&str> = url.trim_matches('/').split('/').collect();
    let start = parts.len().saturating_sub(2);
    parts[start..].to_vec()
}

/// Label a URL with the first vocabulary tag, longest first, that equals one
/// of its trailing segments.
pub fn label_url<'v>(url: &str, vocabulary: &'v TagVocabulary) -> Option<&'v str> {
    let segments = trailing_segments(url);
    vocabulary
        .match_order()
        .iter()
        .find(|tag| segments.iter().any(|segment| *segment == tag.as_str()))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> TagVocabulary {
        TagVocabulary::embedded().unwrap()
    }

    #[test]
    fn trailing_segments_strip_separators() {
        assert_eq!(
            trailing_segments("https://www.cosme.net.tw/brands/123/"),
            vec!["brands", "123"]
        );
        assert_eq!(
            trailing_segments("https://www.cosme.net.tw/brands/"),
            vec!["www.cosme.net.tw", "brands"]
        );
        assert_eq!(trailing_segments("events"), vec!["events"]);
        assert_eq!(trailing_segments(""), vec![""]);
    }

    #[test]
    fn exact_segment_match_not_substring() {
        let vocab = vocab();
        // "brand-events" is tried before "events" and must not steal the match
        assert_eq!(
            label_url("https://www.cosme.net.tw/events", &vocab),
            Some("events")
        );
        assert_eq!(
            label_url("https://www.cosme.net.tw/brand-events/12", &vocab),
            Some("brand-events")
        );
        assert_eq!(label_url("https://www.cosme.net.tw/eventsx", &vocab), None);
    }

    #[test]
    fn longer_tag_wins_across_segments() {
        let vocab = vocab();
        // both segments are tags: the longer one is tried first
        assert_eq!(
            label_url("https://www.cosme.net.tw/products/reviews", &vocab),
            Some("products")
        );
        assert_eq!(
            label_url("https://www.cosme.net.tw/tags/category_list", &vocab),
            Some("category_list")
        );
    }

    #[test]
    fn only_last_two_segments_are_considered() {
        let vocab = vocab();
        assert_eq!(
            label_url("https://www.cosme.net.tw/brands/123/photos", &vocab),
            None
        );
        assert_eq!(
            label_url("https://www.cosme.net.tw/products/123/channel=online", &vocab),
            Some("channel=online")
        );
    }

    #[test]
    fn root_is_recognised_exactly() {
        assert!(is_site_root(DEFAULT_SITE_ROOT, DEFAULT_SITE_ROOT));
        assert!(!is_site_root("https://www.cosme.net.tw", DEFAULT_SITE_ROOT));
        assert!(validate_site_root(DEFAULT_SITE_ROOT).is_ok());
        assert!(validate_site_root("not a url").is_err());
    }

    #[test]
    fn equal_length_ties_follow_declared_order() {
        let vocab =
            TagVocabulary::parse("version 1\nbbb feature\naaa feature\nzz purchase-intent\n")
                .unwrap();
        assert_eq!(label_url("/aaa/bbb", &vocab), Some("bbb"));
        assert_eq!(label_url("/bbb/aaa", &vocab), Some("bbb"));
    }
}
