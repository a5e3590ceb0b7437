//! Just enough XML for list responses: element bodies by tag name, plus entity unescape.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

static TAG_REGEXES: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn tag_regex(tag: &str) -> Regex {
    let mut guard = TAG_REGEXES.lock();
    if let Some(re) = guard.get(tag) {
        return re.clone();
    }
    let pattern = format!(r"(?s)<{t}(?:\s[^>]*)?>(.*?)</{t}>", t = regex::escape(tag));
    let re = match Regex::new(&pattern) {
        Ok(r) => r,
        Err(_) => unreachable!("escaped tag always forms a valid pattern"),
    };
    guard.insert(tag.to_string(), re.clone());
    re
}

/// Raw bodies of every `<tag>...</tag>` element, in document order.
pub fn elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    tag_regex(tag)
        .captures_iter(xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Unescaped text of the first `<tag>` element.
pub fn text(xml: &str, tag: &str) -> Option<String> {
    elements(xml, tag).first().map(|s| unescape(s.trim()))
}

pub fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

pub fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_elements_and_entities() {
        let xml = r#"<ListBucketResult><Contents><Key>a &amp; b.txt</Key><Size>3</Size></Contents>
            <Contents><Key>c.txt</Key><Size>7</Size></Contents>
            <IsTruncated>false</IsTruncated></ListBucketResult>"#;
        let contents = elements(xml, "Contents");
        assert_eq!(contents.len(), 2);
        assert_eq!(text(contents[0], "Key").as_deref(), Some("a & b.txt"));
        assert_eq!(text(contents[1], "Size").as_deref(), Some("7"));
        assert_eq!(text(xml, "IsTruncated").as_deref(), Some("false"));
        assert_eq!(text(xml, "NextContinuationToken"), None);
    }

    #[test]
    fn attributes_on_open_tag() {
        let xml = r#"<EnumerationResults ContainerName="c"><Name>x</Name></EnumerationResults>"#;
        assert_eq!(elements(xml, "EnumerationResults").len(), 1);
        assert_eq!(escape("a<&>"), "a&lt;&amp;&gt;");
        assert_eq!(unescape(&escape("it's \"q\"")), "it's \"q\"");
    }
}
