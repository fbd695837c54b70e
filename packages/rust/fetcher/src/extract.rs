//! Listing extraction: turns a listing page into ordered [`ListingItem`]s.
//!
//! Selectors are compiled once per source ([`ListingExtractor::compile`]) so
//! that a bad rule fails at startup rather than on every poll.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use url::Url;

use changewatch_shared::{ChangeWatchError, ExtractionRule, ListingItem, Result};

/// File extensions dropped from the final path segment when deriving an id.
const STRIP_EXTENSIONS: &[&str] = &[".html", ".htm", ".php", ".aspx", ".shtml"];

/// A compiled [`ExtractionRule`].
#[derive(Debug)]
pub struct ListingExtractor {
    item: Selector,
    link: Option<Selector>,
    title: Option<Selector>,
    date: Option<Selector>,
    date_attr: Option<String>,
    id_pattern: Option<Regex>,
    max_items: usize,
    fallback_link: Selector,
}

impl ListingExtractor {
    /// Compile every selector and pattern in the rule.
    pub fn compile(rule: &ExtractionRule) -> Result<Self> {
        Ok(Self {
            item: parse_selector("item_selector", &rule.item_selector)?,
            link: rule
                .link_selector
                .as_deref()
                .map(|s| parse_selector("link_selector", s))
                .transpose()?,
            title: rule
                .title_selector
                .as_deref()
                .map(|s| parse_selector("title_selector", s))
                .transpose()?,
            date: rule
                .date_selector
                .as_deref()
                .map(|s| parse_selector("date_selector", s))
                .transpose()?,
            date_attr: rule.date_attr.clone(),
            id_pattern: rule
                .id_pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| ChangeWatchError::parse(format!("invalid id_pattern: {e}")))
                })
                .transpose()?,
            max_items: rule.max_items,
            fallback_link: parse_selector("fallback", "a[href]")?,
        })
    }

    /// Extract items in document order (which the source guarantees is newest first).
    ///
    /// Items without a resolvable link are skipped; repeated ids keep their
    /// first occurrence.
    pub fn extract(&self, html: &str, base_url: &Url) -> Vec<ListingItem> {
        let doc = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for el in doc.select(&self.item) {
            if items.len() >= self.max_items {
                break;
            }

            let Some((link_el, url)) = self.resolve_link(el, base_url) else {
                continue;
            };

            let title = self
                .title
                .as_ref()
                .and_then(|sel| el.select(sel).next())
                .map(element_text)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| element_text(link_el));
            let title = if title.is_empty() {
                url.to_string()
            } else {
                title
            };

            let date = self.date.as_ref().and_then(|sel| {
                let date_el = el.select(sel).next()?;
                let raw = match &self.date_attr {
                    Some(attr) => date_el.value().attr(attr)?.to_string(),
                    None => element_text(date_el),
                };
                parse_date(&raw)
            });

            let item_id = item_id_for(&url, &title, self.id_pattern.as_ref());
            if !seen.insert(item_id.clone()) {
                continue;
            }

            items.push(ListingItem {
                item_id,
                title,
                url: url.to_string(),
                date,
            });
        }

        items
    }

    fn resolve_link<'a>(&self, el: ElementRef<'a>, base_url: &Url) -> Option<(ElementRef<'a>, Url)> {
        let link_el = match &self.link {
            Some(sel) => el.select(sel).next()?,
            None if el.value().name() == "a" && el.value().attr("href").is_some() => el,
            None => el.select(&self.fallback_link).next()?,
        };

        let href = link_el.value().attr("href")?.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
        {
            return None;
        }

        let mut resolved = base_url.join(href).ok()?;
        resolved.set_fragment(None);
        Some((link_el, resolved))
    }
}

fn parse_selector(field: &str, raw: &str) -> Result<Selector> {
    Selector::parse(raw)
        .map_err(|e| ChangeWatchError::parse(format!("invalid {field} '{raw}': {e:?}")))
}

/// Element text with whitespace collapsed.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse RFC 3339, RFC 2822, or a bare `YYYY-MM-DD` date.
pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Derive a source-local item id.
///
/// 1. the first capture of `pattern` against the absolute URL, if configured and matching
/// 2. the full path without surrounding slashes (extension stripped, query appended)
/// 3. a content hash of URL + title
///
/// Articles sharing a final segment (`/news/101/index.html`,
/// `/news/102/index.html`) get distinct ids.
pub fn item_id_for(url: &Url, title: &str, pattern: Option<&Regex>) -> String {
    if let Some(id) = pattern
        .and_then(|re| re.captures(url.as_str()))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
    {
        return id.to_string();
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segs| segs.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let Some((last, parents)) = segments.split_last() else {
        return content_hash_id(url.as_str(), title);
    };
    let last = STRIP_EXTENSIONS
        .iter()
        .find_map(|ext| last.strip_suffix(ext))
        .unwrap_or(last);

    let mut path = parents.join("/");
    if !last.is_empty() {
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(last);
    }
    if path.is_empty() {
        return content_hash_id(url.as_str(), title);
    }

    match url.query() {
        Some(q) => format!("{path}?{q}"),
        None => path,
    }
}

/// First 16 hex chars of SHA-256(url + title).
fn content_hash_id(url: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(title.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(item_selector: &str) -> ExtractionRule {
        ExtractionRule {
            item_selector: item_selector.into(),
            link_selector: None,
            title_selector: None,
            date_selector: None,
            date_attr: None,
            id_pattern: None,
            max_items: 50,
        }
    }

    fn base() -> Url {
        Url::parse("https://news.example.com/latest").unwrap()
    }

    #[test]
    fn id_from_path() {
        let url = Url::parse("https://news.example.com/posts/1234-some-title.html").unwrap();
        assert_eq!(item_id_for(&url, "t", None), "posts/1234-some-title");

        let url = Url::parse("https://news.example.com/posts/99/").unwrap();
        assert_eq!(item_id_for(&url, "t", None), "posts/99");
    }

    #[test]
    fn id_keeps_query() {
        let url = Url::parse("https://news.example.com/view.php?id=42").unwrap();
        assert_eq!(item_id_for(&url, "t", None), "view?id=42");
    }

    #[test]
    fn shared_last_segment_gives_distinct_ids() {
        let a = Url::parse("https://news.example.com/news/101/index.html").unwrap();
        let b = Url::parse("https://news.example.com/news/102/index.html").unwrap();
        assert_eq!(item_id_for(&a, "t", None), "news/101/index");
        assert_ne!(item_id_for(&a, "t", None), item_id_for(&b, "t", None));

        let html = r#"<ul class="posts">
            <li><a href="/news/102/index.html">Second story</a></li>
            <li><a href="/news/101/index.html">First story</a></li>
            <li><a href="/news/101/amp">First story (AMP)</a></li>
        </ul>"#;
        let ex = ListingExtractor::compile(&rule("ul.posts li")).unwrap();
        let ids: Vec<_> = ex
            .extract(html, &base())
            .into_iter()
            .map(|i| i.item_id)
            .collect();
        assert_eq!(ids, vec!["news/102/index", "news/101/index", "news/101/amp"]);
    }

    #[test]
    fn id_from_pattern() {
        let re = Regex::new(r"/posts/(\d+)").unwrap();
        let url = Url::parse("https://news.example.com/posts/1234/slug").unwrap();
        assert_eq!(item_id_for(&url, "t", Some(&re)), "1234");
    }

    #[test]
    fn id_hash_fallback() {
        let url = Url::parse("https://news.example.com/").unwrap();
        let a = item_id_for(&url, "Front page", None);
        let b = item_id_for(&url, "Front page", None);
        let c = item_id_for(&url, "Other", None);
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn extracts_in_document_order() {
        let html = r#"<ul class="posts">
            <li><a href="/posts/3">Third</a></li>
            <li><a href="/posts/2">Second</a></li>
            <li><a href="https://news.example.com/posts/1#top">First</a></li>
        </ul>"#;
        let ex = ListingExtractor::compile(&rule("ul.posts li")).unwrap();
        let items = ex.extract(html, &base());

        let ids: Vec<_> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["posts/3", "posts/2", "posts/1"]);
        assert_eq!(items[0].title, "Third");
        assert_eq!(items[0].url, "https://news.example.com/posts/3");
        assert_eq!(items[2].url, "https://news.example.com/posts/1");
    }

    #[test]
    fn anchors_as_items_and_skips() {
        let html = r##"<div>
            <a class="entry" href="/a/10">Ten</a>
            <a class="entry" href="#">Nothing</a>
            <a class="entry" href="javascript:void(0)">Script</a>
            <a class="entry" href="/a/10">Ten again</a>
            <a class="entry" href="/a/9">Nine</a>
        </div>"##;
        let ex = ListingExtractor::compile(&rule("a.entry")).unwrap();
        let items = ex.extract(html, &base());
        let ids: Vec<_> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a/10", "a/9"]);
    }

    #[test]
    fn custom_title_date_and_cap() {
        let html = r#"
            <article><h2>Alpha   release</h2><a href="/r/3">read</a><time datetime="2024-05-03T10:00:00Z">May 3</time></article>
            <article><h2>Beta</h2><a href="/r/2">read</a><time datetime="2024-05-02">May 2</time></article>
            <article><h2>Gamma</h2><a href="/r/1">read</a></article>
        "#;
        let mut r = rule("article");
        r.title_selector = Some("h2".into());
        r.date_selector = Some("time".into());
        r.date_attr = Some("datetime".into());
        r.max_items = 2;

        let ex = ListingExtractor::compile(&r).unwrap();
        let items = ex.extract(html, &base());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Alpha release");
        assert_eq!(
            items[0].date.unwrap().to_rfc3339(),
            "2024-05-03T10:00:00+00:00"
        );
        assert_eq!(items[1].date.unwrap().to_rfc3339(), "2024-05-02T00:00:00+00:00");
    }

    #[test]
    fn invalid_selector_rejected() {
        let err = ListingExtractor::compile(&rule("li[")).unwrap_err();
        assert!(err.to_string().contains("item_selector"));
    }

    #[test]
    fn parses_date_formats() {
        assert!(parse_date("2024-01-02T03:04:05+02:00").is_some());
        assert!(parse_date("Tue, 1 Jul 2003 10:52:37 +0200").is_some());
        assert!(parse_date("2024-01-02").is_some());
        assert!(parse_date("yesterday").is_none());
    }
}
