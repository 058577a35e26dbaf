//! Content extraction: configured CSS selectors with a readability-style
//! fallback, producing the canonical record pushed downstream.

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use scheduler::SourceId;

use crate::urlnorm::ContentHash;

/// Per-source CSS selector set, in extraction order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorSet {
    pub title: Option<String>,
    pub body: Option<String>,
    pub published_time: Option<String>,
    pub author: Option<String>,
    pub canonical_url: Option<String>,
    pub image: Option<String>,
}

/// Extraction result for one page.
#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub title: String,
    pub body: String,
    pub published_date: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub canonical_url: Option<String>,
    pub image: Option<String>,
    pub used_readability_fallback: bool,
}

impl Extracted {
    pub fn title_is_empty(&self) -> bool {
        self.title.trim().is_empty()
    }

    pub fn body_is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }

    /// Fingerprint of the extracted content (title + body, normalized).
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::from_content(&format!("{}\n{}", self.title, self.body))
    }
}

/// The record emitted to the indexing sink, one per extracted item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub url: String,
    pub final_url: String,
    pub source_id: SourceId,
    pub source_name: String,
    pub title: String,
    pub body: String,
    pub published_date: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub image: Option<String>,
    pub canonical_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub extraction_quality: RecordQuality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_blob_ref: Option<String>,
}

/// Per-record quality flags surfaced to the sink.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecordQuality {
    pub empty_title: bool,
    pub empty_body: bool,
    pub used_readability_fallback: bool,
}

/// Selector-driven extractor with an optional readability fallback.
#[derive(Debug, Clone)]
pub struct Extractor {
    pub readability_fallback: bool,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            readability_fallback: true,
        }
    }
}

impl Extractor {
    pub fn extract(&self, html: &str, selectors: &SelectorSet) -> Extracted {
        let document = Html::parse_document(html);

        let mut extracted = Extracted {
            title: select_text(&document, selectors.title.as_deref()).unwrap_or_default(),
            body: select_text(&document, selectors.body.as_deref()).unwrap_or_default(),
            published_date: select_datetime(&document, selectors.published_time.as_deref()),
            author: select_text(&document, selectors.author.as_deref()),
            canonical_url: select_link(&document, selectors.canonical_url.as_deref()),
            image: select_image(&document, selectors.image.as_deref()),
            used_readability_fallback: false,
        };

        // The fallback triggers on EMPTY title or body only; wrong-but-
        // non-empty selector output is surfaced via the quality counters.
        if self.readability_fallback && (extracted.title_is_empty() || extracted.body_is_empty()) {
            let (title, body) = readability(&document);
            if extracted.title_is_empty() && !title.is_empty() {
                extracted.title = title;
                extracted.used_readability_fallback = true;
            }
            if extracted.body_is_empty() && !body.is_empty() {
                extracted.body = body;
                extracted.used_readability_fallback = true;
            }
            if extracted.used_readability_fallback {
                debug!("selector extraction empty, used readability fallback");
            }
        }

        extracted
    }
}

fn parse_selector(raw: &str) -> Option<Selector> {
    Selector::parse(raw).ok()
}

fn select_text(document: &Html, selector: Option<&str>) -> Option<String> {
    let selector = parse_selector(selector?)?;
    let element = document.select(&selector).next()?;
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = squeeze_whitespace(&text);
    (!text.is_empty()).then_some(text)
}

fn select_datetime(document: &Html, selector: Option<&str>) -> Option<DateTime<Utc>> {
    let selector = parse_selector(selector?)?;
    let element = document.select(&selector).next()?;
    let raw = element
        .value()
        .attr("datetime")
        .or_else(|| element.value().attr("content"))
        .map(str::to_string)
        .unwrap_or_else(|| element.text().collect::<Vec<_>>().join(" "));
    parse_date(raw.trim())
}

fn select_link(document: &Html, selector: Option<&str>) -> Option<String> {
    let selector = parse_selector(selector?)?;
    let element = document.select(&selector).next()?;
    element
        .value()
        .attr("href")
        .or_else(|| element.value().attr("content"))
        .map(str::to_string)
}

fn select_image(document: &Html, selector: Option<&str>) -> Option<String> {
    let selector = parse_selector(selector?)?;
    let element = document.select(&selector).next()?;
    element
        .value()
        .attr("src")
        .or_else(|| element.value().attr("content"))
        .or_else(|| element.value().attr("href"))
        .map(str::to_string)
}

/// Accepts RFC 3339, RFC 2822, and bare dates.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

/// Heuristic title + body extraction: the densest text container wins.
fn readability(document: &Html) -> (String, String) {
    let title = first_text(document, "title")
        .or_else(|| meta_content(document, r#"meta[property="og:title"]"#))
        .unwrap_or_default();

    // Prefer semantic containers, then fall back to the densest <div>.
    let body = ["article", "main"]
        .iter()
        .find_map(|tag| container_text(document, tag))
        .or_else(|| densest_div(document))
        .or_else(|| container_text(document, "body"))
        .unwrap_or_default();

    (squeeze_whitespace(&title), body)
}

fn first_text(document: &Html, raw: &str) -> Option<String> {
    let selector = parse_selector(raw)?;
    let element = document.select(&selector).next()?;
    let text = squeeze_whitespace(&element.text().collect::<Vec<_>>().join(" "));
    (!text.is_empty()).then_some(text)
}

fn meta_content(document: &Html, raw: &str) -> Option<String> {
    let selector = parse_selector(raw)?;
    document
        .select(&selector)
        .next()?
        .value()
        .attr("content")
        .map(str::to_string)
}

/// Text of a container's paragraphs, or its full text when it has none.
fn container_text(document: &Html, tag: &str) -> Option<String> {
    let selector = parse_selector(tag)?;
    let container = document.select(&selector).next()?;
    let p = parse_selector("p")?;
    let paragraphs: Vec<String> = container
        .select(&p)
        .map(|e| squeeze_whitespace(&e.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !t.is_empty())
        .collect();
    let text = if paragraphs.is_empty() {
        squeeze_whitespace(&container.text().collect::<Vec<_>>().join(" "))
    } else {
        paragraphs.join("\n\n")
    };
    (!text.is_empty()).then_some(text)
}

fn densest_div(document: &Html) -> Option<String> {
    let div = parse_selector("div")?;
    let p = parse_selector("p")?;
    document
        .select(&div)
        .map(|container| {
            let paragraphs: Vec<String> = container
                .select(&p)
                .map(|e| squeeze_whitespace(&e.text().collect::<Vec<_>>().join(" ")))
                .filter(|t| !t.is_empty())
                .collect();
            (paragraphs.iter().map(String::len).sum::<usize>(), paragraphs)
        })
        .max_by_key(|(score, _)| *score)
        .filter(|(score, _)| *score > 0)
        .map(|(_, paragraphs)| paragraphs.join("\n\n"))
}

fn squeeze_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Same-document link discovery; anchors, javascript:, mailto: and tel:
/// are skipped, relative URLs resolve against the final URL.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let Some(selector) = parse_selector("a[href]") else {
        return Vec::new();
    };
    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }
        if let Ok(resolved) = base.join(href) {
            if matches!(resolved.scheme(), "http" | "https") {
                links.push(resolved);
            }
        }
    }
    links
}
