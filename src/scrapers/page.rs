//! HTTP page fetcher.
//!
//! Every source gets its own request with no cookie jar, so nothing leaks
//! between sources. Only the HTML document is downloaded; images, fonts,
//! stylesheets and media referenced by the page are never requested. The
//! response body is dropped as soon as the text has been extracted.
//!
//! # Extraction
//!
//! - [`FetchMode::Text`]: text of headings and article-like blocks, in
//!   document order and without repeats. If that yields fewer than
//!   [`MIN_PRIORITY_CHARS`] characters, the visible text of `<body>` is used.
//! - [`FetchMode::Metadata`]: `<title>` plus the Open Graph title,
//!   description and image.
//!
//! Either way the result is capped at [`MAX_SNIPPET_CHARS`].

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use reqwest::header::ACCEPT;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};
use url::Url;

use super::{FetchError, PageFetcher};
use crate::models::{FetchMode, SourceDescriptor};
use crate::utils::{clean_text, excerpt};

/// Below this many characters the prioritized text is considered too thin.
pub const MIN_PRIORITY_CHARS: usize = 200;

/// Upper bound on extracted text per page.
pub const MAX_SNIPPET_CHARS: usize = 50_000;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

static PRIORITY_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        r#"h1, h2, h3, h4, article, [role="article"], time, [itemtype*="Event"], .event, .events"#,
    )
    .expect("valid priority selector")
});
static BODY_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("body").expect("valid body selector"));
static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("valid title selector"));
static OG_TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:title"]"#).expect("valid og:title selector")
});
static OG_DESCRIPTION_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:description"], meta[name="description"]"#)
        .expect("valid og:description selector")
});
static OG_IMAGE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:image"]"#).expect("valid og:image selector")
});

/// [`PageFetcher`] over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(level = "info", skip_all, fields(source = %source.id, url = %source.url))]
    async fn fetch(&self, source: &SourceDescriptor) -> Result<String, FetchError> {
        let url = Url::parse(&source.url)?;
        let t0 = Instant::now();
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let html = response.text().await?;

        let text = match source.mode {
            FetchMode::Text => extract_text(&html),
            FetchMode::Metadata => extract_metadata(&html),
        };
        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            html_bytes = html.len(),
            chars = text.chars().count(),
            "Parsed page"
        );
        Ok(text)
    }
}

/// Visible text below `element`, skipping script-like containers.
fn visible_text(element: ElementRef<'_>) -> String {
    let pieces: Vec<&str> = element
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node.parent().and_then(ElementRef::wrap)?;
            match parent.value().name() {
                "script" | "style" | "noscript" | "template" => None,
                _ => Some(&**text),
            }
        })
        .collect();
    clean_text(&pieces.join(" "))
}

/// Prioritized page text, falling back to the whole body.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut prioritized = String::new();
    for element in document.select(&PRIORITY_SELECTOR) {
        let text = visible_text(element);
        if text.is_empty() || !seen.insert(text.clone()) {
            continue;
        }
        prioritized.push_str(&text);
        prioritized.push('\n');
    }

    let text = if prioritized.trim().chars().count() >= MIN_PRIORITY_CHARS {
        prioritized
    } else {
        debug!(
            chars = prioritized.chars().count(),
            "Prioritized text too short; using full page text"
        );
        document
            .select(&BODY_SELECTOR)
            .next()
            .map(visible_text)
            .unwrap_or_default()
    };
    excerpt(text.trim(), MAX_SNIPPET_CHARS).to_string()
}

/// Title and Open Graph metadata as labelled lines.
pub fn extract_metadata(html: &str) -> String {
    let document = Html::parse_document(html);
    let content = |selector: &Selector| {
        document
            .select(selector)
            .filter_map(|el| el.value().attr("content"))
            .map(clean_text)
            .find(|s| !s.is_empty())
    };

    let mut lines = Vec::new();
    if let Some(title) = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(visible_text)
        .filter(|t| !t.is_empty())
    {
        lines.push(format!("Title: {title}"));
    }
    if let Some(og_title) = content(&OG_TITLE_SELECTOR) {
        lines.push(format!("Open Graph title: {og_title}"));
    }
    if let Some(description) = content(&OG_DESCRIPTION_SELECTOR) {
        lines.push(format!("Description: {description}"));
    }
    if let Some(image) = content(&OG_IMAGE_SELECTOR) {
        lines.push(format!("Image: {image}"));
    }
    excerpt(&lines.join("\n"), MAX_SNIPPET_CHARS).to_string()
}
