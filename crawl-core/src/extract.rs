//! Link and metadata extraction from fetched HTML.

use scraper::{Html, Selector};
use url::Url;

/// Metadata lifted from a page's head.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Extract every `a[href]` from the document, resolved against `base_url`.
/// Non-navigational schemes (mailto, tel, javascript) are dropped, and
/// duplicates are removed preserving first-seen order.
pub fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let resolved = resolved.to_string();
        if seen.insert(resolved.clone()) {
            links.push(resolved);
        }
    }
    links
}

/// Extract the `<title>` text and the meta description, trimmed.
pub fn extract_metadata(html: &str) -> PageMetadata {
    let document = Html::parse_document(html);
    let mut metadata = PageMetadata::default();

    if let Ok(selector) = Selector::parse("title") {
        metadata.title = document.select(&selector).next().map(|element| {
            element
                .text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        });
    }
    if let Ok(selector) = Selector::parse(r#"meta[name="description"]"#) {
        metadata.description = document
            .select(&selector)
            .next()
            .and_then(|element| element.value().attr("content"))
            .map(|content| content.trim().to_owned());
    }

    metadata.title = metadata.title.filter(|title| !title.is_empty());
    metadata.description = metadata
        .description
        .filter(|description| !description.is_empty());
    metadata
}
