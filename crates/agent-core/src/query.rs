//! Read-only queries over document markup.
//!
//! Everything here is synchronous: a parsed [`Html`] tree is not `Send`, so
//! callers parse, query and drop it without crossing an await point.

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Subtrees left out of whole-page text extraction.
const SKIPPED_TAGS: [&str; 6] = ["script", "style", "nav", "header", "footer", "aside"];
pub const TRUNCATION_MARKER: &str = "... [truncated]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),
    #[error("Selector not found: {0}")]
    ContainerNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// `tag#id.class` style description, used as the event target.
    pub description: String,
    pub tag: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    pub element: ElementInfo,
    /// Enclosing form, if any.
    pub form: Option<ElementInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMeta {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    pub truncated: bool,
}

impl ExtractedText {
    pub fn length(&self) -> usize {
        self.text.chars().count()
    }
}

fn selector(raw: &str) -> Result<Selector, QueryError> {
    Selector::parse(raw).map_err(|_| QueryError::InvalidSelector(raw.to_string()))
}

fn body(document: &Html) -> Option<ElementRef<'_>> {
    let body = Selector::parse("body").ok()?;
    document.select(&body).next()
}

fn describe(element: ElementRef<'_>) -> ElementInfo {
    let value = element.value();
    let mut description = value.name().to_string();
    if let Some(id) = value.id() {
        description.push('#');
        description.push_str(id);
    }
    for class in value.classes() {
        description.push('.');
        description.push_str(class);
    }
    ElementInfo {
        description,
        tag: value.name().to_string(),
        text: collapse_whitespace(&element.text().collect::<String>()),
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_visible_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(inner) if SKIPPED_TAGS.contains(&inner.name()) => {}
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_visible_text(child, out);
                }
            }
            _ => {}
        }
    }
}

/// Cleaned text of the first match for `scope`, or of the page body with
/// non-content subtrees removed. Truncates to `max_length` characters.
pub fn extract_text(
    markup: &str,
    scope: Option<&str>,
    max_length: usize,
) -> Result<ExtractedText, QueryError> {
    let document = Html::parse_document(markup);
    let raw = match scope {
        Some(scope) => {
            let selector = selector(scope)?;
            document
                .select(&selector)
                .next()
                .map(|element| element.text().collect::<String>())
                .unwrap_or_default()
        }
        None => {
            let mut raw = String::new();
            if let Some(body) = body(&document) {
                collect_visible_text(body, &mut raw);
            }
            raw
        }
    };

    let cleaned = collapse_whitespace(&raw);
    if cleaned.chars().count() <= max_length {
        return Ok(ExtractedText {
            text: cleaned,
            truncated: false,
        });
    }
    let mut text: String = cleaned.chars().take(max_length).collect();
    text.push_str(TRUNCATION_MARKER);
    Ok(ExtractedText {
        text,
        truncated: true,
    })
}

/// Anchors with a usable `href` inside `scope` (or the body), resolved
/// against `base_url`, capped at `max_links`.
pub fn extract_links(
    markup: &str,
    base_url: &str,
    scope: Option<&str>,
    max_links: usize,
) -> Result<Vec<Link>, QueryError> {
    let document = Html::parse_document(markup);
    let container = match scope {
        Some(scope) => document
            .select(&selector(scope)?)
            .next()
            .ok_or_else(|| QueryError::ContainerNotFound(scope.to_string()))?,
        None => body(&document).ok_or_else(|| QueryError::ContainerNotFound("body".into()))?,
    };
    let anchors = selector("a[href]")?;
    let base = Url::parse(base_url).ok();

    Ok(container
        .select(&anchors)
        .filter_map(|anchor| {
            let raw = anchor.value().attr("href")?.trim();
            let href = match &base {
                Some(base) => base
                    .join(raw)
                    .map(String::from)
                    .unwrap_or_else(|_| raw.to_string()),
                None => raw.to_string(),
            };
            if href.is_empty() || href.starts_with("javascript:") {
                return None;
            }
            Some(Link {
                text: anchor.text().collect::<String>().trim().to_string(),
                href,
            })
        })
        .take(max_links)
        .collect())
}

pub fn locate(markup: &str, raw_selector: &str) -> Result<Option<ElementInfo>, QueryError> {
    let document = Html::parse_document(markup);
    let selector = selector(raw_selector)?;
    Ok(document.select(&selector).next().map(describe))
}

pub fn contains(markup: &str, raw_selector: &str) -> Result<bool, QueryError> {
    Ok(locate(markup, raw_selector)?.is_some())
}

/// Parent element of the first body text node (document order) containing `needle`.
pub fn locate_by_text(markup: &str, needle: &str) -> Option<ElementInfo> {
    let document = Html::parse_document(markup);
    let body = body(&document)?;
    body.descendants()
        .find(|node| matches!(node.value(), Node::Text(text) if text.contains(needle)))
        .and_then(|node| node.parent())
        .and_then(ElementRef::wrap)
        .map(describe)
}

pub fn locate_input(markup: &str, raw_selector: &str) -> Result<Option<InputInfo>, QueryError> {
    let document = Html::parse_document(markup);
    let selector = selector(raw_selector)?;
    let Some(element) = document.select(&selector).next() else {
        return Ok(None);
    };
    let form = std::iter::once(element)
        .chain(element.ancestors().filter_map(ElementRef::wrap))
        .find(|candidate| candidate.value().name() == "form")
        .map(describe);
    Ok(Some(InputInfo {
        element: describe(element),
        form,
    }))
}

pub fn page_meta(markup: &str) -> PageMeta {
    let document = Html::parse_document(markup);
    let title = Selector::parse("title").ok().and_then(|title| {
        document
            .select(&title)
            .next()
            .map(|element| collapse_whitespace(&element.text().collect::<String>()))
    });
    let description = Selector::parse(r#"meta[name="description"]"#)
        .ok()
        .and_then(|meta| document.select(&meta).next())
        .and_then(|element| element.value().attr("content"))
        .map(str::to_string);
    PageMeta { title, description }
}
