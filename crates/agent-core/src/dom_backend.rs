use std::time::Duration;

use ai_agent::ToolResult;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{completion_result, BackendKind, ToolBackend};
use crate::dom::{DocumentHandle, DomAction, SyntheticEvent};
use crate::input::{search_url, ClickTarget, ScrollDirection, ToolInput, DEFAULT_WAIT_TIMEOUT_MS};
use crate::page::{PageContext, NEW_TAB_URL};
use crate::query;

pub const INTERNAL_SCHEME: &str = "vyber://";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs tools against the in-process document exposed by the page context.
#[derive(Debug, Clone)]
pub struct DomBackend {
    internal_scheme: String,
}

impl Default for DomBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DomBackend {
    pub fn new() -> Self {
        Self {
            internal_scheme: INTERNAL_SCHEME.to_string(),
        }
    }

    /// URLs starting with `scheme` are host pages and never navigated to.
    pub fn with_internal_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.internal_scheme = scheme.into();
        self
    }

    async fn navigate(&self, url: &str, page: &dyn PageContext) -> Result<ToolResult> {
        if url.starts_with(&self.internal_scheme) {
            debug!(target: "dom_backend", url, "skipping internal page");
            return Ok(ToolResult::ok(json!({ "navigated_to": url, "internal": true })));
        }
        let Some(tab) = page.active_tab() else {
            return Ok(ToolResult::failure("No active tab"));
        };
        page.navigate(&tab, url).await?;
        Ok(ToolResult::ok(json!({ "navigated_to": url })))
    }

    async fn wait(
        &self,
        selector: Option<&str>,
        timeout_ms: Option<u64>,
        page: &dyn PageContext,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
        let Some(selector) = selector else {
            tokio::select! {
                _ = cancel.cancelled() => return ToolResult::failure("wait cancelled"),
                _ = sleep(Duration::from_millis(timeout_ms)) => {}
            }
            return ToolResult::ok(json!({ "waited_ms": timeout_ms }));
        };
        if let Err(denied) = readable_document(page) {
            return denied;
        }

        let started = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);
        loop {
            // Re-read each poll: the host may navigate or refresh markup meanwhile.
            if let Some(markup) = page.document().and_then(|document| document.markup()) {
                match query::contains(&markup, selector) {
                    Ok(true) => {
                        return ToolResult::ok(json!({
                            "found": selector,
                            "waited_ms": started.elapsed().as_millis() as u64,
                        }))
                    }
                    Ok(false) => {}
                    Err(err) => return ToolResult::failure(err.to_string()),
                }
            }
            if started.elapsed() >= timeout {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return ToolResult::failure("wait cancelled"),
                _ = sleep(POLL_INTERVAL) => {}
            }
        }
        ToolResult::failure(format!("Timeout waiting for: {selector}"))
    }
}

#[async_trait]
impl ToolBackend for DomBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Dom
    }

    async fn execute(
        &self,
        input: &ToolInput,
        page: &dyn PageContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        let result = match input {
            ToolInput::Navigate { url } => return self.navigate(url, page).await,
            ToolInput::ExtractText {
                selector,
                max_length,
            } => with_markup(page, |_, markup| {
                let extracted = query::extract_text(markup, selector.as_deref(), *max_length)?;
                Ok(json!({ "text": extracted.text, "length": extracted.length() }))
            }),
            ToolInput::ExtractLinks {
                selector,
                max_links,
            } => with_markup(page, |document, markup| {
                let links =
                    query::extract_links(markup, &document.url(), selector.as_deref(), *max_links)?;
                Ok(json!({ "count": links.len(), "links": links }))
            }),
            ToolInput::Click { target } => click(page, target),
            ToolInput::FillForm {
                selector,
                value,
                submit,
            } => fill_form(page, selector, value, *submit),
            ToolInput::Screenshot { .. } => {
                ToolResult::failure("Screenshots require same-origin page or native mode")
            }
            ToolInput::Scroll {
                direction,
                selector,
                amount,
            } => scroll(page, *direction, selector.as_deref(), *amount),
            ToolInput::Wait {
                selector,
                timeout_ms,
            } => {
                self.wait(selector.as_deref(), *timeout_ms, page, cancel)
                    .await
            }
            ToolInput::GetPageInfo => page_info(page),
            ToolInput::SearchGoogle { query } => {
                let Some(tab) = page.active_tab() else {
                    return Ok(ToolResult::failure("No active tab"));
                };
                let url = search_url(query);
                page.navigate(&tab, &url).await?;
                ToolResult::ok(json!({ "searched": query, "url": url }))
            }
            ToolInput::OpenTab { url } => {
                let tab = page.add_tab().await?;
                if let Some(url) = url {
                    page.navigate(&tab, url).await?;
                }
                ToolResult::ok(json!({
                    "tab_id": tab,
                    "url": url.as_deref().unwrap_or(NEW_TAB_URL),
                }))
            }
            ToolInput::CloseTab => {
                let Some(tab) = page.active_tab() else {
                    return Ok(ToolResult::failure("No active tab"));
                };
                page.close_tab(&tab).await?;
                ToolResult::ok(json!({ "closed": tab }))
            }
            ToolInput::Complete { summary, data } => {
                completion_result(summary.as_deref(), data.as_ref())
            }
        };
        Ok(result)
    }
}

/// The active document and its markup, or the failure to report.
fn readable_document(page: &dyn PageContext) -> Result<(DocumentHandle, String), ToolResult> {
    let document = page.document().ok_or_else(|| {
        ToolResult::failure("Cannot access page content (no document loaded)")
    })?;
    let markup = document
        .markup()
        .ok_or_else(|| ToolResult::failure("Cannot access page content (cross-origin)"))?;
    Ok((document, markup))
}

fn with_markup<F>(page: &dyn PageContext, read: F) -> ToolResult
where
    F: FnOnce(&DocumentHandle, &str) -> Result<Value, query::QueryError>,
{
    match readable_document(page) {
        Ok((document, markup)) => match read(&document, &markup) {
            Ok(data) => ToolResult::ok(data),
            Err(err) => ToolResult::failure(err.to_string()),
        },
        Err(denied) => denied,
    }
}

fn click(page: &dyn PageContext, target: &ClickTarget) -> ToolResult {
    let (document, markup) = match readable_document(page) {
        Ok(readable) => readable,
        Err(denied) => return denied,
    };
    let element = match target {
        ClickTarget::Selector(selector) => match query::locate(&markup, selector) {
            Ok(element) => element,
            Err(err) => return ToolResult::failure(err.to_string()),
        },
        ClickTarget::Text(text) => query::locate_by_text(&markup, text),
    };
    let Some(element) = element else {
        return ToolResult::failure("Element not found");
    };
    document.record(DomAction::Click {
        target: element.description,
    });
    ToolResult::ok(json!({ "clicked": target.label() }))
}

fn fill_form(page: &dyn PageContext, selector: &str, value: &str, submit: bool) -> ToolResult {
    let (document, markup) = match readable_document(page) {
        Ok(readable) => readable,
        Err(denied) => return denied,
    };
    let input = match query::locate_input(&markup, selector) {
        Ok(Some(input)) => input,
        Ok(None) => return ToolResult::failure(format!("Input not found: {selector}")),
        Err(err) => return ToolResult::failure(err.to_string()),
    };

    let target = input.element.description;
    document.record(DomAction::SetValue {
        selector: selector.to_string(),
        value: value.to_string(),
    });
    // Frameworks only notice a value set through these events.
    for event in [SyntheticEvent::Input, SyntheticEvent::Change] {
        document.record(DomAction::Dispatch {
            target: target.clone(),
            event,
        });
    }
    if submit {
        match input.form {
            Some(form) => {
                document.record(DomAction::SubmitForm {
                    form: form.description,
                });
            }
            None => {
                document.record(DomAction::Dispatch {
                    target,
                    event: SyntheticEvent::KeyDown {
                        key: "Enter".into(),
                    },
                });
            }
        }
    }
    ToolResult::ok(json!({ "filled": selector, "value": value }))
}

fn scroll(
    page: &dyn PageContext,
    direction: Option<ScrollDirection>,
    selector: Option<&str>,
    amount: Option<u64>,
) -> ToolResult {
    let (document, markup) = match readable_document(page) {
        Ok(readable) => readable,
        Err(denied) => return denied,
    };

    if let Some(selector) = selector {
        match query::contains(&markup, selector) {
            Ok(true) => {
                document.record(DomAction::ScrollIntoView {
                    selector: selector.to_string(),
                });
                return ToolResult::ok(json!({ "scrolled_to": selector }));
            }
            Ok(false) if direction.is_some() => {}
            Ok(false) => return ToolResult::failure(format!("Element not found: {selector}")),
            Err(err) => return ToolResult::failure(err.to_string()),
        }
    }

    let direction = direction.unwrap_or(ScrollDirection::Down);
    let amount = amount
        .map(|amount| i64::try_from(amount).unwrap_or(i64::MAX))
        .unwrap_or_else(|| i64::from(document.viewport().height));
    match direction {
        ScrollDirection::Up => document.scroll_by(amount.saturating_neg()),
        ScrollDirection::Down => document.scroll_by(amount),
        ScrollDirection::Top => document.scroll_to(0),
        ScrollDirection::Bottom => document.scroll_to(document.scroll_height()),
    };
    ToolResult::ok(json!({
        "scrolled": direction.as_str(),
        "scroll_y": document.scroll_y(),
    }))
}

fn page_info(page: &dyn PageContext) -> ToolResult {
    let Some(document) = page.document() else {
        return ToolResult::ok(json!({
            "url": "unknown",
            "title": "unknown",
            "description": null,
            "viewport": { "width": 0, "height": 0 },
        }));
    };
    let Some(markup) = document.markup() else {
        return ToolResult::ok(json!({
            "url": "cross-origin (restricted)",
            "title": "cross-origin (restricted)",
            "note": "Page is cross-origin, detailed info unavailable",
        }));
    };
    let meta = query::page_meta(&markup);
    let viewport = document.viewport();
    let url = document.url();
    ToolResult::ok(json!({
        "url": if url.is_empty() { "unknown".to_string() } else { url },
        "title": meta.title.filter(|title| !title.is_empty()).unwrap_or_else(|| "unknown".into()),
        "description": meta.description,
        "viewport": { "width": viewport.width, "height": viewport.height },
    }))
}
