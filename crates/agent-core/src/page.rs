use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::dom::DocumentHandle;

pub type TabId = String;

pub const NEW_TAB_URL: &str = "vyber://newtab";

/// Tab and document access supplied by the host application.
#[async_trait]
pub trait PageContext: Send + Sync {
    fn active_tab(&self) -> Option<TabId>;

    async fn navigate(&self, tab: &str, url: &str) -> Result<()>;

    async fn add_tab(&self) -> Result<TabId>;

    async fn close_tab(&self, tab: &str) -> Result<()>;

    /// Document of the active tab, if one is loaded.
    fn document(&self) -> Option<DocumentHandle>;
}

#[derive(Debug, Clone)]
struct Tab {
    url: String,
    document: Option<DocumentHandle>,
}

#[derive(Debug, Default)]
struct PageState {
    tabs: IndexMap<TabId, Tab>,
    active: Option<TabId>,
    next_id: u64,
    served: HashMap<String, String>,
}

impl PageState {
    fn load(&self, url: &str) -> DocumentHandle {
        match self.served.get(url) {
            Some(markup) => DocumentHandle::same_origin(url, markup.clone()),
            None => DocumentHandle::cross_origin(url),
        }
    }
}

/// In-memory tab store. Navigation loads markup registered with
/// [`MemoryPage::serve`]; any other URL yields a cross-origin document.
#[derive(Debug, Default)]
pub struct MemoryPage {
    state: Mutex<PageState>,
}

impl MemoryPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an active tab showing `url`.
    pub fn with_tab(self, url: &str) -> Self {
        {
            let mut state = self.lock();
            let document = state.load(url);
            let id = next_tab_id(&mut state);
            state.tabs.insert(
                id.clone(),
                Tab {
                    url: url.to_string(),
                    document: Some(document),
                },
            );
            state.active = Some(id);
        }
        self
    }

    /// Registers markup returned for `url` on later navigations.
    pub fn serve(self, url: &str, markup: &str) -> Self {
        self.lock()
            .served
            .insert(url.to_string(), markup.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_document(&self, tab: &str, document: Option<DocumentHandle>) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .tabs
            .get_mut(tab)
            .ok_or_else(|| anyhow!("Unknown tab: {tab}"))?;
        entry.document = document;
        Ok(())
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.lock().tabs.keys().cloned().collect()
    }

    pub fn url_of(&self, tab: &str) -> Option<String> {
        self.lock().tabs.get(tab).map(|entry| entry.url.clone())
    }
}

#[async_trait]
impl PageContext for MemoryPage {
    fn active_tab(&self) -> Option<TabId> {
        self.lock().active.clone()
    }

    async fn navigate(&self, tab: &str, url: &str) -> Result<()> {
        let mut state = self.lock();
        let document = state.load(url);
        let entry = state
            .tabs
            .get_mut(tab)
            .ok_or_else(|| anyhow!("Unknown tab: {tab}"))?;
        entry.url = url.to_string();
        entry.document = Some(document);
        Ok(())
    }

    async fn add_tab(&self) -> Result<TabId> {
        let mut state = self.lock();
        let id = next_tab_id(&mut state);
        state.tabs.insert(
            id.clone(),
            Tab {
                url: NEW_TAB_URL.to_string(),
                document: None,
            },
        );
        state.active = Some(id.clone());
        Ok(id)
    }

    async fn close_tab(&self, tab: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .tabs
            .shift_remove(tab)
            .ok_or_else(|| anyhow!("Unknown tab: {tab}"))?;
        if state.active.as_deref() == Some(tab) {
            state.active = state.tabs.keys().last().cloned();
        }
        Ok(())
    }

    fn document(&self) -> Option<DocumentHandle> {
        let state = self.lock();
        let active = state.active.as_ref()?;
        state.tabs.get(active)?.document.clone()
    }
}

fn next_tab_id(state: &mut PageState) -> TabId {
    state.next_id += 1;
    format!("tab-{}", state.next_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn navigation_loads_served_markup() {
        let page = MemoryPage::new()
            .serve("https://example.com/", "<title>Example</title>")
            .with_tab(NEW_TAB_URL);
        let tab = page.active_tab().unwrap();

        page.navigate(&tab, "https://example.com/").await.unwrap();
        let document = page.document().unwrap();
        assert!(!document.is_cross_origin());
        assert_eq!(page.url_of(&tab).as_deref(), Some("https://example.com/"));

        page.navigate(&tab, "https://elsewhere.test/").await.unwrap();
        assert!(page.document().unwrap().is_cross_origin());
    }

    #[tokio::test]
    async fn closing_active_tab_activates_last_remaining() {
        let page = MemoryPage::new().with_tab("https://a.test/");
        let first = page.active_tab().unwrap();
        let second = page.add_tab().await.unwrap();
        assert_eq!(page.active_tab(), Some(second.clone()));
        assert!(page.document().is_none());

        page.close_tab(&second).await.unwrap();
        assert_eq!(page.active_tab(), Some(first.clone()));
        page.close_tab(&first).await.unwrap();
        assert_eq!(page.active_tab(), None);
        assert!(page.close_tab(&first).await.is_err());
    }
}
