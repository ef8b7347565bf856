//! In-process config service for tests and local development.
//!
//! Mirrors the service semantics the remote backend depends on: CAS
//! publishes, blur search with `*` wildcards, pagination, and change
//! notification to registered listeners. State lives in maps guarded by a
//! mutex; listener callbacks fire on the publisher's task.

use super::{
    content_md5, effective_group, ChangeHandler, ConfigChange, ConfigClient, ConfigItem,
    ConfigPage, NacosError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    // Keyed by (group, data_id); BTreeMap keeps search output deterministic.
    configs: BTreeMap<(String, String), String>,
    listeners: HashMap<(String, String), ChangeHandler>,
}

#[derive(Default)]
pub struct MemoryConfigClient {
    state: Mutex<MemoryState>,
}

impl MemoryConfigClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw record access for assertions in tests.
    pub fn raw(&self, data_id: &str, group: &str) -> Option<String> {
        let key = (effective_group(group).to_string(), data_id.to_string());
        self.state.lock().expect("state lock").configs.get(&key).cloned()
    }

    /// Writes a record without firing listeners, emulating out-of-band
    /// mutation by another client of the service.
    pub fn seed(&self, data_id: &str, group: &str, content: &str) {
        let key = (effective_group(group).to_string(), data_id.to_string());
        self.state
            .lock()
            .expect("state lock")
            .configs
            .insert(key, content.to_string());
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    // Greedy segment match over '*' wildcards, enough for `<plural>.*`.
    let mut remaining = value;
    let mut segments = pattern.split('*').peekable();
    let mut first = true;
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            first = false;
            continue;
        }
        match remaining.find(segment) {
            Some(pos) => {
                if first && pos != 0 {
                    return false;
                }
                remaining = &remaining[pos + segment.len()..];
            }
            None => return false,
        }
        if segments.peek().is_none() && !pattern.ends_with('*') && !remaining.is_empty() {
            return false;
        }
        first = false;
    }
    true
}

#[async_trait]
impl ConfigClient for MemoryConfigClient {
    async fn get_config(&self, data_id: &str, group: &str) -> Result<Option<String>, NacosError> {
        let key = (effective_group(group).to_string(), data_id.to_string());
        Ok(self.state.lock().expect("state lock").configs.get(&key).cloned())
    }

    async fn publish_config(
        &self,
        data_id: &str,
        group: &str,
        content: &str,
        cas_md5: Option<&str>,
    ) -> Result<bool, NacosError> {
        let key = (effective_group(group).to_string(), data_id.to_string());
        let handler = {
            let mut state = self.state.lock().expect("state lock");
            if let Some(expected) = cas_md5.filter(|cas| !cas.is_empty()) {
                let current = state.configs.get(&key).cloned().unwrap_or_default();
                if content_md5(&current) != expected {
                    return Ok(false);
                }
            }
            state.configs.insert(key.clone(), content.to_string());
            state.listeners.get(&key).cloned()
        };
        if let Some(handler) = handler {
            handler(ConfigChange {
                data_id: data_id.to_string(),
                group: effective_group(group).to_string(),
                content: content.to_string(),
            });
        }
        Ok(true)
    }

    async fn delete_config(&self, data_id: &str, group: &str) -> Result<bool, NacosError> {
        let key = (effective_group(group).to_string(), data_id.to_string());
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .configs
            .remove(&key)
            .is_some())
    }

    async fn search_configs(
        &self,
        data_id_pattern: &str,
        group: &str,
        page_no: u32,
        page_size: u32,
    ) -> Result<ConfigPage, NacosError> {
        let state = self.state.lock().expect("state lock");
        let matches: Vec<ConfigItem> = state
            .configs
            .iter()
            .filter(|((item_group, data_id), _)| {
                (group.is_empty() || item_group == group) && wildcard_match(data_id_pattern, data_id)
            })
            .map(|((item_group, data_id), content)| ConfigItem {
                data_id: data_id.clone(),
                group: item_group.clone(),
                content: content.clone(),
            })
            .collect();

        let page_size = page_size.max(1);
        let total = matches.len() as u32;
        let pages_available = total.div_ceil(page_size);
        let start = ((page_no.max(1) - 1) * page_size) as usize;
        let items = matches
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();
        Ok(ConfigPage {
            total_count: total,
            page_number: page_no,
            pages_available,
            items,
        })
    }

    async fn listen(
        &self,
        data_id: &str,
        group: &str,
        handler: ChangeHandler,
    ) -> Result<(), NacosError> {
        let key = (effective_group(group).to_string(), data_id.to_string());
        self.state
            .lock()
            .expect("state lock")
            .listeners
            .insert(key, handler);
        Ok(())
    }

    async fn cancel_listen(&self, data_id: &str, group: &str) {
        let key = (effective_group(group).to_string(), data_id.to_string());
        self.state.lock().expect("state lock").listeners.remove(&key);
    }
}
