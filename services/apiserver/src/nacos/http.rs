//! Nacos open-api client.
//!
//! Speaks the v1 HTTP surface: `/v1/cs/configs` for reads, publishes,
//! deletes and blur search, `/v1/cs/configs/listener` for long-poll change
//! subscriptions, `/v1/auth/login` when credentials are configured.
//! Requests rotate across the configured servers.

use super::{
    effective_group, ChangeHandler, ConfigChange, ConfigClient, ConfigItem, ConfigPage, NacosError,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

/// Long-poll window the service holds a listener request open for.
const LONG_POLL_MS: u64 = 30_000;
/// Separators of the `Listening-Configs` wire format.
const FIELD_SEP: char = '\u{2}';
const LINE_SEP: char = '\u{1}';

#[derive(Clone, Debug)]
pub struct HttpConfigClientOptions {
    pub servers: Vec<Url>,
    pub namespace_id: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "totalCount", default)]
    total_count: u32,
    #[serde(rename = "pageNumber", default)]
    page_number: u32,
    #[serde(rename = "pagesAvailable", default)]
    pages_available: u32,
    #[serde(rename = "pageItems", default)]
    page_items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(rename = "dataId")]
    data_id: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    content: String,
}

pub struct HttpConfigClient {
    http: reqwest::Client,
    options: HttpConfigClientOptions,
    next_server: AtomicUsize,
    access_token: tokio::sync::RwLock<Option<String>>,
    listeners: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

impl HttpConfigClient {
    pub fn new(options: HttpConfigClientOptions) -> Result<Self, NacosError> {
        if options.servers.is_empty() {
            return Err(NacosError::Other(
                "at least one config service server is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;
        Ok(Self {
            http,
            options,
            next_server: AtomicUsize::new(0),
            access_token: tokio::sync::RwLock::new(None),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let index = self.next_server.fetch_add(1, Ordering::Relaxed);
        let base = &self.options.servers[index % self.options.servers.len()];
        format!("{}/{}", base.as_str().trim_end_matches('/'), path)
    }

    async fn ensure_token(&self) -> Result<Option<String>, NacosError> {
        if self.options.username.is_empty() {
            return Ok(None);
        }
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(Some(token));
        }
        let response = self
            .http
            .post(self.endpoint("v1/auth/login"))
            .form(&[
                ("username", self.options.username.as_str()),
                ("password", self.options.password.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NacosError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|err| NacosError::BadResponse(format!("login response: {err}")))?;
        *self.access_token.write().await = Some(login.access_token.clone());
        Ok(Some(login.access_token))
    }

    async fn auth_params(&self) -> Result<Vec<(String, String)>, NacosError> {
        let mut params = Vec::new();
        if let Some(token) = self.ensure_token().await? {
            params.push(("accessToken".to_string(), token));
        }
        if !self.options.namespace_id.is_empty() {
            params.push(("tenant".to_string(), self.options.namespace_id.clone()));
        }
        Ok(params)
    }

    /// One long-poll round for a single record. Returns the new content when
    /// the service reports a change, `None` when the window elapsed quietly.
    async fn poll_once(
        &self,
        data_id: &str,
        group: &str,
        known_md5: &str,
    ) -> Result<Option<Option<String>>, NacosError> {
        let tenant = &self.options.namespace_id;
        let listening = format!(
            "{data_id}{FIELD_SEP}{group}{FIELD_SEP}{known_md5}{FIELD_SEP}{tenant}{LINE_SEP}"
        );
        let mut params = self.auth_params().await?;
        params.push(("Listening-Configs".to_string(), listening));

        let response = self
            .http
            .post(self.endpoint("v1/cs/configs/listener"))
            .header("Long-Pulling-Timeout", LONG_POLL_MS.to_string())
            .timeout(Duration::from_millis(LONG_POLL_MS + 10_000))
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NacosError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        // The record changed; fetch the fresh content.
        Ok(Some(self.get_config(data_id, group).await?))
    }
}

#[async_trait]
impl ConfigClient for HttpConfigClient {
    async fn get_config(&self, data_id: &str, group: &str) -> Result<Option<String>, NacosError> {
        let group = effective_group(group);
        let mut params = self.auth_params().await?;
        params.push(("dataId".to_string(), data_id.to_string()));
        params.push(("group".to_string(), group.to_string()));

        let response = self
            .http
            .get(self.endpoint("v1/cs/configs"))
            .query(&params)
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(Some(response.text().await?)),
            404 => Ok(None),
            status => Err(NacosError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn publish_config(
        &self,
        data_id: &str,
        group: &str,
        content: &str,
        cas_md5: Option<&str>,
    ) -> Result<bool, NacosError> {
        let group = effective_group(group);
        let mut params = self.auth_params().await?;
        params.push(("dataId".to_string(), data_id.to_string()));
        params.push(("group".to_string(), group.to_string()));
        params.push(("content".to_string(), content.to_string()));
        if let Some(cas) = cas_md5.filter(|cas| !cas.is_empty()) {
            params.push(("casMd5".to_string(), cas.to_string()));
        }

        let response = self
            .http
            .post(self.endpoint("v1/cs/configs"))
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NacosError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.text().await?.trim() == "true")
    }

    async fn delete_config(&self, data_id: &str, group: &str) -> Result<bool, NacosError> {
        let group = effective_group(group);
        let mut params = self.auth_params().await?;
        params.push(("dataId".to_string(), data_id.to_string()));
        params.push(("group".to_string(), group.to_string()));

        let response = self
            .http
            .delete(self.endpoint("v1/cs/configs"))
            .query(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NacosError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.text().await?.trim() == "true")
    }

    async fn search_configs(
        &self,
        data_id_pattern: &str,
        group: &str,
        page_no: u32,
        page_size: u32,
    ) -> Result<ConfigPage, NacosError> {
        let mut params = self.auth_params().await?;
        params.push(("search".to_string(), "blur".to_string()));
        params.push(("dataId".to_string(), data_id_pattern.to_string()));
        params.push(("group".to_string(), group.to_string()));
        params.push(("pageNo".to_string(), page_no.to_string()));
        params.push(("pageSize".to_string(), page_size.to_string()));

        let response = self
            .http
            .get(self.endpoint("v1/cs/configs"))
            .query(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NacosError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let page: SearchResponse = response
            .json()
            .await
            .map_err(|err| NacosError::BadResponse(format!("search response: {err}")))?;
        Ok(ConfigPage {
            total_count: page.total_count,
            page_number: page.page_number,
            pages_available: page.pages_available,
            items: page
                .page_items
                .into_iter()
                .map(|item| ConfigItem {
                    data_id: item.data_id,
                    group: item.group,
                    content: item.content,
                })
                .collect(),
        })
    }

    async fn listen(
        &self,
        data_id: &str,
        group: &str,
        handler: ChangeHandler,
    ) -> Result<(), NacosError> {
        let group = effective_group(group).to_string();
        let data_id = data_id.to_string();
        let key = (data_id.clone(), group.clone());

        // Seed the known MD5 so the first poll only reports future changes.
        let mut known_md5 = self
            .get_config(&data_id, &group)
            .await?
            .map(|content| super::content_md5(&content))
            .unwrap_or_default();

        let client = self.clone_for_task();
        let task = tokio::spawn(async move {
            loop {
                match client.poll_once(&data_id, &group, &known_md5).await {
                    Ok(Some(Some(content))) => {
                        known_md5 = super::content_md5(&content);
                        handler(ConfigChange {
                            data_id: data_id.clone(),
                            group: group.clone(),
                            content,
                        });
                    }
                    Ok(Some(None)) => {
                        // Changed to a missing record; the roster refresh
                        // owns deletion events.
                        known_md5 = String::new();
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(%data_id, %group, error = %err, "config listener poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        let mut listeners = self.listeners.lock().expect("listeners lock");
        if let Some(previous) = listeners.insert(key, task) {
            previous.abort();
        }
        Ok(())
    }

    async fn cancel_listen(&self, data_id: &str, group: &str) {
        let key = (data_id.to_string(), effective_group(group).to_string());
        let removed = {
            let mut listeners = self.listeners.lock().expect("listeners lock");
            listeners.remove(&key)
        };
        if let Some(task) = removed {
            task.abort();
        }
    }
}

impl HttpConfigClient {
    /// Cheap handle for listener tasks: shares the HTTP client and token
    /// cache but owns no listener registry (tasks never spawn tasks).
    fn clone_for_task(&self) -> HttpConfigClient {
        HttpConfigClient {
            http: self.http.clone(),
            options: self.options.clone(),
            next_server: AtomicUsize::new(self.next_server.load(Ordering::Relaxed)),
            access_token: tokio::sync::RwLock::new(None),
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for HttpConfigClient {
    fn drop(&mut self) {
        if let Ok(listeners) = self.listeners.lock() {
            for task in listeners.values() {
                task.abort();
            }
        }
    }
}
