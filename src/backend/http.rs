use super::Backend;
use crate::error::BackendError;
use crate::model::{InstanceModel, StartOptions, StaticConfig};
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const API_PATH: &str = "api/tensorboard";

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    /// Applied per request; `None` leaves requests unbounded.
    pub request_timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8888".into(),
            request_timeout: None,
            user_agent: format!("board-registry/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Serialize)]
struct StartBody<'a> {
    logdir: &'a str,
    reload_interval: i64,
    enable_multi_log: bool,
    additional_args: &'a str,
}

/// REST client for the instance-management endpoints.
pub struct HttpBackend {
    http: Client,
    api_base: Url,
}

impl HttpBackend {
    pub fn new(cfg: &HttpBackendConfig) -> Result<Self, BackendError> {
        let mut builder = Client::builder().user_agent(cfg.user_agent.clone());
        if let Some(timeout) = cfg.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;
        let mut base = cfg.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_base = Url::parse(&base)
            .and_then(|u| u.join(&format!("{API_PATH}/")))
            .map_err(|e| BackendError::Transport(format!("invalid base url {base}: {e}")))?;
        Ok(Self { http, api_base })
    }

    fn collection_url(&self) -> Url {
        let mut url = self.api_base.clone();
        // `api/tensorboard/` -> `api/tensorboard`
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&path);
        url
    }

    fn endpoint(&self, segment: &str) -> Result<Url, BackendError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Transport("base url cannot be a base".into()))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }
}

async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
    let bytes = check_status(resp).await?.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_running(&self) -> Result<Vec<InstanceModel>, BackendError> {
        let url = self.collection_url();
        debug!(%url, "listing running instances");
        decode(self.http.get(url).send().await?).await
    }

    async fn start_new(
        &self,
        logdir: &str,
        options: &StartOptions,
    ) -> Result<InstanceModel, BackendError> {
        let url = self.collection_url();
        let body = StartBody {
            logdir,
            reload_interval: options.reload_interval,
            enable_multi_log: options.enable_multi_log,
            additional_args: &options.additional_args,
        };
        debug!(%url, logdir, "starting instance");
        decode(self.http.post(url).json(&body).send().await?).await
    }

    async fn shutdown_instance(&self, name: &str) -> Result<(), BackendError> {
        let url = self.endpoint(name)?;
        debug!(%url, "shutting down instance");
        check_status(self.http.delete(url).send().await?).await?;
        Ok(())
    }

    async fn static_config(&self) -> Result<StaticConfig, BackendError> {
        let url = self.endpoint("static_config")?;
        decode(self.http.get(url).send().await?).await
    }
}
