use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{
    config::Settings,
    error::ProxyError,
    models::{ChatRequest, ChatResult, ProviderCategory, AUTO_PROVIDER},
    registry::{canonical_model_id, select_provider, ProviderRegistry},
    secrets::SecretResolver,
    stream::{normalize, FragmentStream, StopCondition},
    telemetry,
    vendor::{Endpoint, Vendor},
};

const UPSTREAM_BODY_LOG_LIMIT: usize = 512;

/**
 * \brief 构建共享的出站 HTTP 客户端。
 */
pub fn http_client() -> Result<reqwest::Client, ProxyError> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("localsite/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/**
 * \brief 流式调用的句柄：片段流加上实际使用的 Provider 与模型。
 */
pub struct StreamHandle {
    pub provider: String,
    pub model: String,
    pub fragments: FragmentStream,
}

/**
 * \brief 一次分发的结果：流式返回句柄，非流式返回完整内容。
 */
pub enum Dispatch {
    Stream(StreamHandle),
    Complete(ChatResult),
}

impl Dispatch {
    /**
     * \brief 把结果折叠为完整文本；流式结果会被读完。
     */
    pub async fn into_result(self) -> Result<ChatResult, ProxyError> {
        match self {
            Dispatch::Complete(result) => Ok(result),
            Dispatch::Stream(handle) => {
                let content = crate::stream::collect_text(handle.fragments).await?;
                if content.is_empty() {
                    return Err(ProxyError::EmptyResponse);
                }
                Ok(ChatResult {
                    ok: true,
                    content,
                    provider: handle.provider,
                    model: handle.model,
                })
            }
        }
    }
}

/**
 * \brief 分发器：把规范化请求路由到本地守护进程或云端厂商。
 */
pub struct Dispatcher {
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    secrets: Arc<SecretResolver>,
    settings: Arc<Settings>,
    stop: StopCondition,
}

impl Dispatcher {
    pub fn new(
        client: reqwest::Client,
        registry: Arc<ProviderRegistry>,
        secrets: Arc<SecretResolver>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            client,
            registry,
            secrets,
            settings,
            stop: StopCondition::default(),
        }
    }

    /**
     * \brief 替换流式输出的提前终止条件。
     */
    pub fn with_stop_condition(mut self, stop: StopCondition) -> Self {
        self.stop = stop;
        self
    }

    /**
     * \brief 按注册表快照分发；`auto` 会先解析为可服务该模型的 Provider。
     */
    pub async fn send(&self, mut request: ChatRequest) -> Result<Dispatch, ProxyError> {
        let snapshot = self.registry.snapshot();
        if request.provider_id == AUTO_PROVIDER {
            request.provider_id = select_provider(&request.model_id, &snapshot)
                .ok_or_else(|| ProxyError::ProviderNotFound(request.model_id.clone()))?;
        }
        let provider = snapshot
            .provider(&request.provider_id)
            .filter(|p| p.is_available())
            .ok_or_else(|| ProxyError::ProviderNotFound(request.provider_id.clone()))?;
        if let Some(canonical) = canonical_model_id(&request.model_id, &provider.id, &snapshot) {
            debug!(from = %request.model_id, to = canonical, "resolved bare vendor model id");
            request.model_id = canonical.to_string();
        }

        match provider.category {
            ProviderCategory::Local => {
                if Vendor::from_tag(&provider.id) != Some(Vendor::Ollama) {
                    return Err(ProxyError::UnsupportedProvider(provider.id.clone()));
                }
                let endpoint = Endpoint {
                    base_url: &provider.base_url,
                    api_key: None,
                };
                self.execute(Vendor::Ollama, endpoint, request).await
            }
            ProviderCategory::Cloud => {
                let vendor = Vendor::cloud_from_tag(&provider.id)
                    .ok_or_else(|| ProxyError::UnsupportedProvider(provider.id.clone()))?;
                self.send_cloud(vendor, request).await
            }
        }
    }

    /**
     * \brief 云端调用路径；凭据缺失时在任何网络请求之前失败。
     */
    pub async fn send_cloud(
        &self,
        vendor: Vendor,
        request: ChatRequest,
    ) -> Result<Dispatch, ProxyError> {
        let credential = vendor
            .credential()
            .ok_or_else(|| ProxyError::UnsupportedProvider(vendor.tag().to_string()))?;
        let key = self
            .secrets
            .credential(credential)
            .ok_or(ProxyError::MissingCredential {
                vendor: credential.display_name(),
            })?;
        let base_url = self
            .settings
            .endpoints
            .base_url(credential)
            .ok_or_else(|| ProxyError::UnsupportedProvider(vendor.tag().to_string()))?;
        let endpoint = Endpoint {
            base_url,
            api_key: Some(key.expose()),
        };
        self.execute(vendor, endpoint, request).await
    }

    async fn execute(
        &self,
        vendor: Vendor,
        endpoint: Endpoint<'_>,
        request: ChatRequest,
    ) -> Result<Dispatch, ProxyError> {
        let adapter = vendor.adapter();
        let built = adapter.build_request(endpoint, &request)?;
        info!(
            vendor = %vendor,
            model = %request.model_id,
            stream = request.stream,
            messages = request.messages.len(),
            "dispatching chat request"
        );
        telemetry::log_event(
            "dispatch",
            &format!("vendor={} model={} stream={}", vendor, request.model_id, request.stream),
        );

        let resp = self
            .client
            .post(&built.url)
            .headers(built.headers)
            .query(&built.query)
            .json(&built.body)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(e.without_url()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail: String = text.chars().take(UPSTREAM_BODY_LOG_LIMIT).collect();
            error!(vendor = %vendor, status = status.as_u16(), body = %detail, "upstream request failed");
            telemetry::log_error("dispatch", &format!("vendor={} status={}", vendor, status));
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        if request.stream {
            let upstream = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(reqwest::Error::without_url));
            return Ok(Dispatch::Stream(StreamHandle {
                provider: vendor.tag().to_string(),
                model: request.model_id,
                fragments: normalize(vendor, upstream, self.stop.clone()),
            }));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::Transport(e.without_url()))?;
        let content = adapter
            .extract_full_content(&body)
            .ok_or(ProxyError::EmptyResponse)?;
        Ok(Dispatch::Complete(ChatResult {
            ok: true,
            content,
            provider: vendor.tag().to_string(),
            model: request.model_id,
        }))
    }
}
