use std::fmt;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::{
    error::ProxyError,
    models::{ChatRequest, Role},
    secrets::Credential,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/**
 * \brief 已实现的厂商协议（封闭集合）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    DeepSeek,
    Google,
    OpenAi,
    Anthropic,
    Groq,
    Ollama,
}

impl Vendor {
    pub const CLOUD: [Vendor; 5] = [
        Vendor::DeepSeek,
        Vendor::Google,
        Vendor::OpenAi,
        Vendor::Anthropic,
        Vendor::Groq,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Vendor::DeepSeek => "deepseek",
            Vendor::Google => "google",
            Vendor::OpenAi => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Groq => "groq",
            Vendor::Ollama => "ollama",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        Self::CLOUD
            .into_iter()
            .chain(std::iter::once(Vendor::Ollama))
            .find(|v| v.tag() == tag)
    }

    /**
     * \brief 仅解析云端厂商标签。
     */
    pub fn cloud_from_tag(tag: &str) -> Option<Self> {
        Self::from_tag(tag).filter(|v| v.credential().is_some())
    }

    /**
     * \brief 云端厂商对应的凭据；本地守护进程无凭据。
     */
    pub fn credential(&self) -> Option<Credential> {
        match self {
            Vendor::DeepSeek => Some(Credential::DeepSeek),
            Vendor::Google => Some(Credential::Google),
            Vendor::OpenAi => Some(Credential::OpenAi),
            Vendor::Anthropic => Some(Credential::Anthropic),
            Vendor::Groq => Some(Credential::Groq),
            Vendor::Ollama => None,
        }
    }

    pub fn adapter(&self) -> &'static dyn VendorAdapter {
        match self {
            Vendor::DeepSeek => &OpenAiCompatible(Vendor::DeepSeek),
            Vendor::OpenAi => &OpenAiCompatible(Vendor::OpenAi),
            Vendor::Groq => &OpenAiCompatible(Vendor::Groq),
            Vendor::Google => &Gemini,
            Vendor::Anthropic => &Claude,
            Vendor::Ollama => &OllamaDaemon,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/**
 * \brief 请求目标：基地址与（可选）凭据。
 */
#[derive(Debug, Clone, Copy)]
pub struct Endpoint<'a> {
    pub base_url: &'a str,
    pub api_key: Option<&'a str>,
}

/**
 * \brief 构建完成的厂商 HTTP 请求。query 可能包含密钥，禁止写入日志。
 */
#[derive(Debug)]
pub struct VendorRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(&'static str, String)>,
    pub body: Value,
}

/**
 * \brief 单行流式数据的解析结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Fragment(String),
    Skip,
    Done,
}

/**
 * \brief 厂商适配能力接口：请求构建、流式片段提取、完整内容提取。
 */
pub trait VendorAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn build_request(
        &self,
        endpoint: Endpoint<'_>,
        request: &ChatRequest,
    ) -> Result<VendorRequest, ProxyError>;

    fn extract_stream_fragment(&self, line: &str) -> Result<StreamLine, ProxyError>;

    fn extract_full_content(&self, body: &Value) -> Option<String>;
}

/**
 * \brief 去掉模型 ID 上的 `<provider>-` 前缀，得到厂商侧模型 ID。
 */
pub fn vendor_model_id<'a>(model_id: &'a str, prefix: &str) -> &'a str {
    model_id
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(model_id)
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

fn bearer_headers(api_key: Option<&str>) -> Result<HeaderMap, ProxyError> {
    let mut headers = json_headers();
    if let Some(key) = api_key {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key))?);
    }
    Ok(headers)
}

fn parse_line(line: &str) -> Result<Value, ProxyError> {
    serde_json::from_str(line).map_err(|e| ProxyError::MalformedStreamLine(e.to_string()))
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.filter(|s| !s.is_empty()).map(str::to_string)
}

fn fragment_or_skip(text: Option<&str>) -> StreamLine {
    match non_empty(text) {
        Some(t) => StreamLine::Fragment(t),
        None => StreamLine::Skip,
    }
}

/**
 * \brief OpenAI 兼容协议（openai / groq / deepseek）。
 */
pub struct OpenAiCompatible(pub Vendor);

impl VendorAdapter for OpenAiCompatible {
    fn vendor(&self) -> Vendor {
        self.0
    }

    fn build_request(
        &self,
        endpoint: Endpoint<'_>,
        request: &ChatRequest,
    ) -> Result<VendorRequest, ProxyError> {
        Ok(VendorRequest {
            url: format!(
                "{}/v1/chat/completions",
                endpoint.base_url.trim_end_matches('/')
            ),
            headers: bearer_headers(endpoint.api_key)?,
            query: Vec::new(),
            body: json!({
                "model": vendor_model_id(&request.model_id, self.0.tag()),
                "messages": request.messages,
                "stream": request.stream,
                "max_tokens": request.max_tokens_or_default(),
                "temperature": request.temperature_or_default(),
            }),
        })
    }

    fn extract_stream_fragment(&self, line: &str) -> Result<StreamLine, ProxyError> {
        let Some(payload) = line.strip_prefix("data: ") else {
            return Ok(StreamLine::Skip);
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(StreamLine::Done);
        }
        let v = parse_line(payload)?;
        Ok(fragment_or_skip(
            v.pointer("/choices/0/delta/content").and_then(Value::as_str),
        ))
    }

    fn extract_full_content(&self, body: &Value) -> Option<String> {
        non_empty(
            body.pointer("/choices/0/message/content")
                .and_then(Value::as_str),
        )
    }
}

/**
 * \brief Google Gemini 协议。
 */
pub struct Gemini;

impl VendorAdapter for Gemini {
    fn vendor(&self) -> Vendor {
        Vendor::Google
    }

    fn build_request(
        &self,
        endpoint: Endpoint<'_>,
        request: &ChatRequest,
    ) -> Result<VendorRequest, ProxyError> {
        let contents: Vec<Value> = request
            .conversation()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": request.max_tokens_or_default(),
                "temperature": request.temperature_or_default(),
            }
        });
        if let Some(sys) = request.system_prompt() {
            body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
        }

        let model = vendor_model_id(&request.model_id, Vendor::Google.tag());
        let base = endpoint.base_url.trim_end_matches('/');
        let mut query = Vec::new();
        let url = if request.stream {
            query.push(("alt", "sse".to_string()));
            format!("{}/v1beta/models/{}:streamGenerateContent", base, model)
        } else {
            format!("{}/v1beta/models/{}:generateContent", base, model)
        };
        if let Some(key) = endpoint.api_key {
            query.push(("key", key.to_string()));
        }

        Ok(VendorRequest {
            url,
            headers: json_headers(),
            query,
            body,
        })
    }

    fn extract_stream_fragment(&self, line: &str) -> Result<StreamLine, ProxyError> {
        // 兼容逐行 JSON、SSE data 行以及 JSON 数组分隔符
        let payload = line.strip_prefix("data: ").unwrap_or(line).trim();
        let payload = payload
            .trim_start_matches(['[', ','])
            .trim_end_matches([',', ']'])
            .trim();
        if payload.is_empty() {
            return Ok(StreamLine::Skip);
        }
        let v = parse_line(payload)?;
        Ok(fragment_or_skip(
            v.pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str),
        ))
    }

    fn extract_full_content(&self, body: &Value) -> Option<String> {
        non_empty(
            body.pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str),
        )
    }
}

/**
 * \brief Anthropic Messages 协议。
 */
pub struct Claude;

impl VendorAdapter for Claude {
    fn vendor(&self) -> Vendor {
        Vendor::Anthropic
    }

    fn build_request(
        &self,
        endpoint: Endpoint<'_>,
        request: &ChatRequest,
    ) -> Result<VendorRequest, ProxyError> {
        let mut headers = json_headers();
        if let Some(key) = endpoint.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(key)?);
        }
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let messages: Vec<_> = request.conversation().collect();
        let mut body = json!({
            "model": vendor_model_id(&request.model_id, Vendor::Anthropic.tag()),
            "messages": messages,
            "stream": request.stream,
            "max_tokens": request.max_tokens_or_default(),
            "temperature": request.temperature_or_default(),
        });
        if let Some(sys) = request.system_prompt() {
            body["system"] = json!(sys);
        }

        Ok(VendorRequest {
            url: format!("{}/v1/messages", endpoint.base_url.trim_end_matches('/')),
            headers,
            query: Vec::new(),
            body,
        })
    }

    fn extract_stream_fragment(&self, line: &str) -> Result<StreamLine, ProxyError> {
        let Some(payload) = line.strip_prefix("data: ") else {
            return Ok(StreamLine::Skip);
        };
        let v = parse_line(payload.trim())?;
        match v.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => Ok(fragment_or_skip(
                v.pointer("/delta/text").and_then(Value::as_str),
            )),
            Some("message_stop") => Ok(StreamLine::Done),
            _ => Ok(StreamLine::Skip),
        }
    }

    fn extract_full_content(&self, body: &Value) -> Option<String> {
        non_empty(body.pointer("/content/0/text").and_then(Value::as_str))
    }
}

/**
 * \brief 本地 Ollama 守护进程（逐行 JSON 信封）。
 */
pub struct OllamaDaemon;

impl VendorAdapter for OllamaDaemon {
    fn vendor(&self) -> Vendor {
        Vendor::Ollama
    }

    fn build_request(
        &self,
        endpoint: Endpoint<'_>,
        request: &ChatRequest,
    ) -> Result<VendorRequest, ProxyError> {
        Ok(VendorRequest {
            url: format!("{}/api/chat", endpoint.base_url.trim_end_matches('/')),
            headers: bearer_headers(endpoint.api_key)?,
            query: Vec::new(),
            body: json!({
                "model": vendor_model_id(&request.model_id, Vendor::Ollama.tag()),
                "messages": request.messages,
                "stream": request.stream,
                "options": {
                    "temperature": request.temperature_or_default(),
                    "num_predict": request.max_tokens_or_default(),
                }
            }),
        })
    }

    fn extract_stream_fragment(&self, line: &str) -> Result<StreamLine, ProxyError> {
        let v = parse_line(line.trim())?;
        let content = v.pointer("/message/content").and_then(Value::as_str);
        match fragment_or_skip(content) {
            StreamLine::Skip if v.get("done").and_then(Value::as_bool) == Some(true) => {
                Ok(StreamLine::Done)
            }
            other => Ok(other),
        }
    }

    fn extract_full_content(&self, body: &Value) -> Option<String> {
        non_empty(body.pointer("/message/content").and_then(Value::as_str))
    }
}
