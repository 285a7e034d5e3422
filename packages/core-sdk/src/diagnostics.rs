use std::{collections::BTreeMap, time::Duration};

use futures_util::future::join_all;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    config::{Settings, VendorEndpoints},
    error::ProxyError,
    secrets::{Credential, SecretResolver},
};

/** \brief 诊断类探测的超时上限。 */
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MIN_KEY_LENGTH: usize = 10;
const PLACEHOLDER_MARKERS: [&str; 2] = ["your_", "xxx"];

/**
 * \brief 单个已配置密钥的校验结果。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/**
 * \brief 临时密钥测试结果，密钥本身不回传也不保存。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyTestReport {
    pub provider: String,
    pub is_valid: bool,
    pub error: Option<String>,
    pub model_count: usize,
    pub message: String,
}

/**
 * \brief 厂商基地址的连通性探测结果。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connectivity {
    pub provider: &'static str,
    pub name: &'static str,
    pub url: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/**
 * \brief 可以在线测试的凭据；HF_TOKEN 不参与。
 */
pub fn testable(credential: Credential) -> bool {
    !matches!(credential, Credential::HuggingFace)
}

/**
 * \brief 调用厂商的模型列表接口，返回模型数量。
 */
pub async fn probe_key(
    client: &reqwest::Client,
    endpoints: &VendorEndpoints,
    credential: Credential,
    key: &str,
) -> Result<usize, ProxyError> {
    let base = endpoints
        .base_url(credential)
        .filter(|_| testable(credential))
        .ok_or_else(|| ProxyError::UnsupportedProvider(credential.id().to_string()))?;

    let req = match credential {
        Credential::Google => client
            .get(format!("{}/v1beta/models", base))
            .query(&[("key", key)]),
        Credential::Anthropic => client
            .get(format!("{}/v1/models", base))
            .header("x-api-key", HeaderValue::from_str(key)?)
            .header("anthropic-version", ANTHROPIC_VERSION),
        Credential::Together => client
            .get(format!("{}/models/info", base))
            .header(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key))?),
        _ => client
            .get(format!("{}/v1/models", base))
            .header(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key))?),
    };

    let resp = req
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| ProxyError::Transport(e.without_url()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ProxyError::Upstream {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
        });
    }
    let body: Value = resp
        .json()
        .await
        .map_err(|e| ProxyError::Transport(e.without_url()))?;
    let models = match credential {
        Credential::Google => parse_gemini_model_list(body)?,
        _ => parse_model_list(body)?,
    };
    Ok(models.len())
}

fn describe(err: &ProxyError) -> String {
    match err {
        ProxyError::Upstream {
            status,
            status_text,
        } => format!("HTTP {}: {}", status, status_text),
        other => other.to_string(),
    }
}

/**
 * \brief 测试调用方提供的密钥。
 */
pub async fn test_key(
    client: &reqwest::Client,
    endpoints: &VendorEndpoints,
    credential: Credential,
    key: &str,
) -> KeyTestReport {
    let provider = credential.id().to_string();
    match probe_key(client, endpoints, credential, key).await {
        Ok(model_count) => KeyTestReport {
            provider,
            is_valid: true,
            error: None,
            model_count,
            message: format!("API key is valid. Found {} models.", model_count),
        },
        Err(err) => {
            let reason = describe(&err);
            let message = match err {
                ProxyError::Upstream { .. } => format!("API key is invalid: {}", reason),
                _ => format!("Failed to test API key: {}", reason),
            };
            KeyTestReport {
                provider,
                is_valid: false,
                error: Some(reason),
                model_count: 0,
                message,
            }
        }
    }
}

/**
 * \brief 并发校验所有已配置的密钥；未配置的厂商不出现在结果中。
 */
pub async fn validate_configured_keys(
    client: &reqwest::Client,
    settings: &Settings,
    secrets: &SecretResolver,
) -> BTreeMap<&'static str, KeyValidation> {
    let probes = Credential::ALL
        .into_iter()
        .filter(|c| testable(*c))
        .filter_map(|c| secrets.credential(c).map(|key| (c, key)))
        .map(|(credential, key)| async move {
            let outcome = probe_key(client, &settings.endpoints, credential, key.expose()).await;
            let validation = match outcome {
                Ok(_) => KeyValidation {
                    valid: true,
                    error: None,
                },
                Err(err) => {
                    warn!(vendor = credential.id(), error = %describe(&err), "key validation failed");
                    KeyValidation {
                        valid: false,
                        error: Some(describe(&err)),
                    }
                }
            };
            (credential.id(), validation)
        });
    let results: BTreeMap<_, _> = join_all(probes).await.into_iter().collect();
    info!(checked = results.len(), "configured keys validated");
    results
}

/**
 * \brief 探测各厂商基地址是否可达，每个探测受超时约束，超时即放弃连接。
 */
pub async fn check_connectivity(
    client: &reqwest::Client,
    endpoints: &VendorEndpoints,
) -> Vec<Connectivity> {
    let probes = Credential::ALL.into_iter().filter_map(|credential| {
        let url = endpoints.base_url(credential)?.to_string();
        Some(async move {
            let outcome = tokio::time::timeout(PROBE_TIMEOUT, client.get(&url).send()).await;
            let mut entry = Connectivity {
                provider: credential.id(),
                name: credential.display_name(),
                url,
                reachable: false,
                status: None,
                status_text: None,
                error: None,
            };
            match outcome {
                Ok(Ok(resp)) => {
                    entry.reachable = true;
                    entry.status = Some(resp.status().as_u16());
                    entry.status_text = resp.status().canonical_reason().map(str::to_string);
                }
                Ok(Err(err)) => entry.error = Some(err.without_url().to_string()),
                Err(_) => entry.error = Some("request timed out".to_string()),
            }
            entry
        })
    });
    join_all(probes).await
}

/**
 * \brief 配置体检报告。
 */
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub providers: BTreeMap<String, ProviderStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub configured: bool,
    pub valid: bool,
    pub issues: Vec<String>,
}

impl ConfigReport {
    /**
     * \brief 纯文本摘要，供 CLI 输出。
     */
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Status: {}\n",
            if self.is_valid { "valid" } else { "invalid" }
        );
        for (title, items) in [
            ("Errors", &self.errors),
            ("Warnings", &self.warnings),
            ("Recommendations", &self.recommendations),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{}:\n", title));
            for item in items {
                out.push_str(&format!("  - {}\n", item));
            }
        }
        out.push_str("\nProviders:\n");
        for (id, status) in &self.providers {
            let state = match (status.configured, status.valid) {
                (false, _) => "not configured",
                (true, true) => "ok",
                (true, false) => "invalid",
            };
            out.push_str(&format!("  {:<12} {}\n", id, state));
            for issue in &status.issues {
                out.push_str(&format!("      {}\n", issue));
            }
        }
        out
    }
}

/**
 * \brief 检查部署配置：运行模式、本地守护进程地址、云端密钥格式。
 */
pub fn validate_config(settings: &Settings, secrets: &SecretResolver) -> ConfigReport {
    let mut report = ConfigReport::default();

    let keys: Vec<(Credential, String)> = Credential::ALL
        .into_iter()
        .filter(|c| testable(*c))
        .filter_map(|c| secrets.credential(c).map(|k| (c, k.expose().to_string())))
        .collect();
    let has_cloud = !keys.is_empty();

    if settings.local_mode && settings.mixed_mode {
        report.warnings.push(
            "LOCAL_MODE=true with ENABLE_MIXED_MODE=true - cloud providers are loaded alongside local ones"
                .to_string(),
        );
    }
    if !settings.local_mode && !has_cloud {
        report.errors.push(
            "No local or cloud providers configured. Set LOCAL_MODE=true or add cloud API keys"
                .to_string(),
        );
    }

    let mut ollama = ProviderStatus::default();
    if settings.local_mode || settings.ollama_base_url.is_some() {
        ollama.configured = true;
        ollama.valid = true;
        let url = settings.ollama_url();
        if reqwest::Url::parse(url).is_err() {
            report.errors.push(format!("Invalid Ollama URL: {}", url));
            ollama.valid = false;
            ollama.issues.push("Invalid URL".to_string());
        }
        if !settings.local_mode {
            report
                .recommendations
                .push("Consider setting LOCAL_MODE=true if you primarily use Ollama".to_string());
        }
    }
    report.providers.insert("ollama".to_string(), ollama);

    for credential in Credential::ALL.into_iter().filter(|c| testable(*c)) {
        let mut status = ProviderStatus::default();
        if let Some((_, key)) = keys.iter().find(|(c, _)| *c == credential) {
            status.configured = true;
            status.valid = true;
            let var = credential.secret_names()[0].to_ascii_uppercase();
            if !key_format_matches(credential, key) {
                report.warnings.push(format!(
                    "{} format may be incorrect for {}",
                    var,
                    credential.display_name()
                ));
            }
            if PLACEHOLDER_MARKERS.iter().any(|m| key.contains(m)) {
                report
                    .errors
                    .push(format!("{} appears to be a placeholder value", var));
                status.valid = false;
                status.issues.push("Appears to be placeholder value".to_string());
            }
            if key.len() < MIN_KEY_LENGTH {
                report.warnings.push(format!(
                    "{} seems too short for {}",
                    var,
                    credential.display_name()
                ));
            }
        }
        report.providers.insert(credential.id().to_string(), status);
    }

    let configured = |c: Credential| keys.iter().any(|(k, _)| *k == c);
    if !settings.local_mode && !has_cloud {
        report.recommendations.push(
            "Start with LOCAL_MODE=true and Ollama for privacy, then add cloud APIs for performance"
                .to_string(),
        );
    }
    if has_cloud && !configured(Credential::DeepSeek) {
        report.recommendations.push(
            "Consider adding DeepSeek API key - it offers excellent value for money".to_string(),
        );
    }
    if has_cloud && !configured(Credential::Google) {
        report.recommendations.push(
            "Consider adding Google API key - Gemini offers generous free quotas".to_string(),
        );
    }
    if settings.local_mode && settings.ollama_base_url.is_none() {
        report.recommendations.push(
            "Set OLLAMA_BASE_URL if Ollama runs on a different port or host".to_string(),
        );
    }
    if has_cloud {
        report
            .recommendations
            .push("Regularly rotate your API keys for security".to_string());
        report
            .recommendations
            .push("Monitor your API usage to avoid unexpected charges".to_string());
    }

    report.is_valid = report.errors.is_empty();
    report
}

/**
 * \brief 已知厂商密钥的前缀与最小长度检查；未知格式一律视为匹配。
 */
fn key_format_matches(credential: Credential, key: &str) -> bool {
    let (prefix, min_len, extra): (&str, usize, &[char]) = match credential {
        Credential::DeepSeek | Credential::OpenAi => ("sk-", 32, &[]),
        Credential::Anthropic => ("sk-ant-", 32, &[]),
        Credential::Google => ("AIza", 35, &['_', '-']),
        Credential::Groq => ("gsk_", 32, &[]),
        _ => return true,
    };
    key.strip_prefix(prefix).is_some_and(|rest| {
        rest.len() >= min_len
            && rest
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || extra.contains(&ch))
    })
}

fn parse_model_list(v: Value) -> Result<Vec<String>, ProxyError> {
    let items = v
        .get("data")
        .and_then(Value::as_array)
        .or_else(|| v.as_array())
        .ok_or_else(|| ProxyError::Internal("unexpected models payload".to_string()))?;
    Ok(items
        .iter()
        .filter_map(|item| {
            item.get("id")
                .and_then(Value::as_str)
                .or_else(|| item.as_str())
        })
        .map(str::to_string)
        .collect())
}

fn parse_gemini_model_list(v: Value) -> Result<Vec<String>, ProxyError> {
    let items = v
        .get("models")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::Internal("unexpected gemini models payload".to_string()))?;
    Ok(items
        .iter()
        .filter_map(|item| {
            item.get("name")
                .and_then(Value::as_str)
                .or_else(|| item.get("id").and_then(Value::as_str))
        })
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvVars;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn setup(pairs: &[(&str, String)]) -> (Settings, SecretResolver) {
        let env: EnvVars = pairs.iter().cloned().collect();
        let settings = Settings::from_env(&env);
        let secrets = SecretResolver::new(&settings, env);
        (settings, secrets)
    }

    #[tokio::test]
    async fn test_key_counts_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer sk-good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]
            })))
            .mount(&server)
            .await;
        let (settings, _) = setup(&[("OPENAI_BASE_URL", server.uri())]);
        let report = test_key(
            &reqwest::Client::new(),
            &settings.endpoints,
            Credential::OpenAi,
            "sk-good",
        )
        .await;
        assert!(report.is_valid);
        assert_eq!(report.model_count, 2);
        assert_eq!(report.message, "API key is valid. Found 2 models.");
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn test_key_reports_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/models"))
            .and(query_param("key", "AIza-bad"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let (settings, _) = setup(&[("GOOGLE_BASE_URL", server.uri())]);
        let report = test_key(
            &reqwest::Client::new(),
            &settings.endpoints,
            Credential::Google,
            "AIza-bad",
        )
        .await;
        assert!(!report.is_valid);
        assert_eq!(report.error.as_deref(), Some("HTTP 403: Forbidden"));
        assert_eq!(report.message, "API key is invalid: HTTP 403: Forbidden");
        assert!(!report.message.contains("AIza-bad"));
    }

    #[tokio::test]
    async fn test_anthropic_probe_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("x-api-key", "sk-ant-k"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "claude"}]})),
            )
            .mount(&server)
            .await;
        let (settings, _) = setup(&[("ANTHROPIC_BASE_URL", server.uri())]);
        let count = probe_key(
            &reqwest::Client::new(),
            &settings.endpoints,
            Credential::Anthropic,
            "sk-ant-k",
        )
        .await
        .expect("probe");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_validate_only_configured_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let (settings, secrets) = setup(&[
            ("GROQ_API_KEY", "gsk_x".into()),
            ("GROQ_BASE_URL", server.uri()),
            ("HF_TOKEN", "hf_x".into()),
        ]);
        let results = validate_configured_keys(&reqwest::Client::new(), &settings, &secrets).await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results["groq"],
            KeyValidation {
                valid: false,
                error: Some("HTTP 401: Unauthorized".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_connectivity_reports_each_vendor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (settings, _) = setup(&[
            ("DEEPSEEK_BASE_URL", server.uri()),
            ("GOOGLE_BASE_URL", server.uri()),
            ("OPENAI_BASE_URL", server.uri()),
            ("ANTHROPIC_BASE_URL", server.uri()),
            ("GROQ_BASE_URL", server.uri()),
            ("TOGETHER_BASE_URL", server.uri()),
            ("FIREWORKS_BASE_URL", "http://127.0.0.1:1".into()),
        ]);
        let results = check_connectivity(&reqwest::Client::new(), &settings.endpoints).await;
        assert_eq!(results.len(), 7);
        let openai = results.iter().find(|c| c.provider == "openai").unwrap();
        assert!(openai.reachable);
        assert_eq!(openai.status, Some(404));
        let fireworks = results.iter().find(|c| c.provider == "fireworks").unwrap();
        assert!(!fireworks.reachable);
        assert!(fireworks.error.is_some());
    }

    #[test]
    fn test_config_without_any_provider_is_invalid() {
        let (settings, secrets) = setup(&[]);
        let report = validate_config(&settings, &secrets);
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("No local or cloud providers"));
        assert!(!report.providers["openai"].configured);
    }

    #[test]
    fn test_config_flags_placeholders_and_formats() {
        let (settings, secrets) = setup(&[
            ("OPENAI_API_KEY", "your_openai_key".into()),
            ("GROQ_API_KEY", format!("gsk_{}", "a".repeat(40))),
        ]);
        let report = validate_config(&settings, &secrets);
        assert!(!report.is_valid);
        assert!(report
            .errors
            .contains(&"OPENAI_API_KEY appears to be a placeholder value".to_string()));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.starts_with("OPENAI_API_KEY format may be incorrect")));
        assert!(!report.warnings.iter().any(|w| w.starts_with("GROQ_API_KEY")));
        assert!(!report.providers["openai"].valid);
        assert!(report.providers["groq"].valid);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("DeepSeek")));
    }

    #[test]
    fn test_local_mode_with_bad_ollama_url() {
        let (settings, secrets) = setup(&[
            ("LOCAL_MODE", "true".into()),
            ("ENABLE_MIXED_MODE", "true".into()),
            ("OLLAMA_BASE_URL", "not a url".into()),
        ]);
        let report = validate_config(&settings, &secrets);
        assert!(report.errors.contains(&"Invalid Ollama URL: not a url".to_string()));
        assert_eq!(report.warnings.len(), 1);
        assert!(!report.providers["ollama"].valid);
        assert!(report.summary().contains("Status: invalid"));
    }

    #[test]
    fn test_key_format_rules() {
        assert!(key_format_matches(
            Credential::Anthropic,
            &format!("sk-ant-{}", "b".repeat(32))
        ));
        assert!(!key_format_matches(Credential::Anthropic, "sk-short"));
        assert!(key_format_matches(
            Credential::Google,
            &format!("AIza{}_-", "c".repeat(33))
        ));
        assert!(key_format_matches(Credential::Together, "anything"));
    }
}
