use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    models::{Model, Provider, ProviderCategory},
    secrets::SecretResolver,
    vendor::{vendor_model_id, Vendor},
};

/** \brief 本地守护进程探测的超时上限。 */
pub const LOCAL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/** \brief 本地模型的首选匹配模式。 */
pub const PREFERRED_LOCAL_PATTERN: &str = "deepseek-r1";
/** \brief 云端模型的首选列表，按顺序匹配。 */
pub const PREFERRED_CLOUD_MODELS: [&str; 2] = ["deepseek-chat", "google-gemini-1.5-pro"];

const OLLAMA_MAX_TOKENS: u32 = 131_000;

struct CatalogModel {
    id: &'static str,
    name: &'static str,
    thinker: bool,
    new: bool,
}

const fn entry(id: &'static str, name: &'static str) -> CatalogModel {
    CatalogModel {
        id,
        name,
        thinker: false,
        new: false,
    }
}

struct CatalogEntry {
    vendor: Vendor,
    name: &'static str,
    max_tokens: u32,
    models: &'static [CatalogModel],
}

/**
 * \brief 云端厂商的静态模型目录（配置数据，不参与发现）。
 */
const CLOUD_CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        vendor: Vendor::DeepSeek,
        name: "DeepSeek API",
        max_tokens: 131_000,
        models: &[
            entry("deepseek-chat", "DeepSeek Chat"),
            entry("deepseek-coder", "DeepSeek Coder"),
            CatalogModel {
                thinker: true,
                ..entry("deepseek-reasoner", "DeepSeek Reasoner")
            },
        ],
    },
    CatalogEntry {
        vendor: Vendor::Google,
        name: "Google Gemini",
        max_tokens: 1_048_576,
        models: &[
            entry("gemini-2.5-flash", "Gemini 2.5 Flash"),
            CatalogModel {
                new: true,
                ..entry("gemini-2.0-flash", "Gemini 2.0 Flash")
            },
            CatalogModel {
                new: true,
                ..entry("gemini-2.0-flash-lite", "Gemini 2.0 Flash Lite")
            },
        ],
    },
    CatalogEntry {
        vendor: Vendor::OpenAi,
        name: "OpenAI",
        max_tokens: 128_000,
        models: &[
            entry("gpt-4o", "GPT-4o"),
            entry("gpt-4o-mini", "GPT-4o Mini"),
            entry("gpt-4-turbo", "GPT-4 Turbo"),
        ],
    },
    CatalogEntry {
        vendor: Vendor::Anthropic,
        name: "Anthropic Claude",
        max_tokens: 200_000,
        models: &[
            entry("claude-opus-4-1-20250805", "Claude Opus 4.1"),
            entry("claude-sonnet-4-20250514", "Claude Sonnet 4"),
            entry("claude-3-opus-20240229", "Claude 3 Opus"),
        ],
    },
    CatalogEntry {
        vendor: Vendor::Groq,
        name: "Groq",
        max_tokens: 131_000,
        models: &[
            entry("llama-3.3-70b-versatile", "Llama 3.3 70B"),
            entry(
                "llama3-groq-70b-8192-tool-use-preview",
                "Llama 3 70B Tool Use",
            ),
        ],
    },
];

/**
 * \brief 注册表快照：一次完整发现的结果，构造后不可变。
 */
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    providers: Vec<Provider>,
    models: Vec<Model>,
}

impl RegistrySnapshot {
    /**
     * \brief 由发现结果组装快照；Provider 重复或模型指向不存在的 Provider 时丢弃该条目。
     */
    pub fn from_parts(parts: Vec<(Provider, Vec<Model>)>) -> Self {
        let mut snapshot = Self::default();
        for (provider, models) in parts {
            if snapshot.provider(&provider.id).is_some() {
                warn!(provider = %provider.id, "duplicate provider id ignored");
                continue;
            }
            for model in models {
                if model.provider != provider.id {
                    warn!(model = %model.id, provider = %provider.id, "model does not belong to provider");
                    continue;
                }
                if snapshot.model(&model.id).is_some() {
                    continue;
                }
                snapshot.models.push(model);
            }
            snapshot.providers.push(provider);
        }
        snapshot
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn provider(&self, id: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn model(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }
}

/**
 * \brief Provider 过滤条件。
 */
#[derive(Debug, Clone, Default)]
pub struct ProviderFilter {
    pub category: Option<ProviderCategory>,
}

/**
 * \brief 模型过滤条件。
 */
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub category: Option<ProviderCategory>,
    pub provider: Option<String>,
}

/**
 * \brief Provider 注册表：发现可用后端并以写时复制方式整体替换快照。
 */
pub struct ProviderRegistry {
    client: reqwest::Client,
    settings: Arc<Settings>,
    secrets: Arc<SecretResolver>,
    snapshot: RwLock<Installed>,
    /** \brief 已开始的发现轮次 */
    started: AtomicU64,
}

/**
 * \brief 当前生效的快照及其所属的发现轮次。
 */
struct Installed {
    generation: u64,
    snapshot: Arc<RegistrySnapshot>,
}

impl ProviderRegistry {
    pub fn new(
        client: reqwest::Client,
        settings: Arc<Settings>,
        secrets: Arc<SecretResolver>,
    ) -> Self {
        Self {
            client,
            settings,
            secrets,
            snapshot: RwLock::new(Installed {
                generation: 0,
                snapshot: Arc::new(RegistrySnapshot::default()),
            }),
            started: AtomicU64::new(0),
        }
    }

    /**
     * \brief 执行一次完整发现并原子替换快照；各 Provider 的失败互不影响，不向调用方抛出。
     * 并发发现时以最后开始的一轮为准，返回当前生效的快照。
     */
    pub async fn discover(&self) -> Arc<RegistrySnapshot> {
        let generation = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let (local, cloud) = tokio::join!(
            discover_local(&self.client, &self.settings),
            async { discover_cloud(&self.settings, &self.secrets) }
        );
        let parts: Vec<_> = local.into_iter().chain(cloud).collect();
        let next = Arc::new(RegistrySnapshot::from_parts(parts));
        info!(
            providers = next.providers().len(),
            models = next.models().len(),
            "provider discovery finished"
        );
        let mut installed = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if generation > installed.generation {
            *installed = Installed {
                generation,
                snapshot: next,
            };
        } else {
            debug!(
                generation,
                current = installed.generation,
                "discarding superseded discovery result"
            );
        }
        installed.snapshot.clone()
    }

    /**
     * \brief 当前快照；读者只会看到旧快照或完整的新快照。
     */
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    pub fn get_providers(&self, filter: &ProviderFilter) -> Vec<Provider> {
        self.snapshot()
            .providers()
            .iter()
            .filter(|p| p.is_available())
            .filter(|p| filter.category.map_or(true, |c| p.category == c))
            .cloned()
            .collect()
    }

    pub fn get_models(&self, filter: &ModelFilter) -> Vec<Model> {
        self.snapshot()
            .models()
            .iter()
            .filter(|m| filter.category.map_or(true, |c| m.category == c))
            .filter(|m| filter.provider.as_deref().map_or(true, |p| m.provider == p))
            .cloned()
            .collect()
    }

    pub fn get_recommended_model(&self) -> Option<Model> {
        recommended_model(&self.snapshot()).cloned()
    }
}

/**
 * \brief 推荐模型：优先本地（首选模式，否则第一个），其次云端首选列表，最后第一个云端模型。
 */
pub fn recommended_model(snapshot: &RegistrySnapshot) -> Option<&Model> {
    let usable = |m: &&Model| {
        snapshot
            .provider(&m.provider)
            .is_some_and(Provider::is_available)
    };
    let local: Vec<&Model> = snapshot
        .models()
        .iter()
        .filter(usable)
        .filter(|m| m.is_local())
        .collect();
    if !local.is_empty() {
        return local
            .iter()
            .find(|m| m.id.contains(PREFERRED_LOCAL_PATTERN))
            .or_else(|| local.first())
            .copied();
    }

    let cloud: Vec<&Model> = snapshot
        .models()
        .iter()
        .filter(usable)
        .filter(|m| m.category == ProviderCategory::Cloud)
        .collect();
    PREFERRED_CLOUD_MODELS
        .iter()
        .find_map(|preferred| cloud.iter().find(|m| m.id.contains(preferred)))
        .or_else(|| cloud.first())
        .copied()
}

/**
 * \brief “auto” 选择：返回能服务该模型的第一个可用 Provider。
 */
pub fn select_provider(model_id: &str, snapshot: &RegistrySnapshot) -> Option<String> {
    if let Some(model) = snapshot.model(model_id) {
        if let Some(p) = snapshot.provider(&model.provider).filter(|p| p.is_available()) {
            return Some(p.id.clone());
        }
    }
    snapshot
        .providers()
        .iter()
        .filter(|p| p.is_available())
        .find(|p| {
            let bare = vendor_model_id(model_id, &p.id);
            p.supported_models.iter().any(|m| m == model_id || m == bare)
        })
        .map(|p| p.id.clone())
}

/**
 * \brief 把裸厂商模型 ID 还原为该 Provider 在注册表中的模型 ID（`<provider>-<厂商 ID>`）。
 * 已是注册 ID 或无对应模型时返回 None。
 */
pub fn canonical_model_id<'a>(
    model_id: &str,
    provider_id: &str,
    snapshot: &'a RegistrySnapshot,
) -> Option<&'a str> {
    if snapshot
        .model(model_id)
        .is_some_and(|m| m.provider == provider_id)
    {
        return None;
    }
    snapshot
        .model(&format!("{}-{}", provider_id, model_id))
        .filter(|m| m.provider == provider_id)
        .map(|m| m.id.as_str())
}

/**
 * \brief 探测本地守护进程的模型列表；不可达时返回 None。
 */
async fn discover_local(
    client: &reqwest::Client,
    settings: &Settings,
) -> Option<(Provider, Vec<Model>)> {
    let base = settings.ollama_url();
    let url = format!("{}/api/tags", base);
    let resp = match client.get(&url).timeout(LOCAL_PROBE_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            info!(status = resp.status().as_u16(), "local daemon probe rejected");
            return None;
        }
        Err(err) => {
            info!(error = %err, "local daemon not available");
            return None;
        }
    };
    let body: Value = match resp.json().await {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "local daemon returned an unreadable model list");
            return None;
        }
    };

    let names = parse_ollama_tags(&body);
    debug!(count = names.len(), "local models discovered");
    let provider_id = Vendor::Ollama.tag();
    let models = names
        .iter()
        .map(|name| Model {
            id: format!("{}-{}", provider_id, name),
            name: name.clone(),
            provider: provider_id.to_string(),
            category: ProviderCategory::Local,
            context_length: Some(OLLAMA_MAX_TOKENS),
            is_thinker: false,
            is_new: false,
        })
        .collect();
    let provider = Provider {
        id: provider_id.to_string(),
        name: "Ollama (Local)".to_string(),
        category: ProviderCategory::Local,
        base_url: base.to_string(),
        credential: None,
        available: true,
        max_tokens: OLLAMA_MAX_TOKENS,
        supported_models: names,
    };
    Some((provider, models))
}

fn parse_ollama_tags(body: &Value) -> Vec<String> {
    body.get("models")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    m.get("name")
                        .or_else(|| m.get("model"))
                        .and_then(Value::as_str)
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/**
 * \brief 根据可解析的密钥注册云端 Provider；严格本地模式下跳过。
 */
fn discover_cloud(settings: &Settings, secrets: &SecretResolver) -> Vec<(Provider, Vec<Model>)> {
    if !settings.cloud_enabled() {
        debug!("strict local mode, skipping cloud providers");
        return Vec::new();
    }
    CLOUD_CATALOG
        .iter()
        .filter_map(|entry| {
            let credential = entry.vendor.credential()?;
            if !secrets.has_credential(credential) {
                return None;
            }
            let base_url = settings.endpoints.base_url(credential)?.to_string();
            let tag = entry.vendor.tag();
            let models = entry
                .models
                .iter()
                .map(|m| Model {
                    id: format!("{}-{}", tag, m.id),
                    name: m.name.to_string(),
                    provider: tag.to_string(),
                    category: ProviderCategory::Cloud,
                    context_length: Some(entry.max_tokens),
                    is_thinker: m.thinker,
                    is_new: m.new,
                })
                .collect();
            let provider = Provider {
                id: tag.to_string(),
                name: entry.name.to_string(),
                category: ProviderCategory::Cloud,
                base_url,
                credential: credential.secret_names().first().map(|s| s.to_string()),
                available: true,
                max_tokens: entry.max_tokens,
                supported_models: entry.models.iter().map(|m| m.id.to_string()).collect(),
            };
            Some((provider, models))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvVars;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn registry(pairs: &[(&str, &str)]) -> ProviderRegistry {
        let env: EnvVars = pairs.iter().copied().collect();
        let settings = Arc::new(Settings::from_env(&env));
        let secrets = Arc::new(SecretResolver::new(&settings, env));
        ProviderRegistry::new(reqwest::Client::new(), settings, secrets)
    }

    fn local_model(id: &str) -> Model {
        Model {
            id: format!("ollama-{}", id),
            name: id.to_string(),
            provider: "ollama".into(),
            category: ProviderCategory::Local,
            context_length: None,
            is_thinker: false,
            is_new: false,
        }
    }

    fn provider(id: &str, category: ProviderCategory, models: &[&str]) -> Provider {
        Provider {
            id: id.into(),
            name: id.into(),
            category,
            base_url: "http://x".into(),
            credential: None,
            available: true,
            max_tokens: 1,
            supported_models: models.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn cloud_snapshot(pairs: &[(&str, &str)]) -> Arc<RegistrySnapshot> {
        let env: EnvVars = pairs.iter().copied().collect();
        let settings = Settings::from_env(&env);
        let secrets = SecretResolver::new(&settings, env);
        Arc::new(RegistrySnapshot::from_parts(discover_cloud(&settings, &secrets)))
    }

    #[test]
    fn test_cloud_discovery_follows_keys() {
        let snap = cloud_snapshot(&[("DEEPSEEK_API_KEY", "sk-1"), ("GROQ_API_KEY", "gsk")]);
        let ids: Vec<_> = snap.providers().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["deepseek", "groq"]);
        let reasoner = snap.model("deepseek-deepseek-reasoner").expect("reasoner");
        assert!(reasoner.is_thinker);
        assert_eq!(snap.models().len(), 5);
        assert!(snap
            .models()
            .iter()
            .all(|m| snap.provider(&m.provider).is_some()));
    }

    #[test]
    fn test_google_models_flag_new() {
        let snap = cloud_snapshot(&[("GEMINI_API_KEY", "AIza")]);
        assert!(snap.model("google-gemini-2.0-flash").unwrap().is_new);
        assert!(!snap.model("google-gemini-2.5-flash").unwrap().is_new);
    }

    #[test]
    fn test_strict_local_mode_skips_cloud() {
        let snap = cloud_snapshot(&[("LOCAL_MODE", "true"), ("OPENAI_API_KEY", "sk")]);
        assert!(snap.providers().is_empty());
        let snap = cloud_snapshot(&[
            ("LOCAL_MODE", "true"),
            ("ENABLE_MIXED_MODE", "true"),
            ("OPENAI_API_KEY", "sk"),
        ]);
        assert_eq!(snap.providers().len(), 1);
    }

    #[test]
    fn test_from_parts_drops_orphan_models() {
        let mut orphan = local_model("x");
        orphan.provider = "lm-studio".into();
        let snap = RegistrySnapshot::from_parts(vec![(
            provider("ollama", ProviderCategory::Local, &["llama3"]),
            vec![local_model("llama3"), orphan],
        )]);
        assert_eq!(snap.models().len(), 1);
    }

    #[test]
    fn test_recommended_prefers_local_pattern() {
        let snap = RegistrySnapshot::from_parts(vec![(
            provider("ollama", ProviderCategory::Local, &[]),
            vec![local_model("llama3"), local_model("deepseek-r1:7b")],
        )]);
        assert_eq!(
            recommended_model(&snap).map(|m| m.id.as_str()),
            Some("ollama-deepseek-r1:7b")
        );

        let snap = RegistrySnapshot::from_parts(vec![(
            provider("ollama", ProviderCategory::Local, &[]),
            vec![local_model("llama3"), local_model("qwen")],
        )]);
        assert_eq!(
            recommended_model(&snap).map(|m| m.id.as_str()),
            Some("ollama-llama3")
        );
    }

    #[test]
    fn test_recommended_cloud_preferences() {
        let snap = cloud_snapshot(&[("OPENAI_API_KEY", "sk"), ("DEEPSEEK_API_KEY", "sk")]);
        assert_eq!(
            recommended_model(&snap).map(|m| m.id.as_str()),
            Some("deepseek-deepseek-chat")
        );
        let snap = cloud_snapshot(&[("OPENAI_API_KEY", "sk")]);
        assert_eq!(
            recommended_model(&snap).map(|m| m.id.as_str()),
            Some("openai-gpt-4o")
        );
        assert!(recommended_model(&RegistrySnapshot::default()).is_none());
    }

    #[test]
    fn test_select_provider() {
        let snap = cloud_snapshot(&[("OPENAI_API_KEY", "sk"), ("GROQ_API_KEY", "gsk")]);
        assert_eq!(select_provider("openai-gpt-4o", &snap).as_deref(), Some("openai"));
        assert_eq!(
            select_provider("llama-3.3-70b-versatile", &snap).as_deref(),
            Some("groq")
        );
        assert_eq!(select_provider("claude-3-opus-20240229", &snap), None);
    }

    #[test]
    fn test_canonical_model_id_restores_provider_prefix() {
        let snap = cloud_snapshot(&[("DEEPSEEK_API_KEY", "sk"), ("GROQ_API_KEY", "gsk")]);
        assert_eq!(select_provider("deepseek-chat", &snap).as_deref(), Some("deepseek"));
        assert_eq!(
            canonical_model_id("deepseek-chat", "deepseek", &snap),
            Some("deepseek-deepseek-chat")
        );
        assert_eq!(canonical_model_id("deepseek-deepseek-chat", "deepseek", &snap), None);
        assert_eq!(
            canonical_model_id("llama-3.3-70b-versatile", "groq", &snap),
            Some("groq-llama-3.3-70b-versatile")
        );
        assert_eq!(canonical_model_id("gpt-4o", "groq", &snap), None);
    }

    #[tokio::test]
    async fn test_discover_registers_local_daemon() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "llama3:latest"}, {"name": "deepseek-r1:7b"}]
            })))
            .mount(&server)
            .await;
        let reg = registry(&[("OLLAMA_BASE_URL", &server.uri()), ("LOCAL_MODE", "true")]);
        reg.discover().await;

        let local = reg.get_providers(&ProviderFilter {
            category: Some(ProviderCategory::Local),
        });
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].supported_models, vec!["llama3:latest", "deepseek-r1:7b"]);
        let models = reg.get_models(&ModelFilter {
            provider: Some("ollama".into()),
            ..Default::default()
        });
        assert_eq!(models.len(), 2);
        assert_eq!(
            reg.get_recommended_model().map(|m| m.id),
            Some("ollama-deepseek-r1:7b".to_string())
        );
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_absent_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let reg = registry(&[("OLLAMA_BASE_URL", &server.uri()), ("OPENAI_API_KEY", "sk")]);
        let snap = reg.discover().await;
        assert!(snap.provider("ollama").is_none());
        assert!(snap.provider("openai").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_discovery_swaps_whole_snapshots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"models": [{"name": "llama3"}]}))
                    .set_delay(Duration::from_millis(20)),
            )
            .mount(&server)
            .await;
        let reg = Arc::new(registry(&[
            ("OLLAMA_BASE_URL", &server.uri()),
            ("OPENAI_API_KEY", "sk"),
        ]));

        let reader = {
            let reg = reg.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snap = reg.snapshot();
                    for p in snap.providers() {
                        let owned = snap.models().iter().filter(|m| m.provider == p.id).count();
                        assert!(owned > 0, "provider {} visible without models", p.id);
                    }
                    for m in snap.models() {
                        assert!(snap.provider(&m.provider).is_some());
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        let (a, b) = tokio::join!(reg.discover(), reg.discover());
        reader.await.expect("reader");
        assert_eq!(a.providers().len(), 2);
        assert_eq!(b.models().len(), a.models().len());
    }

    #[tokio::test]
    async fn test_latest_started_discovery_wins() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"models": [{"name": "stale"}]}))
                    .set_delay(Duration::from_millis(400)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"models": [{"name": "fresh"}]})),
            )
            .mount(&server)
            .await;
        let reg = registry(&[("OLLAMA_BASE_URL", &server.uri()), ("LOCAL_MODE", "true")]);

        let (first, second) = tokio::join!(reg.discover(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            reg.discover().await
        });
        assert!(second.model("ollama-fresh").is_some());
        assert!(first.model("ollama-fresh").is_some());
        assert!(reg.snapshot().model("ollama-fresh").is_some());
        assert!(reg.snapshot().model("ollama-stale").is_none());
    }
}
