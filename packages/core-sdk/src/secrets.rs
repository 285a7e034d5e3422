use std::{collections::BTreeMap, fmt, path::PathBuf};

use tracing::warn;

use crate::config::{EnvVars, Settings};

/**
 * \brief 已知的厂商凭据。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Credential {
    DeepSeek,
    Google,
    OpenAi,
    Anthropic,
    Groq,
    Together,
    Fireworks,
    HuggingFace,
}

impl Credential {
    pub const ALL: [Credential; 8] = [
        Credential::DeepSeek,
        Credential::Google,
        Credential::OpenAi,
        Credential::Anthropic,
        Credential::Groq,
        Credential::Together,
        Credential::Fireworks,
        Credential::HuggingFace,
    ];

    /**
     * \brief 状态接口中使用的厂商键名。
     */
    pub fn id(&self) -> &'static str {
        match self {
            Credential::DeepSeek => "deepseek",
            Credential::Google => "google",
            Credential::OpenAi => "openai",
            Credential::Anthropic => "anthropic",
            Credential::Groq => "groq",
            Credential::Together => "together",
            Credential::Fireworks => "fireworks",
            Credential::HuggingFace => "huggingface",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Credential::DeepSeek => "DeepSeek",
            Credential::Google => "Google",
            Credential::OpenAi => "OpenAI",
            Credential::Anthropic => "Anthropic",
            Credential::Groq => "Groq",
            Credential::Together => "Together AI",
            Credential::Fireworks => "Fireworks AI",
            Credential::HuggingFace => "Hugging Face",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "fireworks-ai" => Some(Credential::Fireworks),
            "gemini" => Some(Credential::Google),
            other => Self::ALL.into_iter().find(|c| c.id() == other),
        }
    }

    /**
     * \brief 密钥名称，按优先级排列；开发模式下对应大写的环境变量。
     */
    pub fn secret_names(&self) -> &'static [&'static str] {
        match self {
            Credential::DeepSeek => &["deepseek_api_key"],
            Credential::Google => &["gemini_api_key", "google_api_key"],
            Credential::OpenAi => &["openai_api_key"],
            Credential::Anthropic => &["anthropic_api_key"],
            Credential::Groq => &["groq_api_key"],
            Credential::Together => &["together_api_key"],
            Credential::Fireworks => &["fireworks_api_key"],
            Credential::HuggingFace => &["hf_token"],
        }
    }

    pub(crate) fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Credential::DeepSeek => Some("https://api.deepseek.com"),
            Credential::Google => Some("https://generativelanguage.googleapis.com"),
            Credential::OpenAi => Some("https://api.openai.com"),
            Credential::Anthropic => Some("https://api.anthropic.com"),
            Credential::Groq => Some("https://api.groq.com/openai"),
            Credential::Together => Some("https://api.together.xyz"),
            Credential::Fireworks => Some("https://api.fireworks.ai/inference"),
            Credential::HuggingFace => None,
        }
    }

    pub(crate) fn base_url_var(&self) -> Option<&'static str> {
        match self {
            Credential::DeepSeek => Some("DEEPSEEK_BASE_URL"),
            Credential::Google => Some("GOOGLE_BASE_URL"),
            Credential::OpenAi => Some("OPENAI_BASE_URL"),
            Credential::Anthropic => Some("ANTHROPIC_BASE_URL"),
            Credential::Groq => Some("GROQ_BASE_URL"),
            Credential::Together => Some("TOGETHER_BASE_URL"),
            Credential::Fireworks => Some("FIREWORKS_BASE_URL"),
            Credential::HuggingFace => None,
        }
    }

    /** \brief HF_TOKEN 始终从进程环境读取。 */
    fn env_only(&self) -> bool {
        matches!(self, Credential::HuggingFace)
    }
}

/**
 * \brief 密钥值包装，Debug/Display 不输出明文。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/**
 * \brief 密钥来源：生产环境读挂载文件，开发环境读环境变量。
 */
#[derive(Debug, Clone)]
pub enum SecretSource {
    Files(PathBuf),
    Environment,
}

/**
 * \brief 密钥解析器，只暴露“是否存在”与取值，不记录密钥内容。
 */
#[derive(Debug, Clone)]
pub struct SecretResolver {
    source: SecretSource,
    env: EnvVars,
}

impl SecretResolver {
    pub fn new(settings: &Settings, env: EnvVars) -> Self {
        let source = if settings.production {
            SecretSource::Files(settings.secrets_dir.clone())
        } else {
            SecretSource::Environment
        };
        Self { source, env }
    }

    pub fn source(&self) -> &SecretSource {
        &self.source
    }

    /**
     * \brief 读取单个密钥；缺失或读取失败时返回 None 并以名称告警。
     */
    pub fn get_secret(&self, name: &str) -> Option<ApiKey> {
        let value = match &self.source {
            SecretSource::Environment => self.read_env(name),
            SecretSource::Files(dir) => match std::fs::read_to_string(dir.join(name)) {
                Ok(raw) => Some(raw),
                Err(err) => {
                    warn!(secret = name, error = %err.kind(), "could not read secret file");
                    return None;
                }
            },
        };
        normalize(name, value)
    }

    pub fn has_secret(&self, name: &str) -> bool {
        self.get_secret(name).is_some()
    }

    /**
     * \brief 解析厂商凭据，按名称优先级取第一个可用值。
     */
    pub fn credential(&self, credential: Credential) -> Option<ApiKey> {
        if credential.env_only() {
            return credential
                .secret_names()
                .iter()
                .find_map(|name| normalize(name, self.read_env(name)));
        }
        credential
            .secret_names()
            .iter()
            .find_map(|name| self.get_secret(name))
    }

    pub fn has_credential(&self, credential: Credential) -> bool {
        self.credential(credential).is_some()
    }

    /**
     * \brief 全部厂商的可用性布尔表。
     */
    pub fn availability(&self) -> BTreeMap<&'static str, bool> {
        Credential::ALL
            .iter()
            .map(|c| (c.id(), self.has_credential(*c)))
            .collect()
    }

    fn read_env(&self, name: &str) -> Option<String> {
        self.env.get(&name.to_ascii_uppercase()).map(str::to_string)
    }
}

fn normalize(name: &str, value: Option<String>) -> Option<ApiKey> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Some(ApiKey(v)),
        _ => {
            warn!(secret = name, "secret not available");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_resolver(pairs: &[(&str, &str)]) -> SecretResolver {
        let env: EnvVars = pairs.iter().copied().collect();
        SecretResolver::new(&Settings::from_env(&env), env)
    }

    #[test]
    fn test_environment_source_reads_uppercase_vars() {
        let r = dev_resolver(&[("OPENAI_API_KEY", "sk-test")]);
        assert!(r.has_secret("openai_api_key"));
        assert_eq!(r.get_secret("openai_api_key").unwrap().expose(), "sk-test");
        assert!(!r.has_secret("groq_api_key"));
    }

    #[test]
    fn test_blank_values_are_absent() {
        let r = dev_resolver(&[("GROQ_API_KEY", "   ")]);
        assert!(!r.has_credential(Credential::Groq));
    }

    #[test]
    fn test_google_accepts_either_variable() {
        let r = dev_resolver(&[("GOOGLE_API_KEY", "AIza-google")]);
        assert_eq!(
            r.credential(Credential::Google).unwrap().expose(),
            "AIza-google"
        );
        let r = dev_resolver(&[("GEMINI_API_KEY", "g1"), ("GOOGLE_API_KEY", "g2")]);
        assert_eq!(r.credential(Credential::Google).unwrap().expose(), "g1");
    }

    #[test]
    fn test_file_source_reads_trimmed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("anthropic_api_key"), "sk-ant-file\n").expect("write");
        let env: EnvVars = [
            ("PRODUCTION", "true".to_string()),
            ("SECRETS_DIR", dir.path().display().to_string()),
            ("OPENAI_API_KEY", "sk-env-ignored".to_string()),
            ("HF_TOKEN", "hf_env".to_string()),
        ]
        .into_iter()
        .collect();
        let r = SecretResolver::new(&Settings::from_env(&env), env);
        assert!(matches!(r.source(), SecretSource::Files(_)));
        assert_eq!(
            r.credential(Credential::Anthropic).unwrap().expose(),
            "sk-ant-file"
        );
        assert!(!r.has_credential(Credential::OpenAi));
        assert!(r.has_credential(Credential::HuggingFace));
    }

    #[test]
    fn test_availability_only_groq() {
        let r = dev_resolver(&[("GROQ_API_KEY", "gsk_abc")]);
        let map = r.availability();
        assert_eq!(map.len(), Credential::ALL.len());
        for (vendor, present) in map {
            assert_eq!(present, vendor == "groq", "vendor {vendor}");
        }
    }

    #[test]
    fn test_api_key_debug_is_redacted() {
        let key = ApiKey::new("sk-secret");
        assert!(!format!("{:?}", key).contains("sk-secret"));
    }

    #[test]
    fn test_from_id_aliases() {
        assert_eq!(Credential::from_id("fireworks-ai"), Some(Credential::Fireworks));
        assert_eq!(Credential::from_id("OpenAI"), Some(Credential::OpenAi));
        assert_eq!(Credential::from_id("mistral"), None);
    }
}
