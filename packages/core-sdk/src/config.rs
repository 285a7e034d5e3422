use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::secrets::Credential;

/** \brief 本地守护进程默认地址。 */
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
/** \brief 生产环境下密钥文件的默认挂载目录。 */
pub const DEFAULT_SECRETS_DIR: &str = "/run/secrets";
/** \brief 每个窗口内单个客户端允许的默认请求数。 */
pub const DEFAULT_MAX_REQUESTS_PER_IP: u32 = 2;
/** \brief 限流计数器的重置周期。 */
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/**
 * \brief 环境变量快照；生产运行取自进程环境，测试中直接构造。
 */
#[derive(Debug, Clone, Default)]
pub struct EnvVars(HashMap<String, String>);

impl EnvVars {
    pub fn from_process() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /**
     * \brief 仅字面量 `true` 视为开启。
     */
    pub fn flag(&self, name: &str) -> bool {
        self.get(name) == Some("true")
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/**
 * \brief 各云厂商 API 基地址，启动时读取一次，运行期不再变更。
 */
#[derive(Debug, Clone)]
pub struct VendorEndpoints {
    urls: HashMap<Credential, String>,
}

impl VendorEndpoints {
    pub fn from_env(env: &EnvVars) -> Self {
        let urls = Credential::ALL
            .iter()
            .filter_map(|c| {
                let default = c.default_base_url()?;
                let url = c
                    .base_url_var()
                    .and_then(|var| env.non_empty(var))
                    .unwrap_or_else(|| default.to_string());
                Some((*c, url.trim_end_matches('/').to_string()))
            })
            .collect();
        Self { urls }
    }

    pub fn base_url(&self, credential: Credential) -> Option<&str> {
        self.urls.get(&credential).map(String::as_str)
    }
}

impl Default for VendorEndpoints {
    fn default() -> Self {
        Self::from_env(&EnvVars::default())
    }
}

/**
 * \brief 部署配置：运行模式、本地守护进程地址、限流上限等。
 */
#[derive(Debug, Clone)]
pub struct Settings {
    /** \brief 严格本地模式 */
    pub local_mode: bool,
    /** \brief 本地模式下仍允许云端 Provider */
    pub mixed_mode: bool,
    /** \brief 生产部署：密钥从挂载文件读取 */
    pub production: bool,
    /** \brief 开发部署：跳过限流 */
    pub dev_mode: bool,
    pub secrets_dir: PathBuf,
    /** \brief 显式配置的 OLLAMA_BASE_URL（未配置时为 None） */
    pub ollama_base_url: Option<String>,
    pub max_requests_per_ip: u32,
    pub endpoints: VendorEndpoints,
    /** \brief 编辑器前端静态资源目录 */
    pub ui_dir: PathBuf,
    /** \brief 是否写入请求事件日志文件 */
    pub telemetry_log: bool,    /** \brief 事件日志目录 */
    pub log_dir: PathBuf,
}

impl Settings {
    pub fn from_env(env: &EnvVars) -> Self {
        let max_requests_per_ip = env
            .non_empty("MAX_REQUESTS_PER_IP")
            .and_then(|v| match v.parse::<u32>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(value = %v, "ignoring invalid MAX_REQUESTS_PER_IP");
                    None
                }
            })
            .unwrap_or(DEFAULT_MAX_REQUESTS_PER_IP);

        Self {
            local_mode: env.flag("LOCAL_MODE"),
            mixed_mode: env.flag("ENABLE_MIXED_MODE"),
            production: env.flag("PRODUCTION"),
            dev_mode: env.flag("DEV_MODE"),
            secrets_dir: env
                .non_empty("SECRETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRETS_DIR)),
            ollama_base_url: env.non_empty("OLLAMA_BASE_URL"),
            max_requests_per_ip,
            endpoints: VendorEndpoints::from_env(env),
            ui_dir: env
                .non_empty("LOCALSITE_UI_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ui/dist")),
            telemetry_log: env.flag("TELEMETRY_LOG"),
            log_dir: env
                .non_empty("LOCALSITE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
        }
    }

    /**
     * \brief 本地守护进程地址，未配置时回落到默认值。
     */
    pub fn ollama_url(&self) -> &str {
        self.ollama_base_url
            .as_deref()
            .unwrap_or(DEFAULT_OLLAMA_BASE_URL)
            .trim_end_matches('/')
    }

    /**
     * \brief 严格本地模式下不加载云端 Provider。
     */
    pub fn cloud_enabled(&self) -> bool {
        !self.local_mode || self.mixed_mode
    }

    pub fn rate_limit_enabled(&self) -> bool {
        !(self.local_mode || self.dev_mode)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env(&EnvVars::default())
    }
}
