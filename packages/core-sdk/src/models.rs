use serde::{Deserialize, Serialize};

/** \brief 未指定时的默认最大生成 token 数。 */
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
/** \brief 未指定时的默认采样温度。 */
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/** \brief 自动选择 Provider 的占位标识。 */
pub const AUTO_PROVIDER: &str = "auto";

/**
 * \brief Provider 类别：本地推理守护进程或云端厂商 API。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCategory {
    Local,
    Cloud,
}

impl ProviderCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCategory::Local => "local",
            ProviderCategory::Cloud => "cloud",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(ProviderCategory::Local),
            "cloud" => Some(ProviderCategory::Cloud),
            _ => None,
        }
    }
}

/**
 * \brief 推理后端描述，只能由注册表的发现流程构造。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /** \brief 全局唯一标识，如 ollama / openai */
    pub id: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 类别 */
    #[serde(rename = "type")]
    pub category: ProviderCategory,
    /** \brief API 基地址 */
    pub base_url: String,
    /** \brief 凭据句柄（密钥名称，而非密钥本身） */
    pub credential: Option<String>,
    /** \brief 可用标记，由发现流程推导 */
    #[serde(rename = "isAvailable")]
    pub(crate) available: bool,
    /** \brief 最大 token 上限 */
    pub max_tokens: u32,
    /** \brief 厂商侧模型 ID 列表 */
    pub supported_models: Vec<String>,
}

impl Provider {
    pub fn is_available(&self) -> bool {
        self.available
    }
}

/**
 * \brief 可寻址的模型条目，归属于恰好一个 Provider。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /** \brief 全局唯一 ID，通常为 `<provider>-<厂商模型 ID>` */
    pub id: String,
    pub name: String,
    /** \brief 所属 Provider 标识 */
    pub provider: String,
    #[serde(rename = "type")]
    pub category: ProviderCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    /** \brief 推理型模型，不适合增量追问 */
    pub is_thinker: bool,
    pub is_new: bool,
}

impl Model {
    pub fn is_local(&self) -> bool {
        self.category == ProviderCategory::Local
    }
}

/**
 * \brief 消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/**
 * \brief 规范化的聊天请求，每次调用构造，不持久化。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /** \brief Provider 标识，可为 `auto` */
    pub provider_id: String,
    pub model_id: String,
    /** \brief 按会话顺序排列的消息 */
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            messages,
            stream: true,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /**
     * \brief 第一条 system 消息内容（若存在）。
     */
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /**
     * \brief 除 system 外的消息，保持原顺序。
     */
    pub fn conversation(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    pub fn max_tokens_or_default(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn temperature_or_default(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }
}

/**
 * \brief 非流式调用的结果。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResult {
    pub ok: bool,
    pub content: String,
    pub provider: String,
    pub model: String,
}
