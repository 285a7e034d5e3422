pub mod config;
pub mod diagnostics;
pub mod error;
pub mod llm;
pub mod models;
pub mod rate_limit;
pub mod registry;
pub mod secrets;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod vendor;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{EnvVars, Settings};
    pub use crate::error::ProxyError;
    pub use crate::llm::{Dispatch, Dispatcher, StreamHandle};
    pub use crate::models::{ChatMessage, ChatRequest, ChatResult, Model, Provider};
    pub use crate::registry::ProviderRegistry;
    pub use crate::server::AppState;
    pub use crate::{diagnostics, llm, models, registry, server, stream, telemetry};
}
