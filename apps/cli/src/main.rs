use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use localsite_core_sdk::{
    config::{EnvVars, Settings},
    diagnostics,
    llm::Dispatch,
    models::{ChatMessage, ChatRequest, AUTO_PROVIDER},
    registry::{ModelFilter, ProviderFilter},
    secrets::Credential,
    server::{self, AppState},
    telemetry,
};

/**
 * \brief CLI 程序入口：启动代理服务，或在终端中直接使用同一套组件。
 */
#[derive(Parser, Debug)]
#[command(name = "localsite", version, about = "LocalSite multi-provider LLM proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
    },

    /**
     * \brief 执行一次发现并列出 Provider 与模型。
     */
    Providers,

    /**
     * \brief 发送一条消息；未指定模型时使用推荐模型。
     */
    Chat {
        #[arg(long, default_value = AUTO_PROVIDER)]
        provider: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
    },

    /**
     * \brief 显示各厂商密钥是否已配置。
     */
    Keys,

    /**
     * \brief 在线校验所有已配置的密钥。
     */
    ValidateKeys,

    /**
     * \brief 测试指定厂商的密钥，不保存。
     */
    TestKey {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        api_key: String,
    },

    /**
     * \brief 检查部署配置。
     */
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env = EnvVars::from_process();
    let settings = Settings::from_env(&env);
    telemetry::init(&settings);
    let state = AppState::new(settings, env).context("initialize components failed")?;

    match cli.command {
        Commands::Serve { addr } => {
            server::run(&addr, state).await?;
        }
        Commands::Providers => {
            state.registry.discover().await;
            let providers = state.registry.get_providers(&ProviderFilter::default());
            if providers.is_empty() {
                println!("No providers available.");
            }
            for p in providers {
                println!("{} ({}, {}) {}", p.id, p.name, p.category.as_str(), p.base_url);
                let models = state.registry.get_models(&ModelFilter {
                    provider: Some(p.id.clone()),
                    ..Default::default()
                });
                for m in models {
                    let mut tags = Vec::new();
                    if m.is_thinker {
                        tags.push("thinker");
                    }
                    if m.is_new {
                        tags.push("new");
                    }
                    println!("  {} {}", m.id, tags.join(" "));
                }
            }
            if let Some(m) = state.registry.get_recommended_model() {
                println!("Recommended: {}", m.id);
            }
        }
        Commands::Chat {
            provider,
            model,
            prompt,
            system,
            no_stream,
            max_tokens,
            temperature,
        } => {
            state.registry.discover().await;
            let model = match model {
                Some(m) => m,
                None => {
                    state
                        .registry
                        .get_recommended_model()
                        .context("no model available, configure Ollama or a cloud API key")?
                        .id
                }
            };

            let mut messages = Vec::new();
            if let Some(sys) = system {
                messages.push(ChatMessage::system(sys));
            }
            messages.push(ChatMessage::user(prompt));
            let mut request = ChatRequest::new(provider, model, messages).streaming(!no_stream);
            request.max_tokens = max_tokens;
            request.temperature = temperature;

            match state.dispatcher.send(request).await? {
                Dispatch::Complete(result) => {
                    println!("{}", result.content);
                }
                Dispatch::Stream(mut handle) => {
                    while let Some(delta) = handle
                        .fragments
                        .next()
                        .await
                        .transpose()
                        .context("stream error")?
                    {
                        print!("{}", delta);
                        std::io::stdout().flush().ok();
                    }
                    println!();
                }
            }
        }
        Commands::Keys => {
            for (vendor, present) in state.secrets.availability() {
                println!(
                    "{:<12} {}",
                    vendor,
                    if present { "configured" } else { "missing" }
                );
            }
        }
        Commands::ValidateKeys => {
            let results = diagnostics::validate_configured_keys(
                &state.client,
                &state.settings,
                &state.secrets,
            )
            .await;
            if results.is_empty() {
                println!("No API keys configured.");
            }
            for (vendor, result) in results {
                match result.error {
                    None => println!("{:<12} valid", vendor),
                    Some(err) => println!("{:<12} invalid ({})", vendor, err),
                }
            }
        }
        Commands::TestKey { provider, api_key } => {
            let credential = Credential::from_id(&provider)
                .filter(|c| diagnostics::testable(*c))
                .with_context(|| format!("provider {} not supported for testing", provider))?;
            let report =
                diagnostics::test_key(&state.client, &state.settings.endpoints, credential, &api_key)
                    .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckConfig => {
            let report = diagnostics::validate_config(&state.settings, &state.secrets);
            print!("{}", report.summary());
            if !report.is_valid {
                bail!("configuration has {} error(s)", report.errors.len());
            }
        }
    }

    Ok(())
}
