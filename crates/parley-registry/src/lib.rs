//! Parley Registry
//!
//! Vendor-keyed adapter construction, resolved once at configuration time:
//! a typed, tagged configuration enum builds a token → adapter table that
//! implements the credential lookup boundary. Unknown backend types fail at
//! deserialization; a missing default route fails at build. Neither ever
//! reaches request handling.

use dashmap::DashMap;
use parley_core::{AdapterLookup, ChatAdapter, Error, Result};
use parley_egress::anthropic::{AnthropicAdapter, AnthropicConfig};
use parley_egress::azure::{AzureAdapter, AzureConfig};
use parley_egress::copilot::{ConversationStyle, CopilotAdapter, CopilotConfig};
use parley_egress::gemini::{GeminiAdapter, GeminiConfig};
use parley_egress::openai::{OpenAiAdapter, OpenAiConfig};
use parley_egress::qwen::{QwenAdapter, QwenConfig};
use parley_egress::sign::TokenCache;
use parley_egress::spark::{SparkAdapter, SparkConfig};
use parley_egress::zhipu::{ZhipuApiAdapter, ZhipuConfig};
use parley_routing::{ModelNameAdapter, PoolAdapter, PoolStrategy};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One configured backend, tagged by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AdapterConfig {
    /// OpenAI or any OpenAI-compatible proxy
    #[serde(alias = "proxy")]
    Openai(OpenAiEntry),
    Azure(AzureEntry),
    Claude(ClaudeEntry),
    Gemini(GeminiEntry),
    Qwen(QwenEntry),
    ZhipuApi(ZhipuEntry),
    Spark(SparkEntry),
    Copilot(CopilotEntry),
    Pool(PoolEntry),
    ModelName(ModelNameEntry),
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiEntry {
    pub api_key: String,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureEntry {
    pub api_base: String,
    pub api_key: String,
    pub api_version: String,
    pub deployment_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeEntry {
    pub api_key: String,
    #[serde(rename = "anthropic-version")]
    pub anthropic_version: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiEntry {
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QwenEntry {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZhipuEntry {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SparkEntry {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_model_version: String,
}

fn default_style() -> ConversationStyle {
    ConversationStyle::Balanced
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopilotEntry {
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default = "default_style")]
    pub style: ConversationStyle,
    #[serde(default)]
    pub single_conversation: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolEntry {
    pub router_strategy: PoolStrategy,
    pub token_pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelNameEntry {
    /// Model → token routes; the `default` key names the fallback token.
    #[serde(rename = "model-2-token")]
    pub model_to_token: HashMap<String, String>,
}

/// Token-keyed adapter table. One instance serves the process lifetime.
pub struct Registry {
    adapters: DashMap<String, Arc<dyn ChatAdapter>>,
    signing_tokens: Arc<TokenCache>,
}

impl Registry {
    /// Build every adapter up front. Routing entries resolve after direct
    /// ones, capturing the registry itself as their delegate lookup.
    pub fn build(configs: Vec<(String, AdapterConfig)>) -> Result<Arc<Self>> {
        let registry = Arc::new(Self {
            adapters: DashMap::new(),
            signing_tokens: Arc::new(TokenCache::new()),
        });

        let mut routers = Vec::new();
        for (token, config) in configs {
            match config {
                AdapterConfig::Pool(_) | AdapterConfig::ModelName(_) => {
                    routers.push((token, config));
                }
                direct => {
                    let adapter = registry.build_direct(direct)?;
                    debug!(token = %token, "registered adapter");
                    registry.adapters.insert(token, adapter);
                }
            }
        }
        for (token, config) in routers {
            let adapter = registry.build_router(config)?;
            debug!(token = %token, "registered routing adapter");
            registry.adapters.insert(token, adapter);
        }
        Ok(registry)
    }

    fn build_direct(&self, config: AdapterConfig) -> Result<Arc<dyn ChatAdapter>> {
        Ok(match config {
            AdapterConfig::Openai(entry) => Arc::new(OpenAiAdapter::new(
                OpenAiConfig::new(entry.api_key).with_base_url(entry.api_base),
            )?),
            AdapterConfig::Azure(entry) => Arc::new(AzureAdapter::new(AzureConfig::new(
                entry.api_base,
                entry.api_key,
                entry.api_version,
                entry.deployment_id,
            ))?),
            AdapterConfig::Claude(entry) => {
                let mut config = AnthropicConfig::new(entry.api_key, entry.anthropic_version);
                config.model = entry.model;
                Arc::new(AnthropicAdapter::new(config)?)
            }
            AdapterConfig::Gemini(entry) => {
                let mut config = GeminiConfig::new(entry.api_key);
                if let Some(model) = entry.model {
                    config.model = model;
                }
                Arc::new(GeminiAdapter::new(config)?)
            }
            AdapterConfig::Qwen(entry) => {
                Arc::new(QwenAdapter::new(QwenConfig::new(entry.api_key, entry.model))?)
            }
            AdapterConfig::ZhipuApi(entry) => Arc::new(ZhipuApiAdapter::new(
                ZhipuConfig::new(entry.api_key, entry.model),
                Arc::clone(&self.signing_tokens),
            )?),
            AdapterConfig::Spark(entry) => Arc::new(SparkAdapter::new(SparkConfig::new(
                entry.app_id,
                entry.api_key,
                entry.api_secret,
                entry.api_model_version,
            ))?),
            AdapterConfig::Copilot(entry) => {
                let config = CopilotConfig {
                    cookies: entry.cookie,
                    style: entry.style,
                    single_conversation: entry.single_conversation,
                    ..CopilotConfig::default()
                };
                Arc::new(CopilotAdapter::new(config)?)
            }
            AdapterConfig::Pool(_) | AdapterConfig::ModelName(_) => {
                return Err(Error::Config(
                    "routing adapters are resolved in the second pass".to_string(),
                ));
            }
        })
    }

    fn build_router(self: &Arc<Self>, config: AdapterConfig) -> Result<Arc<dyn ChatAdapter>> {
        let lookup: Arc<dyn AdapterLookup> = Arc::clone(self) as Arc<dyn AdapterLookup>;
        Ok(match config {
            AdapterConfig::Pool(entry) => Arc::new(PoolAdapter::new(
                entry.token_pool,
                entry.router_strategy,
                lookup,
            )?),
            AdapterConfig::ModelName(entry) => {
                let mut routes = entry.model_to_token;
                let default_token = routes.remove("default");
                Arc::new(ModelNameAdapter::new(routes, default_token, lookup)?)
            }
            _ => {
                return Err(Error::Config(
                    "direct adapters are resolved in the first pass".to_string(),
                ));
            }
        })
    }
}

impl AdapterLookup for Registry {
    fn lookup(&self, token: &str) -> Option<Arc<dyn ChatAdapter>> {
        self.adapters.get(token).map(|entry| Arc::clone(entry.value()))
    }
}
