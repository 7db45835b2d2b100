//! Model-name routing adapter

use async_trait::async_trait;
use parley_core::{AdapterLookup, ChatAdapter, ChatRequest, Error, ResponseStream, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Routes by the request's `model` field with a mandatory default route.
pub struct ModelNameAdapter {
    routes: HashMap<String, String>,
    default_token: String,
    lookup: Arc<dyn AdapterLookup>,
}

impl ModelNameAdapter {
    /// `routes` maps canonical model names to credential tokens; requests for
    /// unmapped models use the default token. Construction fails without one.
    pub fn new(
        routes: HashMap<String, String>,
        default_token: Option<String>,
        lookup: Arc<dyn AdapterLookup>,
    ) -> Result<Self> {
        let default_token = default_token.ok_or_else(|| {
            Error::Config("model-name router requires a default token".to_string())
        })?;
        Ok(Self {
            routes,
            default_token,
            lookup,
        })
    }

    fn select(&self, model: &str) -> &str {
        self.routes
            .get(model)
            .map(String::as_str)
            .unwrap_or(&self.default_token)
    }
}

#[async_trait]
impl ChatAdapter for ModelNameAdapter {
    async fn chat_completions(&self, request: ChatRequest) -> Result<ResponseStream> {
        let token = self.select(&request.model);
        debug!(model = %request.model, token = %token, "model-name routed request");
        let delegate = self.lookup.lookup(token).ok_or_else(|| {
            Error::Authentication(format!("no adapter configured for credential token {token}"))
        })?;
        delegate.chat_completions(request).await
    }
}
