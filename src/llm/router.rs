use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::anthropic::AnthropicModel;
use super::message::ModelRequest;
use super::openai::OpenAiModel;
use super::{LanguageModel, ModelStream};
use crate::config::ProviderKeys;
use crate::errors::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl Provider {
    /// Provider implied by a model name.
    pub fn for_model(model: &str) -> Option<Self> {
        let m = model.to_ascii_lowercase();
        if m.starts_with("claude") {
            return Some(Self::Anthropic);
        }
        let is_o_series = m.starts_with('o') && m[1..].starts_with(|c: char| c.is_ascii_digit());
        if m.starts_with("gpt") || is_o_series {
            return Some(Self::OpenAi);
        }
        None
    }
}

/// Dispatches each request to the provider its model name belongs to.
#[derive(Clone, Default)]
pub struct ModelRouter {
    anthropic: Option<Arc<dyn LanguageModel>>,
    openai: Option<Arc<dyn LanguageModel>>,
}

impl ModelRouter {
    pub fn from_keys(keys: &ProviderKeys) -> Self {
        Self {
            anthropic: keys
                .anthropic
                .as_ref()
                .map(|k| Arc::new(AnthropicModel::new(k.clone())) as Arc<dyn LanguageModel>),
            openai: keys
                .openai
                .as_ref()
                .map(|k| Arc::new(OpenAiModel::new(k.clone())) as Arc<dyn LanguageModel>),
        }
    }

    pub fn with_provider(mut self, provider: Provider, model: Arc<dyn LanguageModel>) -> Self {
        match provider {
            Provider::Anthropic => self.anthropic = Some(model),
            Provider::OpenAi => self.openai = Some(model),
        }
        self
    }

    pub fn resolve(&self, model: &str) -> Result<&Arc<dyn LanguageModel>, ModelError> {
        let provider = Provider::for_model(model).ok_or_else(|| ModelError::NoProvider(model.to_string()))?;
        let slot = match provider {
            Provider::Anthropic => &self.anthropic,
            Provider::OpenAi => &self.openai,
        };
        slot.as_ref().ok_or_else(|| ModelError::NoProvider(model.to_string()))
    }

    pub fn supports(&self, model: &str) -> bool {
        self.resolve(model).is_ok()
    }
}

#[async_trait]
impl LanguageModel for ModelRouter {
    fn provider(&self) -> &'static str {
        "router"
    }

    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        self.resolve(&request.model)?.stream(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedModel;

    #[test]
    fn test_provider_detection() {
        assert_eq!(Provider::for_model("claude-sonnet-4-5"), Some(Provider::Anthropic));
        assert_eq!(Provider::for_model("gpt-4o"), Some(Provider::OpenAi));
        assert_eq!(Provider::for_model("o3-mini"), Some(Provider::OpenAi));
        assert_eq!(Provider::for_model("ollama-llama3"), None);
        assert_eq!(Provider::for_model("llama3"), None);
    }

    #[test]
    fn test_unconfigured_provider_is_rejected() {
        let router = ModelRouter::from_keys(&ProviderKeys {
            anthropic: Some("sk-ant-test".into()),
            openai: None,
        });
        assert!(router.supports("claude-sonnet-4-5"));
        assert!(matches!(router.resolve("gpt-4o"), Err(ModelError::NoProvider(_))));
    }

    #[tokio::test]
    async fn test_routes_to_registered_model() {
        let router = ModelRouter::default()
            .with_provider(Provider::OpenAi, Arc::new(ScriptedModel::text_only("hello")));
        let response = router
            .complete(ModelRequest::new("gpt-4o", "sys"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text, "hello");
    }
}
