//! OpenAI 兼容端点客户端
//!
//! 本地 Ollama、Gemini / Anthropic 的兼容网关与 OpenAI 本身都走同一个 async_openai 客户端，
//! 只有 api_base / model / key 不同。流式补全直接转发 SSE 增量。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::traits::{ChatMessage, CompletionRequest, LlmClient, LlmError, Role, TokenStream};

/// 本地端点不校验 key，但协议要求带 Authorization 头
const PLACEHOLDER_KEY: &str = "sk-no-key";

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key.unwrap_or(PLACEHOLDER_KEY));
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[allow(deprecated)]
    fn build_request(&self, request: &CompletionRequest, stream: bool) -> Result<CreateChatCompletionRequest, LlmError> {
        let messages = request
            .messages
            .iter()
            .map(wire_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages).stream(stream);
        if let Some(t) = request.temperature {
            args.temperature(t);
        }
        if let Some(n) = request.max_tokens {
            args.max_tokens(n);
        }
        args.build().map_err(|e| LlmError::Request(e.to_string()))
    }
}

fn wire_message(m: &ChatMessage) -> Result<ChatCompletionRequestMessage, LlmError> {
    let content = m.content.clone();
    let built = match m.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::System),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::User),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::Assistant),
    };
    built.map_err(|e| LlmError::Request(e.to_string()))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let response = self
            .client
            .chat()
            .create(self.build_request(request, false)?)
            .await
            .map_err(|e| LlmError::Backend(e.to_string()))?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion usage"
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TokenStream, LlmError> {
        let stream = self
            .client
            .chat()
            .create_stream(self.build_request(request, true)?)
            .await
            .map_err(|e| LlmError::Backend(e.to_string()))?;

        let tokens = stream.filter_map(|chunk| async move {
            match chunk {
                Ok(resp) => resp
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|s| !s.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(LlmError::Stream(e.to_string()))),
            }
        });
        Ok(Box::pin(tokens))
    }
}
