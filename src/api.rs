//! # API Module
//!
//! This module handles interactions with the OpenAI-compatible chat API used to
//! generate answers.
//!
//! The [`Generator`] trait is the seam the rest of the crate talks to:
//! one prompt in, a stream of text increments out through a callback, and the
//! full answer returned at the end. [`OpenAiGenerator`] implements it with a
//! streamed chat completion.
//!
//! Increments are handed to the callback as soon as they arrive, and their
//! concatenation always equals the returned text. If the stream fails midway
//! the error is returned; increments already delivered are not taken back.
//!
//! # Example
//!
//! ```no_run
//! use awful_rag::api::{Generator, OpenAiGenerator};
//! use awful_rag::config::AwfulRagConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AwfulRagConfig::default();
//! let generator = OpenAiGenerator::new(&config);
//! let answer = generator
//!     .generate(&config.chat_model, "Say hello.", &mut |piece: &str| print!("{piece}"))
//!     .await?;
//! println!("\n{} bytes", answer.len());
//! # Ok(()) }
//! ```
use crate::{
    config::AwfulRagConfig,
    error::{RagError, Result},
};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::StreamExt;

use tracing::{debug, error};

/// Produces an answer for a prompt, streaming it as it is generated.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a reply to `prompt` with `model`.
    ///
    /// `on_increment` is called with each new, non-overlapping piece of text.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        on_increment: &mut (dyn for<'p> FnMut(&'p str) + Send),
    ) -> Result<String>;
}

/// Creates a new OpenAI API client from configuration.
///
/// # Parameters
/// - `config: &AwfulRagConfig`: Configuration containing API base and key.
///
/// # Returns
/// - `Client<OpenAIConfig>`: A client pointed at `config.api_base`.
fn create_client(config: &AwfulRagConfig) -> Client<OpenAIConfig> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(config.api_key.clone())
        .with_api_base(config.api_base.clone());
    debug!("Client created with config: {:?}", openai_config);
    Client::with_config(openai_config)
}

/// Streams chat completions from an OpenAI-compatible endpoint.
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    num_predict: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &AwfulRagConfig) -> Self {
        Self {
            client: create_client(config),
            num_predict: config.num_predict,
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    #[allow(deprecated)]
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        on_increment: &mut (dyn for<'p> FnMut(&'p str) + Send),
    ) -> Result<String> {
        let user_message = ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
            name: None,
        });

        let request = CreateChatCompletionRequestArgs::default()
            .max_tokens(self.num_predict)
            .model(model)
            .stream(true)
            .messages(vec![user_message])
            .build()?;

        debug!("Sending request: {:?}", request);

        let mut response_string = String::new();
        let mut stream = self.client.chat().create_stream(request).await?;

        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => {
                    for chat_choice in response.choices {
                        if let Some(content) = chat_choice.delta.content {
                            if content.is_empty() {
                                continue;
                            }
                            on_increment(&content);
                            response_string.push_str(&content);
                        }
                    }
                }
                Err(err) => {
                    error!("Received error: {}", err);
                    return Err(RagError::Generation(err.to_string()));
                }
            }
        }

        Ok(response_string)
    }
}
