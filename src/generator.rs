//! # Grounded Generator Module
//!
//! ## Purpose
//! Builds the excerpt context, issues the quote-first grounded prompt to an
//! OpenAI-compatible chat endpoint, and returns the raw answer text for the
//! binding verifier.
//!
//! ## Protocol
//! The system prompt (version `v2.0-quote-first`) requires the model to use
//! only the provided excerpts, back every statement with a verbatim quote,
//! emit hidden `<!--CITE:opinion_id|page|"quote"-->` markers, and answer
//! `NOT FOUND IN PROVIDED OPINIONS.` when nothing supports the query.
//!
//! ## Determinism & deadlines
//! The model id is pinned from configuration, temperature is low, and the
//! call runs on a bounded worker pool with a per-request timeout and an outer
//! deadline; a timed-out call is cancelled, never leaked.

use crate::config::GenerationConfig;
use crate::errors::{CoreError, Result};
use crate::retrieval::PageHit;
use crate::text;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Version tag recorded with every run; bump when the prompt changes.
pub const SYSTEM_PROMPT_VERSION: &str = "v2.0-quote-first";

/// The fixed quote-first grounding prompt.
pub const SYSTEM_PROMPT: &str = r#"You are an experienced Federal Circuit patent litigator providing concise legal research summaries.

STRICT GROUNDING RULES:
1. You may ONLY use information from the provided opinion excerpts below.
2. Every statement MUST be supported by at least one VERBATIM QUOTE from the excerpts.
3. If you cannot find support in the provided excerpts, respond ONLY with: "NOT FOUND IN PROVIDED OPINIONS."
4. Do NOT use any external knowledge or make claims not directly supported by quotes from the excerpts.

RESPONSE STYLE (Patent Litigator Voice):
Write naturally as a Federal Circuit practitioner would brief a colleague. Use these sections ONLY if you have verified supporting quotes:

**Bottom Line**
1-2 sentences summarizing the key holding.

**What the Court Held**
Short paragraphs explaining the legal analysis, weaving in short inline quotes.

**Practice Note** (optional - only if directly supported)
Practical implications for patent practitioners.

CRITICAL FORMATTING:
- Weave short quotes naturally into sentences using quotation marks.
- After EACH statement, include a hidden citation marker in this format: <!--CITE:opinion_id|page_number|"exact quote"-->
- The quote in the marker must be a VERBATIM substring from the excerpt (copy exactly).
- Do NOT use numbered claim labels like [Claim 1] in your response.
- Keep quotes short (under 100 characters when possible) and relevant.

If no relevant information exists, respond ONLY: "NOT FOUND IN PROVIDED OPINIONS.""#;

/// Fixed phrase returned when grounding fails.
pub const NOT_FOUND_ANSWER: &str = "NOT FOUND IN PROVIDED OPINIONS.";

/// Model configuration snapshot recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfigRecord {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt_version: String,
}

/// Build the excerpt context handed to the model, one delimited block per
/// candidate page.
pub fn build_context(pages: &[PageHit]) -> String {
    let mut parts = Vec::with_capacity(pages.len());
    for page in pages {
        parts.push(format!(
            "\n--- BEGIN EXCERPT ---\nOpinion ID: {}\nCase: {}\nAppeal No: {}\nRelease Date: {}\nPage: {}\n\n{}\n--- END EXCERPT ---\n",
            page.opinion_id,
            page.case_name,
            page.appeal_no,
            page.release_date.map(|d| d.to_string()).unwrap_or_default(),
            page.page_number,
            page.text,
        ));
    }
    parts.join("\n")
}

/// Token counts per context page, recorded in the context manifest.
pub fn context_token_counts(pages: &[PageHit]) -> Vec<usize> {
    pages.iter().map(|p| text::estimate_tokens(&p.text)).collect()
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for the OpenAI-compatible chat endpoint with a bounded worker pool.
pub struct LlmClient {
    config: GenerationConfig,
    http: reqwest::Client,
    pool: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(config: GenerationConfig) -> Self {
        let pool_size = config.worker_pool_size.max(1).min(num_cpus::get().max(1) * 4);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            pool: Arc::new(Semaphore::new(pool_size)),
        }
    }

    /// Whether the model endpoint is configured at all.
    pub fn available(&self) -> bool {
        self.config.openai_base_url.is_some() && self.config.openai_api_key.is_some()
    }

    /// The configuration snapshot recorded with each run.
    pub fn model_config_record(&self) -> ModelConfigRecord {
        ModelConfigRecord {
            model: self.config.chat_model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            system_prompt_version: SYSTEM_PROMPT_VERSION.to_string(),
        }
    }

    /// Generate a grounded answer for `question` against the excerpt context.
    ///
    /// Runs on the bounded worker pool; the request itself is limited to the
    /// configured request timeout, and the whole scheduled call to the outer
    /// deadline. Dropping the timed-out future cancels the in-flight request.
    pub async fn generate(&self, question: &str, context: &str) -> Result<String> {
        let (base_url, api_key) = match (&self.config.openai_base_url, &self.config.openai_api_key) {
            (Some(url), Some(key)) => (url.clone(), key.clone()),
            _ => {
                return Err(CoreError::LlmUnavailable {
                    details: "model endpoint not configured".to_string(),
                })
            }
        };

        let _permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::LlmUnavailable {
                details: "worker pool closed".to_string(),
            })?;

        let system = format!("{}\n\nAVAILABLE OPINION EXCERPTS:\n{}", SYSTEM_PROMPT, context);
        let request = ChatCompletionRequest {
            model: &self.config.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: question,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let outer = Duration::from_secs(self.config.outer_timeout_seconds);
        let call = async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&api_key)
                .json(&request)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(CoreError::LlmUnavailable {
                    details: format!("model endpoint returned {}", response.status()),
                });
            }
            let parsed: ChatCompletionResponse = response.json().await?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();
            if content.is_empty() {
                return Err(CoreError::LlmUnavailable {
                    details: "empty completion".to_string(),
                });
            }
            Ok(content)
        };

        match tokio::time::timeout(outer, call).await {
            Ok(result) => result.map_err(|e| match e {
                CoreError::Http(inner) if inner.is_timeout() => CoreError::LlmTimeout {
                    seconds: self.config.request_timeout_seconds,
                },
                other => other,
            }),
            Err(_) => Err(CoreError::LlmTimeout {
                seconds: self.config.outer_timeout_seconds,
            }),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// Embeddings client for the semantic recall fallback, sharing the model
/// endpoint configuration.
pub struct EmbeddingsClient {
    config: GenerationConfig,
    http: reqwest::Client,
}

impl EmbeddingsClient {
    pub fn new(config: GenerationConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    pub fn available(&self) -> bool {
        self.config.embeddings_enabled
            && self.config.openai_base_url.is_some()
            && self.config.openai_api_key.is_some()
    }
}

#[async_trait::async_trait]
impl crate::augment::EmbeddingProvider for EmbeddingsClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let (base_url, api_key) = match (&self.config.openai_base_url, &self.config.openai_api_key) {
            (Some(url), Some(key)) => (url.clone(), key.clone()),
            _ => {
                return Err(CoreError::LlmUnavailable {
                    details: "embeddings endpoint not configured".to_string(),
                })
            }
        };
        let url = format!("{}/embeddings", base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&api_key)
            .json(&EmbeddingRequest {
                model: &self.config.embedding_model,
                input: text,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CoreError::LlmUnavailable {
                details: format!("embeddings endpoint returned {}", response.status()),
            });
        }
        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| CoreError::LlmUnavailable {
                details: "empty embedding response".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(case_name: &str, page_number: u32, body: &str) -> PageHit {
        PageHit {
            opinion_id: Uuid::new_v4(),
            page_number,
            text: body.to_string(),
            case_name: case_name.to_string(),
            appeal_no: "13-298".to_string(),
            release_date: NaiveDate::from_ymd_opt(2014, 6, 19),
            pdf_url: String::new(),
            origin: "SCOTUS".to_string(),
            precedential: true,
            en_banc: false,
            is_rule_36: false,
            is_landmark: false,
            citation_count: 0,
            rank: 0.5,
            provenance: "baseline".to_string(),
        }
    }

    fn client_for(url: &str, outer_seconds: u64) -> LlmClient {
        LlmClient::new(GenerationConfig {
            openai_base_url: Some(url.to_string()),
            openai_api_key: Some("test-key".to_string()),
            request_timeout_seconds: outer_seconds,
            outer_timeout_seconds: outer_seconds,
            ..GenerationConfig::default()
        })
    }

    #[test]
    fn test_build_context_delimiters() {
        let pages = vec![page("Alice Corp. v. CLS Bank International", 5, "We hold that...")];
        let context = build_context(&pages);
        assert!(context.contains("--- BEGIN EXCERPT ---"));
        assert!(context.contains("--- END EXCERPT ---"));
        assert!(context.contains("Case: Alice Corp. v. CLS Bank International"));
        assert!(context.contains("Page: 5"));
        assert!(context.contains("We hold that..."));
    }

    #[test]
    fn test_unconfigured_client_is_unavailable() {
        let client = LlmClient::new(GenerationConfig::default());
        assert!(!client.available());
    }

    #[test]
    fn test_model_config_record_pins_version() {
        let client = LlmClient::new(GenerationConfig::default());
        let record = client.model_config_record();
        assert_eq!(record.system_prompt_version, "v2.0-quote-first");
        assert_eq!(record.model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_generate_parses_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "**Bottom Line**\nAnswer. <!--CITE:a|1|\"quote text\"-->"}}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 5);
        let answer = client.generate("question", "context").await.unwrap();
        assert!(answer.contains("Bottom Line"));
        assert!(answer.contains("<!--CITE:"));
    }

    #[tokio::test]
    async fn test_generate_maps_server_error_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 5);
        let err = client.generate("question", "context").await.unwrap_err();
        assert!(matches!(err, CoreError::LlmUnavailable { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_generate_outer_deadline_cancels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 1);
        let err = client.generate("question", "context").await.unwrap_err();
        assert!(matches!(err, CoreError::LlmTimeout { .. }), "got {:?}", err);
    }
}
