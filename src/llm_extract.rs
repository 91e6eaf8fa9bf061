// src/llm_extract.rs

use crate::config::{Config, EndpointConfig, ExtractionBackend};
use crate::receipt::{
    ExtractedReceipt, MimeType, RawReceiptInput, SummaryFilter, parse_model_response,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use time::{Date, OffsetDateTime};
use tracing::{Instrument, debug, info, warn};

/// Instructions sent alongside the receipt image.
const EXTRACTION_PROMPT: &str = r#"Extract product items from this receipt/invoice. Return JSON only.

RULES:
- Extract ONLY individual product lines (name, quantity, unit, unit price, line total)
- SKIP: totals, subtotals, tax lines, payment methods, headers, footers
- SKIP category subtotal lines such as Non-food, Käyttötavara, Elintarvikkeet
- SKIP lines with: yhteensä, summa, ALV, vero, total, subtotal
- Supplier name from the top of the receipt, date as YYYY-MM-DD, prices as numbers

If the receipt is unreadable return exactly: {"error": "Could not read receipt"}"#;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no receipt data supplied")]
    MissingInput,
    /// The service could not be reached or refused the call. Worth retrying.
    #[error("extraction service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The call succeeded but produced nothing usable. Ask for a new photo.
    #[error("could not read receipt: {0}")]
    Unreadable(String),
}

impl ExtractionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractionError::ServiceUnavailable(_))
    }
}

/// Target shape of the model's answer.
pub fn receipt_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "supplier_name": { "type": "string" },
            "date": { "type": "string" },
            "order_number": { "type": "string", "nullable": true },
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "quantity": { "type": "number" },
                        "unit": { "type": "string" },
                        "pricePerUnit": { "type": "number" },
                        "totalPrice": { "type": "number" }
                    },
                    "required": ["name", "quantity", "unit", "pricePerUnit", "totalPrice"]
                }
            },
            "totalValue": { "type": "number" }
        },
        "required": ["supplier_name", "date", "items", "totalValue"]
    })
}

/// Everything one structured-extraction call needs.
#[derive(Debug)]
pub struct ExtractionRequest<'a> {
    pub data: &'a str,
    pub mime: MimeType,
    pub schema: &'a Value,
    pub prompt: &'a str,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl ExtractionRequest<'_> {
    fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

/// A vision model that answers with JSON text.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the model's raw answer text.
    async fn generate(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError>;
}

// ---------------------------------------------------------------------------
// Gemini generateContent
// ---------------------------------------------------------------------------

pub struct GeminiService {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

impl GeminiResponse {
    fn answer_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
            .filter(|t| !t.trim().is_empty())
    }
}

fn gemini_body(request: &ExtractionRequest<'_>) -> Value {
    json!({
        "contents": [{
            "parts": [
                { "inline_data": { "mime_type": request.mime.as_str(), "data": request.data } },
                { "text": request.prompt }
            ]
        }],
        "generationConfig": {
            "temperature": request.temperature,
            "maxOutputTokens": request.max_output_tokens,
            "responseMimeType": "application/json",
            "responseSchema": request.schema
        }
    })
}

#[async_trait]
impl ExtractionService for GeminiService {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let response = client_send(
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&gemini_body(request)),
        )
        .await?;

        let body: GeminiResponse = response.json().await.map_err(|e| {
            ExtractionError::ServiceUnavailable(format!("malformed Gemini response: {e}"))
        })?;

        body.answer_text()
            .ok_or_else(|| ExtractionError::Unreadable("empty response from model".to_string()))
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions (remote APIs, Ollama)
// ---------------------------------------------------------------------------

pub struct ChatCompletionsService {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    /// Non-strict: strict mode rejects the `nullable` keyword Gemini needs.
    strict: bool,
    schema: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatAnswer,
}

#[derive(Debug, Deserialize)]
struct ChatAnswer {
    content: Option<String>,
}

fn chat_request(model: &str, request: &ExtractionRequest<'_>) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: vec![ContentPart::Text {
                    text: request.prompt.to_string(),
                }],
            },
            ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: "Extract the receipt data from this document.".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: request.data_uri(),
                        },
                    },
                ],
            },
        ],
        temperature: request.temperature,
        max_tokens: request.max_output_tokens,
        response_format: ResponseFormat {
            kind: "json_schema".to_string(),
            json_schema: JsonSchemaFormat {
                name: "receipt".to_string(),
                strict: false,
                schema: request.schema.clone(),
            },
        },
    }
}

#[async_trait]
impl ExtractionService for ChatCompletionsService {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = client_send(
            self.client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&chat_request(&self.model, request)),
        )
        .await?;

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            ExtractionError::ServiceUnavailable(format!("malformed chat response: {e}"))
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ExtractionError::Unreadable("empty response from model".to_string()))
    }
}

/// Send and map transport failures and non-2xx answers to
/// `ServiceUnavailable`.
async fn client_send(
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ExtractionError> {
    let response = builder
        .send()
        .await
        .map_err(|e| ExtractionError::ServiceUnavailable(format!("request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ExtractionError::ServiceUnavailable(format!(
            "API error {status}: {body}"
        )));
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Backend resolution
// ---------------------------------------------------------------------------

fn api_key(backend: ExtractionBackend, endpoint: &EndpointConfig) -> Result<String, ExtractionError> {
    let Some(var) = endpoint.api_key_env.as_deref() else {
        return Err(ExtractionError::ServiceUnavailable(format!(
            "no api_key_env configured for {backend:?} backend"
        )));
    };
    std::env::var(var)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            ExtractionError::ServiceUnavailable(format!(
                "{var} env var required for {backend:?} backend"
            ))
        })
}

/// Check if the Ollama server is reachable.
async fn check_ollama_health(client: &Client, base_url: &str) -> bool {
    // Ollama's health endpoint is at the root (not under /v1)
    let health_url = base_url.trim_end_matches('/').trim_end_matches("/v1");

    match client
        .get(health_url)
        .timeout(Duration::from_secs(3))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            info!("Ollama server is reachable");
            true
        }
        Ok(resp) => {
            warn!(status = %resp.status(), "Ollama server returned non-OK status");
            false
        }
        Err(e) => {
            warn!(error = %e, "Ollama server not reachable");
            false
        }
    }
}

/// Build the service selected in the config.
pub async fn connect(config: &Config) -> Result<Box<dyn ExtractionService>, ExtractionError> {
    let backend = config.extraction.backend;
    let endpoint = config.endpoint();
    let client = Client::builder()
        .timeout(Duration::from_secs(config.extraction.timeout_secs))
        .build()
        .map_err(|e| ExtractionError::ServiceUnavailable(format!("http client: {e}")))?;

    info!(
        backend = ?backend,
        url = %endpoint.base_url,
        model = %endpoint.model,
        "Using extraction backend"
    );

    let base_url = endpoint.base_url.trim_end_matches('/').to_string();
    let model = endpoint.model.clone();

    Ok(match backend {
        ExtractionBackend::Gemini => Box::new(GeminiService {
            api_key: api_key(backend, endpoint)?,
            client,
            base_url,
            model,
        }),
        ExtractionBackend::Remote => Box::new(ChatCompletionsService {
            api_key: api_key(backend, endpoint)?,
            client,
            base_url,
            model,
        }),
        ExtractionBackend::Ollama => {
            if !check_ollama_health(&client, &base_url).await {
                return Err(ExtractionError::ServiceUnavailable(format!(
                    "Ollama is not running at {base_url}. Start it with: ollama serve"
                )));
            }
            Box::new(ChatCompletionsService {
                // required by the API shape, ignored by Ollama
                api_key: "ollama".to_string(),
                client,
                base_url,
                model,
            })
        }
    })
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Receipt payload in, normalized receipt out. Holds no mutable state, so
/// one extractor can serve concurrent calls.
pub struct ReceiptExtractor {
    service: Box<dyn ExtractionService>,
    filter: SummaryFilter,
    schema: Value,
    max_output_tokens: u32,
}

impl ReceiptExtractor {
    pub fn new(service: Box<dyn ExtractionService>) -> Self {
        Self {
            service,
            filter: SummaryFilter::default(),
            schema: receipt_schema(),
            max_output_tokens: 4096,
        }
    }

    pub fn with_filter(mut self, filter: SummaryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub async fn extract(&self, input: &RawReceiptInput) -> Result<ExtractedReceipt, ExtractionError> {
        self.extract_on(input, OffsetDateTime::now_utc().date()).await
    }

    /// As [`ReceiptExtractor::extract`], with `today` used when the receipt
    /// carries no readable date.
    pub async fn extract_on(
        &self,
        input: &RawReceiptInput,
        today: Date,
    ) -> Result<ExtractedReceipt, ExtractionError> {
        if input.is_empty() {
            return Err(ExtractionError::MissingInput);
        }

        let span = tracing::info_span!(
            "extract_receipt",
            mime = %input.mime(),
            model = %self.service.name(),
            bytes = input.data().len()
        );

        async {
            let request = ExtractionRequest {
                data: input.data(),
                mime: input.mime(),
                schema: &self.schema,
                prompt: EXTRACTION_PROMPT,
                temperature: 0.0,
                max_output_tokens: self.max_output_tokens,
            };

            let text = self.service.generate(&request).await.inspect_err(|e| {
                warn!(error = %e, "Extraction call failed");
            })?;
            debug!(raw = %text, "Raw model response");

            let receipt = parse_model_response(&text, &self.filter, today)?;
            info!(
                supplier = %receipt.supplier_name,
                date = %receipt.date,
                order_number = ?receipt.order_number,
                items = receipt.items.len(),
                total_value = receipt.total_value,
                "Receipt extracted"
            );
            Ok::<_, ExtractionError>(receipt)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::ItemStatus;
    use std::sync::Mutex;
    use time::macros::date;

    /// Canned answer plus a record of what was asked.
    struct FakeService {
        reply: Result<String, ExtractionError>,
        seen: Mutex<Vec<(String, MimeType, f32, Value)>>,
    }

    impl FakeService {
        fn replying(reply: Result<&str, ExtractionError>) -> Self {
            Self {
                reply: reply.map(str::to_string),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExtractionService for std::sync::Arc<FakeService> {
        fn name(&self) -> &str {
            "fake"
        }

        async fn generate(&self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
            self.seen.lock().unwrap().push((
                request.data.to_string(),
                request.mime,
                request.temperature,
                request.schema.clone(),
            ));
            self.reply.clone()
        }
    }

    fn extractor(fake: &std::sync::Arc<FakeService>) -> ReceiptExtractor {
        ReceiptExtractor::new(Box::new(fake.clone()))
    }

    const METRO_REPLY: &str = r#"{"supplier_name":"Metrotukku","date":"2025-03-14","order_number":null,"items":[
        {"name":"Non-food","quantity":1,"unit":"kpl","pricePerUnit":417.60,"totalPrice":417.60},
        {"name":"Muovikassi 15L","quantity":2,"unit":"kpl","pricePerUnit":0.35,"totalPrice":0.70}
    ],"totalValue":418.30}"#;

    #[tokio::test]
    async fn test_extract_filters_subtotal() {
        let fake = std::sync::Arc::new(FakeService::replying(Ok(METRO_REPLY)));
        let input = RawReceiptInput::from_encoded("data:image/png;base64,iVBORw0KGgo=");

        let receipt = extractor(&fake)
            .extract_on(&input, date!(2025 - 06 - 01))
            .await
            .unwrap();

        assert_eq!(receipt.supplier_name, "Metrotukku");
        assert_eq!(receipt.date, date!(2025 - 03 - 14));
        assert_eq!(receipt.items.len(), 1);
        assert_eq!(receipt.items[0].name, "Muovikassi 15L");
        assert_eq!(receipt.items[0].status, ItemStatus::Pending);

        let seen = fake.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (data, mime, temperature, schema) = &seen[0];
        assert_eq!(data, "iVBORw0KGgo=");
        assert_eq!(*mime, MimeType::Png);
        assert_eq!(*temperature, 0.0);
        assert_eq!(
            schema["required"],
            json!(["supplier_name", "date", "items", "totalValue"])
        );
    }

    #[tokio::test]
    async fn test_extract_error_sentinel() {
        let fake = std::sync::Arc::new(FakeService::replying(Ok(
            r#"{"error":"Could not read receipt"}"#,
        )));
        let input = RawReceiptInput::from_encoded("/9j/4AAQSkZJRg");

        let err = extractor(&fake).extract(&input).await.unwrap_err();
        assert_eq!(
            err,
            ExtractionError::Unreadable("Could not read receipt".to_string())
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_extract_missing_input_skips_service() {
        let fake = std::sync::Arc::new(FakeService::replying(Ok(METRO_REPLY)));
        let input = RawReceiptInput::from_encoded("data:image/jpeg;base64,");

        let err = extractor(&fake).extract(&input).await.unwrap_err();
        assert_eq!(err, ExtractionError::MissingInput);
        assert!(fake.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extract_service_failure_is_transient() {
        let fake = std::sync::Arc::new(FakeService::replying(Err(
            ExtractionError::ServiceUnavailable("API error 503".to_string()),
        )));
        let input = RawReceiptInput::from_bytes(b"%PDF-1.7", None);

        let err = extractor(&fake).extract(&input).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fake.seen.lock().unwrap()[0].1, MimeType::Pdf);
    }

    #[tokio::test]
    async fn test_custom_filter_is_used() {
        let fake = std::sync::Arc::new(FakeService::replying(Ok(
            r#"{"supplier_name":"Alko","date":"2025-03-14","items":[
                {"name":"Pantti 0,10","quantity":12,"unit":"kpl","pricePerUnit":0.1,"totalPrice":1.2},
                {"name":"Kivennäisvesi","quantity":12,"unit":"kpl","pricePerUnit":0.9,"totalPrice":10.8}
            ],"totalValue":12.0}"#,
        )));
        let input = RawReceiptInput::from_encoded("/9j/4AAQ");
        let filter =
            SummaryFilter::default().with_rule(crate::receipt::MatchRule::prefix("pantti"));

        let receipt = extractor(&fake).with_filter(filter).extract(&input).await.unwrap();
        assert_eq!(receipt.items.len(), 1);
        assert_eq!(receipt.items[0].id, "item-1");
        assert_eq!(receipt.items[0].name, "Kivennäisvesi");
    }

    #[test]
    fn test_gemini_answer_text() {
        let body: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "{\"items\":[]}" }] } }]
        }))
        .unwrap();
        assert_eq!(body.answer_text().as_deref(), Some("{\"items\":[]}"));

        let empty: GeminiResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert_eq!(empty.answer_text(), None);
    }

    #[test]
    fn test_gemini_body_requests_schema_json() {
        let schema = receipt_schema();
        let request = ExtractionRequest {
            data: "iVBOR",
            mime: MimeType::Png,
            schema: &schema,
            prompt: EXTRACTION_PROMPT,
            temperature: 0.0,
            max_output_tokens: 4096,
        };
        let body = gemini_body(&request);
        assert_eq!(body["contents"][0]["parts"][0]["inline_data"]["mime_type"], "image/png");
        assert_eq!(body["generationConfig"]["temperature"], 0.0);
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseSchema"], schema);
    }

    #[test]
    fn test_chat_request_shape() {
        let schema = receipt_schema();
        let request = ExtractionRequest {
            data: "/9j/4AAQ",
            mime: MimeType::Jpeg,
            schema: &schema,
            prompt: EXTRACTION_PROMPT,
            temperature: 0.0,
            max_output_tokens: 1024,
        };
        let body = serde_json::to_value(chat_request("gpt-4o-mini", &request)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "receipt");
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
        assert_eq!(body["messages"][0]["content"][0]["text"], EXTRACTION_PROMPT);
        let image = &body["messages"][1]["content"][1];
        assert_eq!(image["type"], "image_url");
        assert_eq!(image["image_url"]["url"], "data:image/jpeg;base64,/9j/4AAQ");
    }

    #[tokio::test]
    async fn test_connect_without_key_is_unavailable() {
        let mut config = Config::default();
        config.extraction.gemini.api_key_env =
            Some("RECEIPT_RECONCILE_TEST_UNSET_KEY".to_string());

        let err = connect(&config).await.err().unwrap();
        assert!(err.is_transient());
        assert!(err.to_string().contains("RECEIPT_RECONCILE_TEST_UNSET_KEY"));
    }
}
