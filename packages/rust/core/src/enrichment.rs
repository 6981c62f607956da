//! OpenRouter-backed transform service, name validator and bundle revalidator.
//!
//! One chat-completions client serves all three roles. Responses are cached
//! in storage keyed by prompt hash and model, so a resumed run does not pay
//! twice for a call it already made.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use larder_shared::{
    BundleDetector, ENRICHED_SCHEMA_VERSION, EnrichedRecord, LarderError, NameValidator,
    OpenRouterConfig, RawRecord, Result, TransformService, Verdict,
};
use larder_storage::Storage;

use crate::rules::parse_meta;

/// Sampling temperature for every task; output should be stable, not creative.
const TEMPERATURE: f32 = 0.1;

/// Steps shown to the validator and revalidator.
const STEP_PREVIEW: usize = 5;

static JSON_OBJECT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").ok());

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Task types, used as cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    TransformRecipe,
    ValidateName,
    RevalidateBundle,
}

impl TaskType {
    /// Storage key for the enrichment cache.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransformRecipe => "transform_recipe",
            Self::ValidateName => "validate_name",
            Self::RevalidateBundle => "revalidate_bundle",
        }
    }

    fn max_tokens(&self) -> u32 {
        match self {
            Self::TransformRecipe => 1500,
            Self::ValidateName => 100,
            Self::RevalidateBundle => 50,
        }
    }
}

/// Compute a prompt hash for cache keying.
fn prompt_hash(content: &str, task_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(task_type.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// JSON object the transform prompt asks for.
#[derive(Debug, Deserialize)]
struct TransformReply {
    #[serde(default)]
    food_name: Option<String>,
    #[serde(default)]
    recipe_source: Option<String>,
    #[serde(default)]
    steps: Vec<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Chat-completions client for the OpenRouter API.
pub struct OpenRouterClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    cache: Option<Arc<Storage>>,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
}

impl OpenRouterClient {
    pub fn new(config: &OpenRouterConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LarderError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.default_model.clone(),
            cache: None,
            cache_hits: AtomicUsize::new(0),
            cache_misses: AtomicUsize::new(0),
        })
    }

    /// Cache responses in `storage`.
    pub fn with_cache(mut self, storage: Arc<Storage>) -> Self {
        self.cache = Some(storage);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `(hits, misses)` since construction.
    pub fn cache_stats(&self) -> (usize, usize) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Ask the model, going through the cache. Only responses that `parse`
    /// accepts are cached, so a malformed reply is retried for real.
    async fn ask<T, P>(&self, task: TaskType, prompt: &str, parse: P) -> Result<T>
    where
        P: Fn(&str) -> Result<T> + Send + Sync,
        T: Send,
    {
        let hash = prompt_hash(prompt, task.as_str());

        if let Some(cache) = &self.cache {
            if let Some(cached) = cache
                .get_enrichment_cache(task.as_str(), &hash, &self.model)
                .await?
            {
                match parse(&cached) {
                    Ok(value) => {
                        self.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(e) => debug!(task = task.as_str(), error = %e, "ignoring unparseable cache entry"),
                }
            }
        }

        let text = self.complete(prompt, task.max_tokens()).await?;
        let value = parse(&text)?;
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .set_enrichment_cache(task.as_str(), &hash, &self.model, &text)
                .await
            {
                warn!(task = task.as_str(), error = %e, "failed to cache response");
            }
        }
        Ok(value)
    }

    /// One chat-completions round trip.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: TEMPERATURE,
            max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LarderError::Timeout(format!("openrouter: {e}"))
                } else {
                    LarderError::Network(format!("openrouter: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    LarderError::RateLimited(format!("openrouter: HTTP {status}"))
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    LarderError::config(format!("openrouter rejected the request: HTTP {status} {snippet}"))
                }
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                    LarderError::Timeout(format!("openrouter: HTTP {status}"))
                }
                _ => LarderError::Transform(format!("openrouter: HTTP {status} {snippet}")),
            });
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| LarderError::parse(format!("invalid completion response: {e}")))?;

        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| LarderError::parse("completion has no content"))
    }
}

// ---------------------------------------------------------------------------
// Prompts and reply parsing
// ---------------------------------------------------------------------------

fn transform_prompt(raw: &RawRecord) -> String {
    let ingredients: Vec<&str> = raw
        .ingredients
        .iter()
        .take(10)
        .map(|i| i.name.as_str())
        .collect();
    let steps: String = raw.steps.iter().map(|s| format!("- {s}\n")).collect();

    format!(
        "레시피 정제\n\n\
         [원본]\n제목: {title}\n재료: {ingredients}\n조리순서:\n{steps}\n\
         [규칙]\n\
         1. food_name: 핵심 음식명만 (수식어, 출처 제외)\n\
         2. recipe_source: 실존 유명인/셰프만, 없으면 null\n\
         3. steps: 모든 문장을 \"~요\"로 끝내고 괄호와 잡담은 빼기, 짧은 단계는 합치기\n\n\
         {{\"food_name\":\"\",\"recipe_source\":null,\"steps\":[]}}",
        title = raw.title,
        ingredients = ingredients.join(", "),
    )
}

fn validate_prompt(record: &EnrichedRecord) -> String {
    format!(
        "음식명 검증\n\n\
         [현재 음식명]\n{name}\n\n[레시피 내용]\n{steps}\n\n\
         [규칙]\n\
         1. 수식어 제거: 만능, 초간단, 초스피드, 간단, 쉬운, 꿀맛, 대박, 존맛, N분, N색, HACCP 등\n\
         2. 슬래시로 묶인 같은 종류는 대표명 하나로\n\
         3. 쉼표로 나열된 완전히 다른 요리들이면 DELETE\n\
         4. 레시피 내용과 맞지 않으면 내용 기준으로 수정\n\
         5. 빈 값, 모음집, N가지 등은 DELETE\n\n\
         [출력]\n정제된 음식명만 출력. 삭제 대상이면 DELETE만 출력.",
        name = record.canonical_name,
        steps = step_preview(record),
    )
}

fn revalidate_prompt(original_title: &str, record: &EnrichedRecord) -> String {
    format!(
        "레시피 검증\n\n\
         [원본 제목]\n{original_title}\n\n[현재 음식명]\n{name}\n\n[레시피 내용]\n{steps}\n\n\
         [판단 기준]\n\
         1. 원본이 여러 음식 모음인데 단일 음식으로 바뀜 → DELETE\n\
         \x20  예: \"가지요리 6종세트\" → \"돼지고기 가지볶음\"\n\
         \x20  예: \"반찬 3가지\" → \"어묵볶음\"\n\
         2. 원본이 단일 음식이고 수식어만 빠짐 → OK\n\
         \x20  예: \"백종원 김치찌개\" → \"김치찌개\"\n\
         3. 레시피 내용이 실제로 여러 음식을 다루면 → DELETE\n\n\
         [출력]\nOK 또는 DELETE만 출력",
        name = record.canonical_name,
        steps = step_preview(record),
    )
}

fn step_preview(record: &EnrichedRecord) -> String {
    record
        .steps
        .iter()
        .take(STEP_PREVIEW)
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_transform_reply(text: &str) -> Result<TransformReply> {
    let json = JSON_OBJECT
        .as_ref()
        .and_then(|re| re.find(text))
        .map(|m| m.as_str())
        .ok_or_else(|| LarderError::parse("no JSON object in transform reply"))?;
    let reply: TransformReply = serde_json::from_str(json)
        .map_err(|e| LarderError::parse(format!("invalid transform reply: {e}")))?;
    if reply.food_name.as_deref().is_none_or(|n| n.trim().is_empty()) {
        return Err(LarderError::parse("transform reply has no food_name"));
    }
    Ok(reply)
}

/// First line of the reply with quotes stripped.
fn first_line(text: &str) -> String {
    let cleaned = text.replace(['"', '\''], "");
    cleaned.lines().next().unwrap_or("").trim().to_string()
}

fn parse_verdict(text: &str, current: &str) -> Result<Verdict> {
    let name = first_line(text);
    if name.is_empty() {
        return Err(LarderError::parse("empty validation reply"));
    }
    if name.eq_ignore_ascii_case("DELETE") {
        return Ok(Verdict::Delete);
    }
    if name == current {
        Ok(Verdict::Keep)
    } else {
        Ok(Verdict::Modify(name))
    }
}

fn parse_bundle_answer(text: &str) -> Result<bool> {
    let answer = text.to_uppercase();
    if answer.contains("DELETE") {
        Ok(true)
    } else if answer.contains("OK") {
        Ok(false)
    } else {
        Err(LarderError::parse(format!("expected OK or DELETE, got '{}'", first_line(text))))
    }
}

fn normalize_source(source: Option<String>) -> Option<String> {
    source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !matches!(s.as_str(), "null" | "None"))
}

// ---------------------------------------------------------------------------
// Collaborator impls
// ---------------------------------------------------------------------------

#[async_trait]
impl TransformService for OpenRouterClient {
    #[instrument(skip_all, fields(id = %raw.id))]
    async fn transform(&self, raw: &RawRecord) -> Result<EnrichedRecord> {
        let prompt = transform_prompt(raw);
        let reply = self
            .ask(TaskType::TransformRecipe, &prompt, parse_transform_reply)
            .await?;

        let steps: Vec<String> = reply
            .steps
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(EnrichedRecord {
            schema_version: ENRICHED_SCHEMA_VERSION,
            id: raw.id.clone(),
            canonical_name: reply.food_name.unwrap_or_default().trim().to_string(),
            enriched_name: None,
            attribution: normalize_source(reply.recipe_source),
            ingredients: raw.ingredients.clone(),
            steps: if steps.is_empty() { raw.steps.clone() } else { steps },
            meta: parse_meta(raw.description.as_deref().unwrap_or_default()),
            categories: raw.categories.clone(),
            asset_url: raw.asset_urls.first().cloned(),
            source_url: raw.url.clone(),
            enriched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl NameValidator for OpenRouterClient {
    #[instrument(skip_all, fields(id = %record.id))]
    async fn validate(&self, record: &EnrichedRecord) -> Result<Verdict> {
        let prompt = validate_prompt(record);
        let current = record.canonical_name.as_str();
        self.ask(TaskType::ValidateName, &prompt, |text| parse_verdict(text, current))
            .await
    }
}

#[async_trait]
impl BundleDetector for OpenRouterClient {
    #[instrument(skip_all, fields(id = %record.id))]
    async fn is_bundle(&self, original_title: &str, record: &EnrichedRecord) -> Result<bool> {
        let prompt = revalidate_prompt(original_title, record);
        self.ask(TaskType::RevalidateBundle, &prompt, parse_bundle_answer)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_shared::{Ingredient, RAW_SCHEMA_VERSION, RecipeMeta};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> OpenRouterConfig {
        OpenRouterConfig {
            base_url: base_url.to_string(),
            default_model: "test/model".into(),
            ..Default::default()
        }
    }

    fn raw() -> RawRecord {
        RawRecord {
            schema_version: RAW_SCHEMA_VERSION,
            id: "6912345".into(),
            url: "https://www.10000recipe.com/recipe/6912345".into(),
            title: "백종원의 초간단 김치찌개".into(),
            description: Some("2인분 30분 이내 초급".into()),
            ingredients: vec![Ingredient {
                name: "김치".into(),
                amount: "1/4포기".into(),
            }],
            steps: vec!["김치를 썬다.".into()],
            asset_urls: vec!["https://img.example.com/main.jpg".into()],
            categories: Default::default(),
            content_hash: "abc".into(),
            fetched_at: Utc::now(),
        }
    }

    fn enriched(name: &str) -> EnrichedRecord {
        EnrichedRecord {
            schema_version: ENRICHED_SCHEMA_VERSION,
            id: "1".into(),
            canonical_name: name.into(),
            enriched_name: None,
            attribution: None,
            ingredients: Vec::new(),
            steps: vec!["끓여요".into()],
            meta: RecipeMeta::default(),
            categories: Default::default(),
            asset_url: None,
            source_url: String::new(),
            enriched_at: Utc::now(),
        }
    }

    fn completion(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
    }

    async fn mount(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> OpenRouterClient {
        OpenRouterClient::new(&config(&server.uri()), "sk-test".into()).unwrap()
    }

    #[test]
    fn prompt_hash_depends_on_task() {
        let a = prompt_hash("same", TaskType::ValidateName.as_str());
        let b = prompt_hash("same", TaskType::RevalidateBundle.as_str());
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_verdict("DELETE", "x").unwrap(), Verdict::Delete);
        assert_eq!(parse_verdict("\"김치찌개\"\n설명", "김치찌개").unwrap(), Verdict::Keep);
        assert_eq!(
            parse_verdict("김치찌개", "초간단 김치찌개").unwrap(),
            Verdict::Modify("김치찌개".into())
        );
        assert!(parse_verdict("  ", "x").is_err());

        assert!(parse_bundle_answer("delete").unwrap());
        assert!(!parse_bundle_answer("OK").unwrap());
        assert!(parse_bundle_answer("모르겠어요").is_err());

        assert_eq!(normalize_source(Some("null".into())), None);
        assert_eq!(normalize_source(Some("백종원".into())).as_deref(), Some("백종원"));
    }

    #[tokio::test]
    async fn transform_builds_enriched_record() {
        let server = MockServer::start().await;
        mount(
            &server,
            completion(
                "```json\n{\"food_name\":\"김치찌개\",\"recipe_source\":\"백종원\",\"steps\":[\"김치를 썰어요.\"]}\n```",
            ),
        )
        .await;

        let record = client(&server).transform(&raw()).await.unwrap();
        assert_eq!(record.canonical_name, "김치찌개");
        assert_eq!(record.attribution.as_deref(), Some("백종원"));
        assert_eq!(record.steps, vec!["김치를 썰어요.".to_string()]);
        assert_eq!(record.meta.servings.as_deref(), Some("2인분"));
        assert_eq!(record.meta.difficulty.as_deref(), Some("초급"));
        assert_eq!(record.asset_url.as_deref(), Some("https://img.example.com/main.jpg"));
        assert_eq!(record.ingredients.len(), 1);
    }

    #[tokio::test]
    async fn empty_steps_fall_back_to_source_steps() {
        let server = MockServer::start().await;
        mount(
            &server,
            completion(r#"{"food_name":"김치찌개","recipe_source":null,"steps":[]}"#),
        )
        .await;

        let record = client(&server).transform(&raw()).await.unwrap();
        assert_eq!(record.steps, raw().steps);
        assert_eq!(record.attribution, None);
    }

    #[tokio::test]
    async fn status_codes_map_to_error_classes() {
        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(429)).await;
        let err = client(&server).transform(&raw()).await.unwrap_err();
        assert!(matches!(err, LarderError::RateLimited(_)));

        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(401)).await;
        let err = client(&server).transform(&raw()).await.unwrap_err();
        assert!(matches!(err, LarderError::Config { .. }));

        let server = MockServer::start().await;
        mount(&server, ResponseTemplate::new(503)).await;
        let err = client(&server).transform(&raw()).await.unwrap_err();
        assert!(matches!(err, LarderError::Transform(_)));
    }

    #[tokio::test]
    async fn malformed_reply_is_a_parse_error() {
        let server = MockServer::start().await;
        mount(&server, completion("죄송합니다, 이해하지 못했어요")).await;
        let err = client(&server).transform(&raw()).await.unwrap_err();
        assert!(matches!(err, LarderError::Parse { .. }));
    }

    #[tokio::test]
    async fn validator_and_revalidator() {
        let server = MockServer::start().await;
        mount(&server, completion("DELETE")).await;
        let c = client(&server);
        assert_eq!(c.validate(&enriched("반찬 3가지")).await.unwrap(), Verdict::Delete);
        assert!(c.is_bundle("반찬 3가지", &enriched("어묵볶음")).await.unwrap());
    }

    #[tokio::test]
    async fn cached_response_skips_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(completion("김치찌개"))
            .expect(1)
            .mount(&server)
            .await;

        let db = std::env::temp_dir().join(format!("larder_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&db).await.unwrap());
        let c = client(&server).with_cache(storage);

        let record = enriched("초간단 김치찌개");
        let first = c.validate(&record).await.unwrap();
        let second = c.validate(&record).await.unwrap();
        assert_eq!(first, Verdict::Modify("김치찌개".into()));
        assert_eq!(first, second);
        assert_eq!(c.cache_stats(), (1, 1));

        let _ = std::fs::remove_file(&db);
    }
}
