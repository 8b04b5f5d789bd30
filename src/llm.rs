//! LLM prompt programs: query expansion and memory-action planning.
//!
//! Both programs run against the Gemini `generateContent` API with
//! bounded exponential-backoff retry on transient provider failures.
//! The planning program is JSON-schema constrained and works on dense
//! integer aliases instead of raw UUIDs: existing memories are numbered
//! core-first starting at 0 for the duration of a single call, and
//! DELETE targets are rewritten back to real ids on the way out. A
//! hallucinated alias therefore cannot reach the stores.

use crate::errors::{AppError, Result};
use crate::metrics;
use crate::retry;
use crate::types::{MemoryAction, MemoryActionPlan, MemoryRecord, Message, Role};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Character budget for the deterministic expansion fallback.
const FALLBACK_CHAR_LIMIT: usize = 2_000;

/// The two prompt programs the pipeline needs.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Distill the dialogue into a keyword-heavy retrieval query, or
    /// the literal `SKIP` when nothing memorable is being asserted.
    async fn expand_query(&self, messages: &[Message]) -> Result<String>;

    /// Plan INSERT/DELETE actions per tier against the existing state.
    async fn plan_actions(
        &self,
        messages: &[Message],
        existing_core: &[MemoryRecord],
        existing_general: &[MemoryRecord],
    ) -> Result<MemoryActionPlan>;
}

// =============================================================================
// PROMPTS
// =============================================================================

const EXPAND_QUERY_PROMPT: &str = "\
You are the gatekeeper of a long-term memory system for an AI assistant.
Read the conversation and decide whether the user is asserting anything \
worth remembering: a new fact about themselves, a preference, a plan, a \
relationship, or a change to any of these.

If so, reply with a short keyword-heavy search query summarising the topic \
of the new information (e.g. \"current residence city\", \"dog name pet\"). \
The query is used to look up related existing memories, so favour nouns \
over full sentences.

If the turn is pure chit-chat, a greeting, or a task request that reveals \
nothing durable about the user, reply with exactly: SKIP

Reply with the query or SKIP only, no explanation.";

const PLAN_ACTIONS_PROMPT: &str = "\
You maintain the long-term memory of an AI assistant. You receive a \
conversation plus the user's existing memories in two tiers:

- CORE memories: identity-level facts (residence, profession, close \
  relationships). Small and authoritative.
- GENERAL memories: biographical details, preferences, habits, ongoing \
  situations.

Each existing memory is shown with a numeric id in brackets.

Work in three steps:

step 1 - reasoning: think out loud. Filter out anything not memorable \
(small talk, questions, task requests, transient emotions). Enumerate \
each durable fact the user asserted. For each, check whether it \
conflicts with or supersedes an existing memory in either tier.

step 2 - core_actions: actions against the CORE tier.
step 3 - general_actions: actions against the GENERAL tier.

Actions:
- {\"action_type\": \"INSERT\", \"payload\": \"<fact>\"} adds a new memory. \
  The payload must be a self-contained third-person statement \
  (\"User lives in Tokyo, Japan.\"), never a pronoun-dependent fragment.
- {\"action_type\": \"DELETE\", \"target_memory_id\": \"<bracketed id>\"} \
  removes an existing memory. Use it when a fact is contradicted or \
  obsolete. To update a memory, DELETE the old one and INSERT the \
  replacement.

Only reference ids that appear in the lists you were given. Leave \
unaffected memories alone. If nothing qualifies, return empty action \
lists.";

// =============================================================================
// ALIAS TABLE
// =============================================================================

/// Maps the dense integer aliases used inside one planning prompt back
/// to real record ids. Built immediately before the call and dropped
/// right after it; aliases never outlive the call that minted them.
struct AliasTable {
    by_alias: HashMap<String, Uuid>,
}

impl AliasTable {
    /// Assign aliases core-first, then general, starting at 0.
    fn build(core: &[MemoryRecord], general: &[MemoryRecord]) -> Self {
        let mut by_alias = HashMap::with_capacity(core.len() + general.len());
        for (n, record) in core.iter().chain(general.iter()).enumerate() {
            by_alias.insert(n.to_string(), record.id);
        }
        Self { by_alias }
    }

    fn resolve(&self, alias: &str) -> Option<Uuid> {
        self.by_alias.get(alias.trim().trim_matches(['[', ']'])).copied()
    }

    /// Render one tier's records as prompt lines (`[3] User likes coffee.`).
    /// `offset` is the alias of the tier's first record.
    fn render(records: &[MemoryRecord], offset: usize) -> String {
        let mut out = String::new();
        if records.is_empty() {
            out.push_str("(none)\n");
            return out;
        }
        for (n, record) in records.iter().enumerate() {
            let _ = writeln!(out, "[{}] {}", offset + n, record.text);
        }
        out
    }

    /// Rewrite DELETE targets from alias to real UUID, dropping actions
    /// whose alias does not resolve.
    fn rewrite(&self, actions: Vec<MemoryAction>, tier: &str) -> Vec<MemoryAction> {
        actions
            .into_iter()
            .filter_map(|action| match action {
                MemoryAction::Insert { payload } => Some(MemoryAction::Insert { payload }),
                MemoryAction::Delete { target_memory_id } => {
                    match self.resolve(&target_memory_id) {
                        Some(id) => Some(MemoryAction::Delete {
                            target_memory_id: id.to_string(),
                        }),
                        None => {
                            warn!(tier, alias = %target_memory_id, "dropping DELETE with unknown alias");
                            None
                        }
                    }
                }
            })
            .collect()
    }
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Planner output as it arrives from the provider. Action elements are
/// kept as raw JSON so one malformed action is discarded without
/// rejecting the whole plan.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    core_actions: Vec<Value>,
    #[serde(default)]
    general_actions: Vec<Value>,
}

/// Nullable-field shape the schema permits, validated into the tagged
/// [`MemoryAction`] at this boundary.
#[derive(Debug, Deserialize)]
struct RawAction {
    action_type: String,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    target_memory_id: Option<String>,
}

fn validate_action(value: Value, tier: &str) -> Option<MemoryAction> {
    let raw: RawAction = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(tier, %err, "discarding malformed action");
            return None;
        }
    };

    match raw.action_type.as_str() {
        "INSERT" => {
            if raw.target_memory_id.is_some() {
                warn!(tier, "INSERT carried a target_memory_id; ignoring the extra field");
            }
            match raw.payload {
                Some(payload) if !payload.trim().is_empty() => {
                    Some(MemoryAction::Insert { payload })
                }
                _ => {
                    warn!(tier, "discarding INSERT without payload");
                    None
                }
            }
        }
        "DELETE" => {
            if raw.payload.is_some() {
                warn!(tier, "DELETE carried a payload; ignoring the extra field");
            }
            match raw.target_memory_id {
                Some(target_memory_id) if !target_memory_id.trim().is_empty() => {
                    Some(MemoryAction::Delete { target_memory_id })
                }
                _ => {
                    warn!(tier, "discarding DELETE without target");
                    None
                }
            }
        }
        other => {
            warn!(tier, action_type = other, "discarding action with unknown type");
            None
        }
    }
}

/// Gemini response schema for the planning program.
fn plan_response_schema() -> Value {
    let action = json!({
        "type": "OBJECT",
        "properties": {
            "action_type": { "type": "STRING", "enum": ["INSERT", "DELETE"] },
            "payload": { "type": "STRING", "nullable": true },
            "target_memory_id": { "type": "STRING", "nullable": true }
        },
        "required": ["action_type"]
    });
    json!({
        "type": "OBJECT",
        "properties": {
            "reasoning": { "type": "STRING" },
            "core_actions": { "type": "ARRAY", "items": action },
            "general_actions": { "type": "ARRAY", "items": action }
        },
        "required": ["reasoning", "core_actions", "general_actions"]
    })
}

// =============================================================================
// GEMINI CLIENT
// =============================================================================

/// [`LanguageModel`] backed by the Gemini REST API.
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn format_contents(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": msg.content }] })
            })
            .collect()
    }

    /// One `generateContent` attempt. Transient provider failures map
    /// to [`AppError::Transient`] so the backoff loop retries them.
    async fn generate_once(
        &self,
        system: &str,
        contents: &[Value],
        schema: Option<Value>,
    ) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let mut generation_config = json!({ "temperature": 0.0 });
        if let Some(schema) = schema {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = schema;
        }

        let body = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": contents,
            "generationConfig": generation_config,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AppError::Timeout("llm call".to_string())
                } else {
                    AppError::Transport(format!("llm: {err}"))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AppError::Transient(format!("llm returned {status}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Permanent(format!(
                "llm returned {status}: {detail}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| AppError::Transport(format!("llm body: {err}")))?;

        let text = payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(AppError::Permanent("llm returned no candidates".to_string()));
        }
        Ok(text)
    }

    async fn generate_with_retry(
        &self,
        program: &'static str,
        system: &str,
        contents: Vec<Value>,
        schema: Option<Value>,
    ) -> Result<String> {
        let result = retry::with_backoff(program, || {
            self.generate_once(system, &contents, schema.clone())
        })
        .await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::LLM_REQUESTS_TOTAL
            .with_label_values(&[program, outcome])
            .inc();
        result
    }
}

/// Deterministic expansion fallback: the most recent messages,
/// chronological order preserved, capped around [`FALLBACK_CHAR_LIMIT`]
/// characters. Retrieval quality degrades but ingestion can proceed.
fn fallback_query(messages: &[Message]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut total = 0usize;
    for msg in messages.iter().rev() {
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }
        parts.insert(0, content);
        total += content.len();
        if total >= FALLBACK_CHAR_LIMIT {
            break;
        }
    }
    parts.join("\n")
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn expand_query(&self, messages: &[Message]) -> Result<String> {
        let contents = Self::format_contents(messages);
        match self
            .generate_with_retry("expand_query", EXPAND_QUERY_PROMPT, contents, None)
            .await
        {
            Ok(text) => Ok(text.trim().to_string()),
            Err(err) => {
                warn!("query expansion failed terminally, using fallback: {}", err.message());
                Ok(fallback_query(messages))
            }
        }
    }

    async fn plan_actions(
        &self,
        messages: &[Message],
        existing_core: &[MemoryRecord],
        existing_general: &[MemoryRecord],
    ) -> Result<MemoryActionPlan> {
        let aliases = AliasTable::build(existing_core, existing_general);

        let mut prompt = String::from("Existing CORE memories:\n");
        prompt.push_str(&AliasTable::render(existing_core, 0));
        prompt.push_str("\nExisting GENERAL memories:\n");
        prompt.push_str(&AliasTable::render(existing_general, existing_core.len()));
        prompt.push_str("\nConversation:\n");
        for msg in messages {
            let speaker = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            let _ = writeln!(prompt, "{speaker}: {}", msg.content);
        }

        let contents = vec![json!({ "role": "user", "parts": [{ "text": prompt }] })];
        let text = self
            .generate_with_retry(
                "plan_actions",
                PLAN_ACTIONS_PROMPT,
                contents,
                Some(plan_response_schema()),
            )
            .await?;

        let raw: RawPlan = serde_json::from_str(&text)
            .map_err(|err| AppError::Permanent(format!("plan did not match schema: {err}")))?;

        info!(reasoning = %raw.reasoning, "memory plan received");

        let core_actions: Vec<MemoryAction> = raw
            .core_actions
            .into_iter()
            .filter_map(|v| validate_action(v, "core"))
            .collect();
        let general_actions: Vec<MemoryAction> = raw
            .general_actions
            .into_iter()
            .filter_map(|v| validate_action(v, "general"))
            .collect();

        let plan = MemoryActionPlan {
            reasoning: raw.reasoning,
            core_actions: aliases.rewrite(core_actions, "core"),
            general_actions: aliases.rewrite(general_actions, "general"),
        };
        debug!(
            core = plan.core_actions.len(),
            general = plan.general_actions.len(),
            "plan validated"
        );
        Ok(plan)
    }
}
