use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parlay_contracts::{MatchNotice, MessageRecord, TranscriptItem};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::now_rfc3339;
use crate::store::StoreBackend;

const CREATE_MATCH_MUTATION: &str = "
mutation CreateMatch($userId: ID!, $matchedUserId: ID!, $chatroomId: ID!) {
    createMatch(userId: $userId, matchedUserId: $matchedUserId, chatroomId: $chatroomId) {
        userId, matchedUserId, chatroomId
    }
}
";

const SEND_MESSAGE_MUTATION: &str = "
mutation SendMessage($chatroomId: ID!, $text: String!, $senderId: String!) {
    sendMessage(chatroomId: $chatroomId, text: $text, senderId: $senderId) {
        id, chatroomId, text, senderId, createdAt
    }
}
";

/// Realtime notification channel. Match notices and relayed messages go out
/// as GraphQL-shaped mutations; the channel itself persists relayed messages
/// and hands back the stored record.
pub enum NotifierBackend {
    Http(HttpNotifier),
    Recording(RecordingNotifier),
}

pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

/// In-process channel for tests: records every call and, when given a store
/// handle, mirrors the production channel by persisting relayed messages.
#[derive(Clone)]
pub struct RecordingNotifier {
    pub matches: Arc<Mutex<Vec<MatchNotice>>>,
    pub relayed: Arc<Mutex<Vec<MessageRecord>>>,
    store: Option<Arc<Mutex<StoreBackend>>>,
    fail_relay: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn new(store: Option<Arc<Mutex<StoreBackend>>>) -> Self {
        Self {
            matches: Arc::new(Mutex::new(Vec::new())),
            relayed: Arc::new(Mutex::new(Vec::new())),
            store,
            fail_relay: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_fail_relay(&self, fail: bool) {
        self.fail_relay.store(fail, Ordering::SeqCst);
    }
}

impl NotifierBackend {
    pub fn http(endpoint: &str, api_key: &str) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self::Http(HttpNotifier {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }))
    }

    pub async fn notify_match(&self, notice: &MatchNotice) -> Result<(), String> {
        match self {
            NotifierBackend::Http(http) => {
                let payload = http
                    .post_mutation(
                        CREATE_MATCH_MUTATION,
                        json!({
                            "userId": notice.user_id,
                            "matchedUserId": notice.matched_user_id,
                            "chatroomId": notice.chatroom_id,
                        }),
                    )
                    .await?;
                graphql_errors(&payload)?;
                Ok(())
            }
            NotifierBackend::Recording(recording) => {
                recording.matches.lock().await.push(notice.clone());
                Ok(())
            }
        }
    }

    pub async fn relay_message(
        &self,
        chatroom_id: &str,
        text: &str,
        sender_id: &str,
    ) -> Result<MessageRecord, String> {
        match self {
            NotifierBackend::Http(http) => {
                let payload = http
                    .post_mutation(
                        SEND_MESSAGE_MUTATION,
                        json!({
                            "chatroomId": chatroom_id,
                            "text": text,
                            "senderId": sender_id,
                        }),
                    )
                    .await?;
                graphql_errors(&payload)?;
                let message = payload
                    .get("data")
                    .and_then(|d| d.get("sendMessage"))
                    .cloned()
                    .ok_or_else(|| "relay response missing data.sendMessage".to_string())?;
                serde_json::from_value(message).map_err(|e| e.to_string())
            }
            NotifierBackend::Recording(recording) => {
                if recording.fail_relay.load(Ordering::SeqCst) {
                    return Err("relay channel unavailable".to_string());
                }
                let message = MessageRecord {
                    id: Uuid::new_v4().to_string(),
                    chatroom_id: chatroom_id.to_string(),
                    sender_id: sender_id.to_string(),
                    text: text.to_string(),
                    created_at: now_rfc3339(),
                };
                if let Some(store) = &recording.store {
                    store.lock().await.append_message(&message)?;
                }
                recording.relayed.lock().await.push(message.clone());
                Ok(message)
            }
        }
    }
}

impl HttpNotifier {
    async fn post_mutation(&self, query: &str, variables: Value) -> Result<Value, String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("realtime endpoint returned {}", response.status()));
        }
        response.json::<Value>().await.map_err(|e| e.to_string())
    }
}

fn graphql_errors(payload: &Value) -> Result<(), String> {
    match payload.get("errors").and_then(Value::as_array) {
        Some(errors) if !errors.is_empty() => {
            Err(format!("realtime endpoint reported errors: {errors:?}"))
        }
        _ => Ok(()),
    }
}

/// Response generator. The HTTP variant talks to a responses-style API; the
/// scripted variant replays canned outputs for tests.
pub enum GeneratorBackend {
    Http(HttpGenerator),
    Scripted(ScriptedGenerator),
}

pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Clone)]
pub struct ScriptedGenerator {
    responses: Arc<Mutex<VecDeque<Result<String, String>>>>,
    pub calls: Arc<Mutex<Vec<Vec<TranscriptItem>>>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl GeneratorBackend {
    pub fn http(endpoint: &str, model: &str, timeout_ms: u64) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self::Http(HttpGenerator {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
        }))
    }

    /// Returns the raw generated text; it may be empty or the silence token,
    /// which the caller treats as a deliberate skip.
    pub async fn generate(
        &self,
        credential: &str,
        instructions: &str,
        transcript: &[TranscriptItem],
    ) -> Result<String, String> {
        match self {
            GeneratorBackend::Http(http) => {
                let response = http
                    .client
                    .post(&http.endpoint)
                    .bearer_auth(credential)
                    .json(&json!({
                        "model": http.model,
                        "input": transcript,
                        "instructions": instructions,
                        "temperature": 1.0,
                    }))
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                if !response.status().is_success() {
                    return Err(format!("generator returned {}", response.status()));
                }
                let payload = response.json::<Value>().await.map_err(|e| e.to_string())?;
                Ok(parlay_kernel::extract_output_text(&payload))
            }
            GeneratorBackend::Scripted(scripted) => {
                scripted.calls.lock().await.push(transcript.to_vec());
                scripted
                    .responses
                    .lock()
                    .await
                    .pop_front()
                    .unwrap_or_else(|| Err("generator script exhausted".to_string()))
            }
        }
    }
}

enum TextSource {
    EnvVar(String),
    File(String),
}

/// TTL-cached text fetcher for the generator credential and instruction
/// payload.
pub struct CachedTextProvider {
    source: TextSource,
    ttl: Duration,
    cached: Mutex<Option<(String, Instant)>>,
}

impl CachedTextProvider {
    pub fn env(var_name: &str, ttl: Duration) -> Self {
        Self {
            source: TextSource::EnvVar(var_name.to_string()),
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn file(path: &str, ttl: Duration) -> Self {
        Self {
            source: TextSource::File(path.to_string()),
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<String, String> {
        {
            let cached = self.cached.lock().await;
            if let Some((value, expires_at)) = cached.as_ref() {
                if *expires_at > Instant::now() {
                    return Ok(value.clone());
                }
            }
        }

        let value = match &self.source {
            TextSource::EnvVar(name) => std::env::var(name)
                .map_err(|_| format!("environment variable {name} is not set"))?,
            TextSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("read {path} failed: {e}"))?,
        };

        let mut cached = self.cached.lock().await;
        *cached = Some((value.clone(), Instant::now() + self.ttl));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphql_errors_rejects_non_empty_error_array() {
        let payload = json!({"errors": [{"message": "boom"}]});
        assert!(graphql_errors(&payload).is_err());
        assert!(graphql_errors(&json!({"data": {}})).is_ok());
        assert!(graphql_errors(&json!({"errors": []})).is_ok());
    }

    #[tokio::test]
    async fn scripted_generator_replays_in_order() {
        let generator = GeneratorBackend::Scripted(ScriptedGenerator::new(vec![
            Ok("first".to_string()),
            Err("down".to_string()),
        ]));
        assert_eq!(
            generator.generate("key", "inst", &[]).await,
            Ok("first".to_string())
        );
        assert!(generator.generate("key", "inst", &[]).await.is_err());
        assert!(generator.generate("key", "inst", &[]).await.is_err());
    }

    #[tokio::test]
    async fn cached_provider_reads_file_and_caches() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("parlay-instructions-{nanos}.txt"));
        std::fs::write(&path, "be brief").expect("write instructions");

        let provider =
            CachedTextProvider::file(&path.to_string_lossy(), Duration::from_secs(60));
        assert_eq!(provider.get().await.unwrap(), "be brief");

        // A fresh read within the TTL serves the cached value.
        std::fs::write(&path, "changed").expect("rewrite instructions");
        assert_eq!(provider.get().await.unwrap(), "be brief");
    }
}
