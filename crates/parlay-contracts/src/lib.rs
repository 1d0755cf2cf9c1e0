use serde::{Deserialize, Serialize};

/// Participant ids carrying this prefix belong to the AI seat of a chatroom.
pub const AI_SENDER_PREFIX: &str = "ai-";

pub fn is_ai_sender(sender_id: &str) -> bool {
    sender_id.starts_with(AI_SENDER_PREFIX)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct WaitingEntrant {
    pub id: String,
    pub joined_at: String,
}

/// Exactly one participant is the AI seat, the other two are human entrant
/// ids. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct Chatroom {
    pub id: String,
    pub participants: Vec<String>,
    pub created_at: String,
}

impl Chatroom {
    pub fn ai_participant(&self) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| is_ai_sender(p))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct MessageRecord {
    pub id: String,
    pub chatroom_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One line of the transcript handed to the response generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TranscriptItem {
    pub role: Role,
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct MatchNotice {
    pub user_id: String,
    pub matched_user_id: String,
    pub chatroom_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitingState {
    Waiting,
    Matched,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WaitingStatusResponse {
    pub user_id: String,
    pub status: WaitingState,
    pub chatroom_id: Option<String>,
    pub wait_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub chatroom_id: String,
    pub text: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct LeaveWaitingRoomRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct SurveySubmissionRequest {
    pub chatroom_id: String,
    pub user_id: String,
    pub bot_guess: String,
    #[serde(default)]
    pub reasoning: String,
    pub llm_knowledge: String,
    pub chatbot_frequency: String,
    pub age: u32,
    pub education: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct SurveyRecord {
    pub id: String,
    pub timestamp: String,
    pub chatroom_id: String,
    pub user_id: String,
    pub bot_guess: String,
    pub reasoning: String,
    pub llm_knowledge: String,
    pub chatbot_frequency: String,
    pub age: u32,
    pub education: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_record_uses_wire_field_names() {
        let msg = MessageRecord {
            id: "m1".to_string(),
            chatroom_id: "room".to_string(),
            sender_id: "u1".to_string(),
            text: "hi".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("chatroomId").is_some());
        assert!(value.get("senderId").is_some());
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn chatroom_reports_its_ai_seat() {
        let room = Chatroom {
            id: "r".to_string(),
            participants: vec!["h1".to_string(), "h2".to_string(), "ai-42".to_string()],
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert_eq!(room.ai_participant(), Some("ai-42"));
    }

    #[test]
    fn waiting_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WaitingState::NotFound).unwrap(),
            serde_json::json!("not_found")
        );
    }

    #[test]
    fn survey_request_rejects_missing_required_fields() {
        let missing_age = serde_json::json!({
            "chatroomId": "r",
            "userId": "u",
            "botGuess": "Player_1",
            "llmKnowledge": "Some",
            "chatbotFrequency": "Daily",
            "education": "Undergraduate"
        });
        assert!(serde_json::from_value::<SurveySubmissionRequest>(missing_age).is_err());
    }
}
