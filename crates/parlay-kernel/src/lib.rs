use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parlay_contracts::{is_ai_sender, MessageRecord, Role, TranscriptItem, WaitingEntrant};
use rand::Rng;
use serde_json::Value;

/// Generated text equal to this token means the AI declines the turn.
pub const SILENCE_TOKEN: &str = "Silence1";

/// Transcript label for the AI's own messages.
pub const AI_TRANSCRIPT_NAME: &str = "AI_Player";

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

/// Pick the two longest-waiting entrants from a pool snapshot.
///
/// Returns `None` when fewer than two entrants are present. Ties on join
/// time (and entrants with unparseable timestamps, which sort last) are
/// broken by id so repeated passes over the same snapshot agree.
pub fn select_pair(pool: &[WaitingEntrant]) -> Option<(WaitingEntrant, WaitingEntrant)> {
    if pool.len() < 2 {
        return None;
    }
    let mut ordered: Vec<&WaitingEntrant> = pool.iter().collect();
    ordered.sort_by(|a, b| {
        match (parse_rfc3339(&a.joined_at), parse_rfc3339(&b.joined_at)) {
            (Some(ta), Some(tb)) => ta.cmp(&tb).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        }
    });
    Some((ordered[0].clone(), ordered[1].clone()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// Nothing in the room yet; the AI never opens a conversation.
    EmptyHistory,
    /// The AI never speaks two turns in a row.
    AiSpokeLast,
    /// A single message from a single human is not enough activity yet.
    AwaitingActivity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnVerdict {
    Respond { transcript: Vec<TranscriptItem> },
    Hold { reason: HoldReason },
}

/// Restore a most-recent-first page of messages to chronological order.
pub fn restore_chronological(mut messages: Vec<MessageRecord>) -> Vec<MessageRecord> {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    messages
}

/// Decide whether the AI should take the next turn, given the room's recent
/// history in chronological order.
pub fn decide_turn(history: &[MessageRecord]) -> TurnVerdict {
    let Some(last) = history.last() else {
        return TurnVerdict::Hold {
            reason: HoldReason::EmptyHistory,
        };
    };
    if is_ai_sender(&last.sender_id) {
        return TurnVerdict::Hold {
            reason: HoldReason::AiSpokeLast,
        };
    }

    let last_ai_index = history
        .iter()
        .rposition(|m| is_ai_sender(&m.sender_id));
    let since_ai = match last_ai_index {
        Some(i) => &history[i + 1..],
        None => history,
    };

    let distinct_humans: HashSet<&str> = since_ai
        .iter()
        .filter(|m| !is_ai_sender(&m.sender_id))
        .map(|m| m.sender_id.as_str())
        .collect();

    if since_ai.len() < 2 && distinct_humans.len() < 2 {
        return TurnVerdict::Hold {
            reason: HoldReason::AwaitingActivity,
        };
    }

    TurnVerdict::Respond {
        transcript: build_transcript(history),
    }
}

/// Build the generator transcript over the full history: humans are labeled
/// `Player_1`, `Player_2`, … in order of first appearance, the AI's own
/// messages carry the fixed assistant label.
pub fn build_transcript(history: &[MessageRecord]) -> Vec<TranscriptItem> {
    let mut aliases: HashMap<&str, String> = HashMap::new();
    let mut player_counter = 1;
    for msg in history {
        let sender = msg.sender_id.as_str();
        if !is_ai_sender(sender) && !aliases.contains_key(sender) {
            aliases.insert(sender, format!("Player_{player_counter}"));
            player_counter += 1;
        }
    }

    history
        .iter()
        .map(|msg| {
            let sender = msg.sender_id.as_str();
            if is_ai_sender(sender) {
                TranscriptItem {
                    role: Role::Assistant,
                    name: AI_TRANSCRIPT_NAME.to_string(),
                    content: msg.text.clone(),
                }
            } else {
                TranscriptItem {
                    role: Role::User,
                    name: aliases
                        .get(sender)
                        .cloned()
                        .unwrap_or_else(|| "Unknown_Player".to_string()),
                    content: msg.text.clone(),
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingProfile {
    pub typing_speed_cps: f64,
    pub min_thinking_seconds: f64,
    pub max_random_thinking_seconds: f64,
    pub max_delay_seconds: f64,
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self {
            typing_speed_cps: 7.0,
            min_thinking_seconds: 1.0,
            max_random_thinking_seconds: 2.5,
            max_delay_seconds: 15.0,
        }
    }
}

/// Simulated human latency before an AI message is emitted: a random
/// "thinking" pause plus time to type the text, capped so the task never
/// outlives the host invocation's execution ceiling.
pub fn typing_delay(text_len: usize, timing: &TimingProfile, rng: &mut impl Rng) -> f64 {
    let thinking = timing.min_thinking_seconds
        + rng.gen_range(0.0..=timing.max_random_thinking_seconds.max(0.0));
    let typing = text_len as f64 / timing.typing_speed_cps;
    (thinking + typing).clamp(0.0, timing.max_delay_seconds)
}

/// Concatenate the `output_text` fragments of a response-API payload.
pub fn extract_output_text(response: &Value) -> String {
    let mut parts = String::new();
    let items = response
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let content = item
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for chunk in content {
            if chunk.get("type").and_then(Value::as_str) == Some("output_text") {
                parts.push_str(chunk.get("text").and_then(Value::as_str).unwrap_or(""));
            }
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use serde_json::json;

    fn entrant(id: &str, joined_at: &str) -> WaitingEntrant {
        WaitingEntrant {
            id: id.to_string(),
            joined_at: joined_at.to_string(),
        }
    }

    fn message(sender: &str, text: &str, created_at: &str) -> MessageRecord {
        MessageRecord {
            id: format!("m-{sender}-{created_at}"),
            chatroom_id: "room-1".to_string(),
            sender_id: sender.to_string(),
            text: text.to_string(),
            created_at: created_at.to_string(),
        }
    }

    #[test]
    fn select_pair_needs_two_entrants() {
        assert_eq!(select_pair(&[]), None);
        assert_eq!(select_pair(&[entrant("a", "2026-01-01T00:00:00Z")]), None);
    }

    #[test]
    fn select_pair_takes_longest_waiting_first() {
        let pool = vec![
            entrant("c", "2026-01-01T00:00:02Z"),
            entrant("a", "2026-01-01T00:00:00Z"),
            entrant("b", "2026-01-01T00:00:01Z"),
        ];
        let (first, second) = select_pair(&pool).unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(second.id, "b");
    }

    #[test]
    fn select_pair_breaks_ties_by_id() {
        let pool = vec![
            entrant("b", "2026-01-01T00:00:00Z"),
            entrant("a", "2026-01-01T00:00:00Z"),
        ];
        let (first, second) = select_pair(&pool).unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(second.id, "b");
    }

    #[test]
    fn select_pair_sorts_unparseable_timestamps_last() {
        let pool = vec![
            entrant("x", "not-a-timestamp"),
            entrant("a", "2026-01-01T00:00:01Z"),
            entrant("b", "2026-01-01T00:00:00Z"),
        ];
        let (first, second) = select_pair(&pool).unwrap();
        assert_eq!(first.id, "b");
        assert_eq!(second.id, "a");
    }

    #[test]
    fn empty_history_holds() {
        assert_eq!(
            decide_turn(&[]),
            TurnVerdict::Hold {
                reason: HoldReason::EmptyHistory
            }
        );
    }

    #[test]
    fn ai_never_speaks_twice_in_a_row() {
        let history = vec![
            message("h1", "hi", "2026-01-01T00:00:00Z"),
            message("h2", "hello", "2026-01-01T00:00:01Z"),
            message("ai-x", "hey there", "2026-01-01T00:00:02Z"),
        ];
        assert_eq!(
            decide_turn(&history),
            TurnVerdict::Hold {
                reason: HoldReason::AiSpokeLast
            }
        );
    }

    #[test]
    fn single_lone_message_holds() {
        let history = vec![message("h1", "hi", "2026-01-01T00:00:00Z")];
        assert_eq!(
            decide_turn(&history),
            TurnVerdict::Hold {
                reason: HoldReason::AwaitingActivity
            }
        );
    }

    #[test]
    fn two_distinct_senders_respond() {
        let history = vec![
            message("h1", "hi", "2026-01-01T00:00:00Z"),
            message("h2", "hello", "2026-01-01T00:00:01Z"),
        ];
        assert!(matches!(decide_turn(&history), TurnVerdict::Respond { .. }));
    }

    #[test]
    fn two_messages_same_sender_respond() {
        let history = vec![
            message("h1", "hi", "2026-01-01T00:00:00Z"),
            message("h1", "anyone?", "2026-01-01T00:00:01Z"),
        ];
        assert!(matches!(decide_turn(&history), TurnVerdict::Respond { .. }));
    }

    #[test]
    fn one_message_since_ai_holds() {
        let history = vec![
            message("h1", "hi", "2026-01-01T00:00:00Z"),
            message("ai-x", "hello both", "2026-01-01T00:00:01Z"),
            message("h2", "hey", "2026-01-01T00:00:02Z"),
        ];
        assert_eq!(
            decide_turn(&history),
            TurnVerdict::Hold {
                reason: HoldReason::AwaitingActivity
            }
        );
    }

    #[test]
    fn activity_window_resets_at_last_ai_message() {
        // Plenty of history before the AI spoke, then two fresh human turns.
        let history = vec![
            message("h1", "hi", "2026-01-01T00:00:00Z"),
            message("h2", "hello", "2026-01-01T00:00:01Z"),
            message("ai-x", "hey", "2026-01-01T00:00:02Z"),
            message("h1", "so", "2026-01-01T00:00:03Z"),
            message("h1", "anyway", "2026-01-01T00:00:04Z"),
        ];
        assert!(matches!(decide_turn(&history), TurnVerdict::Respond { .. }));
    }

    #[test]
    fn restore_chronological_reverses_recent_first_page() {
        let page = vec![
            message("h2", "hello", "2026-01-01T00:00:01Z"),
            message("h1", "hi", "2026-01-01T00:00:00Z"),
        ];
        let ordered = restore_chronological(page);
        assert_eq!(ordered[0].sender_id, "h1");
        assert_eq!(ordered[1].sender_id, "h2");
    }

    #[test]
    fn aliases_follow_first_appearance_over_full_history() {
        let history = vec![
            message("h1", "hi", "2026-01-01T00:00:00Z"),
            message("h2", "hello", "2026-01-01T00:00:01Z"),
            message("ai-x", "hey", "2026-01-01T00:00:02Z"),
            message("h2", "how goes", "2026-01-01T00:00:03Z"),
            message("h1", "fine", "2026-01-01T00:00:04Z"),
        ];
        let transcript = build_transcript(&history);
        assert_eq!(transcript[0].name, "Player_1");
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[1].name, "Player_2");
        assert_eq!(transcript[2].name, AI_TRANSCRIPT_NAME);
        assert_eq!(transcript[2].role, Role::Assistant);
        // The first speaker stays Player_1 no matter who spoke since.
        assert_eq!(transcript[4].name, "Player_1");
        assert_eq!(transcript[3].name, "Player_2");
    }

    #[test]
    fn typing_delay_is_min_thinking_plus_typing_without_randomness() {
        let timing = TimingProfile {
            typing_speed_cps: 7.0,
            min_thinking_seconds: 1.0,
            max_random_thinking_seconds: 0.0,
            max_delay_seconds: 15.0,
        };
        let mut rng = StepRng::new(0, 0);
        let delay = typing_delay(14, &timing, &mut rng);
        assert!((delay - 3.0).abs() < 1e-9, "delay was {delay}");
    }

    #[test]
    fn typing_delay_is_non_decreasing_in_text_length() {
        let timing = TimingProfile::default();
        let mut previous = 0.0;
        for len in [0, 1, 10, 50, 100, 1000] {
            let mut rng = StepRng::new(0, 0);
            let delay = typing_delay(len, &timing, &mut rng);
            assert!(delay >= previous, "delay shrank at len {len}");
            previous = delay;
        }
    }

    #[test]
    fn typing_delay_never_exceeds_cap() {
        let timing = TimingProfile::default();
        let mut rng = StepRng::new(u64::MAX / 2, 1);
        for len in [0, 10_000, 1_000_000] {
            let delay = typing_delay(len, &timing, &mut rng);
            assert!(delay <= timing.max_delay_seconds);
        }
    }

    #[test]
    fn typing_delay_is_deterministic_for_a_fixed_rng() {
        let timing = TimingProfile::default();
        let a = typing_delay(42, &timing, &mut StepRng::new(7, 3));
        let b = typing_delay(42, &timing, &mut StepRng::new(7, 3));
        assert_eq!(a, b);
    }

    #[test]
    fn extract_output_text_joins_message_fragments() {
        let payload = json!({
            "output": [
                {"type": "reasoning", "content": [{"type": "output_text", "text": "skip me"}]},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "Hello"},
                    {"type": "refusal", "refusal": "no"},
                    {"type": "output_text", "text": " there"}
                ]}
            ]
        });
        assert_eq!(extract_output_text(&payload), "Hello there");
    }

    #[test]
    fn extract_output_text_handles_missing_output() {
        assert_eq!(extract_output_text(&json!({})), "");
    }
}
