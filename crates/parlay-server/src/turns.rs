use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parlay_contracts::MessageRecord;
use parlay_kernel::{
    decide_turn, restore_chronological, typing_delay, HoldReason, TurnVerdict, SILENCE_TOKEN,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use uuid::Uuid;

use crate::{now_rfc3339, timing_profile, AppState};

/// Keyed async mutexes: at most one AI turn runs per chatroom at a time, so
/// concurrent message-append events cannot both answer the same human turn.
#[derive(Default)]
pub struct RoomLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoomLocks {
    pub async fn acquire(&self, chatroom_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            Arc::clone(map.entry(chatroom_id.to_string()).or_default())
        };
        slot.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RoomMissing,
    NoAiParticipant,
    EmptyHistory,
    AiSpokeLast,
    AwaitingActivity,
    GeneratorDeclined,
    EmptyGeneration,
}

impl From<HoldReason> for SkipReason {
    fn from(reason: HoldReason) -> Self {
        match reason {
            HoldReason::EmptyHistory => SkipReason::EmptyHistory,
            HoldReason::AiSpokeLast => SkipReason::AiSpokeLast,
            HoldReason::AwaitingActivity => SkipReason::AwaitingActivity,
        }
    }
}

/// Outcome of one AI turn. `Skipped` is a deliberate no-op; transport and
/// store failures surface as `Err` from [`run_ai_turn`] instead.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Sent {
        message: MessageRecord,
        delay_seconds: f64,
    },
    Skipped(SkipReason),
}

/// Spawn one AI turn for the chatroom. The handle is returned so callers and
/// tests can observe completion; the dispatched task logs and swallows its
/// own failure (a skipped AI turn is never escalated).
pub fn dispatch_ai_turn(
    state: AppState,
    chatroom_id: String,
) -> tokio::task::JoinHandle<Result<TurnOutcome, String>> {
    tokio::spawn(async move {
        let result = run_ai_turn(&state, &chatroom_id).await;
        match &result {
            Ok(TurnOutcome::Sent { message, delay_seconds }) => {
                tracing::info!(
                    %chatroom_id,
                    sender_id = %message.sender_id,
                    delay_seconds,
                    "ai turn sent"
                );
            }
            Ok(TurnOutcome::Skipped(reason)) => {
                tracing::debug!(%chatroom_id, ?reason, "ai turn skipped");
            }
            Err(err) => {
                tracing::error!(%chatroom_id, error = %err, "ai turn failed");
            }
        }
        result
    })
}

/// Run one serialized AI turn: decide, generate, delay, emit.
pub async fn run_ai_turn(state: &AppState, chatroom_id: &str) -> Result<TurnOutcome, String> {
    let _guard = state.room_locks.acquire(chatroom_id).await;

    let chatroom = { state.store.lock().await.get_chatroom(chatroom_id)? };
    let Some(chatroom) = chatroom else {
        tracing::warn!(chatroom_id, "ai turn for unknown chatroom");
        return Ok(TurnOutcome::Skipped(SkipReason::RoomMissing));
    };
    let Some(ai_id) = chatroom.ai_participant().map(str::to_string) else {
        tracing::warn!(chatroom_id, "chatroom has no ai participant");
        return Ok(TurnOutcome::Skipped(SkipReason::NoAiParticipant));
    };

    let recent = {
        state
            .store
            .lock()
            .await
            .recent_messages(chatroom_id, state.cfg.policy.history_limit)?
    };
    let history = restore_chronological(recent);

    let transcript = match decide_turn(&history) {
        TurnVerdict::Hold { reason } => {
            tracing::debug!(chatroom_id, ?reason, "holding ai turn");
            return Ok(TurnOutcome::Skipped(reason.into()));
        }
        TurnVerdict::Respond { transcript } => transcript,
    };

    let credential = state.generator_credential.get().await?;
    let instructions = state.instructions.get().await?;
    let text = state
        .generator
        .generate(&credential, &instructions, &transcript)
        .await?;
    let text = text.trim().to_string();

    if text == SILENCE_TOKEN {
        tracing::info!(chatroom_id, "ai chose to remain silent");
        return Ok(TurnOutcome::Skipped(SkipReason::GeneratorDeclined));
    }
    if text.is_empty() {
        tracing::info!(chatroom_id, "generator returned empty text");
        return Ok(TurnOutcome::Skipped(SkipReason::EmptyGeneration));
    }

    let timing = timing_profile(&state.cfg.timing);
    let delay_seconds = {
        let mut rng = rand::thread_rng();
        typing_delay(text.chars().count(), &timing, &mut rng)
    };
    sleep(Duration::from_secs_f64(delay_seconds)).await;

    match state.notifier.relay_message(chatroom_id, &text, &ai_id).await {
        Ok(message) => Ok(TurnOutcome::Sent {
            message,
            delay_seconds,
        }),
        Err(relay_err) => {
            // At-least-once: the realtime channel failed (or its ack was
            // lost), so persist the turn directly rather than dropping it.
            tracing::warn!(
                chatroom_id,
                error = %relay_err,
                "relay failed, persisting ai turn directly"
            );
            let fallback = MessageRecord {
                id: Uuid::new_v4().to_string(),
                chatroom_id: chatroom_id.to_string(),
                sender_id: ai_id,
                text,
                created_at: now_rfc3339(),
            };
            state
                .store
                .lock()
                .await
                .append_message(&fallback)
                .map_err(|e| {
                    format!("fallback persist failed after relay error ({relay_err}): {e}")
                })?;
            Ok(TurnOutcome::Sent {
                message: fallback,
                delay_seconds,
            })
        }
    }
}
