use std::collections::HashMap;

use parlay_contracts::{Chatroom, MessageRecord, SurveyRecord, WaitingEntrant};
use rusqlite::{params, Connection, OptionalExtension};

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
pub struct MemoryStore {
    waiting: HashMap<String, WaitingEntrant>,
    chatrooms: HashMap<String, Chatroom>,
    messages: HashMap<String, Vec<MessageRecord>>,
    surveys: HashMap<String, SurveyRecord>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    pub fn insert_waiting(&mut self, entrant: &WaitingEntrant) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.waiting.insert(entrant.id.clone(), entrant.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.insert_waiting(entrant),
        }
    }

    /// Test-and-delete: succeeds only if the entrant is still waiting, so
    /// concurrent pairing passes cannot both claim the same entrant.
    pub fn remove_waiting_if_present(&mut self, id: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.waiting.remove(id).is_some()),
            StoreBackend::Sqlite(store) => store.remove_waiting_if_present(id),
        }
    }

    pub fn waiting_contains(&self, id: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.waiting.contains_key(id)),
            StoreBackend::Sqlite(store) => store.waiting_contains(id),
        }
    }

    pub fn list_waiting(&self) -> Result<Vec<WaitingEntrant>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.waiting.values().cloned().collect()),
            StoreBackend::Sqlite(store) => store.list_waiting(),
        }
    }

    /// Create-once: a second put under the same id is an error, never an
    /// overwrite.
    pub fn put_chatroom(&mut self, chatroom: &Chatroom) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                if store.chatrooms.contains_key(&chatroom.id) {
                    return Err(format!("chatroom {} already exists", chatroom.id));
                }
                store.chatrooms.insert(chatroom.id.clone(), chatroom.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_chatroom(chatroom),
        }
    }

    pub fn get_chatroom(&self, id: &str) -> Result<Option<Chatroom>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.chatrooms.get(id).cloned()),
            StoreBackend::Sqlite(store) => store.get_chatroom(id),
        }
    }

    pub fn find_chatroom_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Option<Chatroom>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .chatrooms
                .values()
                .find(|room| room.participants.iter().any(|p| p == participant_id))
                .cloned()),
            StoreBackend::Sqlite(store) => store.find_chatroom_by_participant(participant_id),
        }
    }

    pub fn append_message(&mut self, message: &MessageRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .messages
                    .entry(message.chatroom_id.clone())
                    .or_default()
                    .push(message.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.append_message(message),
        }
    }

    /// Most-recent-first page of a chatroom's messages.
    pub fn recent_messages(
        &self,
        chatroom_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut messages = store
                    .messages
                    .get(chatroom_id)
                    .cloned()
                    .unwrap_or_default();
                messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                messages.truncate(limit);
                Ok(messages)
            }
            StoreBackend::Sqlite(store) => store.recent_messages(chatroom_id, limit),
        }
    }

    pub fn put_survey(&mut self, survey: &SurveyRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.surveys.insert(survey.id.clone(), survey.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_survey(survey),
        }
    }
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS waiting_room (
                id TEXT PRIMARY KEY,
                joined_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chatrooms (
                id TEXT PRIMARY KEY,
                participants TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                chatroom_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (chatroom_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_room_time
                ON messages (chatroom_id, created_at);
            CREATE TABLE IF NOT EXISTS survey_responses (
                id TEXT PRIMARY KEY,
                chatroom_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn insert_waiting(&mut self, entrant: &WaitingEntrant) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO waiting_room(id, joined_at) VALUES (?1, ?2)",
                params![entrant.id, entrant.joined_at],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn remove_waiting_if_present(&mut self, id: &str) -> Result<bool, String> {
        let affected = self
            .conn
            .execute("DELETE FROM waiting_room WHERE id = ?1", params![id])
            .map_err(|e| e.to_string())?;
        Ok(affected > 0)
    }

    fn waiting_contains(&self, id: &str) -> Result<bool, String> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM waiting_room WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        Ok(row.is_some())
    }

    fn list_waiting(&self) -> Result<Vec<WaitingEntrant>, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, joined_at FROM waiting_room")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WaitingEntrant {
                    id: row.get(0)?,
                    joined_at: row.get(1)?,
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    fn put_chatroom(&mut self, chatroom: &Chatroom) -> Result<(), String> {
        let participants =
            serde_json::to_string(&chatroom.participants).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "INSERT INTO chatrooms(id, participants, created_at) VALUES (?1, ?2, ?3)",
                params![chatroom.id, participants, chatroom.created_at],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get_chatroom(&self, id: &str) -> Result<Option<Chatroom>, String> {
        let row = self
            .conn
            .query_row(
                "SELECT id, participants, created_at FROM chatrooms WHERE id = ?1",
                params![id],
                |row| {
                    let id: String = row.get(0)?;
                    let participants: String = row.get(1)?;
                    let created_at: String = row.get(2)?;
                    Ok((id, participants, created_at))
                },
            )
            .optional()
            .map_err(|e| e.to_string())?;
        match row {
            Some((id, participants, created_at)) => Ok(Some(Chatroom {
                id,
                participants: serde_json::from_str(&participants).map_err(|e| e.to_string())?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    fn find_chatroom_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Option<Chatroom>, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, participants, created_at FROM chatrooms")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let participants: String = row.get(1)?;
                let created_at: String = row.get(2)?;
                Ok((id, participants, created_at))
            })
            .map_err(|e| e.to_string())?;
        for row in rows {
            let (id, participants, created_at) = row.map_err(|e| e.to_string())?;
            let participants: Vec<String> =
                serde_json::from_str(&participants).map_err(|e| e.to_string())?;
            if participants.iter().any(|p| p == participant_id) {
                return Ok(Some(Chatroom {
                    id,
                    participants,
                    created_at,
                }));
            }
        }
        Ok(None)
    }

    fn append_message(&mut self, message: &MessageRecord) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO messages(id, chatroom_id, sender_id, body, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    message.id,
                    message.chatroom_id,
                    message.sender_id,
                    message.text,
                    message.created_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn recent_messages(
        &self,
        chatroom_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT id, chatroom_id, sender_id, body, created_at FROM messages
                WHERE chatroom_id = ?1
                ORDER BY created_at DESC
                LIMIT ?2
                ",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![chatroom_id, limit as i64], |row| {
                Ok(MessageRecord {
                    id: row.get(0)?,
                    chatroom_id: row.get(1)?,
                    sender_id: row.get(2)?,
                    text: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    fn put_survey(&mut self, survey: &SurveyRecord) -> Result<(), String> {
        let record_json = serde_json::to_string(survey).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT INTO survey_responses(id, chatroom_id, user_id, submitted_at, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    survey.id,
                    survey.chatroom_id,
                    survey.user_id,
                    survey.timestamp,
                    record_json
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}
