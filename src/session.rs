//! Per-browser conversation state, kept in the session store.

use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use crate::error::Result;

const CONVERSATION_KEY: &str = "conversation";

pub const MIN_MAX_LENGTH: usize = 100;
pub const MAX_MAX_LENGTH: usize = 2000;
pub const DEFAULT_MAX_LENGTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
    token_history: Option<Vec<u32>>,
    exchanges: usize,
    max_length: usize,
}

impl Default for Conversation {
    fn default() -> Self {
        Self { turns: Vec::new(), token_history: None, exchanges: 0, max_length: DEFAULT_MAX_LENGTH }
    }
}

impl Conversation {
    pub async fn load(session: &Session) -> Result<Self> {
        Ok(session.get::<Self>(CONVERSATION_KEY).await?.unwrap_or_default())
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        session.insert(CONVERSATION_KEY, self).await?;
        Ok(())
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Number of turns shown, user and ai alike.
    pub fn message_count(&self) -> usize {
        self.turns.len()
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    pub fn token_history(&self) -> Option<&[u32]> {
        self.token_history.as_deref()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = clamp_max_length(max_length);
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn { role: Role::User, text: text.into() });
    }

    /// Records the reply and replaces the token history with the one it
    /// was generated into.
    pub fn push_ai(&mut self, text: impl Into<String>, token_history: Option<Vec<u32>>) {
        self.turns.push(Turn { role: Role::Ai, text: text.into() });
        self.token_history = token_history;
        self.exchanges += 1;
    }

    /// Forgets every turn and the token history. The chosen max length stays.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.token_history = None;
        self.exchanges = 0;
    }
}

pub fn clamp_max_length(max_length: usize) -> usize {
    max_length.clamp(MIN_MAX_LENGTH, MAX_MAX_LENGTH)
}
