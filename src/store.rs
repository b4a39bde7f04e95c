//! In-memory session records that are dropped once their expiry passes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tower_sessions::session::{Id, Record};
use tower_sessions::session_store::{self, SessionStore};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ChatSessionStore {
    records: Arc<DashMap<Id, Record>>,
}

fn is_active(record: &Record) -> bool {
    record.expiry_date > OffsetDateTime::now_utc()
}

impl ChatSessionStore {
    /// Removes every record whose expiry has passed. Returns how many went.
    pub fn prune_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| is_active(record));
        let pruned = before.saturating_sub(self.records.len());
        if pruned > 0 {
            debug!("Pruned {} expired sessions, {} remain", pruned, self.records.len());
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Prunes on every tick of `period` for as long as the process runs.
    pub fn spawn_pruning(&self, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                store.prune_expired();
            }
        })
    }
}

#[async_trait]
impl SessionStore for ChatSessionStore {
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        while self.records.contains_key(&record.id) {
            record.id = Id::default();
        }
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn save(&self, record: &Record) -> session_store::Result<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        Ok(self
            .records
            .get(session_id)
            .filter(|record| is_active(record))
            .map(|record| record.clone()))
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        self.records.remove(session_id);
        Ok(())
    }
}
