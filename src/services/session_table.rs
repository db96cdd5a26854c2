//! Per-key slots holding multipart sessions.
//!
//! Each destination key maps to its own `Arc<Mutex<Option<UploadSession>>>`.
//! A caller holds the slot's lock for the whole initiate/upload/complete
//! sequence of one chunk, so chunks for the same key are serialized while
//! chunks for different keys only meet on the short map lookup. A slot is
//! dropped from the map once its session is gone.

use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::models::multipart::{SessionSummary, UploadSession};

type Slot = Arc<Mutex<Option<UploadSession>>>;

/// Exclusive access to the session slot of one key.
pub struct SessionGuard {
    key: String,
    guard: OwnedMutexGuard<Option<UploadSession>>,
}

impl SessionGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Deref for SessionGuard {
    type Target = Option<UploadSession>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[derive(Default)]
pub struct SessionTable {
    slots: RwLock<HashMap<String, Slot>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot for `key`, creating an empty one if needed.
    pub async fn acquire(&self, key: &str) -> SessionGuard {
        loop {
            let slot = {
                let mut slots = self.slots.write().await;
                slots
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(None)))
                    .clone()
            };
            let guard = slot.clone().lock_owned().await;
            // The previous holder may have retired this slot while we waited.
            if self.is_current(key, &slot).await {
                return SessionGuard {
                    key: key.to_string(),
                    guard,
                };
            }
        }
    }

    /// Lock every slot that is not busy right now.
    pub async fn acquire_idle(&self) -> Vec<SessionGuard> {
        let snapshot: Vec<(String, Slot)> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .map(|(key, slot)| (key.clone(), slot.clone()))
                .collect()
        };

        let mut guards = Vec::new();
        for (key, slot) in snapshot {
            let Ok(guard) = slot.clone().try_lock_owned() else {
                continue;
            };
            if self.is_current(&key, &slot).await {
                guards.push(SessionGuard { key, guard });
            }
        }
        guards
    }

    /// Unlock a slot, retiring it when it no longer holds a session.
    pub async fn release(&self, guard: SessionGuard) {
        if guard.is_none() {
            let mut slots = self.slots.write().await;
            let ours = slots
                .get(&guard.key)
                .is_some_and(|slot| Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&guard.guard)));
            if ours {
                slots.remove(&guard.key);
            }
        }
    }

    /// Whether a session exists (or is being set up) for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        let slot = match self.slots.read().await.get(key) {
            Some(slot) => slot.clone(),
            None => return false,
        };
        match slot.try_lock() {
            Ok(session) => session.is_some(),
            Err(_) => true,
        }
    }

    /// Summaries of all sessions. Slots busy with a chunk right now are
    /// skipped rather than waited for.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let snapshot: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut summaries = Vec::new();
        for slot in snapshot {
            let Ok(session) = slot.try_lock() else {
                continue;
            };
            if let Some(session) = session.as_ref() {
                summaries.push(session.summary());
            }
        }
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn is_current(&self, key: &str, slot: &Slot) -> bool {
        self.slots
            .read()
            .await
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session(key: &str) -> UploadSession {
        UploadSession::new(key.into(), format!("upload-{}", key), 2, "text/plain".into())
    }

    #[tokio::test]
    async fn empty_slot_is_retired_on_release() {
        let table = SessionTable::new();
        let guard = table.acquire("a.txt").await;
        assert!(table.contains("a.txt").await);
        table.release(guard).await;
        assert!(!table.contains("a.txt").await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn session_survives_release() {
        let table = SessionTable::new();
        let mut guard = table.acquire("a.txt").await;
        *guard = Some(session("a.txt"));
        table.release(guard).await;

        assert!(table.contains("a.txt").await);
        assert_eq!(table.summaries().await.len(), 1);
        let guard = table.acquire("a.txt").await;
        assert_eq!(guard.as_ref().unwrap().upload_id, "upload-a.txt");
        table.release(guard).await;
    }

    #[tokio::test]
    async fn summaries_skip_busy_slots() {
        let table = SessionTable::new();
        let mut idle = table.acquire("idle").await;
        *idle = Some(session("idle"));
        table.release(idle).await;
        let mut busy = table.acquire("busy").await;
        *busy = Some(session("busy"));

        let summaries = tokio::time::timeout(Duration::from_secs(1), table.summaries())
            .await
            .expect("summaries must not wait for a held slot");
        let keys: Vec<&str> = summaries.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["idle"]);

        table.release(busy).await;
        assert_eq!(table.summaries().await.len(), 2);
    }

    #[tokio::test]
    async fn same_key_waits_for_holder() {
        let table = Arc::new(SessionTable::new());
        let mut first = table.acquire("a.txt").await;

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let guard = table.acquire("a.txt").await;
                let seen = guard.as_ref().map(|s| s.upload_id.clone());
                table.release(guard).await;
                seen
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        *first = Some(session("a.txt"));
        table.release(first).await;

        assert_eq!(waiter.await.unwrap().as_deref(), Some("upload-a.txt"));
    }

    #[tokio::test]
    async fn waiter_on_retired_slot_gets_fresh_one() {
        let table = Arc::new(SessionTable::new());
        let first = table.acquire("a.txt").await;

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let mut guard = table.acquire("a.txt").await;
                *guard = Some(session("a.txt"));
                table.release(guard).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.release(first).await;
        waiter.await.unwrap();

        assert_eq!(table.len().await, 1);
        assert!(table.contains("a.txt").await);
    }

    #[tokio::test]
    async fn idle_acquisition_skips_busy_slots() {
        let table = SessionTable::new();
        let mut busy = table.acquire("busy").await;
        *busy = Some(session("busy"));
        let mut idle = table.acquire("idle").await;
        *idle = Some(session("idle"));
        table.release(idle).await;

        let guards = table.acquire_idle().await;
        let keys: Vec<&str> = guards.iter().map(|g| g.key()).collect();
        assert_eq!(keys, vec!["idle"]);

        for guard in guards {
            table.release(guard).await;
        }
        table.release(busy).await;
    }
}
