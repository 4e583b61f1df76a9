use std::{collections::HashMap, sync::Arc, time::Duration};

use channel_integration::GroupChannel;
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{Participant, PresenceChange, SelfPresence},
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Idle,
    Syncing,
}

/// Translates noisy local state changes into infrequent serialized presence
/// writes, and remote presence events into a clean participant snapshot.
///
/// Outgoing writes go through a single-slot buffer: a newer announce
/// overwrites an unsent one, and a debounce timer flushes exactly one write
/// per idle period. Incoming events always rebuild the snapshot wholesale
/// from the transport's full presence state, never patching incrementally,
/// so missed events cannot cause divergence.
pub struct PresenceCoordinator {
    local_user: UserId,
    debounce: Duration,
    inner: Mutex<PresenceInner>,
    participants: RwLock<HashMap<UserId, Participant>>,
}

struct PresenceInner {
    channel: Option<Arc<dyn GroupChannel>>,
    pending: Option<SelfPresence>,
    flush_task: Option<JoinHandle<()>>,
    sync_state: SyncState,
}

impl PresenceCoordinator {
    pub fn new(local_user: UserId, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            local_user,
            debounce,
            inner: Mutex::new(PresenceInner {
                channel: None,
                pending: None,
                flush_task: None,
                sync_state: SyncState::Idle,
            }),
            participants: RwLock::new(HashMap::new()),
        })
    }

    pub async fn attach_channel(&self, channel: Arc<dyn GroupChannel>) {
        let mut inner = self.inner.lock().await;
        inner.channel = Some(channel);
    }

    /// Drops the channel and cancels any queued-but-unsent announce along
    /// with its debounce timer. Called on session teardown.
    pub async fn detach(&self) {
        let task = {
            let mut inner = self.inner.lock().await;
            inner.channel = None;
            inner.pending = None;
            inner.sync_state = SyncState::Idle;
            inner.flush_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Stores the latest self-state in the single-slot buffer and schedules
    /// a debounced flush. Rapid calls collapse into the final state only.
    pub async fn announce(self: &Arc<Self>, presence: SelfPresence) {
        let mut inner = self.inner.lock().await;
        inner.pending = Some(presence);
        let flusher_running = inner
            .flush_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if !flusher_running {
            let coordinator = Arc::clone(self);
            // Created here (not inside the task) so the debounce deadline is
            // anchored at the announce itself rather than at the spawned
            // task's first poll.
            let debounce = tokio::time::sleep(self.debounce);
            inner.flush_task = Some(tokio::spawn(async move {
                debounce.await;
                coordinator.flush().await;
            }));
        }
    }

    async fn flush(&self) {
        loop {
            let (channel, payload) = {
                let mut inner = self.inner.lock().await;
                if inner.sync_state == SyncState::Syncing {
                    // Another write is in flight; its drain loop picks up
                    // whatever is pending.
                    return;
                }
                let Some(channel) = inner.channel.clone() else {
                    // Not connected; keep the pending payload for the
                    // re-announce that follows reconnection.
                    inner.flush_task = None;
                    return;
                };
                let Some(payload) = inner.pending.take() else {
                    inner.flush_task = None;
                    return;
                };
                inner.sync_state = SyncState::Syncing;
                (channel, payload)
            };

            if let Err(err) = channel.track(payload).await {
                // Write failures ride the supervisor's reconnect path; no
                // independent retry here.
                warn!("presence: track failed: {err:#}");
            }

            let mut inner = self.inner.lock().await;
            inner.sync_state = SyncState::Idle;
            if inner.pending.is_none() {
                inner.flush_task = None;
                return;
            }
            // A newer state arrived while the write was in flight; drain it
            // immediately rather than waiting for another timer.
        }
    }

    /// Applies a remote presence event by rebuilding the snapshot wholesale
    /// from the channel's full presence state. Returns whether the snapshot
    /// was replaced; a malformed payload retains the previous snapshot.
    pub async fn apply_change(&self, change: &PresenceChange) -> bool {
        let channel = { self.inner.lock().await.channel.clone() };
        let Some(channel) = channel else {
            return false;
        };
        let state = channel.presence_state();
        match self.rebuild(state) {
            Ok(rebuilt) => {
                *self.participants.write().await = rebuilt;
                true
            }
            Err(err) => {
                warn!(?change, "presence: malformed payload, snapshot retained: {err}");
                false
            }
        }
    }

    fn rebuild(
        &self,
        state: HashMap<String, Vec<Value>>,
    ) -> Result<HashMap<UserId, Participant>, serde_json::Error> {
        let mut participants = HashMap::new();
        for metas in state.into_values() {
            // The most recent meta wins when a user is tracked twice.
            let Some(meta) = metas.into_iter().last() else {
                continue;
            };
            let presence: SelfPresence = serde_json::from_value(meta)?;
            if presence.user_id == self.local_user {
                continue;
            }
            if presence.hidden {
                debug!(user_id = %presence.user_id, "presence: hidden participant filtered");
                continue;
            }
            participants.insert(presence.user_id.clone(), Participant::from(presence));
        }
        Ok(participants)
    }

    /// Current participant snapshot, ordered by join time. Never contains
    /// the local user.
    pub async fn participants(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> =
            self.participants.read().await.values().cloned().collect();
        participants.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.as_str().cmp(b.user_id.as_str()))
        });
        participants
    }

    pub async fn clear(&self) {
        self.participants.write().await.clear();
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
