use std::sync::Arc;

use channel_integration::{CaptureStreamHandle, ChannelConnector, ChannelOptions};
use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupId, UserId},
    protocol::{Participant, SelfPresence},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    error::SessionError,
    presence::PresenceCoordinator,
    resource::{ResourceError, ResourceLifecycleManager},
    supervisor::{ConnectionState, ConnectionSupervisor, ReconnectGate, SupervisorEvent},
};

#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub enable_microphone: bool,
    pub start_muted: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            enable_microphone: true,
            start_muted: false,
        }
    }
}

/// Immutable point-in-time view handed to the UI layer. Rebuilt on every
/// update, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub participants: Vec<Participant>,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub hand_raised: bool,
    pub is_speaking: bool,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SnapshotUpdated(SessionSnapshot),
    Error(String),
}

#[derive(Debug, Clone)]
struct SelfState {
    muted: bool,
    deafened: bool,
    speaking: bool,
    hand_raised: bool,
    has_microphone: bool,
    hidden: bool,
    joined_at: DateTime<Utc>,
}

struct ActiveSession {
    session_id: Uuid,
    group_id: GroupId,
    display_name: String,
    created_at: DateTime<Utc>,
    self_state: SelfState,
    capture: Option<Arc<dyn CaptureStreamHandle>>,
    pump_task: JoinHandle<()>,
}

impl ActiveSession {
    fn presence_payload(&self, local_user: &UserId) -> SelfPresence {
        SelfPresence {
            user_id: local_user.clone(),
            display_name: self.display_name.clone(),
            muted: self.self_state.muted,
            deafened: self.self_state.deafened,
            speaking: self.self_state.speaking,
            hand_raised: self.self_state.hand_raised,
            has_microphone: self.self_state.has_microphone,
            hidden: self.self_state.hidden,
            joined_at: self.self_state.joined_at,
        }
    }
}

struct SessionInner {
    active: Option<ActiveSession>,
}

/// The only entry point the application uses for live sessions. Composes the
/// connection supervisor, the presence coordinator, and the resource
/// lifecycle manager; at most one live session exists per client.
pub struct GroupSession {
    local_user: UserId,
    auth_token: String,
    resources: Arc<ResourceLifecycleManager>,
    supervisor: Arc<ConnectionSupervisor>,
    presence: Arc<PresenceCoordinator>,
    gate: Arc<ReconnectGate>,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl GroupSession {
    pub fn new(
        local_user: UserId,
        auth_token: impl Into<String>,
        config: SessionConfig,
        connector: Arc<dyn ChannelConnector>,
        resources: Arc<ResourceLifecycleManager>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let gate = Arc::new(ReconnectGate::default());
        let supervisor = ConnectionSupervisor::new(connector, config.clone(), Arc::clone(&gate));
        let presence = PresenceCoordinator::new(local_user.clone(), config.announce_debounce);
        Arc::new(Self {
            local_user,
            auth_token: auth_token.into(),
            resources,
            supervisor,
            presence,
            gate,
            inner: Mutex::new(SessionInner { active: None }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Starts a live session for the group. Rejected with a conflict while
    /// another session is active; a media permission failure surfaces
    /// synchronously and acquires nothing.
    pub async fn join(
        self: &Arc<Self>,
        group_id: GroupId,
        display_name: impl Into<String>,
        options: JoinOptions,
    ) -> Result<(), SessionError> {
        let display_name = display_name.into();
        {
            let inner = self.inner.lock().await;
            if let Some(active) = &inner.active {
                return Err(SessionError::AlreadyJoined(active.group_id.clone()));
            }
        }

        // Scarce resources are acquired before any network work so a
        // permission error rejects the join without a half-open channel.
        let _audio = self.resources.acquire_audio_context().await?;
        let capture = if options.enable_microphone {
            match self.resources.acquire_capture_stream().await {
                Ok(capture) => Some(capture),
                Err(err) => {
                    self.release_media(false).await;
                    return Err(err.into());
                }
            }
        } else {
            None
        };
        if options.start_muted {
            if let Some(capture) = &capture {
                if let Err(err) = capture.set_enabled(false).await {
                    warn!("session: muting capture on join failed: {err:#}");
                }
            }
        }

        let session_id = Uuid::new_v4();
        let self_state = SelfState {
            muted: options.start_muted,
            deafened: false,
            speaking: false,
            hand_raised: false,
            has_microphone: capture.is_some(),
            hidden: false,
            joined_at: Utc::now(),
        };
        let pump_task = self.spawn_event_pump();
        {
            let mut inner = self.inner.lock().await;
            if let Some(active) = &inner.active {
                // Lost a race with a concurrent join; roll back.
                let conflicting = active.group_id.clone();
                pump_task.abort();
                self.release_media(capture.is_some()).await;
                return Err(SessionError::AlreadyJoined(conflicting));
            }
            inner.active = Some(ActiveSession {
                session_id,
                group_id: group_id.clone(),
                display_name,
                created_at: Utc::now(),
                self_state,
                capture,
                pump_task,
            });
        }

        info!(session_id = %session_id, group_id = %group_id, "session: joining");
        self.supervisor
            .connect(ChannelOptions {
                group_id,
                auth_token: self.auth_token.clone(),
            })
            .await;
        self.emit_snapshot().await;
        Ok(())
    }

    /// Tears the session down: cancels queued announces and timers, releases
    /// media resources, then disconnects the channel. The three steps run
    /// independently so a failure in one never blocks the others. Idempotent.
    pub async fn leave(&self) {
        let Some(active) = self.inner.lock().await.active.take() else {
            return;
        };
        info!(
            session_id = %active.session_id,
            group_id = %active.group_id,
            uptime_secs = (Utc::now() - active.created_at).num_seconds(),
            "session: leaving"
        );
        active.pump_task.abort();

        self.presence.detach().await;

        if active.capture.is_some() {
            self.log_release(self.resources.release_capture_stream().await, "capture stream");
        }
        self.log_release(self.resources.release_audio_context().await, "audio context");

        self.supervisor.disconnect().await;
        self.presence.clear().await;
        self.emit_snapshot().await;
    }

    /// Critical teardown (logout, page unload): force-closes media resources
    /// regardless of outstanding holders, then runs the normal leave path.
    pub async fn shutdown(&self) {
        self.resources.force_close_all().await;
        self.leave().await;
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        let (payload, capture) = {
            let mut inner = self.inner.lock().await;
            let active = inner.active.as_mut().ok_or(SessionError::NotJoined)?;
            active.self_state.muted = muted;
            (
                active.presence_payload(&self.local_user),
                active.capture.clone(),
            )
        };
        // Device state follows the logical state, through the ref-counted
        // handle only.
        if let Some(capture) = capture {
            if let Err(err) = capture.set_enabled(!muted).await {
                warn!("session: capture toggle failed: {err:#}");
                let _ = self
                    .events
                    .send(SessionEvent::Error(format!("capture toggle failed: {err:#}")));
            }
        }
        self.emit_snapshot().await;
        self.presence.announce(payload).await;
        Ok(())
    }

    pub async fn set_deafened(&self, deafened: bool) -> Result<(), SessionError> {
        let payload = self
            .mutate_self(|state| state.deafened = deafened)
            .await?;
        self.emit_snapshot().await;
        self.presence.announce(payload).await;
        Ok(())
    }

    pub async fn set_hand_raised(&self, hand_raised: bool) -> Result<(), SessionError> {
        let payload = self
            .mutate_self(|state| state.hand_raised = hand_raised)
            .await?;
        self.emit_snapshot().await;
        self.presence.announce(payload).await;
        Ok(())
    }

    pub async fn set_speaking(&self, speaking: bool) -> Result<(), SessionError> {
        let payload = self
            .mutate_self(|state| state.speaking = speaking)
            .await?;
        self.emit_snapshot().await;
        self.presence.announce(payload).await;
        Ok(())
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let connection_state = self.supervisor.state().await;
        let participants = self.presence.participants().await;
        let inner = self.inner.lock().await;
        match &inner.active {
            Some(active) => SessionSnapshot {
                connection_state,
                participants,
                is_muted: active.self_state.muted,
                is_deafened: active.self_state.deafened,
                hand_raised: active.self_state.hand_raised,
                is_speaking: active.self_state.speaking,
            },
            None => SessionSnapshot {
                connection_state: ConnectionState::Idle,
                participants: Vec::new(),
                is_muted: false,
                is_deafened: false,
                hand_raised: false,
                is_speaking: false,
            },
        }
    }

    pub(crate) fn pause_reconnects(&self) {
        self.gate.pause();
        info!("session: reconnect attempts paused while hidden");
    }

    pub(crate) async fn resume_reconnects(&self) {
        let deferred = self.gate.resume();
        let expected_active = { self.inner.lock().await.active.is_some() };
        if !expected_active {
            return;
        }
        let state = self.supervisor.state().await;
        if deferred
            || matches!(
                state,
                ConnectionState::Reconnecting | ConnectionState::Failed
            )
        {
            info!("session: visible again, retrying immediately");
            self.supervisor.retry_now().await;
        }
    }

    async fn mutate_self(
        &self,
        apply: impl FnOnce(&mut SelfState),
    ) -> Result<SelfPresence, SessionError> {
        let mut inner = self.inner.lock().await;
        let active = inner.active.as_mut().ok_or(SessionError::NotJoined)?;
        apply(&mut active.self_state);
        Ok(active.presence_payload(&self.local_user))
    }

    async fn self_presence(&self) -> Option<SelfPresence> {
        let inner = self.inner.lock().await;
        inner
            .active
            .as_ref()
            .map(|active| active.presence_payload(&self.local_user))
    }

    async fn release_media(&self, capture_held: bool) {
        if capture_held {
            self.log_release(self.resources.release_capture_stream().await, "capture stream");
        }
        self.log_release(self.resources.release_audio_context().await, "audio context");
    }

    fn log_release(&self, result: Result<(), ResourceError>, resource: &str) {
        if let Err(err) = result {
            // Expected after a force-close; anything else is still teardown
            // and must not block the remaining steps.
            debug!("session: releasing {resource} reported: {err}");
        }
    }

    fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.supervisor.subscribe();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SupervisorEvent::StateChanged(ConnectionState::Connected) => {
                        if let Some(channel) = session.supervisor.channel().await {
                            session.presence.attach_channel(channel).await;
                        }
                        if let Some(payload) = session.self_presence().await {
                            session.presence.announce(payload).await;
                        }
                        session.emit_snapshot().await;
                    }
                    SupervisorEvent::StateChanged(state) => {
                        if state == ConnectionState::Failed {
                            let _ = session.events.send(SessionEvent::Error(
                                "connection failed after exhausting reconnect attempts"
                                    .to_string(),
                            ));
                        }
                        session.emit_snapshot().await;
                    }
                    SupervisorEvent::Presence(change) => {
                        if session.presence.apply_change(&change).await {
                            session.emit_snapshot().await;
                        }
                    }
                }
            }
        })
    }

    async fn emit_snapshot(&self) {
        let snapshot = self.snapshot().await;
        let _ = self.events.send(SessionEvent::SnapshotUpdated(snapshot));
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
