use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use channel_integration::{ChannelConnector, ChannelOptions, GroupChannel};
use shared::protocol::{ChannelEvent, ChannelStatus, PresenceChange};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Pause flag shared with the visibility layer. The supervisor consults it
/// when a reconnect timer fires: while paused the attempt is deferred and
/// recorded, so the visibility layer can trigger exactly one immediate
/// attempt when the page becomes visible again.
#[derive(Default)]
pub struct ReconnectGate {
    paused: AtomicBool,
    deferred: AtomicBool,
}

impl ReconnectGate {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clears the pause flag and reports whether a reconnect attempt was
    /// deferred while paused.
    pub fn resume(&self) -> bool {
        self.paused.store(false, Ordering::SeqCst);
        self.deferred.swap(false, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn defer(&self) {
        self.deferred.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged(ConnectionState),
    Presence(PresenceChange),
}

/// Owns exactly one channel handle and keeps it connected under unreliable
/// networks: bounded retries with exponential backoff, stale-timer fencing
/// through an epoch counter, and idempotent teardown.
pub struct ConnectionSupervisor {
    connector: Arc<dyn ChannelConnector>,
    config: SessionConfig,
    gate: Arc<ReconnectGate>,
    inner: Mutex<SupervisorInner>,
    events: broadcast::Sender<SupervisorEvent>,
}

struct SupervisorInner {
    state: ConnectionState,
    options: Option<ChannelOptions>,
    channel: Option<Arc<dyn GroupChannel>>,
    retry_count: u32,
    /// Bumped on every disconnect and fresh connect; timers and event pumps
    /// carry the epoch they were created under and bail out if it moved on,
    /// so no stale timer can resurrect a session after an explicit leave.
    epoch: u64,
    reconnect_enabled: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    event_pump: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        config: SessionConfig,
        gate: Arc<ReconnectGate>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            connector,
            config,
            gate,
            inner: Mutex::new(SupervisorInner {
                state: ConnectionState::Idle,
                options: None,
                channel: None,
                retry_count: 0,
                epoch: 0,
                reconnect_enabled: false,
                reconnect_timer: None,
                event_pump: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn channel(&self) -> Option<Arc<dyn GroupChannel>> {
        self.inner.lock().await.channel.clone()
    }

    /// No-op while already Connecting/Connected; otherwise starts a fresh
    /// connect cycle with the retry budget reset.
    pub async fn connect(self: &Arc<Self>, options: ChannelOptions) {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return;
            }
            inner.state = ConnectionState::Connecting;
            inner.options = Some(options.clone());
            inner.retry_count = 0;
            inner.reconnect_enabled = true;
            inner.epoch += 1;
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.epoch
        };
        info!(group_id = %options.group_id, "supervisor: connecting");
        let _ = self
            .events
            .send(SupervisorEvent::StateChanged(ConnectionState::Connecting));
        self.attempt(epoch).await;
    }

    /// Cancels any pending reconnect timer, unsubscribes the channel, and
    /// returns to Idle. Always succeeds and is idempotent.
    pub async fn disconnect(&self) {
        let (channel, timer, pump, was_idle) = {
            let mut inner = self.inner.lock().await;
            inner.reconnect_enabled = false;
            inner.epoch += 1;
            inner.retry_count = 0;
            inner.options = None;
            let was_idle = inner.state == ConnectionState::Idle;
            inner.state = ConnectionState::Idle;
            (
                inner.channel.take(),
                inner.reconnect_timer.take(),
                inner.event_pump.take(),
                was_idle,
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(channel) = channel {
            if let Err(err) = channel.unsubscribe().await {
                warn!("supervisor: unsubscribe during disconnect failed: {err:#}");
            }
        }
        if !was_idle {
            info!("supervisor: disconnected");
            let _ = self
                .events
                .send(SupervisorEvent::StateChanged(ConnectionState::Idle));
        }
    }

    /// One immediate attempt bypassing the remaining backoff wait. Used by
    /// the visibility layer when the page becomes visible while the session
    /// is Reconnecting or Failed.
    pub async fn retry_now(self: &Arc<Self>) {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if !inner.reconnect_enabled {
                return;
            }
            match inner.state {
                ConnectionState::Reconnecting | ConnectionState::Failed => {}
                _ => return,
            }
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.state = ConnectionState::Reconnecting;
            inner.epoch
        };
        info!("supervisor: immediate reconnect attempt");
        let _ = self.events.send(SupervisorEvent::StateChanged(
            ConnectionState::Reconnecting,
        ));
        self.attempt(epoch).await;
    }

    async fn attempt(self: &Arc<Self>, epoch: u64) {
        let options = {
            let inner = self.inner.lock().await;
            if inner.epoch != epoch || !inner.reconnect_enabled {
                return;
            }
            match inner.options.clone() {
                Some(options) => options,
                None => return,
            }
        };

        match self.connector.open(options).await {
            Ok(channel) => {
                // Take the event receiver before subscribing so the initial
                // status cannot be missed.
                let receiver = channel.subscribe_events();
                {
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch || !inner.reconnect_enabled {
                        return;
                    }
                    inner.channel = Some(Arc::clone(&channel));
                    if let Some(pump) = inner.event_pump.take() {
                        pump.abort();
                    }
                    inner.event_pump = Some(self.spawn_event_pump(epoch, receiver));
                }
                if let Err(err) = channel.subscribe().await {
                    warn!("supervisor: channel subscribe failed: {err:#}");
                    self.handle_channel_failure(epoch, ChannelStatus::ChannelError)
                        .await;
                }
            }
            Err(err) => {
                warn!("supervisor: channel open failed: {err:#}");
                self.handle_channel_failure(epoch, ChannelStatus::ChannelError)
                    .await;
            }
        }
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        epoch: u64,
        mut receiver: broadcast::Receiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                match event {
                    ChannelEvent::Status(ChannelStatus::Subscribed) => {
                        supervisor.handle_subscribed(epoch).await;
                    }
                    ChannelEvent::Status(
                        status @ (ChannelStatus::ChannelError | ChannelStatus::TimedOut),
                    ) => {
                        supervisor.handle_channel_failure(epoch, status).await;
                    }
                    ChannelEvent::Status(ChannelStatus::Closed) => {
                        // Follows an explicit unsubscribe; the disconnect
                        // path already handled state.
                    }
                    ChannelEvent::Presence(change) => {
                        let _ = supervisor.events.send(SupervisorEvent::Presence(change));
                    }
                }
            }
        })
    }

    async fn handle_subscribed(&self, epoch: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.state = ConnectionState::Connected;
            inner.retry_count = 0;
        }
        info!("supervisor: channel subscribed");
        let _ = self
            .events
            .send(SupervisorEvent::StateChanged(ConnectionState::Connected));
    }

    async fn handle_channel_failure(self: &Arc<Self>, epoch: u64, status: ChannelStatus) {
        let next_state = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || !inner.reconnect_enabled {
                return;
            }
            inner.channel = None;
            inner.retry_count += 1;
            if inner.retry_count >= self.config.max_reconnect_attempts {
                inner.state = ConnectionState::Failed;
                error!(
                    ?status,
                    attempts = inner.retry_count,
                    "supervisor: retry budget exhausted, giving up"
                );
                ConnectionState::Failed
            } else {
                inner.state = ConnectionState::Reconnecting;
                let delay = self.config.backoff_delay(inner.retry_count);
                warn!(
                    ?status,
                    attempt = inner.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "supervisor: channel failure, reconnect scheduled"
                );
                if let Some(timer) = inner.reconnect_timer.take() {
                    timer.abort();
                }
                let supervisor = Arc::clone(self);
                inner.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    supervisor.fire_reconnect(epoch).await;
                }));
                ConnectionState::Reconnecting
            }
        };
        let _ = self.events.send(SupervisorEvent::StateChanged(next_state));
    }

    // Boxed (rather than `async fn`) to break the recursive opaque-future
    // cycle attempt -> handle_channel_failure -> fire_reconnect -> attempt,
    // which otherwise keeps the compiler from proving the futures are Send.
    fn fire_reconnect<'a>(
        self: &'a Arc<Self>,
        epoch: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            {
                let inner = self.inner.lock().await;
                if inner.epoch != epoch || !inner.reconnect_enabled {
                    return;
                }
            }
            if self.gate.is_paused() {
                self.gate.defer();
                info!("supervisor: reconnect deferred while hidden");
                return;
            }
            self.attempt(epoch).await;
        })
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
