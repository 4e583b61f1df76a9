use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use channel_integration::{
    AudioContextHandle, CaptureStreamHandle, ChannelConnector, ChannelOptions, GroupChannel,
    MediaBackend, MediaError,
};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{ChannelEvent, ChannelStatus, SelfPresence},
};
use tokio::sync::{broadcast, Mutex};

pub(crate) struct MockChannel {
    pub events_tx: broadcast::Sender<ChannelEvent>,
    pub tracked: Arc<Mutex<Vec<SelfPresence>>>,
    pub remote_state: StdMutex<HashMap<String, Vec<Value>>>,
    pub subscribe_calls: Arc<Mutex<u32>>,
    pub unsubscribe_calls: Arc<Mutex<u32>>,
    pub fail_track: AtomicBool,
    ack_subscribe: bool,
}

impl MockChannel {
    pub fn new(ack_subscribe: bool) -> Arc<Self> {
        Arc::new(Self {
            events_tx: broadcast::channel(64).0,
            tracked: Arc::new(Mutex::new(Vec::new())),
            remote_state: StdMutex::new(HashMap::new()),
            subscribe_calls: Arc::new(Mutex::new(0)),
            unsubscribe_calls: Arc::new(Mutex::new(0)),
            fail_track: AtomicBool::new(false),
            ack_subscribe,
        })
    }

    pub fn insert_presence(&self, presence: &SelfPresence) {
        let value = serde_json::to_value(presence).expect("serialize presence");
        self.remote_state
            .lock()
            .expect("remote state lock")
            .insert(presence.user_id.as_str().to_string(), vec![value]);
    }

    pub fn insert_raw(&self, key: &str, metas: Vec<Value>) {
        self.remote_state
            .lock()
            .expect("remote state lock")
            .insert(key.to_string(), metas);
    }

    pub fn emit_status(&self, status: ChannelStatus) {
        let _ = self.events_tx.send(ChannelEvent::Status(status));
    }
}

#[async_trait]
impl GroupChannel for MockChannel {
    async fn subscribe(&self) -> anyhow::Result<()> {
        *self.subscribe_calls.lock().await += 1;
        if self.ack_subscribe {
            self.emit_status(ChannelStatus::Subscribed);
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> anyhow::Result<()> {
        *self.unsubscribe_calls.lock().await += 1;
        Ok(())
    }

    async fn track(&self, presence: SelfPresence) -> anyhow::Result<()> {
        if self.fail_track.load(Ordering::SeqCst) {
            return Err(anyhow!("track rejected by transport"));
        }
        self.tracked.lock().await.push(presence);
        Ok(())
    }

    fn presence_state(&self) -> HashMap<String, Vec<Value>> {
        self.remote_state.lock().expect("remote state lock").clone()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }
}

pub(crate) struct MockConnector {
    channel: StdMutex<Arc<MockChannel>>,
    pub open_calls: Arc<Mutex<Vec<(ChannelOptions, tokio::time::Instant)>>>,
    pub fail_opens: AtomicBool,
}

impl MockConnector {
    pub fn new(channel: Arc<MockChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel: StdMutex::new(channel),
            open_calls: Arc::new(Mutex::new(Vec::new())),
            fail_opens: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_opens.store(failing, Ordering::SeqCst);
    }

    pub async fn open_count(&self) -> usize {
        self.open_calls.lock().await.len()
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn open(&self, options: ChannelOptions) -> anyhow::Result<Arc<dyn GroupChannel>> {
        self.open_calls
            .lock()
            .await
            .push((options, tokio::time::Instant::now()));
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(anyhow!("transport unreachable"));
        }
        let channel = self.channel.lock().expect("channel lock").clone();
        Ok(channel)
    }
}

pub(crate) struct MockAudioContext {
    pub close_calls: Arc<Mutex<u32>>,
}

#[async_trait]
impl AudioContextHandle for MockAudioContext {
    async fn close(&self) -> anyhow::Result<()> {
        *self.close_calls.lock().await += 1;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MockCaptureStream {
    pub close_calls: Arc<Mutex<u32>>,
    pub enabled_calls: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl CaptureStreamHandle for MockCaptureStream {
    async fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.enabled_calls.lock().await.push(enabled);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        *self.close_calls.lock().await += 1;
        Ok(())
    }
}

pub(crate) struct MockMediaBackend {
    pub audio: Arc<MockAudioContext>,
    pub capture: Arc<MockCaptureStream>,
    pub audio_opens: Arc<Mutex<u32>>,
    pub capture_opens: Arc<Mutex<u32>>,
    pub deny_audio: AtomicBool,
    pub deny_capture: AtomicBool,
}

impl MockMediaBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            audio: Arc::new(MockAudioContext {
                close_calls: Arc::new(Mutex::new(0)),
            }),
            capture: Arc::new(MockCaptureStream {
                close_calls: Arc::new(Mutex::new(0)),
                enabled_calls: Arc::new(Mutex::new(Vec::new())),
            }),
            audio_opens: Arc::new(Mutex::new(0)),
            capture_opens: Arc::new(Mutex::new(0)),
            deny_audio: AtomicBool::new(false),
            deny_capture: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MediaBackend for MockMediaBackend {
    async fn open_audio_context(&self) -> Result<Arc<dyn AudioContextHandle>, MediaError> {
        if self.deny_audio.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "audio output blocked".to_string(),
            ));
        }
        *self.audio_opens.lock().await += 1;
        Ok(Arc::clone(&self.audio) as Arc<dyn AudioContextHandle>)
    }

    async fn open_capture_stream(&self) -> Result<Arc<dyn CaptureStreamHandle>, MediaError> {
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "microphone access denied".to_string(),
            ));
        }
        *self.capture_opens.lock().await += 1;
        Ok(Arc::clone(&self.capture) as Arc<dyn CaptureStreamHandle>)
    }
}

pub(crate) fn sample_presence(user_id: &str, display_name: &str) -> SelfPresence {
    SelfPresence {
        user_id: UserId::new(user_id),
        display_name: display_name.to_string(),
        muted: false,
        deafened: false,
        speaking: false,
        hand_raised: false,
        has_microphone: true,
        hidden: false,
        joined_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("timestamp"),
    }
}

/// Lets spawned event-pump chains run to completion under a paused clock.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
