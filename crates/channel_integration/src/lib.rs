use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::GroupId,
    protocol::{ChannelEvent, SelfPresence},
};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub group_id: GroupId,
    pub auth_token: String,
}

/// One pub/sub channel scoped to a single group. Implementations wrap the
/// real transport; the coordinator only ever talks to this trait.
#[async_trait]
pub trait GroupChannel: Send + Sync {
    async fn subscribe(&self) -> anyhow::Result<()>;
    async fn unsubscribe(&self) -> anyhow::Result<()>;
    /// Broadcast the local user's presence payload to the channel.
    async fn track(&self, presence: SelfPresence) -> anyhow::Result<()>;
    /// Full presence state as last seen by the transport, keyed by user id.
    fn presence_state(&self) -> HashMap<String, Vec<Value>>;
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, options: ChannelOptions) -> anyhow::Result<Arc<dyn GroupChannel>>;
}

pub struct MissingChannelConnector;

#[async_trait]
impl ChannelConnector for MissingChannelConnector {
    async fn open(&self, options: ChannelOptions) -> anyhow::Result<Arc<dyn GroupChannel>> {
        Err(anyhow!(
            "realtime channel backend unavailable for group {}",
            options.group_id
        ))
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("media backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait AudioContextHandle: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CaptureStreamHandle: Send + Sync + std::fmt::Debug {
    /// Enable or disable the underlying input track without releasing it.
    async fn set_enabled(&self, enabled: bool) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// The scarce hardware side: one audio context and one microphone capture
/// stream per process. Construction may fail with a permission error, which
/// is surfaced to the caller and never retried.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn open_audio_context(&self) -> Result<Arc<dyn AudioContextHandle>, MediaError>;
    async fn open_capture_stream(&self) -> Result<Arc<dyn CaptureStreamHandle>, MediaError>;
}

pub struct MissingMediaBackend;

#[async_trait]
impl MediaBackend for MissingMediaBackend {
    async fn open_audio_context(&self) -> Result<Arc<dyn AudioContextHandle>, MediaError> {
        Err(MediaError::DeviceUnavailable(
            "no media backend configured".to_string(),
        ))
    }

    async fn open_capture_stream(&self) -> Result<Arc<dyn CaptureStreamHandle>, MediaError> {
        Err(MediaError::DeviceUnavailable(
            "no media backend configured".to_string(),
        ))
    }
}
