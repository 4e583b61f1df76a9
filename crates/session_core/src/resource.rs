use std::sync::Arc;

use channel_integration::{AudioContextHandle, CaptureStreamHandle, MediaBackend, MediaError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("release called with zero outstanding references to {resource}")]
    ReleaseUnderflow { resource: &'static str },
}

struct Slot<T: ?Sized> {
    refcount: u32,
    resource: Option<Arc<T>>,
}

impl<T: ?Sized> Slot<T> {
    fn new() -> Self {
        Self {
            refcount: 0,
            resource: None,
        }
    }
}

/// Ref-counted ownership of the process-wide media resources. Exactly one
/// audio context and one capture stream exist no matter how many logical
/// components request them; the underlying resource is closed when the last
/// holder releases it.
///
/// Owned by the composition root and passed by reference to the session
/// facade; there is no hidden global instance.
pub struct ResourceLifecycleManager {
    backend: Arc<dyn MediaBackend>,
    audio: Mutex<Slot<dyn AudioContextHandle>>,
    capture: Mutex<Slot<dyn CaptureStreamHandle>>,
}

impl ResourceLifecycleManager {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            audio: Mutex::new(Slot::new()),
            capture: Mutex::new(Slot::new()),
        }
    }

    /// Construction failures (e.g. permission denied) surface to the caller
    /// and leave the refcount untouched.
    pub async fn acquire_audio_context(&self) -> Result<Arc<dyn AudioContextHandle>, MediaError> {
        let mut slot = self.audio.lock().await;
        let handle = match slot.resource.as_ref() {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = self.backend.open_audio_context().await?;
                slot.resource = Some(Arc::clone(&handle));
                handle
            }
        };
        slot.refcount += 1;
        Ok(handle)
    }

    pub async fn acquire_capture_stream(&self) -> Result<Arc<dyn CaptureStreamHandle>, MediaError> {
        let mut slot = self.capture.lock().await;
        let handle = match slot.resource.as_ref() {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = self.backend.open_capture_stream().await?;
                slot.resource = Some(Arc::clone(&handle));
                handle
            }
        };
        slot.refcount += 1;
        Ok(handle)
    }

    pub async fn release_audio_context(&self) -> Result<(), ResourceError> {
        let closed = {
            let mut slot = self.audio.lock().await;
            if slot.refcount == 0 {
                return Err(ResourceError::ReleaseUnderflow {
                    resource: "audio_context",
                });
            }
            slot.refcount -= 1;
            if slot.refcount == 0 {
                slot.resource.take()
            } else {
                None
            }
        };
        if let Some(handle) = closed {
            if let Err(err) = handle.close().await {
                warn!("resource: audio context close failed: {err:#}");
            }
        }
        Ok(())
    }

    pub async fn release_capture_stream(&self) -> Result<(), ResourceError> {
        let closed = {
            let mut slot = self.capture.lock().await;
            if slot.refcount == 0 {
                return Err(ResourceError::ReleaseUnderflow {
                    resource: "capture_stream",
                });
            }
            slot.refcount -= 1;
            if slot.refcount == 0 {
                slot.resource.take()
            } else {
                None
            }
        };
        if let Some(handle) = closed {
            if let Err(err) = handle.close().await {
                warn!("resource: capture stream close failed: {err:#}");
            }
        }
        Ok(())
    }

    /// Immediate teardown regardless of outstanding holders. Only for
    /// critical paths (logout, page unload) where graceful release ordering
    /// cannot be guaranteed.
    pub async fn force_close_all(&self) {
        let capture = {
            let mut slot = self.capture.lock().await;
            slot.refcount = 0;
            slot.resource.take()
        };
        if let Some(handle) = capture {
            if let Err(err) = handle.close().await {
                warn!("resource: forced capture stream close failed: {err:#}");
            }
        }

        let audio = {
            let mut slot = self.audio.lock().await;
            slot.refcount = 0;
            slot.resource.take()
        };
        if let Some(handle) = audio {
            if let Err(err) = handle.close().await {
                warn!("resource: forced audio context close failed: {err:#}");
            }
        }

        info!("resource: force-closed all media resources");
    }

    pub async fn audio_context_refcount(&self) -> u32 {
        self.audio.lock().await.refcount
    }

    pub async fn capture_stream_refcount(&self) -> u32 {
        self.capture.lock().await.refcount
    }
}

#[cfg(test)]
#[path = "tests/resource_tests.rs"]
mod tests;
