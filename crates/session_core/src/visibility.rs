use std::sync::Arc;

use crate::session::GroupSession;

/// Bridges page visibility to the session: while hidden, reconnect attempts
/// are paused (existing connections stay up and logical session state is
/// kept); on return to visibility, a session stuck in Reconnecting or Failed
/// gets exactly one immediate attempt, bypassing the remaining backoff wait.
pub struct VisibilityGate {
    session: Arc<GroupSession>,
}

impl VisibilityGate {
    pub fn new(session: Arc<GroupSession>) -> Self {
        Self { session }
    }

    pub fn on_hidden(&self) {
        self.session.pause_reconnects();
    }

    pub async fn on_visible(&self) {
        self.session.resume_reconnects().await;
    }
}
