use channel_integration::MediaError;
use shared::domain::GroupId;
use thiserror::Error;

use crate::resource::ResourceError;

/// Errors surfaced by the session facade. Transient network failures are
/// recovered internally by the supervisor and never appear here; what does
/// appear requires user-facing handling.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a live session is already active for group {0}")]
    AlreadyJoined(GroupId),
    #[error("no active session")]
    NotJoined,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}
