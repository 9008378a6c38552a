pub mod auth;
pub mod calls;
pub mod history;
pub mod response;
pub mod users;

use serde_json::{json, Value};

use crate::repo::users::UserRow;

/// Wire form of a user row; the password hash never leaves the repo layer.
pub(crate) fn user_json(user: &UserRow) -> Value {
    json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
        "status": user.status,
        "avatarUrl": user.avatar_url,
        "lastSeen": user.last_seen.to_rfc3339(),
    })
}
