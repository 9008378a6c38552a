//! Passwords and opaque session tokens.
//!
//! Login mints a random token and stores only its SHA-256 hash; the
//! WebSocket upgrade and every authenticated REST handler resolve the
//! presented token back to a user id.  Logout revokes the row.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

const TOKEN_LEN: usize = 48;

pub struct TokenClaims {
    pub user_id: i64,
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

fn token_hash(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

/// Mint a session token for the user and persist its hash.  The raw token
/// is returned exactly once; only the hash ever touches the store.
pub async fn issue_token(pool: &PgPool, user_id: i64) -> Result<String, sqlx::Error> {
    let raw: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect();
    sqlx::query("INSERT INTO session_tokens (user_id, token_hash, created_at) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(token_hash(&raw))
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(raw)
}

pub async fn validate_token(pool: &PgPool, raw_token: &str) -> Option<TokenClaims> {
    let row = sqlx::query(
        "SELECT user_id FROM session_tokens WHERE token_hash = $1 AND revoked_at IS NULL",
    )
    .bind(token_hash(raw_token))
    .fetch_optional(pool)
    .await
    .ok()??;
    Some(TokenClaims {
        user_id: row.get("user_id"),
    })
}

pub async fn revoke_token(pool: &PgPool, raw_token: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE session_tokens SET revoked_at = $1 WHERE token_hash = $2")
        .bind(Utc::now())
        .bind(token_hash(raw_token))
        .execute(pool)
        .await?;
    Ok(())
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
