use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use glimpse_protocol::UserStatus;

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub status: String,
    pub avatar_url: Option<String>,
    pub last_seen: DateTime<Utc>,
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> UserRow {
    UserRow {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        status: row.get("status"),
        avatar_url: row.get("avatar_url"),
        last_seen: row.get("last_seen"),
    }
}

pub async fn create_user(
    pool: &PgPool,
    name: &str,
    email: &str,
    password_hash: &str,
) -> Result<UserRow, sqlx::Error> {
    let row = sqlx::query(
        r#"INSERT INTO users (name, email, password_hash)
           VALUES ($1, $2, $3)
           RETURNING id, name, email, status, avatar_url, last_seen"#,
    )
    .bind(name)
    .bind(email)
    .bind(password_hash)
    .fetch_one(pool)
    .await?;
    Ok(row_to_user(&row))
}

/// Login lookup; the hash is returned separately so it never rides on the
/// row type handlers serialize.
pub async fn find_by_email(
    pool: &PgPool,
    email: &str,
) -> Result<Option<(UserRow, String)>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, email, status, avatar_url, last_seen, password_hash FROM users WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| {
        let hash: String = row.get("password_hash");
        (row_to_user(&row), hash)
    }))
}

pub async fn get_user(pool: &PgPool, user_id: i64) -> Result<Option<UserRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, email, status, avatar_url, last_seen FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_user))
}

pub async fn list_users(pool: &PgPool) -> Result<Vec<UserRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, name, email, status, avatar_url, last_seen FROM users ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_user).collect())
}

pub async fn update_profile(
    pool: &PgPool,
    user_id: i64,
    name: Option<&str>,
    avatar_url: Option<&str>,
) -> Result<Option<UserRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"UPDATE users
           SET name = COALESCE($2, name), avatar_url = COALESCE($3, avatar_url)
           WHERE id = $1
           RETURNING id, name, email, status, avatar_url, last_seen"#,
    )
    .bind(user_id)
    .bind(name)
    .bind(avatar_url)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_user))
}

/// Denormalized presence mirror; the hub writes it on every transition and
/// never reads it back during signaling.
pub async fn update_status(
    pool: &PgPool,
    user_id: i64,
    status: UserStatus,
    last_seen: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET status = $2, last_seen = $3 WHERE id = $1")
        .bind(user_id)
        .bind(status.as_str())
        .bind(last_seen)
        .execute(pool)
        .await?;
    Ok(())
}

/// Startup cleanup: no client is connected yet, so any lingering
/// online/busy rows are stale from an unclean shutdown.
pub async fn reset_statuses(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET status = 'offline' WHERE status <> 'offline'")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
