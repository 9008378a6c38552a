use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use glimpse_protocol::CallStatus;

pub struct HistoryRow {
    pub id: i64,
    pub user_id: i64,
    pub call_id: i64,
    pub status: String,
    pub role: String,
    pub end_time: DateTime<Utc>,
    pub caller_id: i64,
    pub start_time: DateTime<Utc>,
}

/// One row per participant per terminated call.
pub async fn insert(
    pool: &PgPool,
    user_id: i64,
    call_id: i64,
    status: CallStatus,
    role: &str,
    end_time: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO history (user_id, call_id, status, role, end_time) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(user_id)
    .bind(call_id)
    .bind(status.as_str())
    .bind(role)
    .bind(end_time)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_for_user(pool: &PgPool, user_id: i64) -> Result<Vec<HistoryRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT h.id, h.user_id, h.call_id, h.status, h.role, h.end_time,
                  c.caller_id, c.start_time
           FROM history h
           JOIN calls c ON c.id = h.call_id
           WHERE h.user_id = $1
           ORDER BY h.end_time DESC"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| HistoryRow {
            id: row.get("id"),
            user_id: row.get("user_id"),
            call_id: row.get("call_id"),
            status: row.get("status"),
            role: row.get("role"),
            end_time: row.get("end_time"),
            caller_id: row.get("caller_id"),
            start_time: row.get("start_time"),
        })
        .collect())
}
