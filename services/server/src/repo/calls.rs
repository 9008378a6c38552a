use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use glimpse_protocol::{CallRecord, CallStatus};

fn parse_status(raw: &str) -> CallStatus {
    match raw {
        "ongoing" => CallStatus::Ongoing,
        "ended" => CallStatus::Ended,
        "missed" => CallStatus::Missed,
        _ => CallStatus::Ringing,
    }
}

/// Persist a new ringing call with its ordered callee set and return the
/// wire record.  SDP never lands here; offers ride only on the in-memory
/// copy the call session holds.
pub async fn create_call(
    pool: &PgPool,
    caller_id: i64,
    callee_ids: &[i64],
) -> Result<CallRecord, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "INSERT INTO calls (caller_id) VALUES ($1) RETURNING id, start_time, status",
    )
    .bind(caller_id)
    .fetch_one(&mut *tx)
    .await?;
    let call_id: i64 = row.get("id");
    for (position, callee_id) in callee_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO call_callees (call_id, user_id, position) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(call_id)
        .bind(callee_id)
        .bind(i32::try_from(position).unwrap_or(i32::MAX))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(CallRecord {
        id: call_id,
        caller_id,
        callee_ids: callee_ids.to_vec(),
        start_time: row.get("start_time"),
        end_time: None,
        status: parse_status(row.get("status")),
        offer: None,
        answer: None,
    })
}

pub async fn get_call(pool: &PgPool, call_id: i64) -> Result<Option<CallRecord>, sqlx::Error> {
    let Some(row) = sqlx::query(
        "SELECT id, caller_id, start_time, end_time, status FROM calls WHERE id = $1",
    )
    .bind(call_id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let callee_rows = sqlx::query(
        "SELECT user_id FROM call_callees WHERE call_id = $1 ORDER BY position",
    )
    .bind(call_id)
    .fetch_all(pool)
    .await?;

    let status: String = row.get("status");
    Ok(Some(CallRecord {
        id: row.get("id"),
        caller_id: row.get("caller_id"),
        callee_ids: callee_rows.iter().map(|r| r.get("user_id")).collect(),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        status: parse_status(&status),
        offer: None,
        answer: None,
    }))
}

pub async fn set_status(
    pool: &PgPool,
    call_id: i64,
    status: CallStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE calls SET status = $2 WHERE id = $1")
        .bind(call_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn finish(
    pool: &PgPool,
    call_id: i64,
    status: CallStatus,
    end_time: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE calls SET status = $2, end_time = $3 WHERE id = $1")
        .bind(call_id)
        .bind(status.as_str())
        .bind(end_time)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn add_callee(pool: &PgPool, call_id: i64, user_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO call_callees (call_id, user_id, position)
           SELECT $1, $2, COALESCE(MAX(position) + 1, 0) FROM call_callees WHERE call_id = $1
           ON CONFLICT DO NOTHING"#,
    )
    .bind(call_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}
