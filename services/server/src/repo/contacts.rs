use sqlx::{PgPool, Row};

use super::users::UserRow;

pub async fn add_contact(
    pool: &PgPool,
    user_id: i64,
    contact_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO contacts (user_id, contact_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(user_id)
    .bind(contact_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_contacts(pool: &PgPool, user_id: i64) -> Result<Vec<UserRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT u.id, u.name, u.email, u.status, u.avatar_url, u.last_seen
           FROM contacts c
           JOIN users u ON u.id = c.contact_id
           WHERE c.user_id = $1
           ORDER BY u.name"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| UserRow {
            id: row.get("id"),
            name: row.get("name"),
            email: row.get("email"),
            status: row.get("status"),
            avatar_url: row.get("avatar_url"),
            last_seen: row.get("last_seen"),
        })
        .collect())
}
