//! User rows

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{db_err, from_db_time, to_db_time};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub salt: String,
    pub role: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        salt: row.get("salt"),
        role: row.get("role"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: from_db_time(row.get("created_at"))?,
    })
}

pub async fn get_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load user", e))?;
    row.as_ref().map(row_to_user).transpose()
}

pub async fn count(pool: &SqlitePool) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count users", e))?;
    Ok(count as usize)
}

pub async fn insert(pool: &SqlitePool, user: &User) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, username, password_hash, salt, role, enabled, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.username)
    .bind(&user.password_hash)
    .bind(&user.salt)
    .bind(&user.role)
    .bind(user.enabled as i64)
    .bind(to_db_time(user.created_at))
    .execute(pool)
    .await
    .map_err(|e| {
        if matches!(&e, sqlx::Error::Database(d) if d.message().contains("UNIQUE")) {
            Error::Validation(format!("user '{}' already exists", user.username))
        } else {
            db_err("failed to insert user", e)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn sample(username: &str) -> User {
        User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: "hash".to_string(),
            salt: "salt".to_string(),
            role: "admin".to_string(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let db = test_db().await;
        assert_eq!(count(db.pool()).await.unwrap(), 0);
        insert(db.pool(), &sample("admin")).await.unwrap();
        let user = get_by_username(db.pool(), "admin").await.unwrap().unwrap();
        assert!(user.enabled);
        assert!(get_by_username(db.pool(), "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let db = test_db().await;
        insert(db.pool(), &sample("admin")).await.unwrap();
        let err = insert(db.pool(), &sample("admin")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
