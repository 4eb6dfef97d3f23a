//! Users repository
//!
//! CRUD over the `users` table. Mutations publish the matching domain event
//! after the row is written; that wiring lives in the GraphQL layer, not here.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

type UserRow = (i64, String, String, i64, String, i64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub age: i64,
    pub profession: String,
    pub friendly: bool,
}

impl From<UserRow> for UserRecord {
    fn from(r: UserRow) -> Self {
        UserRecord {
            id: r.0,
            name: r.1,
            email: r.2,
            age: r.3,
            profession: r.4,
            friendly: r.5 != 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateUser {
    pub name: String,
    pub email: String,
    pub age: i64,
    pub profession: String,
    pub friendly: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub email: Option<String>,
    pub age: Option<i64>,
    pub profession: Option<String>,
    pub friendly: Option<bool>,
}

const USER_COLUMNS: &str = "id, name, email, age, profession, friendly";

pub struct UsersRepository {
    pool: SqlitePool,
}

impl UsersRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user
    pub async fn create(&self, user: CreateUser) -> Result<UserRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (name, email, age, profession, friendly)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.age)
        .bind(&user.profession)
        .bind(if user.friendly { 1 } else { 0 })
        .execute(&self.pool)
        .await?;

        self.get_by_id(result.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to create user"))
    }

    /// Get user by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserRecord::from))
    }

    /// Get user by email (case-insensitive)
    pub async fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ? COLLATE NOCASE"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserRecord::from))
    }

    /// List users, optionally filtered by name
    pub async fn list_by_name(&self, name: Option<&str>) -> Result<Vec<UserRecord>> {
        let rows = match name {
            Some(name) => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE name LIKE ? ORDER BY id"
                ))
                .bind(format!("%{name}%"))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {USER_COLUMNS} FROM users ORDER BY id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(UserRecord::from).collect())
    }

    /// Update user fields that are present in the payload
    pub async fn update(&self, id: i64, update: UpdateUser) -> Result<Option<UserRecord>> {
        if self.get_by_id(id).await?.is_none() {
            return Ok(None);
        }

        if let Some(name) = update.name {
            sqlx::query("UPDATE users SET name = ? WHERE id = ?")
                .bind(name)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(email) = update.email {
            sqlx::query("UPDATE users SET email = ? WHERE id = ?")
                .bind(email)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(age) = update.age {
            sqlx::query("UPDATE users SET age = ? WHERE id = ?")
                .bind(age)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(profession) = update.profession {
            sqlx::query("UPDATE users SET profession = ? WHERE id = ?")
                .bind(profession)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(friendly) = update.friendly {
            sqlx::query("UPDATE users SET friendly = ? WHERE id = ?")
                .bind(if friendly { 1 } else { 0 })
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        self.get_by_id(id).await
    }

    /// Delete user, returning the deleted record
    pub async fn delete(&self, id: i64) -> Result<Option<UserRecord>> {
        let Some(user) = self.get_by_id(id).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(Some(user))
    }

    /// Count users
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
