use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use trellis_common::{Error, Result};

use crate::sql_store::SqlStore;

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 5;
pub const MAX_PAGE: i64 = 100;

/// Row of the `user` table. `id` is assigned by the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub age: i64,
}

impl User {
    pub fn new(name: impl Into<String>, age: i64) -> Self {
        Self {
            id: None,
            name: name.into(),
            age,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        if self.age < 0 {
            return Err(Error::Validation("age must not be negative".into()));
        }
        Ok(())
    }
}

/// A page of a listing. Out-of-range inputs fall back to the defaults
/// instead of failing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub page: i64,
    pub size: i64,
}

impl Page {
    pub fn from_params(page: Option<i64>, size: Option<i64>) -> Self {
        let size = size
            .filter(|s| (1..=MAX_PAGE_SIZE).contains(s))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let page = page.filter(|p| (1..=MAX_PAGE).contains(p)).unwrap_or(1);
        Self { page, size }
    }

    pub fn offset(&self) -> i64 {
        self.size * (self.page - 1)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::from_params(None, None)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        age: row.get(2)?,
    })
}

impl SqlStore {
    pub fn list_users(&self, page: Page) -> Result<Vec<User>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(r#"SELECT id, name, age FROM "user" ORDER BY id LIMIT ?1 OFFSET ?2"#)
            .map_err(|e| Error::Database(format!("failed to prepare user listing: {e}")))?;

        stmt.query_map(params![page.size, page.offset()], row_to_user)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::Database(format!("failed to list users: {e}")))
    }

    pub fn get_user(&self, id: i64) -> Result<User> {
        self.connection()?
            .query_row(
                r#"SELECT id, name, age FROM "user" WHERE id = ?1"#,
                [id],
                row_to_user,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load user {id}: {e}")))?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    pub fn create_user(&self, user: &User) -> Result<User> {
        user.validate()?;
        let conn = self.connection()?;
        conn.execute(
            r#"INSERT INTO "user" (name, age) VALUES (?1, ?2)"#,
            params![user.name, user.age],
        )
        .map_err(|e| Error::Database(format!("failed to insert user: {e}")))?;

        Ok(User {
            id: Some(conn.last_insert_rowid()),
            ..user.clone()
        })
    }

    pub fn update_user(&self, id: i64, user: &User) -> Result<User> {
        user.validate()?;
        let updated = self
            .connection()?
            .execute(
                r#"UPDATE "user" SET name = ?1, age = ?2 WHERE id = ?3"#,
                params![user.name, user.age, id],
            )
            .map_err(|e| Error::Database(format!("failed to update user {id}: {e}")))?;

        if updated == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(User {
            id: Some(id),
            ..user.clone()
        })
    }

    pub fn delete_user(&self, id: i64) -> Result<()> {
        let deleted = self
            .connection()?
            .execute(r#"DELETE FROM "user" WHERE id = ?1"#, [id])
            .map_err(|e| Error::Database(format!("failed to delete user {id}: {e}")))?;

        if deleted == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    pub fn insert_customer(&self, name: &str) -> Result<i64> {
        if name.trim().is_empty() {
            return Err(Error::Validation("customer name must not be empty".into()));
        }
        let conn = self.connection()?;
        conn.execute("INSERT INTO customers (name) VALUES (?1)", [name])
            .map_err(|e| Error::Database(format!("failed to insert customer: {e}")))?;
        Ok(conn.last_insert_rowid())
    }
}
