//! Credential store backed by a single SQLite table.
//!
use std::str::FromStr;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqlitePool,
};

use crate::error::AppError;

/// Schema created at startup if absent.
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL
)
"#;

/// A registered user. `password` holds the PHC string of the argon2 hash.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Open the database (creating the file if needed) and make sure the schema exists.
pub async fn connect(database_url: &str) -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // Every connection to an in-memory database sees its own empty database
    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::query(SQLITE_INIT).execute(&pool).await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a user. The email and the username must not be on file yet.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AppError> {
        if self.exists("email", email).await? {
            return Err(AppError::EmailTaken);
        }
        if self.exists("username", username).await? {
            return Err(AppError::UsernameTaken);
        }

        let password = password.to_owned();
        let hashed = tokio::task::spawn_blocking(move || hash_password(&password)).await??;

        let result = sqlx::query("INSERT INTO users (username, email, password) VALUES (?, ?, ?)")
            .bind(username)
            .bind(email)
            .bind(&hashed)
            .execute(&self.pool)
            .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            // Lost a race against a concurrent signup
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(if e.message().contains("users.email") {
                    AppError::EmailTaken
                } else {
                    AppError::UsernameTaken
                });
            }
            Err(e) => return Err(e.into()),
        };

        log::info!("Registered user {} ({})", username, id);

        Ok(User {
            id,
            username: username.to_owned(),
            email: email.to_owned(),
            password: hashed,
        })
    }

    /// Check a username/password pair.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User, AppError> {
        let user = self
            .find_by_username(username)
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        let password = password.to_owned();
        let hash = user.password.clone();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await?;

        if valid {
            Ok(user)
        } else {
            Err(AppError::InvalidCredentials)
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let rec: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(rec.0)
    }

    async fn exists(&self, column: &'static str, value: &str) -> Result<bool, AppError> {
        let query = format!("SELECT COUNT(*) FROM users WHERE {column} = ?");
        let rec: (i64,) = sqlx::query_as(&query)
            .bind(value)
            .fetch_one(&self.pool)
            .await?;
        Ok(rec.0 > 0)
    }
}

fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::PasswordHash(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            log::warn!("Stored password hash is unreadable: {e}");
            false
        }
    }
}
