mod memory;

pub use memory::InMemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite,
};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Ballot, BallotDraft, BallotOption};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored data is malformed: {0}")]
    Corrupt(String),

    #[error("ballot {0} does not exist")]
    MissingBallot(String),

    #[error("option {option_id} does not belong to ballot {ballot_id}")]
    MissingOption { ballot_id: String, option_id: i64 },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for ballots and votes.
///
/// `persist_vote` must have committed by the time it returns `Ok`.
#[async_trait]
pub trait BallotRepository: Send + Sync {
    async fn list_ballots(&self) -> Result<Vec<Ballot>, RepositoryError>;

    async fn load_ballot(&self, ballot_id: &str) -> Result<Option<Ballot>, RepositoryError>;

    async fn create_ballot(
        &self,
        ballot_id: &str,
        draft: &BallotDraft,
    ) -> Result<Ballot, RepositoryError>;

    async fn add_write_in_option(
        &self,
        ballot_id: &str,
        text: &str,
    ) -> Result<BallotOption, RepositoryError>;

    async fn persist_vote(&self, ballot_id: &str, option_id: i64) -> Result<(), RepositoryError>;

    /// Vote counts keyed by option id. Options without votes may be absent.
    async fn get_tallies(&self, ballot_id: &str) -> Result<HashMap<i64, u64>, RepositoryError>;
}

/// SQLite-backed repository.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self, RepositoryError> {
        let in_memory = db_url.contains(":memory:");

        // Create database if it doesn't exist
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database at {}", db_url);
            Sqlite::create_database(db_url).await?;
        }

        // An in-memory database lives exactly as long as its single connection
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(db_url).await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ballots (
                id TEXT PRIMARY KEY,
                measure TEXT NOT NULL,
                allow_write_in BOOLEAN NOT NULL DEFAULT FALSE,
                start_time TEXT,
                end_time TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ballot_options (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ballot_id TEXT NOT NULL,
                text TEXT NOT NULL,
                is_write_in BOOLEAN NOT NULL DEFAULT FALSE,
                position INTEGER NOT NULL,
                FOREIGN KEY (ballot_id) REFERENCES ballots(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ballot_id TEXT NOT NULL,
                option_id INTEGER NOT NULL,
                cast_at TEXT NOT NULL,
                FOREIGN KEY (ballot_id) REFERENCES ballots(id) ON DELETE CASCADE,
                FOREIGN KEY (option_id) REFERENCES ballot_options(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_votes_ballot ON votes (ballot_id);")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn load_options(&self, ballot_id: &str) -> Result<Vec<BallotOption>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, text, is_write_in
            FROM ballot_options
            WHERE ballot_id = ?
            ORDER BY position
            "#,
        )
        .bind(ballot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<BallotOption, RepositoryError> {
                Ok(BallotOption {
                    id: row.try_get::<i64, _>("id")?,
                    text: row.try_get::<String, _>("text")?,
                    is_write_in: row.try_get::<bool, _>("is_write_in")?,
                })
            })
            .collect()
    }

    async fn ballot_from_row(&self, row: SqliteRow) -> Result<Ballot, RepositoryError> {
        let id = row.try_get::<String, _>("id")?;
        let start_time: Option<String> = row.try_get("start_time")?;
        let end_time: Option<String> = row.try_get("end_time")?;
        let created_at: String = row.try_get("created_at")?;
        let options = self.load_options(&id).await?;

        Ok(Ballot {
            measure: row.try_get::<String, _>("measure")?,
            allow_write_in: row.try_get::<bool, _>("allow_write_in")?,
            start_time: start_time.as_deref().map(parse_timestamp).transpose()?,
            end_time: end_time.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&created_at)?,
            options,
            id,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("bad timestamp '{}': {}", value, e)))
}

#[async_trait]
impl BallotRepository for Database {
    async fn list_ballots(&self) -> Result<Vec<Ballot>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, measure, allow_write_in, start_time, end_time, created_at
            FROM ballots
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut ballots = Vec::with_capacity(rows.len());
        for row in rows {
            ballots.push(self.ballot_from_row(row).await?);
        }
        Ok(ballots)
    }

    async fn load_ballot(&self, ballot_id: &str) -> Result<Option<Ballot>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, measure, allow_write_in, start_time, end_time, created_at
            FROM ballots
            WHERE id = ?
            "#,
        )
        .bind(ballot_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.ballot_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn create_ballot(
        &self,
        ballot_id: &str,
        draft: &BallotDraft,
    ) -> Result<Ballot, RepositoryError> {
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ballots (id, measure, allow_write_in, start_time, end_time, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ballot_id)
        .bind(&draft.measure)
        .bind(draft.allow_write_in)
        .bind(draft.start_time.map(|dt| dt.to_rfc3339()))
        .bind(draft.end_time.map(|dt| dt.to_rfc3339()))
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let mut options = Vec::with_capacity(draft.options.len());
        for (i, text) in draft.options.iter().enumerate() {
            let result = sqlx::query(
                r#"
                INSERT INTO ballot_options (ballot_id, text, is_write_in, position)
                VALUES (?, ?, FALSE, ?)
                "#,
            )
            .bind(ballot_id)
            .bind(text)
            .bind(i as i64)
            .execute(&mut *tx)
            .await?;

            options.push(BallotOption {
                id: result.last_insert_rowid(),
                text: text.clone(),
                is_write_in: false,
            });
        }

        tx.commit().await?;

        Ok(Ballot {
            id: ballot_id.to_string(),
            measure: draft.measure.clone(),
            options,
            allow_write_in: draft.allow_write_in,
            start_time: draft.start_time,
            end_time: draft.end_time,
            created_at,
        })
    }

    async fn add_write_in_option(
        &self,
        ballot_id: &str,
        text: &str,
    ) -> Result<BallotOption, RepositoryError> {
        let ballot_exists = sqlx::query("SELECT 1 FROM ballots WHERE id = ?")
            .bind(ballot_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if !ballot_exists {
            return Err(RepositoryError::MissingBallot(ballot_id.to_string()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO ballot_options (ballot_id, text, is_write_in, position)
            VALUES (?, ?, TRUE,
                (SELECT COALESCE(MAX(position), -1) + 1 FROM ballot_options WHERE ballot_id = ?))
            "#,
        )
        .bind(ballot_id)
        .bind(text)
        .bind(ballot_id)
        .execute(&self.pool)
        .await?;

        Ok(BallotOption {
            id: result.last_insert_rowid(),
            text: text.to_string(),
            is_write_in: true,
        })
    }

    async fn persist_vote(&self, ballot_id: &str, option_id: i64) -> Result<(), RepositoryError> {
        let option_exists = sqlx::query("SELECT 1 FROM ballot_options WHERE id = ? AND ballot_id = ?")
            .bind(option_id)
            .bind(ballot_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if !option_exists {
            return Err(RepositoryError::MissingOption {
                ballot_id: ballot_id.to_string(),
                option_id,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO votes (ballot_id, option_id, cast_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(ballot_id)
        .bind(option_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_tallies(&self, ballot_id: &str) -> Result<HashMap<i64, u64>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT option_id, COUNT(*) AS votes
            FROM votes
            WHERE ballot_id = ?
            GROUP BY option_id
            "#,
        )
        .bind(ballot_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tallies = HashMap::with_capacity(rows.len());
        for row in rows {
            let option_id = row.try_get::<i64, _>("option_id")?;
            let votes = row.try_get::<i64, _>("votes")?;
            tallies.insert(option_id, votes.max(0) as u64);
        }
        Ok(tallies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn database() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_load_round_trip() {
        let db = database().await;
        let now = Utc::now();
        let draft = BallotDraft::new("SQL Test Ballot", vec!["Yes".into(), "No".into()])
            .with_write_ins(true)
            .starting_at(now)
            .ending_at(now + Duration::minutes(10));

        let created = db.create_ballot("b1", &draft).await.unwrap();
        let loaded = db.load_ballot("b1").await.unwrap().unwrap();

        assert_eq!(loaded.id, "b1");
        assert_eq!(loaded.options, created.options);
        assert!(loaded.allow_write_in);
        assert_eq!(loaded.end_time.map(|t| t.timestamp()), draft.end_time.map(|t| t.timestamp()));
        assert!(db.load_ballot("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn votes_are_counted_per_option() {
        let db = database().await;
        let draft = BallotDraft::new("Vote Test", vec!["Option 1".into(), "Option 2".into()]);
        let ballot = db.create_ballot("b2", &draft).await.unwrap();
        let first = ballot.options[0].id;
        let second = ballot.options[1].id;

        db.persist_vote("b2", first).await.unwrap();
        db.persist_vote("b2", first).await.unwrap();
        db.persist_vote("b2", second).await.unwrap();

        let tallies = db.get_tallies("b2").await.unwrap();
        assert_eq!(tallies.get(&first), Some(&2));
        assert_eq!(tallies.get(&second), Some(&1));
    }

    #[tokio::test]
    async fn write_ins_append_to_option_order() {
        let db = database().await;
        let draft = BallotDraft::new("Write ins", vec!["A".into()]).with_write_ins(true);
        db.create_ballot("b3", &draft).await.unwrap();

        let added = db.add_write_in_option("b3", "Zed").await.unwrap();
        let loaded = db.load_ballot("b3").await.unwrap().unwrap();

        assert!(added.is_write_in);
        assert_eq!(loaded.options.last(), Some(&added));
        assert!(matches!(
            db.add_write_in_option("nope", "Zed").await,
            Err(RepositoryError::MissingBallot(_))
        ));
    }

    #[tokio::test]
    async fn vote_for_foreign_option_is_rejected() {
        let db = database().await;
        let draft = BallotDraft::new("Ballot 1", vec!["A".into(), "B".into()]);
        db.create_ballot("b4", &draft).await.unwrap();

        assert!(matches!(
            db.persist_vote("b4", 9_999).await,
            Err(RepositoryError::MissingOption { .. })
        ));
    }

    #[tokio::test]
    async fn lists_all_ballots() {
        let db = database().await;
        db.create_ballot("x", &BallotDraft::new("Ballot 1", vec!["A".into(), "B".into()]))
            .await
            .unwrap();
        db.create_ballot("y", &BallotDraft::new("Ballot 2", vec!["A".into(), "B".into()]))
            .await
            .unwrap();

        let all = db.list_ballots().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
