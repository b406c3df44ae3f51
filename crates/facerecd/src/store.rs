//! Person and enrollment persistence (SQLite via tokio-rusqlite).
//!
//! Embeddings are stored encrypted; everything else is plain columns.

use crate::crypto::{CryptoError, EmbeddingCipher};
use chrono::{SecondsFormat, Utc};
use facerec_core::{Embedding, FaceModel};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persons (
    id            TEXT PRIMARY KEY,
    first_name    TEXT NOT NULL,
    last_name     TEXT NOT NULL,
    national_code TEXT UNIQUE,
    employee_id   TEXT UNIQUE,
    email         TEXT,
    phone         TEXT,
    department    TEXT,
    position      TEXT,
    metadata      TEXT,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollments (
    id            TEXT PRIMARY KEY,
    person_id     TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    embedding     BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    quality       REAL NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_enrollments_person ON enrollments(person_id);
CREATE TABLE IF NOT EXISTS recognitions (
    id            TEXT PRIMARY KEY,
    person_id     TEXT REFERENCES persons(id) ON DELETE SET NULL,
    enrollment_id TEXT REFERENCES enrollments(id) ON DELETE SET NULL,
    similarity    REAL NOT NULL,
    matched       INTEGER NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recognitions_created ON recognitions(created_at);
";

const PERSON_COLUMNS: &str = "id, first_name, last_name, national_code, employee_id, email, \
     phone, department, position, metadata, is_active, created_at, updated_at";

const RECOGNITION_COLUMNS: &str =
    "id, person_id, enrollment_id, similarity, matched, created_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("enrollment {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
}

/// Enrolled person as returned by the API. Embeddings are never exposed.
#[derive(Debug, Clone, Serialize)]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub national_code: Option<String>,
    pub employee_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
    pub enrollments: Vec<EnrollmentInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentInfo {
    pub id: String,
    pub quality: f32,
    pub model_version: Option<String>,
    pub created_at: String,
}

/// Fields for a new person.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPerson {
    pub first_name: String,
    pub last_name: String,
    pub national_code: Option<String>,
    pub employee_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update; `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub national_code: Option<String>,
    pub employee_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionEvent {
    pub id: String,
    pub person_id: Option<String>,
    pub enrollment_id: Option<String>,
    pub similarity: f32,
    pub matched: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreCounts {
    pub persons: u64,
    pub enrollments: u64,
}

/// Handle to the face database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    cipher: EmbeddingCipher,
}

impl Store {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path, cipher: EmbeddingCipher) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn, cipher).await
    }

    pub async fn open_in_memory(cipher: EmbeddingCipher) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, cipher).await
    }

    async fn init(conn: Connection, cipher: EmbeddingCipher) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.pragma_update(None, "foreign_keys", true)?;
            c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, cipher })
    }

    /// Create a person together with their first enrollment, atomically.
    pub async fn create_person_with_enrollment(
        &self,
        new: NewPerson,
        embedding: &Embedding,
        quality: f32,
    ) -> Result<(Person, EnrollmentInfo), StoreError> {
        let (info, blob, dim) = self.seal(embedding, quality)?;
        let mut person = Person::from_new(new);
        person.updated_at = info.created_at.clone();
        person.enrollments.push(info.clone());

        let (p, row) = (person.clone(), info.clone());
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                insert_person(&tx, &p)?;
                insert_enrollment(&tx, &p.id, &row, &blob, dim)?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(unique_conflict)?;

        tracing::info!(person_id = %person.id, enrollment_id = %info.id, "person created with enrollment");
        Ok((person, info))
    }

    pub async fn get_person(&self, id: &str) -> Result<Option<Person>, StoreError> {
        let id = id.to_string();
        let person = self
            .conn
            .call(move |c| {
                let person = c
                    .query_row(
                        &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE id = ?1"),
                        [&id],
                        person_from_row,
                    )
                    .optional()?;
                let Some(mut person) = person else {
                    return Ok(None);
                };
                let mut stmt = c.prepare(
                    "SELECT id, quality, model_version, created_at FROM enrollments \
                     WHERE person_id = ?1 ORDER BY created_at DESC, rowid DESC",
                )?;
                person.enrollments = stmt
                    .query_map([&id], enrollment_from_row)?
                    .collect::<Result<_, _>>()?;
                Ok(Some(person))
            })
            .await?;
        Ok(person)
    }

    /// All persons, newest first, each with its enrollments (newest first).
    pub async fn list_persons(&self) -> Result<Vec<Person>, StoreError> {
        let persons = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {PERSON_COLUMNS} FROM persons ORDER BY created_at DESC, rowid DESC"
                ))?;
                let mut persons: Vec<Person> = stmt
                    .query_map([], person_from_row)?
                    .collect::<Result<_, _>>()?;

                let mut stmt = c.prepare(
                    "SELECT person_id, id, quality, model_version, created_at FROM enrollments \
                     ORDER BY created_at DESC, rowid DESC",
                )?;
                let mut by_person: HashMap<String, Vec<EnrollmentInfo>> = HashMap::new();
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        EnrollmentInfo {
                            id: row.get(1)?,
                            quality: row.get(2)?,
                            model_version: row.get(3)?,
                            created_at: row.get(4)?,
                        },
                    ))
                })?;
                for row in rows {
                    let (person_id, info) = row?;
                    by_person.entry(person_id).or_default().push(info);
                }
                for p in &mut persons {
                    p.enrollments = by_person.remove(&p.id).unwrap_or_default();
                }
                Ok(persons)
            })
            .await?;
        Ok(persons)
    }

    /// Apply a partial update. Returns `None` if the person does not exist.
    pub async fn update_person(
        &self,
        id: &str,
        update: PersonUpdate,
    ) -> Result<Option<Person>, StoreError> {
        let key = id.to_string();
        let now = timestamp();
        let changed = self
            .conn
            .call(move |c| {
                let n = c.execute(
                    "UPDATE persons SET \
                        first_name    = COALESCE(?2, first_name), \
                        last_name     = COALESCE(?3, last_name), \
                        national_code = COALESCE(?4, national_code), \
                        employee_id   = COALESCE(?5, employee_id), \
                        email         = COALESCE(?6, email), \
                        phone         = COALESCE(?7, phone), \
                        department    = COALESCE(?8, department), \
                        position      = COALESCE(?9, position), \
                        metadata      = COALESCE(?10, metadata), \
                        is_active     = COALESCE(?11, is_active), \
                        updated_at    = ?12 \
                     WHERE id = ?1",
                    params![
                        key,
                        update.first_name,
                        update.last_name,
                        update.national_code,
                        update.employee_id,
                        update.email,
                        update.phone,
                        update.department,
                        update.position,
                        update.metadata.as_ref().map(|m| m.to_string()),
                        update.is_active,
                        now,
                    ],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(unique_conflict)?;

        if !changed {
            return Ok(None);
        }
        tracing::info!(person_id = id, "person updated");
        self.get_person(id).await
    }

    /// Delete a person and (by cascade) its enrollments.
    /// Returns `false` if no such person existed.
    pub async fn delete_person(&self, id: &str) -> Result<bool, StoreError> {
        let key = id.to_string();
        let deleted = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM persons WHERE id = ?1", [&key])? > 0))
            .await?;
        if deleted {
            tracing::info!(person_id = id, "person deleted");
        }
        Ok(deleted)
    }

    /// Store a new embedding for `person_id`. With `replace`, the person's
    /// previous enrollments are removed in the same transaction.
    pub async fn add_enrollment(
        &self,
        person_id: &str,
        embedding: &Embedding,
        quality: f32,
        replace: bool,
    ) -> Result<EnrollmentInfo, StoreError> {
        let (info, blob, dim) = self.seal(embedding, quality)?;
        let pid = person_id.to_string();
        let row = info.clone();

        let inserted = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let exists = tx
                    .query_row("SELECT 1 FROM persons WHERE id = ?1", [&pid], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !exists {
                    return Ok(false);
                }
                if replace {
                    tx.execute("DELETE FROM enrollments WHERE person_id = ?1", [&pid])?;
                }
                insert_enrollment(&tx, &pid, &row, &blob, dim)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !inserted {
            return Err(StoreError::NotFound(format!("person {person_id}")));
        }
        tracing::info!(person_id, enrollment_id = %info.id, replace, "enrollment stored");
        Ok(info)
    }

    /// Encrypt an embedding and describe the enrollment row it will become.
    fn seal(
        &self,
        embedding: &Embedding,
        quality: f32,
    ) -> Result<(EnrollmentInfo, Vec<u8>, i64), StoreError> {
        let blob = self.cipher.encrypt(&embedding.to_bytes())?;
        let info = EnrollmentInfo {
            id: Uuid::new_v4().to_string(),
            quality,
            model_version: embedding.model_version.clone(),
            created_at: timestamp(),
        };
        Ok((info, blob, embedding.dim() as i64))
    }

    /// Remove one enrollment of a person. Returns `false` if it did not exist.
    pub async fn delete_enrollment(&self, person_id: &str, enrollment_id: &str) -> Result<bool, StoreError> {
        let pid = person_id.to_string();
        let eid = enrollment_id.to_string();
        let deleted = self
            .conn
            .call(move |c| {
                Ok(c.execute(
                    "DELETE FROM enrollments WHERE id = ?1 AND person_id = ?2",
                    [&eid, &pid],
                )? > 0)
            })
            .await?;
        if deleted {
            tracing::info!(person_id, enrollment_id, "enrollment deleted");
        }
        Ok(deleted)
    }

    /// Decrypted embeddings of every active person.
    pub async fn gallery(&self) -> Result<Vec<FaceModel>, StoreError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT e.id, e.person_id, p.first_name, p.last_name, e.embedding, e.model_version \
                     FROM enrollments e JOIN persons p ON p.id = e.person_id \
                     WHERE p.is_active = 1",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            display_name(&row.get::<_, String>(2)?, &row.get::<_, String>(3)?),
                            row.get::<_, Vec<u8>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, person_id, label, blob, model_version)| {
                let bytes = self.cipher.decrypt(&blob)?;
                let embedding = Embedding::from_bytes(&bytes, model_version).map_err(|e| {
                    StoreError::Corrupt {
                        id: id.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(FaceModel { id, person_id, label, embedding })
            })
            .collect()
    }

    /// Log one recognition attempt. A person or enrollment deleted since the
    /// gallery was read is stored as NULL, like `ON DELETE SET NULL` would.
    pub async fn record_recognition(
        &self,
        person_id: Option<String>,
        enrollment_id: Option<String>,
        similarity: f32,
        matched: bool,
    ) -> Result<RecognitionEvent, StoreError> {
        let id = Uuid::new_v4().to_string();
        let created_at = timestamp();
        let event = self
            .conn
            .call(move |c| {
                let (person_id, enrollment_id) = c.query_row(
                    &format!(
                        "INSERT INTO recognitions ({RECOGNITION_COLUMNS}) \
                         VALUES (?1, (SELECT id FROM persons WHERE id = ?2), \
                                 (SELECT id FROM enrollments WHERE id = ?3), ?4, ?5, ?6) \
                         RETURNING person_id, enrollment_id"
                    ),
                    params![id, person_id, enrollment_id, similarity, matched, created_at],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(RecognitionEvent {
                    id,
                    person_id,
                    enrollment_id,
                    similarity,
                    matched,
                    created_at,
                })
            })
            .await?;
        Ok(event)
    }

    /// Most recent recognition events, newest first, optionally for one person.
    pub async fn recent_recognitions(
        &self,
        limit: usize,
        person_id: Option<String>,
    ) -> Result<Vec<RecognitionEvent>, StoreError> {
        let limit = limit as i64;
        let events = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {RECOGNITION_COLUMNS} FROM recognitions \
                     WHERE ?1 IS NULL OR person_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ))?;
                let events = stmt
                    .query_map(params![person_id, limit], recognition_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await?;
        Ok(events)
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let counts = self
            .conn
            .call(|c| {
                let persons: i64 = c.query_row("SELECT COUNT(*) FROM persons", [], |r| r.get(0))?;
                let enrollments: i64 =
                    c.query_row("SELECT COUNT(*) FROM enrollments", [], |r| r.get(0))?;
                Ok(StoreCounts {
                    persons: persons as u64,
                    enrollments: enrollments as u64,
                })
            })
            .await?;
        Ok(counts)
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn display_name(first: &str, last: &str) -> String {
    format!("{first} {last}").trim().to_string()
}

impl Person {
    fn from_new(new: NewPerson) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            first_name: new.first_name,
            last_name: new.last_name,
            national_code: new.national_code,
            employee_id: new.employee_id,
            email: new.email,
            phone: new.phone,
            department: new.department,
            position: new.position,
            metadata: new.metadata,
            is_active: true,
            created_at: now.clone(),
            updated_at: now,
            enrollments: Vec::new(),
        }
    }
}

fn insert_person(c: &rusqlite::Connection, p: &Person) -> rusqlite::Result<()> {
    c.execute(
        &format!(
            "INSERT INTO persons ({PERSON_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            p.id,
            p.first_name,
            p.last_name,
            p.national_code,
            p.employee_id,
            p.email,
            p.phone,
            p.department,
            p.position,
            p.metadata.as_ref().map(|m| m.to_string()),
            p.is_active,
            p.created_at,
            p.updated_at,
        ],
    )?;
    Ok(())
}

/// Insert an enrollment row and bump the owner's `updated_at`.
fn insert_enrollment(
    c: &rusqlite::Connection,
    person_id: &str,
    row: &EnrollmentInfo,
    blob: &[u8],
    dim: i64,
) -> rusqlite::Result<()> {
    c.execute(
        "INSERT INTO enrollments \
         (id, person_id, embedding, dim, model_version, quality, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![row.id, person_id, blob, dim, row.model_version, row.quality, row.created_at],
    )?;
    c.execute(
        "UPDATE persons SET updated_at = ?2 WHERE id = ?1",
        params![person_id, row.created_at],
    )?;
    Ok(())
}

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    let metadata: Option<String> = row.get(9)?;
    Ok(Person {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        national_code: row.get(3)?,
        employee_id: row.get(4)?,
        email: row.get(5)?,
        phone: row.get(6)?,
        department: row.get(7)?,
        position: row.get(8)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        is_active: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        enrollments: Vec::new(),
    })
}

fn enrollment_from_row(row: &Row<'_>) -> rusqlite::Result<EnrollmentInfo> {
    Ok(EnrollmentInfo {
        id: row.get(0)?,
        quality: row.get(1)?,
        model_version: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn recognition_from_row(row: &Row<'_>) -> rusqlite::Result<RecognitionEvent> {
    Ok(RecognitionEvent {
        id: row.get(0)?,
        person_id: row.get(1)?,
        enrollment_id: row.get(2)?,
        similarity: row.get(3)?,
        matched: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Map UNIQUE violations on persons to a conflict the caller can report.
fn unique_conflict(err: tokio_rusqlite::Error) -> StoreError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, msg)) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            let field = match msg.as_deref() {
                Some(m) if m.contains("national_code") => "National code",
                Some(m) if m.contains("employee_id") => "Employee ID",
                _ => "Unique field",
            };
            return StoreError::Conflict(format!("{field} already exists"));
        }
    }
    StoreError::Database(err)
}
