use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quill_thread::{Chat, Message, ThreadId, UserId};
use snafu::ResultExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::error::{
    ChatIndexOutOfRangeSnafu, CreateSqliteDirectorySnafu, DeserializeDocumentSnafu, NotFoundSnafu,
    SerializeDocumentSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::{BoxFuture, ThreadDocument, ThreadStore};

/// Sqlite-backed document store, one row per `(user_id, thread_id)`.
#[derive(Debug, Clone)]
pub struct SqliteThreadStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteThreadStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;
        Self::connect(&normalize_database_url(database_location)).await
    }

    /// Private in-memory database, used by tests.
    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(database_url: &str) -> StorageResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.to_string(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.to_string(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic.
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url, "sqlite thread store ready");

        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn save_thread_inner(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
        document: &ThreadDocument,
    ) -> StorageResult<()> {
        let messages_json =
            serde_json::to_string(&document.messages).context(SerializeDocumentSnafu {
                stage: "sqlite-save-serialize-messages",
            })?;
        let chats_json = serde_json::to_string(&document.chats).context(SerializeDocumentSnafu {
            stage: "sqlite-save-serialize-chats",
        })?;

        sqlx::query(
            "INSERT INTO thread_documents \
             (user_id, thread_id, messages_json, chats_json, updated_at_unix_seconds) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (user_id, thread_id) DO UPDATE SET \
             messages_json = excluded.messages_json, \
             chats_json = excluded.chats_json, \
             updated_at_unix_seconds = excluded.updated_at_unix_seconds",
        )
        .bind(user_id.to_string())
        .bind(thread_id.to_string())
        .bind(messages_json)
        .bind(chats_json)
        .bind(current_unix_timestamp_seconds() as i64)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-save-upsert",
        })?;

        Ok(())
    }

    async fn patch_answer_inner(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
        chat_index: usize,
        answer: &str,
    ) -> StorageResult<()> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT chats_json FROM thread_documents WHERE user_id = ?1 AND thread_id = ?2",
        )
        .bind(user_id.to_string())
        .bind(thread_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-patch-select",
        })?;

        let Some(chats_json) = row else {
            return NotFoundSnafu {
                stage: "sqlite-patch-answer",
                user_id,
                thread_id,
            }
            .fail();
        };

        let mut chats: Vec<Chat> =
            serde_json::from_str(&chats_json).context(DeserializeDocumentSnafu {
                stage: "sqlite-patch-parse-chats",
            })?;

        let chat_count = chats.len();
        let Some(chat) = chats.get_mut(chat_index) else {
            return ChatIndexOutOfRangeSnafu {
                stage: "sqlite-patch-answer",
                chat_index,
                chat_count,
            }
            .fail();
        };

        // Re-applying the same answer must not produce a new write.
        if chat.answer == answer {
            return Ok(());
        }
        chat.answer = answer.to_string();

        let updated_json = serde_json::to_string(&chats).context(SerializeDocumentSnafu {
            stage: "sqlite-patch-serialize-chats",
        })?;

        sqlx::query(
            "UPDATE thread_documents SET chats_json = ?3, updated_at_unix_seconds = ?4 \
             WHERE user_id = ?1 AND thread_id = ?2",
        )
        .bind(user_id.to_string())
        .bind(thread_id.to_string())
        .bind(updated_json)
        .bind(current_unix_timestamp_seconds() as i64)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-patch-update",
        })?;

        Ok(())
    }

    async fn load_thread_inner(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> StorageResult<Option<ThreadDocument>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT messages_json, chats_json FROM thread_documents \
             WHERE user_id = ?1 AND thread_id = ?2",
        )
        .bind(user_id.to_string())
        .bind(thread_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-load-select",
        })?;

        let Some((messages_json, chats_json)) = row else {
            return Ok(None);
        };

        let messages: Vec<Message> =
            serde_json::from_str(&messages_json).context(DeserializeDocumentSnafu {
                stage: "sqlite-load-parse-messages",
            })?;
        let chats: Vec<Chat> =
            serde_json::from_str(&chats_json).context(DeserializeDocumentSnafu {
                stage: "sqlite-load-parse-chats",
            })?;

        Ok(Some(ThreadDocument::new(messages, chats)))
    }
}

impl ThreadStore for SqliteThreadStore {
    fn save_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        document: &'a ThreadDocument,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.save_thread_inner(user_id, thread_id, document))
    }

    fn patch_answer<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        chat_index: usize,
        answer: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.patch_answer_inner(user_id, thread_id, chat_index, answer))
    }

    fn load_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> BoxFuture<'a, StorageResult<Option<ThreadDocument>>> {
        Box::pin(self.load_thread_inner(user_id, thread_id))
    }
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    let Some(parent) = Path::new(database_location).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
        stage: "sqlite-ensure-directory",
        path: parent.display().to_string(),
    })
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        database_location.to_string()
    } else {
        format!("sqlite://{database_location}")
    }
}

fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
