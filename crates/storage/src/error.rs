use quill_thread::{ThreadId, UserId};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("thread document for user '{user_id}' thread '{thread_id}' was not found"))]
    NotFound {
        stage: &'static str,
        user_id: UserId,
        thread_id: ThreadId,
    },
    #[snafu(display("chat index {chat_index} is out of range for {chat_count} stored chats"))]
    ChatIndexOutOfRange {
        stage: &'static str,
        chat_index: usize,
        chat_count: usize,
    },
    #[snafu(display("failed to serialize thread document on `{stage}`"))]
    SerializeDocument {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to deserialize thread document on `{stage}`"))]
    DeserializeDocument {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
