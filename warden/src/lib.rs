pub mod api;
pub mod config;
pub mod db;
pub mod events;
pub mod gate;
pub mod health;
pub mod hub;
pub mod scheduler;
pub mod sessions;
pub mod supervisor;

/// Errors surfaced by the supervising subsystem.
///
/// Repository methods return `sqlx::Error` directly; this enum wraps them
/// at the supervisor/scheduler boundary where IO and spawn failures mix in.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
