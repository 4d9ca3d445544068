/// Core error type for teledigest.
///
/// Adapter crates map their specific errors into this type so handlers can
/// decide between a user-facing reply and a log line.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("a digest is already being generated")]
    Busy,
}

pub type Result<T> = std::result::Result<T, Error>;
