use thiserror::Error;

/// Error kinds observable at the engine's surface.
///
/// `Bypass` never escapes the engine — a "pending read-misses blocked"
/// condition degrades silently to pass-through and is never handed to a
/// caller's completion.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("no memory available for promotion buffer")]
    NoMemory,

    #[error("cache device I/O error: {0}")]
    CacheIo(String),

    #[error("core device I/O error: {0}")]
    CoreIo(String),

    #[error("cache line mapping error: {0}")]
    Mapping(String),

    #[error("cache line lock error: {0}")]
    Lock(String),

    #[error("pending read-misses blocked, bypassing")]
    Bypass,
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::CoreIo(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
