use thiserror::Error;

/// The five error kinds the engine can surface. Every public entry point
/// wraps these in `anyhow::Result` so callers get free-form context on top
/// of a matchable discriminant.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("io error at page {page_id:?} offset {offset:?}: {source}")]
    Io {
        page_id: Option<u32>,
        offset: Option<u32>,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt database: {0}")]
    CorruptDb(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key {0} not found")]
    KeyNotFound(u32),

    #[error("key {0} already exists")]
    KeyDuplicate(u32),
}

impl EngineError {
    pub fn io(source: std::io::Error) -> Self {
        EngineError::Io {
            page_id: None,
            offset: None,
            source,
        }
    }

    pub fn io_at(page_id: u32, source: std::io::Error) -> Self {
        EngineError::Io {
            page_id: Some(page_id),
            offset: None,
            source,
        }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        EngineError::CorruptDb(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}
