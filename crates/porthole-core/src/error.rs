use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("domain {0} unavailable")]
    NameTaken(String),

    #[error("valid token required")]
    Unauthenticated,

    #[error("reached max waiting connections {0}")]
    Capacity(usize),

    #[error("no idle connection available")]
    NoIdle,

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("version incorrect: {0}")]
    Version(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("pipe failure: {0}")]
    Pipe(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
