use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decoder overflow: length {got} exceeds limit {limit}")]
    DecoderOverflow { got: usize, limit: usize },

    #[error("SOCKS protocol error: {0}")]
    SocksProtocol(String),

    #[error("stack error: {0}")]
    Stack(String),

    #[error("buffer exhausted: {0}")]
    BufferExhausted(String),

    #[error("initialization failed: {0}")]
    InitFailure(String),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}
