use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrambleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log file checksum mismatch")]
    BadLogFile,

    #[error("xid file corrupt or truncated")]
    BadXidFile,

    #[error("cache is full: every slot is pinned")]
    CacheFull,

    #[error("data item of {0} bytes exceeds page capacity")]
    DataTooLarge(usize),

    #[error("no page with enough free space")]
    NoSpaceOnAnyPage,

    #[error("storage corrupt: {0}")]
    Corrupt(String),
}
