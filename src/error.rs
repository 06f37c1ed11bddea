use std::path::PathBuf;

/// Unified error type for all indexing operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot open {}: {source}", path.display())]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid record structure at byte {offset}: {reason}")]
    Format { offset: u64, reason: String },

    #[error("k = {k} at {bits_per_char} bits per character exceeds the {capacity}-bit k-mer storage")]
    Overflow {
        k: usize,
        bits_per_char: u8,
        capacity: usize,
    },

    #[error("Unsupported alphabet width: {0} bits per character")]
    UnsupportedWidth(u8),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Worker thread panicked during index construction")]
    WorkerPanic,
}

impl Error {
    /// Shorthand for a structural error at a known byte offset.
    pub fn format(offset: u64, reason: impl Into<String>) -> Self {
        Self::Format {
            offset,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
