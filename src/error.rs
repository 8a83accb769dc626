//! Error types of the ISP driver.

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Send or receive failed at the transport boundary. The bus is left in
    /// an unknown electrical state, callers must not continue the session.
    #[error("{op}: programmer is not responding: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Programming enable was never acknowledged, or the signature read back
    /// afterwards was not a plausible AVR identifier.
    #[error("program enable failed after {probes} probes")]
    Handshake { probes: usize },

    /// Paged access requested on a memory this driver cannot stream.
    #[error("memory \"{0}\" does not support paged access")]
    UnsupportedMemory(String),

    /// The part description lacks an instruction template needed for the operation.
    #[error("{op} instruction not defined for \"{part}\"")]
    MissingOpcode { op: &'static str, part: String },

    /// Invalid user supplied setting, rejected before touching the bus.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed or unknown part description.
    #[error("part database: {0}")]
    Part(String),
}

impl Error {
    pub(crate) fn transport(op: &'static str) -> impl FnOnce(anyhow::Error) -> Error {
        move |source| Error::Transport { op, source }
    }

    /// Whether the error leaves the bus unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}
