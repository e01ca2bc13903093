use std::{error::Error, fmt, io, path::PathBuf};

/// The client module's result type.
pub type Result<T> = std::result::Result<T, ClientErr>;

/// Client runtime failures.
#[derive(Debug)]
pub enum ClientErr {
    Io(io::Error),
    /// The server's admission policy turned the client down.
    Rejected,
    /// The server broke the protocol.
    Protocol(String),
    Checkpoint { path: PathBuf, source: io::Error },
    InvalidConfig(String),
}

impl fmt::Display for ClientErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErr::Io(e) => write!(f, "io error: {e}"),
            ClientErr::Rejected => f.write_str("admission rejected by the server"),
            ClientErr::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            ClientErr::Checkpoint { path, source } => {
                write!(f, "local checkpoint '{}': {source}", path.display())
            }
            ClientErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for ClientErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientErr::Io(e) => Some(e),
            ClientErr::Checkpoint { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries.
impl From<ClientErr> for io::Error {
    fn from(value: ClientErr) -> Self {
        match value {
            ClientErr::Io(e) => e,
            ClientErr::Rejected => io::Error::new(io::ErrorKind::PermissionDenied, value),
            ClientErr::InvalidConfig(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
