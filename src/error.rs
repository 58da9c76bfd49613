use std::fmt;

/// Errors the engine can surface directly to a caller.
///
/// Per-connection failures (a bad write, a dropped read) never reach this
/// type — they are handled inline by the dispatcher loop and only ever
/// show up as a missing entry in a publish's recipient count. `Error` is
/// reserved for engine-level preconditions: things that make the engine
/// itself unable to start or keep running.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// The wake-pipe or the poller could not be created during `PubSub::new`.
    EngineInit(&'static str, std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::EngineInit(what, err) => write!(f, "failed to initialize {what}: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::EngineInit(_, err) => Some(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
