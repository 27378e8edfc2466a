use std::fmt;

/// Every fatal condition the orchestrator can surface.
///
/// Variants map onto spec.md §7's error kinds; the binary entry point
/// converts any of these into exit code 255 (see `cli::EXIT_FAILURE`),
/// except a successfully completed remote command, whose own exit
/// status is propagated instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Configuration(String),

    #[error("could not resolve or connect to {host}:{port}: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol major versions differ: {ours} vs. {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },

    #[error("banner exchange failed: {0}")]
    Banner(String),

    #[error("host key verification failed for {host}: {reason}")]
    HostKeyRejected { host: String, reason: String },

    #[error("REVOKED host key for {0}")]
    HostKeyRevoked(String),

    #[error("authentication failed for user {user} at {host}")]
    AuthenticationFailed { user: String, host: String },

    #[error("forwarding setup failed: {0}")]
    ForwardingFailed(String),

    #[error("the legacy SSH-1 path is not built into this binary (enable the `ssh1` feature)")]
    Protocol1Unsupported,

    #[error("no home directory could be determined")]
    NoHomeDir,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] thrussh::Error),

    #[error(transparent)]
    Keys(#[from] thrussh_keys::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Error {
        Error::Configuration(msg.into())
    }
}

/// The result of a completed session: either the remote command's exit
/// status (v1 and v2) or a client-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    ClientFailure,
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(c) => write!(f, "exit status {}", c),
            ExitOutcome::ClientFailure => write!(f, "client failure"),
        }
    }
}

pub const EXIT_FAILURE: i32 = 255;

pub type Result<T> = std::result::Result<T, Error>;
