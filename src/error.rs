use thiserror::Error;

/// Exit status the service manager treats as "do not restart"
/// (`RestartPreventExitStatus=255` in the systemd unit).
pub const EXIT_DO_NOT_RESTART: u8 = 255;

/// Exit status for fatal errors the service manager may restart from.
pub const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(String),

    #[error("refusing unencrypted broker connection over {scheme}://, use amqps://")]
    InsecureBroker { scheme: String },

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker unreachable after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("malformed message: {0}")]
    Message(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl DaemonError {
    /// Map an error that escaped the top-level loop to a process exit status.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Config(_)
            | DaemonError::InsecureBroker { .. }
            | DaemonError::ReconnectExhausted(_) => EXIT_DO_NOT_RESTART,
            DaemonError::Broker(_)
            | DaemonError::Message(_)
            | DaemonError::Playback(_)
            | DaemonError::Cache(_)
            | DaemonError::Anyhow(_) => EXIT_FAILURE,
        }
    }
}

pub type Result<T, E = DaemonError> = std::result::Result<T, E>;
