use std::process::ExitStatus;

/// Errors raised by the stream registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("stream '{0}' is already being published")]
    DuplicateStream(String),

    #[error("no active stream for key '{0}'")]
    NotFound(String),
}

/// Errors raised while handling an ingest connection. All of these close the
/// publisher's socket; none of them affect other sessions.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid stream key '{0}'")]
    InvalidKey(String),

    #[error("unknown application '{0}'")]
    UnknownApp(String),

    #[error(transparent)]
    Duplicate(#[from] RegistryError),

    #[error("rtmp protocol error: {0}")]
    Protocol(String),

    #[error("transcoder failed: {0}")]
    Transcoder(#[from] TranscoderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the external transcoder process. Contained within the
/// supervisor and surfaced to the ingest side only as a session-state
/// transition plus the final error value.
#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("failed to spawn transcoder '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder exited while live: {0}")]
    Exited(ExitStatus),

    #[error("transcoder failed {attempts} times, giving up")]
    RetriesExhausted { attempts: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Request-local errors from the segment store. `Expired` maps to HTTP 410,
/// `NotFound` to 404.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("segment {0} has not been published")]
    NotFound(u64),

    #[error("segment {0} has fallen out of the window")]
    Expired(u64),
}
