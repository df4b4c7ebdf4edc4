use std::fmt;

/// Faults a controller operation reports back to its caller.  Every variant
/// is raised before the session is mutated.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("preset {0} not found")]
    NotFound(u32),

    /// The station store contradicted itself.
    #[error("station store integrity violation: {0}")]
    Internal(String),
}

pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

// Classic media-player error codes; mpv end-file errors are mapped onto them.
pub const MEDIA_ERROR_UNKNOWN: i32 = 1;
pub const MEDIA_ERROR_IO: i32 = -1004;
pub const MEDIA_ERROR_TIMED_OUT: i32 = -110;

/// A decode/IO fault reported by a media handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFault {
    Io,
    TimedOut,
    Other { code: i32, extra: i32 },
}

impl MediaFault {
    pub fn codes(&self) -> (i32, i32) {
        match self {
            MediaFault::Io => (MEDIA_ERROR_UNKNOWN, MEDIA_ERROR_IO),
            MediaFault::TimedOut => (MEDIA_ERROR_UNKNOWN, MEDIA_ERROR_TIMED_OUT),
            MediaFault::Other { code, extra } => (*code, *extra),
        }
    }
}

impl fmt::Display for MediaFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaFault::Io => f.write_str("Media IO Error"),
            MediaFault::TimedOut => f.write_str("Timed out"),
            MediaFault::Other { code, extra } => write!(f, "{}:{}", code, extra),
        }
    }
}

/// Errors from a single media handle.  Never propagated past the controller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("illegal handle state for {op} (phase {phase})")]
    IllegalState { op: &'static str, phase: &'static str },

    #[error("media fault: {0}")]
    Fault(MediaFault),
}
