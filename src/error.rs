/// Wire-level dispatch status, carried as a small code on error responses.
///
/// This is protocol data rather than a Rust error: `Refuse` and `NoRequest`
/// drive the try-next-stage chaining inside the pipeline and are a normal
/// part of message routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handled successfully; nothing further to do.
    Okay,
    /// Not this stage's job; the next stage should see the message.
    /// Never sent on the wire.
    Refuse,
    /// No handler claimed the request.
    NoRequest,
    /// No handler claimed the response. Same wire code as `NoRequest`,
    /// but silent: a stray response is logged, never answered.
    NoResponse,
    /// Syntactically valid but semantically wrong.
    BadRequest,
    /// The frame could not be parsed.
    Parse,
    /// Internal failure: queue exhaustion or a broken invariant.
    Fail,
}

impl Status {
    /// Two-digit hex code rendered into an error response.
    pub fn wire_code(self) -> u8 {
        match self {
            Status::Okay => 0x00,
            Status::Refuse | Status::NoRequest | Status::NoResponse => 0xff,
            Status::BadRequest => 0xfe,
            Status::Parse => 0x7f,
            Status::Fail => 0x80,
        }
    }

    /// Stock message text for the response body, if the code carries one.
    pub fn stock_message(self) -> Option<&'static str> {
        match self {
            Status::Okay => Some("READY"),
            Status::Refuse => None,
            Status::NoRequest | Status::NoResponse => Some("COMMAND NOT FOUND"),
            Status::BadRequest => Some("BAD REQUEST"),
            Status::Parse => Some("INVALID REQUEST"),
            Status::Fail => Some("INTERNAL ERROR"),
        }
    }

    pub fn is_okay(self) -> bool {
        self == Status::Okay
    }
}

/// Result of pushing bytes through a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// Consumed (or deliberately ignored).
    Okay,
    /// Not consumed; the next stage should see the bytes. A trailing
    /// refuse is treated as a silent drop by the pipeline.
    Refuse,
    /// The stage failed to buffer the data; the current message is lost.
    Fail,
}

/// Errors from building or validating an [`EmcConfig`](crate::EmcConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("mtu {mtu} outside [{min}, {max}]")]
    MtuOutOfRange { mtu: usize, min: usize, max: usize },
    #[error("queue_size_min ({min}) exceeds queue_size_max ({max})")]
    QueueBoundsInverted { min: usize, max: usize },
    #[error("message_wait_time ({wait}s) must stay below message_drop_time ({drop}s)")]
    WaitExceedsDrop { wait: f32, drop: f32 },
    #[error("message_ping_time ({ping}s) must exceed message_wait_time ({wait}s)")]
    PingBelowWait { ping: f32, wait: f32 },
    #[error(
        "message_ping_time ({ping}s) must stay below message_trip_time ({trip}s) \
         minus twice message_wait_time ({wait}s)"
    )]
    PingTooCloseToTrip { ping: f32, trip: f32, wait: f32 },
    #[error("message_trip_time ({trip}s) must exceed message_wait_time ({wait}s)")]
    TripBelowWait { trip: f32, wait: f32 },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from attaching or detaching pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("a gate-kind stage is already attached")]
    DuplicateGate,
    #[error("a core-kind stage is already attached")]
    DuplicateCore,
    #[error("stage refused to resume; reactor suspended")]
    ResumeFailed,
    #[error("no stage with id {0:?}")]
    UnknownStage(crate::pipeline::StageId),
}

/// Errors from the byte-bus drivers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect to {addr} failed after {attempts} attempt(s): {reason}")]
    Connect {
        addr: String,
        attempts: u32,
        reason: String,
    },
    #[error("peer hung up")]
    HungUp,
    #[error("reactor failed to resume")]
    NotResumed,
}

/// Errors from registering devices with a mapper.
#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    #[error("device table full ({0} slots)")]
    DeviceTableFull(usize),
    #[error("device name {0:?} is empty or longer than {1} bytes")]
    BadDeviceName(String, usize),
    #[error("device {0:?} already registered")]
    DuplicateDevice(String),
}

/// Convenience alias for bus-facing entry points.
pub type Result<T> = std::result::Result<T, BusError>;
