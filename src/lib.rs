//! EMC core: a line-oriented, full-duplex protocol runtime for managing
//! links between a controller (host) and clients (users) over byte
//! transports.
//!
//! The crate is organised as a pipeline of stages owned by a [`Reactor`]:
//! the [`Gateway`] frames raw bytes into text lines and binary packets
//! and runs the liveness timers, an optional [`Codec`] bridges packet
//! bodies across text-only links, and the [`Mapper`] answers the device
//! and channel verbs. The reactor core is synchronous and
//! single-threaded; the [`tcp`] module provides the asynchronous byte
//! bus that feeds it.

pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mapper;
pub mod pipeline;
pub mod protocol;
pub mod reactor;
pub mod stage;
#[cfg(feature = "tcp")]
pub mod tcp;
pub mod timer;
pub mod transport;

pub use command::{Command, Token, ARG_COUNT_MAX};
pub use config::EmcConfig;
pub use error::{
    AttachError, BusError, ConfigError, FeedResult, MapperError, Result, Status,
};
pub use gateway::{Emitter, Gateway, GatewayOptions, GatewayStats, Value};
pub use mapper::{
    ChannelMap, DeviceDriver, DeviceFlags, Mapper, SharedChannels, Stream, DEVICE_NAME_SIZE,
};
pub use pipeline::{Linkage, StageId};
pub use protocol::{Ring, Role};
pub use reactor::{Env, Event, Reactor};
pub use stage::{kind, Stage};
pub use timer::Timer;
pub use transport::{Codec, Encoding};
