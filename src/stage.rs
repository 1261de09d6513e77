//! The stage contract: every node in a reactor's pipeline implements this
//! capability set, with default no-ops for the callbacks it does not care
//! about. The gateway and the mapper are the two concrete in-crate variants.

use std::any::Any;

use crate::command::Command;
use crate::error::{FeedResult, Status};
use crate::gateway::Emitter;
use crate::pipeline::Linkage;
use crate::reactor::Env;

/// Stage kind bytes. A stage's kind fixes its position in the pipeline:
/// insertion keeps kinds non-decreasing from head to tail.
pub mod kind {
    pub const NONE: u8 = 0;
    /// Gate stages frame raw bytes; at most one per reactor.
    pub const GATE_BASE: u8 = 0x01;
    pub const GATE_LAST: u8 = 0x1f;
    pub const AUTH_BASE: u8 = 0x20;
    pub const AUTH_LAST: u8 = 0x4f;
    /// Core stages own the device layer; at most one per reactor.
    pub const CORE_BASE: u8 = 0x50;
    pub const CORE_LAST: u8 = 0x7f;
    /// Generic stages append to the tail regardless of order.
    pub const GENERIC: u8 = 0xff;

    /// Default kind for the framing gateway.
    pub const GATE: u8 = GATE_BASE;
    /// Default kind for the transport codec, between gate and core.
    pub const CODEC: u8 = AUTH_BASE;
    /// Default kind for the mapper.
    pub const CORE: u8 = CORE_BASE;

    pub fn is_gate(kind: u8) -> bool {
        (GATE_BASE..=GATE_LAST).contains(&kind)
    }

    pub fn is_core(kind: u8) -> bool {
        (CORE_BASE..=CORE_LAST).contains(&kind)
    }

    /// Generic stages skip the ordered insertion walk.
    pub fn is_generic(kind: u8) -> bool {
        kind == NONE || kind > CORE_LAST
    }
}

/// A node in the reactor's pipeline.
///
/// Lifecycle callbacks arrive in the fixed order
/// `attach (resume (join .. drop_link)? suspend)* detach`; the reactor
/// guarantees a stage never observes them out of sequence. Data-plane
/// callbacks (`feed` downward, `send` upward) and the typed protocol
/// callbacks the gateway dispatches are all optional.
#[allow(unused_variables)]
pub trait Stage: Any + Send {
    /// Position category in the pipeline; see [`kind`].
    fn kind(&self) -> u8 {
        kind::GENERIC
    }

    /// Short diagnostic name.
    fn type_name(&self) -> &'static str;

    /// Called once on insertion, before any other callback.
    fn attach(&mut self, env: &Env) {}

    /// Called when the reactor resumes. Returning false aborts the resume
    /// pass; the reactor rolls back every stage resumed before this one.
    fn resume(&mut self, env: &Env) -> bool {
        true
    }

    /// The byte link is up.
    fn join(&mut self, link: &mut Linkage<'_>) {}

    /// Inbound bytes, head to tail. `Refuse` passes the bytes to the next
    /// stage; a trailing refuse is a silent drop.
    fn feed(&mut self, link: &mut Linkage<'_>, data: &[u8]) -> FeedResult {
        FeedResult::Refuse
    }

    /// Outbound bytes on the return path, tail to head. `Refuse` passes
    /// them along unchanged; past the head they reach the transport.
    fn send(&mut self, link: &mut Linkage<'_>, data: &[u8]) -> FeedResult {
        FeedResult::Refuse
    }

    /// The byte link went down (protocol failure, hangup or close).
    fn drop_link(&mut self, link: &mut Linkage<'_>) {}

    /// The reactor is suspending; release session state.
    fn suspend(&mut self, env: &Env) {}

    /// Final removal from the pipeline.
    fn detach(&mut self, env: &Env) {}

    /// Periodic clock tick, head to tail. Timer-driven output belongs here.
    fn sync(&mut self, link: &mut Linkage<'_>, dt: f32) {}

    // --- typed callbacks, dispatched downstream by the gate stage ---

    /// The protocol negotiation succeeded: the remote identified itself.
    fn on_connect(&mut self, link: &mut Linkage<'_>, name: &str, info: &str, mtu: usize) {}

    /// Raw copy of every framed request/response line, before parsing.
    fn process_message(&mut self, out: &mut Emitter, link: &mut Linkage<'_>, message: &str) {}

    /// A parsed request. `Refuse`/`NoRequest` passes it to the next stage.
    fn process_request(
        &mut self,
        out: &mut Emitter,
        link: &mut Linkage<'_>,
        argv: &Command<'_>,
    ) -> Status {
        Status::Refuse
    }

    /// A parsed response. `Refuse`/`NoResponse` passes it on.
    fn process_response(
        &mut self,
        out: &mut Emitter,
        link: &mut Linkage<'_>,
        argv: &Command<'_>,
    ) -> Status {
        Status::Refuse
    }

    /// A line that is neither request nor response.
    fn process_comment(&mut self, out: &mut Emitter, link: &mut Linkage<'_>, message: &str) {}

    /// A complete binary packet. `Refuse` passes it on; unclaimed packets
    /// are dropped silently.
    fn process_packet(
        &mut self,
        out: &mut Emitter,
        link: &mut Linkage<'_>,
        channel: u8,
        data: &[u8],
    ) -> Status {
        Status::Refuse
    }

    /// A message travelling back up toward the gate. The gate emits it;
    /// intermediate stages may transform it.
    fn return_message(&mut self, link: &mut Linkage<'_>, message: &str) -> Status {
        Status::Refuse
    }

    /// A packet travelling back up toward the gate.
    fn return_packet(&mut self, link: &mut Linkage<'_>, channel: u8, data: &[u8]) -> Status {
        Status::Refuse
    }

    /// The protocol link degraded; the remote is gone.
    fn on_disconnect(&mut self, link: &mut Linkage<'_>) {}

    /// Emit support descriptors for a sync dump.
    fn describe(&mut self, out: &mut Emitter) {}

    /// Service layers this stage exposes, for the `]s` service listing.
    /// Index past the last layer returns None.
    fn layer_name(&self, index: usize) -> Option<&str> {
        None
    }

    fn layer_enabled(&self, index: usize) -> bool {
        true
    }
}
