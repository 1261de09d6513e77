//! The stage arena: a list of slots ordered by kind, plus the [`Linkage`]
//! handle stages use to reach their neighbours while they are dispatched.
//!
//! Dispatch vacates the invoked stage's slot, so a stage can walk the rest
//! of the pipeline (typed dispatch downstream, send path upstream) without
//! aliasing itself. Vacant slots encountered mid-walk belong to outer
//! dispatch frames and are skipped.

use std::collections::VecDeque;

use crate::command::Command;
use crate::error::{FeedResult, Status};
use crate::gateway::Emitter;
use crate::reactor::{Env, Event};
use crate::stage::{kind, Stage};

/// Stable identifier for an attached stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageId(pub(crate) u32);

pub(crate) struct Slot {
    pub id: StageId,
    pub kind: u8,
    pub stage: Option<Box<dyn Stage>>,
}

/// Reactor state every dispatch can reach: the environment, the transport
/// outbox and the pending event queue.
pub(crate) struct Shared {
    pub env: Env,
    pub outbox: Vec<u8>,
    pub events: VecDeque<Event>,
}

#[derive(Default)]
pub(crate) struct Pipeline {
    slots: Vec<Slot>,
    next_id: u32,
}

impl Pipeline {
    /// Insert keeping kinds non-decreasing: walk back from the tail and
    /// place the stage after the last slot whose kind is not greater.
    /// Generic stages append to the tail unconditionally.
    pub fn insert(&mut self, stage: Box<dyn Stage>) -> StageId {
        let id = StageId(self.next_id);
        self.next_id += 1;
        let stage_kind = stage.kind();
        let slot = Slot {
            id,
            kind: stage_kind,
            stage: Some(stage),
        };
        if kind::is_generic(stage_kind) {
            self.slots.push(slot);
        } else {
            let position = self
                .slots
                .iter()
                .rposition(|s| s.kind <= stage_kind)
                .map(|p| p + 1)
                .unwrap_or(0);
            self.slots.insert(position, slot);
        }
        id
    }

    pub fn remove(&mut self, id: StageId) -> Option<Box<dyn Stage>> {
        let index = self.index_of(id)?;
        self.slots.remove(index).stage
    }

    pub fn index_of(&self, id: StageId) -> Option<usize> {
        self.slots.iter().position(|s| s.id == id)
    }

    pub fn find_kind(&self, lo: u8, hi: u8) -> Option<usize> {
        self.slots.iter().position(|s| (lo..=hi).contains(&s.kind))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }
}

/// Take a stage out of its slot, run `f` with the stage and a [`Linkage`]
/// rooted at its position, and put it back. Skips vacant slots.
pub(crate) fn with_stage<R>(
    slots: &mut [Slot],
    shared: &mut Shared,
    index: usize,
    f: impl FnOnce(&mut dyn Stage, &mut Linkage<'_>) -> R,
) -> Option<R> {
    let mut stage = slots[index].stage.take()?;
    let result = {
        let mut link = Linkage {
            slots: &mut *slots,
            index,
            shared: &mut *shared,
        };
        f(stage.as_mut(), &mut link)
    };
    slots[index].stage = Some(stage);
    Some(result)
}

/// A dispatched stage's view of the pipeline around it.
pub struct Linkage<'a> {
    pub(crate) slots: &'a mut [Slot],
    pub(crate) index: usize,
    pub(crate) shared: &'a mut Shared,
}

impl Linkage<'_> {
    pub fn env(&self) -> &Env {
        &self.shared.env
    }

    /// Queue a reactor event; the reactor applies it once the current
    /// dispatch unwinds.
    pub fn post(&mut self, event: Event) {
        self.shared.events.push_back(event);
    }

    /// Push bytes up the return path. Stages ahead of the caller may
    /// transform or consume them; whatever reaches past the head goes to
    /// the transport outbox.
    pub fn send_upstream(&mut self, data: &[u8]) -> FeedResult {
        for j in (0..self.index).rev() {
            let Some(result) = with_stage(self.slots, self.shared, j, |stage, link| {
                stage.send(link, data)
            }) else {
                continue;
            };
            match result {
                FeedResult::Refuse => continue,
                other => return other,
            }
        }
        self.shared.outbox.extend_from_slice(data);
        FeedResult::Okay
    }

    /// Offer a parsed request to every stage after the caller, in order,
    /// until one claims it.
    pub fn forward_request(&mut self, out: &mut Emitter, argv: &Command<'_>) -> Status {
        for j in self.index + 1..self.slots.len() {
            let Some(status) = with_stage(self.slots, self.shared, j, |stage, link| {
                stage.process_request(out, link, argv)
            }) else {
                continue;
            };
            match status {
                Status::Refuse | Status::NoRequest => continue,
                other => return other,
            }
        }
        Status::NoRequest
    }

    /// Offer a parsed response to every stage after the caller.
    pub fn forward_response(&mut self, out: &mut Emitter, argv: &Command<'_>) -> Status {
        for j in self.index + 1..self.slots.len() {
            let Some(status) = with_stage(self.slots, self.shared, j, |stage, link| {
                stage.process_response(out, link, argv)
            }) else {
                continue;
            };
            match status {
                Status::Refuse | Status::NoResponse => continue,
                other => return other,
            }
        }
        Status::NoResponse
    }

    /// Offer a packet to every stage after the caller. Unclaimed packets
    /// are dropped silently.
    pub fn forward_packet(&mut self, out: &mut Emitter, channel: u8, data: &[u8]) -> Status {
        for j in self.index + 1..self.slots.len() {
            let Some(status) = with_stage(self.slots, self.shared, j, |stage, link| {
                stage.process_packet(out, link, channel, data)
            }) else {
                continue;
            };
            match status {
                Status::Refuse | Status::NoRequest => continue,
                other => return other,
            }
        }
        Status::Okay
    }

    /// Hand the raw line to every stage after the caller.
    pub fn dispatch_message(&mut self, out: &mut Emitter, message: &str) {
        for j in self.index + 1..self.slots.len() {
            with_stage(self.slots, self.shared, j, |stage, link| {
                stage.process_message(out, link, message);
            });
        }
    }

    /// Hand a comment line to every stage after the caller.
    pub fn dispatch_comment(&mut self, out: &mut Emitter, message: &str) {
        for j in self.index + 1..self.slots.len() {
            with_stage(self.slots, self.shared, j, |stage, link| {
                stage.process_comment(out, link, message);
            });
        }
    }

    /// Announce the negotiated remote identity to every stage after the
    /// caller.
    pub fn dispatch_connect(&mut self, name: &str, info: &str, mtu: usize) {
        for j in self.index + 1..self.slots.len() {
            with_stage(self.slots, self.shared, j, |stage, link| {
                stage.on_connect(link, name, info, mtu);
            });
        }
    }

    /// Announce protocol loss to every stage after the caller.
    pub fn dispatch_disconnect(&mut self) {
        for j in self.index + 1..self.slots.len() {
            with_stage(self.slots, self.shared, j, |stage, link| {
                stage.on_disconnect(link);
            });
        }
    }

    /// Collect the enabled service layers of every stage after the caller.
    pub fn downstream_layers(&mut self, mut f: impl FnMut(&str)) {
        for slot in self.slots[self.index + 1..].iter() {
            let Some(stage) = slot.stage.as_ref() else {
                continue;
            };
            let mut layer = 0;
            while let Some(name) = stage.layer_name(layer) {
                if stage.layer_enabled(layer) {
                    if name.is_empty() {
                        f("?");
                    } else {
                        f(name);
                    }
                }
                layer += 1;
            }
        }
    }

    /// Ask every stage after the caller to emit its support descriptors.
    pub fn downstream_describe(&mut self, out: &mut Emitter) {
        for j in self.index + 1..self.slots.len() {
            with_stage(self.slots, self.shared, j, |stage, _| {
                stage.describe(out);
            });
        }
    }

    /// Push a message up the typed return path toward the gate.
    pub fn return_message(&mut self, message: &str) -> Status {
        for j in (0..self.index).rev() {
            let Some(status) = with_stage(self.slots, self.shared, j, |stage, link| {
                stage.return_message(link, message)
            }) else {
                continue;
            };
            match status {
                Status::Refuse => continue,
                other => return other,
            }
        }
        Status::Refuse
    }

    /// Push a packet up the typed return path toward the gate.
    pub fn return_packet(&mut self, channel: u8, data: &[u8]) -> Status {
        for j in (0..self.index).rev() {
            let Some(status) = with_stage(self.slots, self.shared, j, |stage, link| {
                stage.return_packet(link, channel, data)
            }) else {
                continue;
            };
            match status {
                Status::Refuse => continue,
                other => return other,
            }
        }
        Status::Refuse
    }
}
