//! The reactor: owner of the stage pipeline. The external byte bus feeds
//! it raw bytes and clock ticks; the reactor routes them through the
//! stages, applies posted events, and hands outbound bytes back to the
//! bus through its outbox.

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::error::{AttachError, FeedResult};
use crate::gateway::{Gateway, GatewayStats};
use crate::pipeline::{with_stage, Linkage, Pipeline, Shared, StageId};
use crate::protocol::{Ring, Role};
use crate::stage::{kind, Stage};

/// System events posted into a reactor, by the bus or by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The byte link is established.
    Join,
    /// The link was lost.
    Drop,
    /// The peer hung up.
    Hup,
    /// The peer asked to close the session (`?z` / `]z`).
    CloseRequest,
    /// The session was aborted from outside.
    Abort,
    /// The process is terminating.
    Terminated,
    /// A stage failed but can carry on; logged only.
    SoftFault,
    /// A stage failed irrecoverably; the reactor suspends.
    HardFault,
}

/// Read-only reactor environment handed to stage lifecycle callbacks.
#[derive(Debug, Clone)]
pub struct Env {
    role: Role,
    ring: Ring,
    system_name: String,
    system_type: String,
}

impl Env {
    pub(crate) fn new(role: Role, ring: Ring) -> Self {
        Self {
            role,
            ring,
            system_name: String::new(),
            system_type: String::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    /// Machine name advertised in info responses; may be empty.
    pub fn system_name(&self) -> &str {
        &self.system_name
    }

    /// Machine type advertised in info responses; may be empty.
    pub fn system_type(&self) -> &str {
        &self.system_type
    }
}

type SyncHook = Box<dyn FnMut(f32) + Send>;

pub struct Reactor {
    pipeline: Pipeline,
    shared: Shared,
    resume_bit: bool,
    join_bit: bool,
    events_enabled: bool,
    recorded: Vec<Event>,
    sync_hook: Option<SyncHook>,
}

impl Reactor {
    pub fn new(role: Role, ring: Ring) -> Self {
        Self {
            pipeline: Pipeline::default(),
            shared: Shared {
                env: Env::new(role, ring),
                outbox: Vec::new(),
                events: VecDeque::new(),
            },
            resume_bit: false,
            join_bit: false,
            events_enabled: true,
            recorded: Vec::new(),
            sync_hook: None,
        }
    }

    /// Set the machine identity advertised in info responses.
    pub fn with_identity(mut self, name: &str, machine_type: &str) -> Self {
        self.shared.env.system_name = name.to_owned();
        self.shared.env.system_type = machine_type.to_owned();
        self
    }

    /// Hook run after every stage has seen `sync(dt)`.
    pub fn set_sync_hook(&mut self, hook: impl FnMut(f32) + Send + 'static) {
        self.sync_hook = Some(Box::new(hook));
    }

    pub fn env(&self) -> &Env {
        &self.shared.env
    }

    pub fn role(&self) -> Role {
        self.shared.env.role
    }

    pub fn ring(&self) -> Ring {
        self.shared.env.ring
    }

    pub fn is_resumed(&self) -> bool {
        self.resume_bit
    }

    pub fn is_joined(&self) -> bool {
        self.join_bit
    }

    pub fn stage_count(&self) -> usize {
        self.pipeline.len()
    }

    /// Insert a stage in kind order. At most one gate-kind and one
    /// core-kind stage may be attached. If the reactor is already resumed
    /// the stage resumes (and joins) immediately; a resume refusal tears
    /// the whole reactor down, matching the failure policy of a resume
    /// pass.
    pub fn attach(&mut self, stage: Box<dyn Stage>) -> Result<StageId, AttachError> {
        let stage_kind = stage.kind();
        if kind::is_gate(stage_kind)
            && self
                .pipeline
                .find_kind(kind::GATE_BASE, kind::GATE_LAST)
                .is_some()
        {
            return Err(AttachError::DuplicateGate);
        }
        if kind::is_core(stage_kind)
            && self
                .pipeline
                .find_kind(kind::CORE_BASE, kind::CORE_LAST)
                .is_some()
        {
            return Err(AttachError::DuplicateCore);
        }
        let type_name = stage.type_name();
        let id = self.pipeline.insert(stage);
        let index = self.pipeline.index_of(id).expect("just inserted");
        {
            let slots = self.pipeline.slots_mut();
            let stage = slots[index].stage.as_mut().expect("slot occupied");
            stage.attach(&self.shared.env);
            if self.resume_bit && !stage.resume(&self.shared.env) {
                self.pipeline.remove(id);
                self.suspend();
                return Err(AttachError::ResumeFailed);
            }
        }
        if self.resume_bit && self.join_bit {
            with_stage(self.pipeline.slots_mut(), &mut self.shared, index, |s, l| {
                s.join(l)
            });
        }
        info!(stage = type_name, kind = stage_kind, "stage attached");
        self.process_events();
        Ok(id)
    }

    /// Remove a stage, walking it down through drop/suspend/detach first.
    /// Events raised during the teardown are recorded and re-posted once
    /// the stage is gone.
    pub fn detach(&mut self, id: StageId) -> Result<(), AttachError> {
        let index = self
            .pipeline
            .index_of(id)
            .ok_or(AttachError::UnknownStage(id))?;
        self.events_enabled = false;
        if self.resume_bit {
            if self.join_bit {
                with_stage(self.pipeline.slots_mut(), &mut self.shared, index, |s, l| {
                    s.drop_link(l)
                });
            }
            let slots = self.pipeline.slots_mut();
            if let Some(stage) = slots[index].stage.as_mut() {
                stage.suspend(&self.shared.env);
            }
        }
        {
            let slots = self.pipeline.slots_mut();
            if let Some(stage) = slots[index].stage.as_mut() {
                stage.detach(&self.shared.env);
            }
        }
        self.pipeline.remove(id);
        self.drain_into_record();
        self.events_enabled = true;
        let recorded = std::mem::take(&mut self.recorded);
        for event in recorded {
            self.apply_event(event);
        }
        self.process_events();
        Ok(())
    }

    /// Resume every stage head to tail. A refusal rolls back the stages
    /// already resumed, in reverse order, and leaves the reactor down.
    pub fn resume(&mut self) -> bool {
        if !self.resume_bit {
            let count = self.pipeline.len();
            let mut failed_at = None;
            {
                let slots = self.pipeline.slots_mut();
                for (i, slot) in slots.iter_mut().enumerate() {
                    let okay = slot
                        .stage
                        .as_mut()
                        .map(|s| s.resume(&self.shared.env))
                        .unwrap_or(true);
                    if !okay {
                        failed_at = Some(i);
                        break;
                    }
                }
                if let Some(stop) = failed_at {
                    for slot in slots[..stop].iter_mut().rev() {
                        if let Some(stage) = slot.stage.as_mut() {
                            stage.suspend(&self.shared.env);
                        }
                    }
                }
            }
            match failed_at {
                None => {
                    self.resume_bit = true;
                    info!(stages = count, "reactor resumed");
                    if self.join_bit {
                        self.dispatch_join();
                    }
                }
                Some(stop) => {
                    warn!(stage = stop, "stage refused to resume, rolled back");
                }
            }
            self.process_events();
        }
        self.resume_bit
    }

    /// Walk every stage down and clear the outbox. Idempotent.
    pub fn suspend(&mut self) {
        if self.resume_bit {
            if self.join_bit {
                self.dispatch_drop();
                self.join_bit = false;
            }
            let slots = self.pipeline.slots_mut();
            for slot in slots.iter_mut().rev() {
                if let Some(stage) = slot.stage.as_mut() {
                    stage.suspend(&self.shared.env);
                }
            }
            self.resume_bit = false;
            self.shared.outbox.clear();
            info!("reactor suspended");
        }
    }

    /// The byte link is up; stages observe `join` head to tail.
    pub fn join(&mut self) {
        if !self.join_bit {
            if self.resume_bit {
                self.dispatch_join();
            }
            self.join_bit = true;
        }
        self.process_events();
    }

    /// Inbound bytes from the transport. Walks the pipeline head to tail;
    /// a trailing refuse is a silent drop.
    pub fn feed(&mut self, data: &[u8]) -> FeedResult {
        let mut result = FeedResult::Refuse;
        for i in 0..self.pipeline.len() {
            let Some(r) = with_stage(self.pipeline.slots_mut(), &mut self.shared, i, |s, l| {
                s.feed(l, data)
            }) else {
                continue;
            };
            result = r;
            if r != FeedResult::Refuse {
                break;
            }
        }
        self.process_events();
        match result {
            FeedResult::Refuse => FeedResult::Okay,
            other => other,
        }
    }

    /// The transport observed a hangup.
    pub fn hup(&mut self) {
        self.post(Event::Hup);
    }

    /// Raise a system event.
    pub fn post(&mut self, event: Event) {
        self.apply_or_record(event);
        self.process_events();
    }

    /// Advance the clock: every stage sees `sync(dt)` head to tail, then
    /// the reactor's own sync hook runs.
    pub fn sync(&mut self, dt: f32) {
        for i in 0..self.pipeline.len() {
            with_stage(self.pipeline.slots_mut(), &mut self.shared, i, |s, l| {
                s.sync(l, dt)
            });
        }
        if let Some(hook) = self.sync_hook.as_mut() {
            hook(dt);
        }
        self.process_events();
    }

    /// Take the bytes queued for the transport.
    pub fn drain_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.shared.outbox)
    }

    pub fn has_output(&self) -> bool {
        !self.shared.outbox.is_empty()
    }

    // --- gateway access ---

    /// Run a closure against the attached gateway, if any.
    pub fn with_gateway<R>(
        &mut self,
        f: impl FnOnce(&mut Gateway, &mut Linkage<'_>) -> R,
    ) -> Option<R> {
        let index = self
            .pipeline
            .find_kind(kind::GATE_BASE, kind::GATE_LAST)?;
        let result = with_stage(self.pipeline.slots_mut(), &mut self.shared, index, |s, l| {
            let any: &mut dyn std::any::Any = s;
            any.downcast_mut::<Gateway>().map(|gateway| f(gateway, l))
        })
        .flatten();
        self.process_events();
        result
    }

    /// Send a raw line through a healthy user-role gateway.
    pub fn send_line(&mut self, text: &str) -> bool {
        self.with_gateway(|gateway, link| gateway.send_line(link, text))
            .unwrap_or(false)
    }

    /// Send a packet through a healthy user-role gateway.
    pub fn send_packet(&mut self, channel: u8, body: &[u8]) -> bool {
        self.with_gateway(|gateway, link| gateway.send_packet(link, channel, body))
            .unwrap_or(false)
    }

    /// Traffic counters of the attached gateway.
    pub fn gateway_stats(&self) -> Option<GatewayStats> {
        let index = self
            .pipeline
            .find_kind(kind::GATE_BASE, kind::GATE_LAST)?;
        let stage = self.pipeline.slots()[index].stage.as_ref()?;
        let any: &dyn std::any::Any = stage.as_ref();
        any.downcast_ref::<Gateway>().map(|g| g.stats())
    }

    /// Identity the remote peer reported, once the protocol is up.
    pub fn remote_identity(&self) -> Option<(String, String)> {
        let index = self
            .pipeline
            .find_kind(kind::GATE_BASE, kind::GATE_LAST)?;
        let stage = self.pipeline.slots()[index].stage.as_ref()?;
        let any: &dyn std::any::Any = stage.as_ref();
        let gateway = any.downcast_ref::<Gateway>()?;
        if gateway.is_healthy() {
            Some((
                gateway.remote_name().to_owned(),
                gateway.remote_info().to_owned(),
            ))
        } else {
            None
        }
    }

    // --- event plumbing ---

    fn apply_or_record(&mut self, event: Event) {
        if self.events_enabled {
            self.apply_event(event);
        } else if !self.recorded.contains(&event) {
            self.recorded.push(event);
        }
    }

    fn apply_event(&mut self, event: Event) {
        match event {
            Event::Join => {
                if !self.join_bit {
                    if self.resume_bit {
                        self.dispatch_join();
                    }
                    self.join_bit = true;
                }
            }
            Event::Drop | Event::Hup | Event::CloseRequest => {
                self.link_down();
            }
            Event::Abort | Event::Terminated | Event::HardFault => {
                warn!(?event, "fault event, suspending reactor");
                self.suspend();
            }
            Event::SoftFault => {
                warn!("soft fault reported by a stage");
            }
        }
    }

    fn process_events(&mut self) {
        while let Some(event) = self.shared.events.pop_front() {
            self.apply_or_record(event);
        }
    }

    fn drain_into_record(&mut self) {
        while let Some(event) = self.shared.events.pop_front() {
            if !self.recorded.contains(&event) {
                self.recorded.push(event);
            }
        }
    }

    fn link_down(&mut self) {
        if self.join_bit {
            if self.resume_bit {
                self.dispatch_drop();
            }
            self.join_bit = false;
            info!("link down");
        }
    }

    fn dispatch_join(&mut self) {
        for i in 0..self.pipeline.len() {
            with_stage(self.pipeline.slots_mut(), &mut self.shared, i, |s, l| {
                s.join(l)
            });
        }
    }

    fn dispatch_drop(&mut self) {
        for i in (0..self.pipeline.len()).rev() {
            with_stage(self.pipeline.slots_mut(), &mut self.shared, i, |s, l| {
                s.drop_link(l)
            });
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.suspend();
        let env = self.shared.env.clone();
        for slot in self.pipeline.slots_mut().iter_mut().rev() {
            if let Some(stage) = slot.stage.as_mut() {
                stage.detach(&env);
            }
        }
    }
}
