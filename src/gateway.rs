//! The gateway: the gate-kind stage between a raw byte transport and the
//! protocol stages. It frames inbound bytes into text lines and typed
//! binary packets, answers the standard info/ping/bye/sync requests,
//! assembles outbound packets, and runs the four liveness timers.

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::{EmcConfig, MTU_MAX, MTU_MIN};
use crate::error::{FeedResult, Status};
use crate::pipeline::Linkage;
use crate::protocol::{
    self, packet_header, round_packet_size, Ring, Role, ASCII_MAX, CHID_MAX, CHID_MIN, ENABLE_TAG,
    EOL, INFO_SIZE, MACHINE_NAME_NONE, MACHINE_TYPE_GENERIC, NAME_SIZE, NUL, ORDER_BE, ORDER_LE,
    PACKET_HEAD_SIZE, PACKET_SIZE_MAX, PACKET_SIZE_MULTIPLIER, PROTOCOL_NAME, PROTOCOL_VERSION,
    REQUEST_BYE, REQUEST_INFO, REQUEST_PING, REQUEST_SERVICE, RESPONSE_BYE, RESPONSE_INFO,
    RESPONSE_PONG, RESPONSE_SERVICE, RET, SPC, TAG_HELP, TAG_REQUEST, TAG_RESPONSE, TAG_SYNC,
};
use crate::reactor::{Env, Event};
use crate::stage::{kind, Stage};
use crate::timer::Timer;
use crate::transport::{self, Encoding};

/// One typed value for the [`Emitter`] formatter.
pub enum Value<'a> {
    Char(u8),
    Text(&'a str),
    Dec(i64),
    /// Lowercase hex, zero-padded to the given width (0 = no padding).
    Hex(u64, usize),
    /// Uppercase hex, zero-padded to the given width (0 = no padding).
    HexUpper(u64, usize),
    /// Fixed-point float with the given precision.
    Float(f32, usize),
}

struct PacketAssembly {
    channel: u8,
    /// Body size rounded up to the packet multiplier.
    size: usize,
}

/// The gateway's transmit queue: a capacity-bounded byte buffer with a
/// small typed formatter and packet assembly on top.
///
/// Text writes are refused while a packet is being assembled. All writes
/// are best-effort: exceeding the capacity bound drops the write and
/// returns false, mirroring the wire rule that a message which does not
/// fit is a message lost.
pub struct Emitter {
    data: Vec<u8>,
    limit: usize,
    packet: Option<PacketAssembly>,
    messages: u32,
}

impl Emitter {
    pub(crate) fn new(reserve_min: usize, limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(reserve_min),
            limit,
            packet: None,
            messages: 0,
        }
    }

    fn fits(&self, additional: usize) -> bool {
        self.data.len() + additional <= self.limit
    }

    pub fn put_char(&mut self, c: u8) -> bool {
        if self.packet.is_some() || !self.fits(1) {
            return false;
        }
        self.data.push(c);
        if c == EOL {
            self.messages += 1;
        }
        true
    }

    pub fn put_text(&mut self, text: &str) -> bool {
        if self.packet.is_some() || !self.fits(text.len()) {
            return false;
        }
        self.data.extend_from_slice(text.as_bytes());
        self.messages += text.bytes().filter(|&b| b == EOL).count() as u32;
        true
    }

    /// Render a sequence of typed values contiguously.
    pub fn put(&mut self, values: &[Value<'_>]) -> bool {
        for value in values {
            let okay = match *value {
                Value::Char(c) => self.put_char(c),
                Value::Text(text) => self.put_text(text),
                Value::Dec(v) => self.put_text(&format!("{v}")),
                Value::Hex(v, 0) => self.put_text(&format!("{v:x}")),
                Value::Hex(v, width) => self.put_text(&format!("{v:0width$x}")),
                Value::HexUpper(v, 0) => self.put_text(&format!("{v:X}")),
                Value::HexUpper(v, width) => self.put_text(&format!("{v:0width$X}")),
                Value::Float(v, precision) => self.put_text(&format!("{v:.precision$}")),
            };
            if !okay {
                return false;
            }
        }
        true
    }

    pub fn end_line(&mut self) -> bool {
        self.put_char(EOL)
    }

    /// Begin a packet: writes the header and locks the queue for body
    /// bytes. Requires an empty queue and no assembly in progress.
    pub fn prepare_packet(&mut self, channel: u8, size: usize) -> bool {
        if !self.data.is_empty() || self.packet.is_some() {
            return false;
        }
        if !(CHID_MIN..=CHID_MAX).contains(&channel) {
            return false;
        }
        let rounded = round_packet_size(size);
        if rounded > PACKET_SIZE_MAX || !self.fits(PACKET_HEAD_SIZE + rounded) {
            return false;
        }
        self.data
            .extend_from_slice(&packet_header(channel, rounded));
        self.packet = Some(PacketAssembly {
            channel,
            size: rounded,
        });
        true
    }

    /// Append the packet body, zero-padded to the rounded size.
    pub fn fill_packet(&mut self, body: &[u8]) -> bool {
        let Some(packet) = &self.packet else {
            return false;
        };
        let rounded = packet.size;
        if !self.fits(rounded) {
            return false;
        }
        let copy = body.len().min(rounded);
        self.data.extend_from_slice(&body[..copy]);
        self.data.resize(self.data.len() + (rounded - copy), 0);
        true
    }

    /// Reserve the zero-filled body slice for in-place writes.
    pub fn reserve_packet(&mut self) -> Option<&mut [u8]> {
        let rounded = self.packet.as_ref()?.size;
        if !self.fits(rounded) {
            return None;
        }
        let start = self.data.len();
        self.data.resize(start + rounded, 0);
        Some(&mut self.data[start..])
    }

    /// Append an all-zero body.
    pub fn zero_packet(&mut self) -> bool {
        self.fill_packet(&[])
    }

    /// Close the assembly; the queued bytes are ready to flush.
    fn finish_packet(&mut self) -> bool {
        if self.packet.take().is_some() {
            self.messages += 1;
            true
        } else {
            false
        }
    }

    /// Abort the assembly and discard the queued header and body.
    pub fn drop_packet(&mut self) -> bool {
        if self.packet.take().is_some() {
            self.data.clear();
            true
        } else {
            false
        }
    }

    pub fn packet_pending(&self) -> bool {
        self.packet.is_some()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    fn restore_buffer(&mut self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.data = buffer;
    }

    fn take_messages(&mut self) -> u32 {
        std::mem::take(&mut self.messages)
    }

    fn clear(&mut self) {
        self.data.clear();
        self.packet = None;
        self.messages = 0;
    }
}

/// Behaviour switches for a gateway instance.
#[derive(Debug, Clone, Copy)]
pub struct GatewayOptions {
    /// Flush the transmit queue as soon as a line terminator is written.
    pub auto_flush: bool,
    /// Suppress status (error and ready) responses; for proxy use.
    pub stealth: bool,
    /// Re-dispatch unparseable requests to comment listeners.
    pub error_comment: bool,
    /// Transport encoding applied to outbound packet bodies.
    pub encoding: Encoding,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            auto_flush: true,
            stealth: false,
            error_comment: false,
            encoding: Encoding::None,
        }
    }
}

/// Traffic counters and queue occupancy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    pub msg_recv: u32,
    pub msg_drop: u32,
    pub msg_tmit: u32,
    pub chr_recv: u64,
    pub chr_tmit: u64,
    pub recv_queue: usize,
    pub send_queue: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    /// Reject all input; set until the first resume and after a drop.
    Drop,
    /// Skip input until the end of the broken message or packet.
    Recover,
    /// Classify the next byte.
    Accept,
    CaptureMessage,
    CapturePacket,
}

struct RecvPacket {
    channel: u8,
    size: usize,
    left: usize,
}

pub struct Gateway {
    options: GatewayOptions,

    recv: Vec<u8>,
    recv_limit: usize,
    recv_state: RecvState,
    recv_packet: Option<RecvPacket>,
    swallow_lf: bool,
    recv_mtu: usize,

    send: Emitter,
    send_mtu: usize,

    gate_name: String,
    gate_info: String,

    ping_time: f32,
    info_time: f32,
    drop_time: f32,
    trip_time: f32,

    ping_ctr: Timer,
    info_ctr: Timer,
    drop_ctr: Timer,
    trip_ctr: Timer,
    ping_await: bool,
    run_time: f32,

    host_role: bool,
    user_role: bool,
    resume_bit: bool,
    join_bit: bool,
    healthy_bit: bool,

    msg_recv: u32,
    msg_drop: u32,
    msg_tmit: u32,
    chr_recv: u64,
    chr_tmit: u64,
}

impl Gateway {
    pub fn new(config: &EmcConfig, options: GatewayOptions) -> Self {
        Self {
            options,
            recv: Vec::with_capacity(config.queue_size_min),
            recv_limit: config.queue_size_max,
            recv_state: RecvState::Drop,
            recv_packet: None,
            swallow_lf: false,
            recv_mtu: config.mtu_size,
            send: Emitter::new(config.queue_size_min, config.queue_size_max),
            send_mtu: config.mtu_size,
            gate_name: String::new(),
            gate_info: String::new(),
            ping_time: config.message_ping_time,
            info_time: config.info_time(),
            drop_time: config.message_drop_time,
            trip_time: config.message_trip_time,
            ping_ctr: Timer::new(false),
            info_ctr: Timer::new(false),
            drop_ctr: Timer::new(false),
            trip_ctr: Timer::new(false),
            ping_await: false,
            run_time: 0.0,
            host_role: false,
            user_role: false,
            resume_bit: false,
            join_bit: false,
            healthy_bit: false,
            msg_recv: 0,
            msg_drop: 0,
            msg_tmit: 0,
            chr_recv: 0,
            chr_tmit: 0,
        }
    }

    /// Name the remote reported in its info response.
    pub fn remote_name(&self) -> &str {
        &self.gate_name
    }

    /// Machine type the remote reported in its info response.
    pub fn remote_info(&self) -> &str {
        &self.gate_info
    }

    pub fn send_mtu(&self) -> usize {
        self.send_mtu
    }

    pub fn set_send_mtu(&mut self, mtu: usize) -> bool {
        if (MTU_MIN..=MTU_MAX).contains(&mtu) {
            self.send_mtu = mtu;
            return true;
        }
        false
    }

    pub fn set_drop_time(&mut self, value: f32) -> bool {
        if value > 0.0 && value < 300.0 && value < self.trip_time {
            self.drop_time = value;
            return true;
        }
        false
    }

    pub fn set_trip_time(&mut self, value: f32) -> bool {
        if value > self.drop_time && value < 600.0 {
            self.trip_time = value;
            return true;
        }
        false
    }

    pub fn is_resumed(&self) -> bool {
        self.resume_bit
    }

    pub fn is_joined(&self) -> bool {
        self.join_bit
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy_bit
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            msg_recv: self.msg_recv,
            msg_drop: self.msg_drop,
            msg_tmit: self.msg_tmit,
            chr_recv: self.chr_recv,
            chr_tmit: self.chr_tmit,
            recv_queue: self.recv.len(),
            send_queue: self.send.len(),
        }
    }

    /// Send a complete line on a healthy user link. The caller supplies the
    /// tag; the terminator is appended here. Lines above the negotiated MTU
    /// are rejected.
    pub fn send_line(&mut self, link: &mut Linkage<'_>, text: &str) -> bool {
        if !(self.resume_bit && self.healthy_bit && self.user_role) {
            return false;
        }
        if text.len() > self.send_mtu {
            return false;
        }
        self.send.put_text(text);
        self.send.end_line();
        if self.options.auto_flush {
            self.flush(link);
        }
        true
    }

    /// Send a packet on a healthy user link, applying the configured
    /// transport encoding to the body.
    pub fn send_packet(&mut self, link: &mut Linkage<'_>, channel: u8, body: &[u8]) -> bool {
        if !(self.resume_bit && self.healthy_bit && self.user_role) {
            return false;
        }
        let okay = match self.options.encoding {
            Encoding::None => {
                self.send.prepare_packet(channel, body.len()) && self.send.fill_packet(body)
            }
            Encoding::Base16 => {
                let encoded = transport::base16_encode(body);
                self.send.prepare_packet(channel, encoded.len())
                    && self.send.fill_packet(&encoded)
            }
            Encoding::Base64 => {
                let encoded = transport::base64_encode(body);
                self.send.prepare_packet(channel, encoded.len())
                    && self.send.fill_packet(&encoded)
            }
        };
        if !okay {
            self.send.drop_packet();
            return false;
        }
        self.emit_packet(link)
    }

    fn emit_packet(&mut self, link: &mut Linkage<'_>) -> bool {
        if !self.send.finish_packet() {
            return false;
        }
        self.flush(link);
        true
    }

    /// Push the transmit queue up the return path toward the transport.
    pub fn flush(&mut self, link: &mut Linkage<'_>) {
        if self.send.is_empty() {
            return;
        }
        let buffer = self.send.take_buffer();
        self.chr_tmit += buffer.len() as u64;
        self.msg_tmit += self.send.take_messages();
        link.send_upstream(&buffer);
        self.send.restore_buffer(buffer);
    }

    // --- outbound protocol frames ---

    fn send_info_response(&mut self, env: &Env) -> Status {
        let name = match env.system_name() {
            "" => MACHINE_NAME_NONE,
            name => name,
        };
        let machine_type = match env.system_type() {
            "" => MACHINE_TYPE_GENERIC,
            t => t,
        };
        let order = if cfg!(target_endian = "little") {
            ORDER_LE
        } else {
            ORDER_BE
        };
        self.send.put(&[
            Value::Char(TAG_RESPONSE),
            Value::Char(RESPONSE_INFO),
            Value::Char(SPC),
            Value::Text(PROTOCOL_NAME),
            Value::Char(SPC),
            Value::Text(PROTOCOL_VERSION),
            Value::Char(SPC),
            Value::Text(name),
            Value::Char(SPC),
            Value::Text(machine_type),
            Value::Char(SPC),
            Value::Text(std::env::consts::ARCH),
            Value::Char(b'_'),
            Value::Text(order),
            Value::Char(SPC),
            Value::HexUpper(self.recv_mtu as u64, 0),
            Value::Char(EOL),
        ]);
        Status::Okay
    }

    fn send_info_request(&mut self) {
        self.send.put(&[
            Value::Char(TAG_REQUEST),
            Value::Char(REQUEST_INFO),
            Value::Char(EOL),
        ]);
    }

    fn send_service_response(&mut self, link: &mut Linkage<'_>) -> Status {
        let send = &mut self.send;
        send.put(&[
            Value::Char(TAG_RESPONSE),
            Value::Char(RESPONSE_SERVICE),
            Value::Char(ENABLE_TAG),
        ]);
        link.downstream_layers(|name| {
            send.put(&[Value::Char(SPC), Value::Text(name)]);
        });
        send.end_line();
        Status::Okay
    }

    fn send_sync_response(&mut self, link: &mut Linkage<'_>) -> Status {
        let env = link.env().clone();
        self.send_info_response(&env);
        self.send_service_response(link);
        link.downstream_describe(&mut self.send);
        Status::Okay
    }

    fn send_ping_request(&mut self) {
        if self.ping_await {
            return;
        }
        // cookie: uptime folded to one day, in 1/16 millisecond ticks
        let exec_time = self.run_time % 86400.0;
        let cookie = (exec_time / 0.0010625) as i64;
        if cookie > 0 {
            self.send.put(&[
                Value::Char(TAG_REQUEST),
                Value::Char(REQUEST_PING),
                Value::Char(SPC),
                Value::HexUpper(cookie as u64, 0),
                Value::Char(EOL),
            ]);
            self.ping_await = true;
        }
    }

    fn send_pong_response(&mut self, cookie: Option<&str>) -> Status {
        match cookie {
            Some(word) => self.send.put(&[
                Value::Char(TAG_RESPONSE),
                Value::Char(RESPONSE_PONG),
                Value::Char(SPC),
                Value::Text(word),
                Value::Char(EOL),
            ]),
            None => self.send.put(&[
                Value::Char(TAG_RESPONSE),
                Value::Char(RESPONSE_PONG),
                Value::Char(EOL),
            ]),
        };
        Status::Okay
    }

    fn send_bye_response(&mut self) -> Status {
        self.send_error_response(Status::Okay, None)
    }

    fn send_error_response(&mut self, status: Status, extra: Option<&str>) -> Status {
        if self.options.stealth {
            return status;
        }
        let status = if status == Status::Refuse {
            Status::NoRequest
        } else {
            status
        };
        self.send.put(&[
            Value::Char(TAG_RESPONSE),
            Value::HexUpper(status.wire_code() as u64, 2),
        ]);
        let mut terminate = false;
        let mut separate = false;
        if let Some(stock) = status.stock_message() {
            self.send
                .put(&[Value::Char(SPC), Value::Text(stock)]);
            terminate = true;
            separate = true;
        }
        if let Some(text) = extra.filter(|t| !t.is_empty()) {
            if separate {
                self.send.put_char(b':');
            }
            self.send.put(&[Value::Char(SPC), Value::Text(text)]);
            terminate = true;
        }
        if terminate {
            self.send.put_char(b'.');
        }
        self.send.end_line();
        status
    }

    // --- inbound dispatch ---

    fn feed_request(&mut self, link: &mut Linkage<'_>, line: &str) {
        link.dispatch_message(&mut self.send, line);
        let argv = Command::parse(&line[1..]);
        let mut status = Status::Parse;
        if !argv.is_empty() {
            status = Status::NoRequest;
            let head = argv.get(0).expect("non-empty argv");
            if head.has_size(1) {
                status = match head.chr(0) {
                    REQUEST_INFO => {
                        if argv.has_count(1) {
                            let env = link.env().clone();
                            self.send_info_response(&env)
                        } else {
                            Status::Parse
                        }
                    }
                    REQUEST_PING => match argv.len() {
                        1 => self.send_pong_response(None),
                        2 => self.send_pong_response(Some(argv.text(1))),
                        _ => Status::Parse,
                    },
                    REQUEST_BYE => {
                        self.send_bye_response();
                        link.post(Event::CloseRequest);
                        Status::Okay
                    }
                    REQUEST_SERVICE => {
                        if argv.has_count(1) {
                            self.send_service_response(link)
                        } else {
                            Status::Parse
                        }
                    }
                    _ => Status::NoRequest,
                };
            }
            if status == Status::NoRequest {
                status = link.forward_request(&mut self.send, &argv);
            }
        }
        if !status.is_okay() {
            self.send_error_response(status, None);
            if status == Status::Parse && self.options.error_comment {
                link.dispatch_comment(&mut self.send, line);
            }
        }
    }

    fn feed_help_request(&mut self, link: &mut Linkage<'_>, line: &str) {
        link.dispatch_message(&mut self.send, line);
        // the help response is intentionally empty
    }

    fn feed_sync_request(&mut self, link: &mut Linkage<'_>, line: &str) {
        link.dispatch_message(&mut self.send, line);
        self.send_sync_response(link);
    }

    fn feed_response(&mut self, link: &mut Linkage<'_>, line: &str) {
        link.dispatch_message(&mut self.send, line);
        let argv = Command::parse(&line[1..]);
        let mut status = Status::Parse;
        if !argv.is_empty() {
            let tag = argv.get(0).expect("non-empty argv").chr(0);
            status = match tag {
                RESPONSE_INFO => self.accept_info_response(link, &argv),
                RESPONSE_SERVICE => {
                    self.trip_ctr.reset();
                    Status::Okay
                }
                RESPONSE_PONG => {
                    self.trip_ctr.reset();
                    self.ping_await = false;
                    Status::Okay
                }
                b'0'..=b'9' | b'A'..=b'F' => {
                    // a status line; the code already reached message
                    // listeners through dispatch_message
                    self.trip_ctr.reset();
                    Status::Okay
                }
                RESPONSE_BYE => {
                    self.trip_ctr.reset();
                    link.post(Event::CloseRequest);
                    Status::Okay
                }
                _ => link.forward_response(&mut self.send, &argv),
            };
        }
        match status {
            Status::Okay => {}
            Status::NoResponse | Status::Refuse => {
                // silent: a stray response is logged, never answered
                debug!(line, "response not claimed by any stage");
            }
            other => {
                self.send_error_response(other, None);
            }
        }
    }

    fn accept_info_response(&mut self, link: &mut Linkage<'_>, argv: &Command<'_>) -> Status {
        if argv.len() < 7 {
            return Status::Parse;
        }
        if argv.text(1) != PROTOCOL_NAME || !argv.text(2).starts_with(PROTOCOL_VERSION) {
            return Status::Parse;
        }
        let name = argv.text(3);
        let machine_info = argv.text(4);
        if name.is_empty() || name.len() > NAME_SIZE {
            return Status::Parse;
        }
        if machine_info.is_empty() || machine_info.len() > INFO_SIZE {
            return Status::Parse;
        }
        let Some(mtu) = argv.get(6).and_then(|t| t.hex()) else {
            return Status::Parse;
        };
        let mtu = mtu as usize;
        self.gate_name = name.to_owned();
        self.gate_info = machine_info.to_owned();
        self.set_send_mtu(mtu);
        self.info_ctr.suspend();
        self.trip_ctr.reset();
        if !self.healthy_bit {
            self.healthy_bit = true;
            info!(name, info = machine_info, mtu, "protocol up");
            link.dispatch_connect(name, machine_info, mtu);
        }
        Status::Okay
    }

    fn feed_comment(&mut self, link: &mut Linkage<'_>, line: &str) {
        link.dispatch_comment(&mut self.send, line);
    }

    // --- receive state machine ---

    fn capture_message(
        &mut self,
        link: &mut Linkage<'_>,
        data: &[u8],
        mut i: usize,
        feed_rc: &mut FeedResult,
    ) -> usize {
        while i < data.len() {
            let b = data[i];
            i += 1;
            if b == NUL || b == RET || b == EOL {
                if b == RET {
                    self.swallow_lf = true;
                }
                self.commit_message(link);
                return i;
            }
            if self.recv.len() >= self.recv_limit {
                *feed_rc = FeedResult::Fail;
                self.recv.clear();
                self.recv_packet = None;
                self.recv_state = RecvState::Recover;
                self.drop_ctr.reset();
                return i;
            }
            self.recv.push(b);
        }
        self.drop_ctr.reset();
        i
    }

    fn commit_message(&mut self, link: &mut Linkage<'_>) {
        self.recv_state = RecvState::Accept;
        self.msg_recv += 1;
        self.drop_ctr.reset();
        let buffer = std::mem::take(&mut self.recv);
        match std::str::from_utf8(&buffer) {
            Ok(line) => {
                if self.host_role {
                    if line.as_bytes().first() == Some(&TAG_REQUEST) {
                        self.feed_request(link, line);
                    } else if line.len() == 1 && line.as_bytes()[0] == TAG_HELP {
                        self.feed_help_request(link, line);
                    } else if line.len() == 1 && line.as_bytes()[0] == TAG_SYNC {
                        self.feed_sync_request(link, line);
                    } else {
                        self.feed_comment(link, line);
                    }
                } else if self.user_role {
                    if line.as_bytes().first() == Some(&TAG_RESPONSE) {
                        self.feed_response(link, line);
                    } else {
                        self.feed_comment(link, line);
                    }
                }
            }
            Err(_) => {
                self.send_error_response(Status::Parse, None);
            }
        }
        self.recv = buffer;
        self.recv.clear();
    }

    fn capture_packet(
        &mut self,
        link: &mut Linkage<'_>,
        data: &[u8],
        i: usize,
        feed_rc: &mut FeedResult,
    ) -> usize {
        let available = data.len() - i;
        let read = match &self.recv_packet {
            Some(packet) => available.min(packet.left),
            None => available.min(PACKET_HEAD_SIZE - self.recv.len()),
        };
        if self.recv.len() + read > self.recv_limit {
            *feed_rc = FeedResult::Fail;
            // skip whatever is still owed to this packet, then resume
            self.recv.clear();
            self.recv_state = RecvState::Recover;
            self.drop_ctr.reset();
            return i;
        }
        self.recv.extend_from_slice(&data[i..i + read]);
        match &mut self.recv_packet {
            None => {
                if self.recv.len() >= PACKET_HEAD_SIZE {
                    let channel = protocol::PACKET_MARKER_BASE - self.recv[0];
                    let digits = std::str::from_utf8(&self.recv[1..PACKET_HEAD_SIZE])
                        .ok()
                        .and_then(|s| usize::from_str_radix(s, 16).ok());
                    match digits {
                        Some(eights) => {
                            let size = eights * PACKET_SIZE_MULTIPLIER;
                            self.recv_packet = Some(RecvPacket {
                                channel,
                                size,
                                left: size,
                            });
                            if size == 0 {
                                self.dispatch_packet(link);
                            }
                        }
                        None => {
                            warn!("malformed packet header, recovering");
                            *feed_rc = FeedResult::Fail;
                            self.recv.clear();
                            self.recv_packet = None;
                            self.recv_state = RecvState::Recover;
                        }
                    }
                }
            }
            Some(packet) => {
                packet.left -= read;
                if packet.left == 0 {
                    self.dispatch_packet(link);
                }
            }
        }
        self.drop_ctr.reset();
        i + read
    }

    fn dispatch_packet(&mut self, link: &mut Linkage<'_>) {
        let Some(packet) = self.recv_packet.take() else {
            return;
        };
        self.recv_state = RecvState::Accept;
        self.msg_recv += 1;
        let buffer = std::mem::take(&mut self.recv);
        let body = &buffer[PACKET_HEAD_SIZE.min(buffer.len())..];
        debug!(
            channel = packet.channel,
            size = packet.size,
            "packet received"
        );
        link.forward_packet(&mut self.send, packet.channel, body);
        self.recv = buffer;
        self.recv.clear();
    }

    fn recover(&mut self, data: &[u8], mut i: usize) -> usize {
        if let Some(packet) = &mut self.recv_packet {
            let available = data.len() - i;
            let skip = available.min(packet.left);
            packet.left -= skip;
            if packet.left == 0 {
                self.recv_packet = None;
                self.msg_drop += 1;
                self.recv_state = RecvState::Accept;
            }
            self.drop_ctr.reset();
            return i + skip;
        }
        while i < data.len() {
            let b = data[i];
            i += 1;
            if b == NUL || b == RET || b == EOL {
                if b == RET {
                    self.swallow_lf = true;
                }
                self.msg_drop += 1;
                self.recv_state = RecvState::Accept;
                break;
            }
        }
        self.drop_ctr.reset();
        i
    }

    /// Drop timer fired: discard the partially received message.
    fn gate_drop(&mut self) {
        if !self.recv.is_empty() {
            self.recv.clear();
            self.recv_packet = None;
            self.recv_state = RecvState::Recover;
        }
    }

    /// Trip timer fired: the peer is unreachable.
    fn gate_trip(&mut self, link: &mut Linkage<'_>) {
        if self.user_role {
            warn!(trip_time = self.trip_time, "peer unreachable, dropping link");
            link.post(Event::Drop);
        }
    }
}

impl Stage for Gateway {
    fn kind(&self) -> u8 {
        kind::GATE
    }

    fn type_name(&self) -> &'static str {
        "gateway"
    }

    fn resume(&mut self, env: &Env) -> bool {
        if !self.user_role && !self.host_role && !self.resume_bit {
            self.join_bit = false;
            self.healthy_bit = false;
            self.msg_recv = 0;
            self.msg_drop = 0;
            self.msg_tmit = 0;
            match env.role() {
                Role::User => {
                    self.user_role = true;
                    self.resume_bit = true;
                    self.recv_state = RecvState::Accept;
                }
                Role::Host | Role::Proxy => {
                    self.host_role = env.role() == Role::Host;
                    self.resume_bit = true;
                    self.join_bit = true;
                    self.healthy_bit = true;
                    self.recv_state = RecvState::Accept;
                }
                Role::Undef => {}
            }
        }
        self.resume_bit
    }

    fn join(&mut self, link: &mut Linkage<'_>) {
        self.ping_ctr.reset();
        self.info_ctr.reset();
        self.drop_ctr.reset();
        self.trip_ctr.reset();
        self.drop_ctr.resume(true);
        if self.user_role {
            if link.env().ring() == Ring::Network {
                self.ping_ctr.resume(true);
            }
            self.info_ctr.resume(true);
            self.trip_ctr.resume(true);
            self.join_bit = true;
            debug!("gateway joined as user");
        }
        if self.host_role {
            self.send_sync_response(link);
            self.flush(link);
        }
        self.run_time = 0.0;
    }

    fn feed(&mut self, link: &mut Linkage<'_>, data: &[u8]) -> FeedResult {
        let mut feed_rc = FeedResult::Okay;
        if self.recv_state != RecvState::Drop {
            let mut i = 0;
            while i < data.len() {
                match self.recv_state {
                    RecvState::Accept => {
                        let b = data[i];
                        if self.swallow_lf {
                            self.swallow_lf = false;
                            if b == EOL {
                                i += 1;
                                continue;
                            }
                        }
                        if b == protocol::PACKET_MARKER_BASE || b == ASCII_MAX {
                            i += 1;
                        } else if b < ASCII_MAX {
                            self.recv.clear();
                            self.recv_state = RecvState::CaptureMessage;
                        } else {
                            self.recv.clear();
                            self.recv_packet = None;
                            self.recv_state = RecvState::CapturePacket;
                        }
                    }
                    RecvState::CaptureMessage => {
                        i = self.capture_message(link, data, i, &mut feed_rc);
                    }
                    RecvState::CapturePacket => {
                        i = self.capture_packet(link, data, i, &mut feed_rc);
                    }
                    RecvState::Recover => {
                        i = self.recover(data, i);
                    }
                    RecvState::Drop => break,
                }
            }
        }
        self.chr_recv += data.len() as u64;
        self.ping_ctr.reset();
        self.trip_ctr.reset();
        if self.options.auto_flush && !self.send.is_empty() {
            self.flush(link);
        }
        feed_rc
    }

    fn drop_link(&mut self, link: &mut Linkage<'_>) {
        if self.join_bit {
            if self.user_role && self.healthy_bit {
                link.dispatch_disconnect();
                self.healthy_bit = false;
            }
            self.user_role = false;
            self.host_role = false;
            self.recv_state = RecvState::Drop;
            self.join_bit = false;
            self.healthy_bit = false;
        }
        self.recv.clear();
        self.recv_packet = None;
        self.send.clear();
        self.ping_ctr.suspend();
        self.info_ctr.suspend();
        self.drop_ctr.suspend();
        self.trip_ctr.suspend();
        self.ping_await = false;
    }

    fn suspend(&mut self, _env: &Env) {
        if self.resume_bit {
            self.join_bit = false;
            self.healthy_bit = false;
            self.recv.clear();
            self.recv_packet = None;
            self.send.clear();
            self.ping_ctr.suspend();
            self.info_ctr.suspend();
            self.drop_ctr.suspend();
            self.trip_ctr.suspend();
            self.user_role = false;
            self.host_role = false;
            self.recv_state = RecvState::Drop;
            self.gate_name.clear();
            self.gate_info.clear();
            self.ping_await = false;
            self.resume_bit = false;
        }
    }

    fn sync(&mut self, link: &mut Linkage<'_>, dt: f32) {
        self.ping_ctr.update(dt);
        if self.ping_ctr.test(self.ping_time) {
            self.send_ping_request();
            self.ping_ctr.reset();
        }
        self.info_ctr.update(dt);
        if self.info_ctr.test(self.info_time) {
            self.send_info_request();
            self.info_ctr.reset();
        }
        self.drop_ctr.update(dt);
        if self.drop_ctr.test(self.drop_time) {
            self.gate_drop();
            self.drop_ctr.reset();
        }
        self.trip_ctr.update(dt);
        if self.trip_ctr.test(self.trip_time) {
            self.gate_trip(link);
            self.trip_ctr.reset();
        }
        if self.join_bit {
            self.run_time += dt;
        }
        if self.options.auto_flush && !self.send.is_empty() {
            self.flush(link);
        }
    }

    fn return_message(&mut self, link: &mut Linkage<'_>, message: &str) -> Status {
        self.send.put_text(message);
        if self.options.auto_flush {
            self.flush(link);
        }
        Status::Okay
    }

    fn return_packet(&mut self, link: &mut Linkage<'_>, channel: u8, data: &[u8]) -> Status {
        if self.send.prepare_packet(channel, data.len()) && self.send.fill_packet(data) {
            if self.emit_packet(link) {
                return Status::Okay;
            }
        }
        self.send.drop_packet();
        Status::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> Emitter {
        Emitter::new(64, 4096)
    }

    #[test]
    fn formatter_renders_typed_values() {
        let mut out = emitter();
        out.put(&[
            Value::Char(b']'),
            Value::HexUpper(0x7f, 2),
            Value::Char(b' '),
            Value::Dec(-12),
            Value::Char(b' '),
            Value::Hex(255, 0),
            Value::Char(b' '),
            Value::Float(1.5, 2),
            Value::Char(b'\n'),
        ]);
        assert_eq!(out.as_slice(), b"]7F -12 ff 1.50\n");
    }

    #[test]
    fn emitter_enforces_capacity() {
        let mut out = Emitter::new(4, 8);
        assert!(out.put_text("12345678"));
        assert!(!out.put_char(b'9'));
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn packet_assembly_blocks_text() {
        let mut out = emitter();
        assert!(out.prepare_packet(5, 3));
        assert!(!out.put_text("no text during assembly"));
        assert!(out.fill_packet(b"abc"));
        // header + body rounded to 8
        assert_eq!(out.len(), 4 + 8);
        assert_eq!(&out.as_slice()[..4], &[0xfa, b'0', b'0', b'1']);
        assert_eq!(&out.as_slice()[4..7], b"abc");
        assert_eq!(&out.as_slice()[7..], &[0u8; 5]);
        assert!(out.finish_packet());
        assert!(out.put_text("text again"));
    }

    #[test]
    fn prepare_packet_requires_empty_queue() {
        let mut out = emitter();
        out.put_text("pending");
        assert!(!out.prepare_packet(1, 8));
    }

    #[test]
    fn prepare_packet_validates_channel_and_size() {
        let mut out = emitter();
        assert!(!out.prepare_packet(0, 8));
        assert!(!out.prepare_packet(128, 8));
        // a body that rounds past the largest encodable size is rejected
        // even when the queue could hold it
        let mut wide = Emitter::new(64, 65536);
        assert!(!wide.prepare_packet(1, PACKET_SIZE_MAX + 1));
        assert!(wide.prepare_packet(1, PACKET_SIZE_MAX));
        assert_eq!(&wide.as_slice()[..4], &[0xfe, b'f', b'f', b'f']);
    }

    #[test]
    fn drop_packet_discards_header() {
        let mut out = emitter();
        assert!(out.prepare_packet(2, 4));
        assert!(out.drop_packet());
        assert!(out.is_empty());
        assert!(!out.packet_pending());
    }

    #[test]
    fn timer_setters_keep_drop_below_trip() {
        let mut gateway = Gateway::new(&EmcConfig::default(), GatewayOptions::default());
        // defaults: drop 32 s, trip 256 s
        assert!(!gateway.set_drop_time(299.0));
        assert!(gateway.set_drop_time(100.0));
        assert!(!gateway.set_trip_time(50.0));
        assert!(gateway.set_trip_time(400.0));
        assert!(gateway.set_drop_time(299.0));
    }

    #[test]
    fn message_counter_tracks_lines_and_packets() {
        let mut out = emitter();
        out.put_text("one\ntwo\n");
        assert_eq!(out.take_messages(), 2);
        assert_eq!(out.take_messages(), 0);

        let mut out = emitter();
        assert!(out.prepare_packet(1, 0) && out.zero_packet() && out.finish_packet());
        assert_eq!(out.take_messages(), 1);
    }
}
