//! The mapper: the core-kind stage that exposes the device layer. It owns
//! the device table and the open-stream table, allocates channel
//! identifiers, and answers the `support`/`describe`/`o`/`x` verbs.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::command::Command;
use crate::config::{DEVICE_COUNT_MAX, STREAM_COUNT_MAX};
use crate::error::{MapperError, Status};
use crate::gateway::{Emitter, Value};
use crate::pipeline::Linkage;
use crate::protocol::{
    CHID_MAX, CHID_MIN, DISABLE_TAG, ENABLE_TAG, RESPONSE_CHANNEL, RESPONSE_SUPPORT, SPC,
    TAG_RESPONSE,
};
use crate::stage::{kind, Stage};

/// Device names on the wire are at most this many bytes.
pub const DEVICE_NAME_SIZE: usize = 8;

/// Access and mode bits of a device, rendered as the four-character
/// `<t|-><r|-><w|-><b|->` string in support lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFlags {
    /// The device carries a time base.
    pub sync: bool,
    /// The device can be read from.
    pub recv: bool,
    /// The device can be written to.
    pub send: bool,
    /// The device can seek.
    pub seek: bool,
    /// The device speaks binary packets rather than text lines.
    pub binary: bool,
}

impl DeviceFlags {
    pub fn mode_string(&self) -> String {
        let mut mode = String::with_capacity(4);
        mode.push(if self.sync { 't' } else { '-' });
        mode.push(if self.recv { 'r' } else { '-' });
        mode.push(if self.send { 'w' } else { '-' });
        mode.push(if self.binary { 'b' } else { '-' });
        mode
    }
}

/// Occupancy table for channel identifiers `[1, 127]`.
///
/// Each mapper owns a private map by default; handing the same
/// [`SharedChannels`] to several mappers serialises their claims behind
/// the mutex.
pub struct ChannelMap {
    used: [bool; (CHID_MAX as usize) + 1],
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            used: [false; (CHID_MAX as usize) + 1],
        }
    }

    pub fn is_occupied(&self, channel: u8) -> bool {
        self.used.get(channel as usize).copied().unwrap_or(false)
    }

    fn acquire(&mut self, channel: u8) -> bool {
        let slot = &mut self.used[channel as usize];
        if *slot {
            return false;
        }
        *slot = true;
        true
    }

    fn release(&mut self, channel: u8) -> bool {
        let slot = &mut self.used[channel as usize];
        if *slot {
            *slot = false;
            return true;
        }
        false
    }

    pub fn occupied_count(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel map handle shareable across mappers (and reactors).
pub type SharedChannels = Arc<Mutex<ChannelMap>>;

/// Bookkeeping for one open stream.
#[derive(Debug, Clone)]
pub struct Stream {
    /// Index into the owning mapper's device table.
    pub device: usize,
    pub channel: u8,
    pub flags: DeviceFlags,
    pub rate: u32,
    pub offset: u32,
    pub size: u32,
}

/// Behaviour plugged in per registered device. The mapper handles the
/// wire protocol and the tables; the driver handles the device itself.
#[allow(unused_variables)]
pub trait DeviceDriver: Send {
    /// Human-readable device type for support lines.
    fn type_name(&self) -> &'static str;

    /// Extra device detail appended to enable support lines.
    fn device_info(&self) -> Option<String> {
        None
    }

    /// Extra stream detail appended to enable channel lines.
    fn stream_info(&self, stream: &Stream) -> Option<String> {
        None
    }

    /// A stream is opening on this device. The driver may adjust the
    /// stream's rate/offset/size from the request arguments.
    fn open(&mut self, stream: &mut Stream, args: &Command<'_>, out: &mut Emitter) -> Status {
        Status::Fail
    }

    /// The stream on this device is closing.
    fn close(&mut self, stream: &mut Stream, out: &mut Emitter) -> Status {
        Status::Okay
    }

    /// A packet arrived on the stream's channel.
    fn packet(&mut self, stream: &Stream, data: &[u8], out: &mut Emitter) -> Status {
        Status::Okay
    }
}

struct DeviceEntry {
    name: String,
    flags: DeviceFlags,
    instance_count: u8,
    /// 0 = unlimited.
    instance_limit: u8,
    driver: Box<dyn DeviceDriver>,
}

pub struct Mapper {
    devices: Vec<DeviceEntry>,
    streams: Vec<Option<Stream>>,
    /// Hint: no free channel lies below this index.
    search_index: u8,
    channels: SharedChannels,
}

impl Mapper {
    pub fn new() -> Self {
        Self::with_shared_channels(Arc::new(Mutex::new(ChannelMap::new())))
    }

    pub fn with_shared_channels(channels: SharedChannels) -> Self {
        Self {
            devices: Vec::new(),
            streams: Vec::new(),
            search_index: CHID_MIN,
            channels,
        }
    }

    /// Handle to this mapper's channel map, for sharing with another
    /// mapper instance.
    pub fn channels(&self) -> SharedChannels {
        Arc::clone(&self.channels)
    }

    pub fn register_device(
        &mut self,
        name: &str,
        flags: DeviceFlags,
        instance_limit: u8,
        driver: Box<dyn DeviceDriver>,
    ) -> Result<usize, MapperError> {
        if self.devices.len() >= DEVICE_COUNT_MAX {
            return Err(MapperError::DeviceTableFull(DEVICE_COUNT_MAX));
        }
        if name.is_empty() || name.len() > DEVICE_NAME_SIZE {
            return Err(MapperError::BadDeviceName(name.to_owned(), DEVICE_NAME_SIZE));
        }
        if self.find_device(name).is_some() {
            return Err(MapperError::DuplicateDevice(name.to_owned()));
        }
        self.devices.push(DeviceEntry {
            name: name.to_owned(),
            flags,
            instance_count: 0,
            instance_limit,
            driver,
        });
        Ok(self.devices.len() - 1)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.iter().filter(|s| s.is_some()).count()
    }

    /// The stream open on `channel`, if this mapper owns it.
    pub fn stream_on(&self, channel: u8) -> Option<&Stream> {
        self.find_stream(channel)
            .and_then(|index| self.streams[index].as_ref())
    }

    // --- channel allocation ---

    fn find_channel(&self) -> Option<u8> {
        let map = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for channel in self.search_index..=CHID_MAX {
            if !map.is_occupied(channel) {
                return Some(channel);
            }
        }
        if self.search_index > CHID_MIN {
            for channel in CHID_MIN..self.search_index {
                if !map.is_occupied(channel) {
                    return Some(channel);
                }
            }
        }
        None
    }

    fn acquire_channel(&mut self, channel: u8) -> bool {
        self.search_index = channel.saturating_add(1);
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acquire(channel)
    }

    fn release_channel(&mut self, channel: u8) -> bool {
        if self.search_index > channel {
            self.search_index = channel;
        }
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(channel)
    }

    // --- device and stream tables ---

    fn find_device(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name == name)
    }

    fn find_stream(&self, channel: u8) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.channel == channel))
    }

    fn has_free_stream_slot(&self) -> bool {
        self.streams.len() < STREAM_COUNT_MAX || self.streams.iter().any(|s| s.is_none())
    }

    /// Store a stream: append while the table has headroom, otherwise
    /// re-use the highest free slot.
    fn store_stream(&mut self, stream: Stream) -> Option<usize> {
        if self.streams.len() < STREAM_COUNT_MAX {
            self.streams.push(Some(stream));
            return Some(self.streams.len() - 1);
        }
        let index = self.streams.iter().rposition(|s| s.is_none())?;
        self.streams[index] = Some(stream);
        Some(index)
    }

    /// Shrink the table tail past trailing free slots.
    fn fold_streams(&mut self) {
        while matches!(self.streams.last(), Some(None)) {
            self.streams.pop();
        }
    }

    // --- wire output ---

    fn send_support_event(&self, out: &mut Emitter, device_index: usize, tag: u8) {
        let device = &self.devices[device_index];
        out.put(&[
            Value::Char(TAG_RESPONSE),
            Value::Char(RESPONSE_SUPPORT),
            Value::Char(tag),
            Value::Char(SPC),
            Value::Text(&device.name),
        ]);
        if tag == ENABLE_TAG {
            out.put(&[
                Value::Char(SPC),
                Value::Text(&device.flags.mode_string()),
                Value::Char(SPC),
                Value::Text(device.driver.type_name()),
            ]);
            if let Some(info) = device.driver.device_info() {
                out.put(&[Value::Char(SPC), Value::Text(&info)]);
            }
        }
        out.end_line();
    }

    fn send_channel_event(&self, out: &mut Emitter, stream: &Stream, tag: u8) {
        let device = &self.devices[stream.device];
        out.put(&[
            Value::Char(TAG_RESPONSE),
            Value::Char(RESPONSE_CHANNEL),
            Value::Char(tag),
            Value::Char(SPC),
            Value::HexUpper(stream.channel as u64, 2),
        ]);
        if tag == ENABLE_TAG {
            out.put(&[
                Value::Char(SPC),
                Value::Text(&device.name),
                Value::Char(SPC),
                Value::Text(&stream.flags.mode_string()),
                Value::Char(SPC),
                Value::Text(device.driver.type_name()),
            ]);
            if let Some(info) = device.driver.stream_info(stream) {
                out.put(&[Value::Char(SPC), Value::Text(&info)]);
            }
        }
        out.end_line();
    }

    fn send_support_response(&self, out: &mut Emitter) {
        for index in 0..self.devices.len() {
            self.send_support_event(out, index, ENABLE_TAG);
        }
    }

    // --- verbs ---

    fn open_request(&mut self, out: &mut Emitter, argv: &Command<'_>) -> Status {
        let channel_token = argv.text(1);
        let channel = if channel_token == "*" || channel_token == "0" {
            match self.find_channel() {
                Some(channel) => channel,
                None => {
                    warn!("channel table exhausted");
                    return Status::Fail;
                }
            }
        } else {
            match argv.get(1).and_then(|t| t.hex()) {
                Some(value) if (CHID_MIN as i64..=CHID_MAX as i64).contains(&value) => value as u8,
                _ => return Status::BadRequest,
            }
        };
        let device_name = argv.text(2);
        let Some(device_index) = self.find_device(device_name) else {
            return Status::NoRequest;
        };
        {
            let device = &self.devices[device_index];
            if device.instance_limit > 0 && device.instance_count >= device.instance_limit {
                warn!(device = device_name, "instance count exceeded");
                return Status::Fail;
            }
        }
        if !self.has_free_stream_slot() {
            warn!(device = device_name, "stream table exhausted");
            return Status::Fail;
        }
        if !self.acquire_channel(channel) {
            warn!(channel, device = device_name, "channel already claimed");
            return Status::Fail;
        }
        let mut stream = Stream {
            device: device_index,
            channel,
            flags: self.devices[device_index].flags,
            rate: 0,
            offset: 0,
            size: 0,
        };
        let status = self.devices[device_index].driver.open(&mut stream, argv, out);
        if !status.is_okay() {
            self.release_channel(channel);
            return status;
        }
        let index = self.store_stream(stream).expect("slot checked above");
        {
            let stream = self.streams[index].as_ref().expect("just stored");
            self.send_channel_event(out, stream, ENABLE_TAG);
        }
        let device = &mut self.devices[device_index];
        if device.instance_limit > 0 {
            device.instance_count += 1;
            if device.instance_count == device.instance_limit {
                self.send_support_event(out, device_index, DISABLE_TAG);
            }
        }
        debug!(channel, device = device_name, "stream opened");
        Status::Okay
    }

    fn close_request(&mut self, out: &mut Emitter, argv: &Command<'_>) -> Status {
        let channel = match argv.get(1).and_then(|t| t.hex()) {
            Some(value) if (CHID_MIN as i64..=CHID_MAX as i64).contains(&value) => value as u8,
            _ => return Status::BadRequest,
        };
        let Some(index) = self.find_stream(channel) else {
            return Status::NoRequest;
        };
        {
            let stream = self.streams[index].as_ref().expect("found above");
            self.send_channel_event(out, stream, DISABLE_TAG);
        }
        let Some(mut stream) = self.streams[index].take() else {
            return Status::NoRequest;
        };
        let device_index = stream.device;
        self.devices[device_index].driver.close(&mut stream, out);
        self.release_channel(channel);
        let at_limit = {
            let device = &self.devices[device_index];
            device.instance_limit > 0 && device.instance_count == device.instance_limit
        };
        if at_limit {
            self.send_support_event(out, device_index, ENABLE_TAG);
        }
        if self.devices[device_index].instance_limit > 0 {
            self.devices[device_index].instance_count -= 1;
        }
        self.fold_streams();
        debug!(channel, "stream closed");
        Status::Okay
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Mapper {
    fn kind(&self) -> u8 {
        kind::CORE
    }

    fn type_name(&self) -> &'static str {
        "mapper"
    }

    fn process_request(
        &mut self,
        out: &mut Emitter,
        _link: &mut Linkage<'_>,
        argv: &Command<'_>,
    ) -> Status {
        match argv.text(0) {
            "support" => {
                if argv.has_count(1) {
                    self.send_support_response(out);
                    Status::Okay
                } else {
                    Status::NoRequest
                }
            }
            "describe" => match argv.len() {
                1 => {
                    self.send_support_response(out);
                    Status::Okay
                }
                2 => match self.find_device(argv.text(1)) {
                    Some(index) => {
                        self.send_support_event(out, index, ENABLE_TAG);
                        Status::Okay
                    }
                    None => Status::NoRequest,
                },
                _ => Status::NoRequest,
            },
            "ctl" => {
                if argv.has_count(1) {
                    Status::Fail
                } else {
                    Status::Parse
                }
            }
            "o" => {
                if argv.len() >= 3 {
                    self.open_request(out, argv)
                } else {
                    Status::NoRequest
                }
            }
            "x" => {
                if argv.has_count(2) {
                    self.close_request(out, argv)
                } else {
                    Status::NoRequest
                }
            }
            "sync" => {
                if argv.has_count(1) {
                    Status::Fail
                } else {
                    Status::NoRequest
                }
            }
            _ => Status::Refuse,
        }
    }

    fn process_packet(
        &mut self,
        out: &mut Emitter,
        _link: &mut Linkage<'_>,
        channel: u8,
        data: &[u8],
    ) -> Status {
        let Some(index) = self.find_stream(channel) else {
            // not one of ours; unclaimed packets vanish silently
            return Status::Refuse;
        };
        let stream = self.streams[index].as_ref().expect("found above");
        let device_index = stream.device;
        self.devices[device_index].driver.packet(stream, data, out)
    }

    fn describe(&mut self, out: &mut Emitter) {
        self.send_support_response(out);
    }

    fn layer_name(&self, index: usize) -> Option<&str> {
        (index == 0).then_some("dev")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;
    impl DeviceDriver for Null {
        fn type_name(&self) -> &'static str {
            "null"
        }
        fn open(&mut self, _: &mut Stream, _: &Command<'_>, _: &mut Emitter) -> Status {
            Status::Okay
        }
    }

    fn mapper_with(name: &str, limit: u8) -> Mapper {
        let mut mapper = Mapper::new();
        mapper
            .register_device(name, DeviceFlags::default(), limit, Box::new(Null))
            .unwrap();
        mapper
    }

    #[test]
    fn mode_string_rendering() {
        let flags = DeviceFlags {
            sync: false,
            recv: true,
            send: true,
            seek: false,
            binary: false,
        };
        assert_eq!(flags.mode_string(), "-rw-");
        let flags = DeviceFlags {
            sync: true,
            binary: true,
            ..DeviceFlags::default()
        };
        assert_eq!(flags.mode_string(), "t--b");
    }

    #[test]
    fn channel_map_claims_are_exclusive() {
        let mut map = ChannelMap::new();
        assert!(map.acquire(1));
        assert!(!map.acquire(1));
        assert!(map.release(1));
        assert!(!map.release(1));
        assert!(map.acquire(1));
    }

    #[test]
    fn find_channel_searches_from_hint_and_wraps() {
        let mut mapper = mapper_with("dev", 0);
        assert_eq!(mapper.find_channel(), Some(1));
        assert!(mapper.acquire_channel(1));
        // hint advanced past the claimed channel
        assert_eq!(mapper.find_channel(), Some(2));
        // push the hint to the end of the range: the search wraps to 1
        mapper.search_index = CHID_MAX;
        assert!(mapper.acquire_channel(CHID_MAX));
        assert_eq!(mapper.find_channel(), Some(2));
    }

    #[test]
    fn release_moves_hint_backward() {
        let mut mapper = mapper_with("dev", 0);
        assert!(mapper.acquire_channel(5));
        assert_eq!(mapper.search_index, 6);
        mapper.release_channel(5);
        assert_eq!(mapper.search_index, 5);
    }

    #[test]
    fn device_registration_limits() {
        let mut mapper = Mapper::new();
        assert!(matches!(
            mapper.register_device("toolongname", DeviceFlags::default(), 0, Box::new(Null)),
            Err(MapperError::BadDeviceName(..))
        ));
        mapper
            .register_device("dev", DeviceFlags::default(), 0, Box::new(Null))
            .unwrap();
        assert!(matches!(
            mapper.register_device("dev", DeviceFlags::default(), 0, Box::new(Null)),
            Err(MapperError::DuplicateDevice(..))
        ));
    }

    #[test]
    fn stream_table_folds_trailing_free_slots() {
        let mut mapper = mapper_with("dev", 0);
        let a = Stream {
            device: 0,
            channel: 1,
            flags: DeviceFlags::default(),
            rate: 0,
            offset: 0,
            size: 0,
        };
        let mut b = a.clone();
        b.channel = 2;
        mapper.store_stream(a);
        mapper.store_stream(b);
        assert_eq!(mapper.streams.len(), 2);
        mapper.streams[1] = None;
        mapper.fold_streams();
        assert_eq!(mapper.streams.len(), 1);
    }
}
