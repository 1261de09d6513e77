//! Transport-level packet encoding for text-only links.
//!
//! When the underlying link cannot carry raw binary, packet bodies are
//! bridged as base16 or base64; the four-byte packet header stays ASCII
//! either way. Encoding leans on the `hex` and `base64` crates; decoding
//! follows the wire rules instead — bodies arrive zero-padded to the
//! packet multiplier, so the decoders map padding and any other
//! out-of-alphabet byte to zero rather than rejecting the frame.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tracing::debug;

use crate::error::Status;
use crate::gateway::Emitter;
use crate::pipeline::Linkage;
use crate::protocol::round_packet_size;
use crate::stage::{kind, Stage};

/// Body encoding of packets crossing a text-only transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    None,
    Base16,
    Base64,
}

/// Encode to lowercase base16.
pub fn base16_encode(data: &[u8]) -> Vec<u8> {
    hex::encode(data).into_bytes()
}

/// Decode base16, case-insensitive; non-hex bytes (padding included)
/// decode as zero. An odd trailing digit yields one low-nibble byte.
pub fn base16_decode(data: &[u8]) -> Vec<u8> {
    fn nibble(b: u8) -> u8 {
        match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => 0,
        }
    }
    let mut out = Vec::with_capacity(data.len().div_ceil(2));
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        out.push((nibble(pair[0]) << 4) | nibble(pair[1]));
    }
    if let [odd] = chunks.remainder() {
        out.push(nibble(*odd));
    }
    out
}

/// Encode to standard base64 with `+`/`/` and `=` padding, so encoded
/// bodies come out in four-byte groups.
pub fn base64_encode(data: &[u8]) -> Vec<u8> {
    BASE64_STANDARD.encode(data).into_bytes()
}

/// Decode standard-alphabet base64, ignoring padding: `=` and any other
/// out-of-alphabet byte decode as zero bits.
pub fn base64_decode(data: &[u8]) -> Vec<u8> {
    fn digit(b: u8) -> u8 {
        match b {
            b'A'..=b'Z' => b - b'A',
            b'a'..=b'z' => b - b'a' + 26,
            b'0'..=b'9' => b - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => 0,
        }
    }
    let mut out = Vec::with_capacity(data.len() / 4 * 3 + 3);
    for group in data.chunks(4) {
        let d: Vec<u8> = group.iter().map(|&b| digit(b)).collect();
        if d.len() >= 2 {
            out.push((d[0] << 2) | (d[1] >> 4));
        }
        if d.len() >= 3 {
            out.push((d[1] << 4) | (d[2] >> 2));
        }
        if d.len() == 4 {
            out.push((d[2] << 6) | d[3]);
        }
    }
    out
}

/// A thin stage between the gateway and the core that transcodes packet
/// bodies. Inbound packets are decoded and forwarded downstream; outbound
/// packets are encoded and passed on up toward the gate.
pub struct Codec {
    encoding: Encoding,
    cache: Vec<u8>,
}

impl Codec {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            cache: Vec::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decode `data` into the scratch buffer, zero-padded to the size the
    /// peer's own decoder would observe.
    fn decode_into_cache(&mut self, data: &[u8]) -> usize {
        let (decoded, forward_size) = match self.encoding {
            Encoding::Base16 => (base16_decode(data), data.len() / 2),
            Encoding::Base64 => (base64_decode(data), round_packet_size(data.len() * 6 / 8)),
            Encoding::None => (data.to_vec(), data.len()),
        };
        self.cache.clear();
        self.cache.extend_from_slice(&decoded);
        self.cache.resize(forward_size.max(decoded.len()), 0);
        self.cache.truncate(forward_size);
        forward_size
    }
}

impl Stage for Codec {
    fn kind(&self) -> u8 {
        kind::CODEC
    }

    fn type_name(&self) -> &'static str {
        "codec"
    }

    fn resume(&mut self, _env: &crate::reactor::Env) -> bool {
        self.cache.reserve(64);
        true
    }

    fn suspend(&mut self, _env: &crate::reactor::Env) {
        self.cache = Vec::new();
    }

    fn process_packet(
        &mut self,
        out: &mut Emitter,
        link: &mut Linkage<'_>,
        channel: u8,
        data: &[u8],
    ) -> Status {
        if self.encoding == Encoding::None || data.is_empty() {
            return Status::Refuse;
        }
        let size = self.decode_into_cache(data);
        debug!(channel, wire = data.len(), size, "packet decoded");
        link.forward_packet(out, channel, &self.cache)
    }

    fn return_packet(&mut self, link: &mut Linkage<'_>, channel: u8, data: &[u8]) -> Status {
        let encoded = match self.encoding {
            Encoding::None => return Status::Refuse,
            Encoding::Base16 => base16_encode(data),
            Encoding::Base64 => base64_encode(data),
        };
        self.cache.clear();
        self.cache.extend_from_slice(&encoded);
        link.return_packet(channel, &self.cache)
    }
}
