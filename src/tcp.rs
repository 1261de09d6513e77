//! Byte-bus drivers: the asynchronous outer loop that owns a transport
//! and pumps a synchronous reactor. Readable bytes become `feed` calls,
//! a steady interval becomes `sync(dt)` ticks, and whatever the reactor
//! queues in its outbox is written back to the transport after every
//! turn. The reactor itself never blocks.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{BusError, Result};
use crate::reactor::Reactor;

/// Default clock tick for the pump loops.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// Backoff policy for user-side connection attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay for the given attempt, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        (self.base_delay * factor).min(self.max_delay)
    }
}

/// Connect to a TCP address with retry and exponential backoff.
pub async fn connect_retry(addr: SocketAddr, policy: &RetryPolicy) -> Result<TcpStream> {
    for attempt in 0..=policy.max_retries {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                debug!(addr = %addr, attempt, "TCP connected");
                return Ok(stream);
            }
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(addr = %addr, attempt, error = %e, delay_ms = delay.as_millis(), "TCP connect retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(BusError::Connect {
                    addr: addr.to_string(),
                    attempts: attempt + 1,
                    reason: e.to_string(),
                });
            }
        }
    }
    unreachable!()
}

/// Drive a resumed reactor over a full-duplex stream until the peer
/// hangs up or the reactor drops the link.
pub async fn pump<S>(stream: S, reactor: &mut Reactor, tick: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    pump_split(reader, writer, reactor, tick).await
}

/// [`pump`] over separate read and write halves (stdio, pipes).
pub async fn pump_split<R, W>(
    mut reader: R,
    mut writer: W,
    reactor: &mut Reactor,
    tick: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let dt = tick.as_secs_f32();
    let mut clock = tokio::time::interval(tick);
    clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buffer = BytesMut::with_capacity(4096);

    reactor.join();
    write_pending(&mut writer, reactor).await?;

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => {
                        reactor.hup();
                        write_pending(&mut writer, reactor).await?;
                        debug!("peer hung up");
                        return Ok(());
                    }
                    Ok(_) => {
                        reactor.feed(&buffer);
                        buffer.clear();
                    }
                    Err(e) => {
                        reactor.hup();
                        return Err(BusError::Io(e));
                    }
                }
            }
            _ = clock.tick() => {
                reactor.sync(dt);
            }
        }
        write_pending(&mut writer, reactor).await?;
        if !reactor.is_joined() {
            debug!("link dropped, pump stopping");
            return Ok(());
        }
    }
}

async fn write_pending<W>(writer: &mut W, reactor: &mut Reactor) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while reactor.has_output() {
        let out = reactor.drain_output();
        writer.write_all(&out).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Accept a single peer on `listener` and serve it with a host reactor.
pub async fn serve_host(
    listener: &TcpListener,
    reactor: &mut Reactor,
    tick: Duration,
) -> Result<()> {
    if !reactor.resume() {
        return Err(BusError::NotResumed);
    }
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true).ok();
    info!(peer = %peer, "host: peer connected");
    pump(stream, reactor, tick).await
}

/// Dial a host and drive a user reactor over the connection.
pub async fn run_user(
    addr: SocketAddr,
    reactor: &mut Reactor,
    policy: &RetryPolicy,
    tick: Duration,
) -> Result<()> {
    if !reactor.resume() {
        return Err(BusError::NotResumed);
    }
    let stream = connect_retry(addr, policy).await?;
    info!(addr = %addr, "user: connected");
    pump(stream, reactor, tick).await
}

/// Serve a host reactor on standard input and output.
pub async fn serve_stdio(reactor: &mut Reactor, tick: Duration) -> Result<()> {
    if !reactor.resume() {
        return Err(BusError::NotResumed);
    }
    pump_split(tokio::io::stdin(), tokio::io::stdout(), reactor, tick).await
}
