//! A minimal outbound peer connection.
//!
//! Connects, performs the version handshake, then exposes deadline-based
//! send/receive. Pings are answered transparently; everything else is
//! handed to the caller. The connection is strictly request/observe — it
//! never relays and never initiates anything beyond the handshake.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::P2pError;
use crate::message::{CFilterMessage, Message, VersionMessage, decode_frame, encode_frame};
use crate::{PROTOCOL_VERSION, REGTEST_MAGIC};

const USER_AGENT: &str = "/wagerr-harness:0.1.0/";

pub struct PeerConnection {
    stream: TcpStream,
    recv_buf: BytesMut,
    magic: [u8; 4],
    remote_version: Option<VersionMessage>,
}

impl PeerConnection {
    /// Connect to `addr` on the regtest network and complete the handshake.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, P2pError> {
        Self::connect_with_magic(addr, REGTEST_MAGIC, timeout).await
    }

    pub async fn connect_with_magic(
        addr: &str,
        magic: [u8; 4],
        timeout: Duration,
    ) -> Result<Self, P2pError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::Timeout(format!("tcp connect to {addr}")))??;
        stream.set_nodelay(true)?;
        let mut conn = Self {
            stream,
            recv_buf: BytesMut::with_capacity(64 * 1024),
            magic,
            remote_version: None,
        };
        conn.handshake(timeout).await?;
        debug!(addr, services = conn.remote_services(), "peer handshake complete");
        Ok(conn)
    }

    /// Service bits the remote advertised in its `version` message.
    pub fn remote_services(&self) -> u64 {
        self.remote_version.as_ref().map(|v| v.services).unwrap_or(0)
    }

    async fn handshake(&mut self, timeout: Duration) -> Result<(), P2pError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.send(&Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: now,
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            start_height: 0,
        }))
        .await?;

        let deadline = Instant::now() + timeout;
        let mut got_verack = false;
        while !(got_verack && self.remote_version.is_some()) {
            match self.recv_raw(deadline).await {
                Ok(Message::Version(v)) => {
                    self.remote_version = Some(v);
                    self.send(&Message::Verack).await?;
                }
                Ok(Message::Verack) => got_verack = true,
                Ok(Message::Ping(nonce)) => self.send(&Message::Pong(nonce)).await?,
                Ok(other) => trace!(command = other.command(), "ignoring during handshake"),
                Err(P2pError::Timeout(_)) => {
                    return Err(P2pError::Handshake("no verack within budget".into()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), P2pError> {
        trace!(command = msg.command(), "send");
        let frame = encode_frame(self.magic, msg);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Receive the next non-keepalive message within `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Message, P2pError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv_raw(deadline).await? {
                Message::Ping(nonce) => self.send(&Message::Pong(nonce)).await?,
                other => return Ok(other),
            }
        }
    }

    /// Receive messages until one matches `want`, skipping the rest.
    pub async fn wait_for(
        &mut self,
        what: &str,
        timeout: Duration,
        mut want: impl FnMut(&Message) -> bool,
    ) -> Result<Message, P2pError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| P2pError::Timeout(what.to_string()))?;
            let msg = self.recv(remaining).await?;
            if want(&msg) {
                return Ok(msg);
            }
            trace!(command = msg.command(), "skipping while waiting for {what}");
        }
    }

    /// Collect exactly `count` `cfilter` messages, skipping unrelated traffic.
    pub async fn collect_cfilters(
        &mut self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<CFilterMessage>, P2pError> {
        let deadline = Instant::now() + timeout;
        let mut filters = Vec::with_capacity(count);
        while filters.len() < count {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    P2pError::Timeout(format!("cfilter {}/{}", filters.len(), count))
                })?;
            if let Message::CFilter(f) = self.recv(remaining).await? {
                filters.push(f);
            }
        }
        Ok(filters)
    }

    /// Wait for the remote to drop the connection. Useful for asserting that
    /// an invalid request gets the peer disconnected.
    pub async fn wait_for_disconnect(&mut self, timeout: Duration) -> Result<(), P2pError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv_raw(deadline).await {
                Ok(Message::Ping(nonce)) => self.send(&Message::Pong(nonce)).await?,
                Ok(msg) => trace!(command = msg.command(), "still connected"),
                Err(P2pError::Disconnected) | Err(P2pError::Io(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn recv_raw(&mut self, deadline: Instant) -> Result<Message, P2pError> {
        loop {
            if let Some(msg) = decode_frame(self.magic, &mut self.recv_buf)? {
                trace!(command = msg.command(), "recv");
                return Ok(msg);
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| P2pError::Timeout("message".to_string()))?;
            let n = tokio::time::timeout(remaining, self.stream.read_buf(&mut self.recv_buf))
                .await
                .map_err(|_| P2pError::Timeout("message".to_string()))??;
            if n == 0 {
                return Err(P2pError::Disconnected);
            }
        }
    }
}
