//! # Summary
//!
//! This module implements the connection-per-message TCP transport.
//!
//! The listening side accepts inbound connections on the peer's own port,
//! reads a single newline-terminated line per connection, decodes it, and
//! pushes the message onto the internal inbound queue. The sending side
//! opens a fresh connection per message, writes the serialized line, and
//! closes. Success only means the bytes were handed to the OS; delivery is
//! the protocol layer's problem, which is why it tolerates duplicates,
//! reordering, and loss.

use std::io;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::Membership;
use crate::internal;
use crate::message::{MemberId, PaxosMessage};

/// Point-to-point transport over a static member directory.
pub struct Transport {
    id: MemberId,
    membership: Arc<Membership>,
}

impl Transport {
    pub fn new(id: MemberId, membership: Arc<Membership>) -> Self {
        Transport { id, membership }
    }

    /// Bind the listening socket and spawn the accept loop. Each accepted
    /// connection is handled by its own task, so a slow or stalled sender
    /// never blocks the rest of the cluster.
    pub async fn listen(
        &self,
        port: u16,
        inbound: internal::Tx<PaxosMessage>,
    ) -> io::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let id = self.id.clone();
        debug!("{} listening on port {}", id, port);

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                | Ok((stream, _)) => {
                    let inbound = inbound.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        read_one(id, stream, inbound).await;
                    });
                }
                | Err(error) => {
                    warn!("{} failed to accept connection: {}", id, error);
                }
                }
            }
        }))
    }

    /// Send one message to one peer over a fresh connection.
    pub async fn send(&self, peer: &MemberId, message: &PaxosMessage) -> io::Result<()> {
        let member = self.membership.get(peer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown recipient {}", peer))
        })?;

        let mut stream = TcpStream::connect((member.host.as_str(), member.port)).await?;
        let mut line = message.serialize();
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await.ok();

        trace!("{} sent {} to {}", self.id, message.kind, peer);
        Ok(())
    }

    /// Send one message to every known peer except self. Returns the number
    /// of sends that were handed to the OS successfully.
    pub async fn broadcast(&self, message: &PaxosMessage) -> usize {
        let mut delivered = 0;
        for peer in self.membership.ids() {
            if *peer == self.id {
                continue;
            }
            match self.send(peer, message).await {
            | Ok(()) => delivered += 1,
            | Err(error) => debug!("{} failed to send to {}: {}", self.id, peer, error),
            }
        }
        delivered
    }

    pub fn peers(&self) -> impl Iterator<Item = &MemberId> {
        let id = self.id.clone();
        self.membership.ids().filter(move |peer| **peer != id)
    }
}

/// Read a single line from an accepted connection and enqueue it. Framing
/// errors are logged and dropped; the listener keeps running.
async fn read_one(
    id: MemberId,
    stream: TcpStream,
    inbound: internal::Tx<PaxosMessage>,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
    | Ok(0) => (),
    | Ok(_) => {
        if line.trim().is_empty() {
            return;
        }
        match PaxosMessage::deserialize(&line) {
        | Ok(message) => {
            trace!("{} received {} from {}", id, message.kind, message.sender);
            inbound.try_send(message);
        }
        | Err(error) => {
            warn!("{} dropping malformed line `{}`: {}", id, line.trim_end(), error);
        }
        }
    }
    | Err(error) => debug!("{} error reading connection: {}", id, error),
    }
}
