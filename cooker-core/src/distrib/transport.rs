//! Message transport between the director and its workers.
//!
//! The scheduler never blocks on a connection: it drains whatever arrived
//! since the last pump with [`Connection::try_recv`] and sends without
//! waiting for the peer.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::error::{CookError, Result};

use super::{codec, message::Message};

/// What a connection hands the scheduler.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Message(Message),
    /// A frame that could not be decoded. The connection stays usable.
    ProtocolError(String),
    /// The peer went away. Reported once.
    Closed,
}

/// Non-blocking message channel to one peer.
pub trait Connection: Send {
    /// Queues a message for the peer.
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Next inbound message, if one is already here.
    fn try_recv(&mut self) -> Option<Inbound>;

    /// Stops sending. Frames already queued are still delivered.
    fn close(&mut self);

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer())
            .finish()
    }
}

/// In-process connection over encoded frames. Used for workers hosted on
/// threads of the same process and by tests.
pub struct ChannelConnection {
    label: String,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed_reported: bool,
}

impl ChannelConnection {
    /// Two connected ends: `(director side, worker side)`.
    pub fn pair(label: impl Into<String>) -> (Self, Self) {
        let label = label.into();
        let (to_worker, worker_rx) = mpsc::unbounded_channel();
        let (to_director, director_rx) = mpsc::unbounded_channel();
        let director = Self {
            label: format!("{label} (worker end)"),
            tx: Some(to_worker),
            rx: director_rx,
            closed_reported: false,
        };
        let worker = Self {
            label: format!("{label} (director end)"),
            tx: Some(to_director),
            rx: worker_rx,
            closed_reported: false,
        };
        (director, worker)
    }

    /// Sends a raw frame, bypassing the encoder.
    pub fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| CookError::Protocol(format!("{}: connection closed", self.label)))?;
        tx.send(frame)
            .map_err(|_| CookError::Protocol(format!("{}: peer gone", self.label)))
    }
}

impl Connection for ChannelConnection {
    fn send(&mut self, message: &Message) -> Result<()> {
        let frame = codec::encode(message)?;
        self.send_frame(frame)
    }

    fn try_recv(&mut self) -> Option<Inbound> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if let Some(inbound) = codec::decode_inbound(&frame) {
                        return Some(inbound);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    if self.closed_reported {
                        return None;
                    }
                    self.closed_reported = true;
                    return Some(Inbound::Closed);
                }
            }
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distrib::message::Heartbeat;

    #[test]
    fn frames_cross_the_pair() {
        let (mut director, mut worker) = ChannelConnection::pair("w1");
        director
            .send(&Message::Heartbeat(Heartbeat { number: 7 }))
            .unwrap();
        assert_eq!(
            worker.try_recv(),
            Some(Inbound::Message(Message::Heartbeat(Heartbeat { number: 7 })))
        );
        assert_eq!(worker.try_recv(), None);
    }

    #[test]
    fn close_is_reported_once() {
        let (mut director, mut worker) = ChannelConnection::pair("w1");
        worker.close();
        assert_eq!(director.try_recv(), Some(Inbound::Closed));
        assert_eq!(director.try_recv(), None);
        assert!(worker.send(&Message::Heartbeat(Heartbeat { number: 1 })).is_err());
    }

    #[test]
    fn garbage_frame_does_not_close() {
        let (mut director, mut worker) = ChannelConnection::pair("w1");
        worker.send_frame(Bytes::from_static(b"\x00\x01")).unwrap();
        worker
            .send(&Message::Heartbeat(Heartbeat { number: 2 }))
            .unwrap();
        assert!(matches!(director.try_recv(), Some(Inbound::ProtocolError(_))));
        assert!(matches!(director.try_recv(), Some(Inbound::Message(_))));
    }
}
