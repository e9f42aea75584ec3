//! TCP transport for workers running in separate processes.
//!
//! Socket I/O happens on tokio tasks; the scheduler thread only touches
//! the channels in front of them.

use std::{net::SocketAddr, sync::mpsc as std_mpsc, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::mpsc::{self, error::TryRecvError},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::{CookError, Result};

use super::{
    codec,
    message::Message,
    transport::{Connection, Inbound},
};

/// How long `close` waits for queued frames to reach the socket.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// [`Connection`] over a TCP stream with 4-byte length-prefixed frames.
pub struct TcpConnection {
    peer: SocketAddr,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    writer_done: Option<std_mpsc::Receiver<()>>,
    closed_reported: bool,
}

impl TcpConnection {
    /// Splits `stream` into reader and writer tasks on `runtime`.
    pub fn spawn(stream: TcpStream, runtime: &Handle) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();
        let (done_tx, done_rx) = std_mpsc::channel();

        runtime.spawn(async move {
            let mut reader = FramedRead::new(read_half, codec::frame_codec());
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(frame) => {
                        if let Some(inbound) = codec::decode_inbound(&frame)
                            && in_tx.send(inbound).is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        // framing is lost; nothing after this can be trusted
                        warn!(target: "cook::transport", %peer, error = %err, "read failed");
                        break;
                    }
                }
            }
            debug!(target: "cook::transport", %peer, "reader finished");
            let _ = in_tx.send(Inbound::Closed);
        });

        runtime.spawn(async move {
            let mut writer = FramedWrite::new(write_half, codec::frame_codec());
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = writer.send(frame).await {
                    warn!(target: "cook::transport", %peer, error = %err, "write failed");
                    break;
                }
            }
            if let Err(err) = SinkExt::<Bytes>::close(&mut writer).await {
                warn!(target: "cook::transport", %peer, error = %err, "close failed");
            }
            let _ = done_tx.send(());
        });

        Ok(Self {
            peer,
            outbound: Some(out_tx),
            inbound: in_rx,
            writer_done: Some(done_rx),
            closed_reported: false,
        })
    }

    /// Connects to a director. Must be called inside a tokio runtime.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::spawn(stream, &Handle::current())
    }

    /// Accepts `count` worker connections.
    pub async fn accept(listener: &TcpListener, count: usize) -> Result<Vec<Self>> {
        let mut connections = Vec::with_capacity(count);
        while connections.len() < count {
            let (stream, peer) = listener.accept().await?;
            debug!(target: "cook::transport", %peer, "worker connection accepted");
            connections.push(Self::spawn(stream, &Handle::current())?);
        }
        Ok(connections)
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, message: &Message) -> Result<()> {
        let frame = codec::encode(message)?;
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| CookError::Protocol(format!("{}: connection closed", self.peer)))?;
        outbound
            .send(frame)
            .map_err(|_| CookError::Protocol(format!("{}: writer stopped", self.peer)))
    }

    fn try_recv(&mut self) -> Option<Inbound> {
        match self.inbound.try_recv() {
            Ok(Inbound::Closed) | Err(TryRecvError::Disconnected) => {
                if self.closed_reported {
                    return None;
                }
                self.closed_reported = true;
                Some(Inbound::Closed)
            }
            Ok(inbound) => Some(inbound),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Blocks the calling thread until queued frames are written, bounded
    /// by a grace period. A peer that already hung up is not waited on.
    fn close(&mut self) {
        self.outbound = None;
        let Some(done) = self.writer_done.take() else {
            return;
        };
        if self.closed_reported {
            return;
        }
        if let Err(std_mpsc::RecvTimeoutError::Timeout) = done.recv_timeout(FLUSH_GRACE) {
            warn!(target: "cook::transport", peer = %self.peer, "queued frames not flushed before close");
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}
