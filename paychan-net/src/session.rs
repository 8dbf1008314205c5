//! Framed message transport shared by the listener and the client connection.
//!
//! Each connection is split into a writer task draining an outbound queue
//! and a reader producing decoded frames, so the state machines never block
//! on the socket.

use core::sync::atomic::{AtomicBool, Ordering};
use std::net::SocketAddr;

use log::{debug, error};
use payment_channel::prelude::*;
use paychan_protocol::codec::{read_async, write_async};
use paychan_protocol::TwoWayChannelMessage;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the writer task is asked to do
#[derive(Debug)]
pub enum Outbound {
    /// Send a message
    Message(TwoWayChannelMessage),
    /// Flush what was queued before and shut the socket down
    Close,
}

/// Spawn the task writing queued messages to `writer`
pub fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    log_prefix: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(next) = outbound.recv().await {
            match next {
                Outbound::Message(msg) => {
                    if let Err(e) = write_async(&mut writer, &msg).await {
                        error!("{}: write failed: {}", log_prefix, e);
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        debug!("{}: writer done", log_prefix);
        let _ = writer.shutdown().await;
    })
}

/// Spawn the task decoding frames from `reader` into `inbound`.
///
/// The first error, including a clean end of stream, is delivered and ends
/// the task.
pub fn spawn_reader(
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<paychan_protocol::Result<TwoWayChannelMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = read_async(&mut reader).await;
            let failed = received.is_err();
            if inbound.send(received).is_err() || failed {
                break;
            }
        }
    })
}

/// A handle to one accepted session, given to the application's handler
#[derive(Clone)]
pub struct SessionHandle {
    remote_addr: SocketAddr,
    commands: mpsc::UnboundedSender<()>,
    closing: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn new(remote_addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (SessionHandle { remote_addr, commands, closing: Arc::new(AtomicBool::new(false)) }, receiver)
    }

    /// The client's address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Close the session without settling.  The client may resume the
    /// channel later.  Calling this more than once has no further effect.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(());
        }
    }
}
