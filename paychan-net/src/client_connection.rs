//! The paying side over TCP.

use std::net::SocketAddr;

use log::{debug, info};
use payment_channel::bitcoin::Amount;
use payment_channel::channel::{ChannelId, ServerId};
use payment_channel::config::ClientConfig;
use payment_channel::prelude::*;
use payment_channel::registry::ClientChannelRegistry;
use payment_channel::wallet::Wallet;
use paychan_handler::client::{OpenResult, PaymentResult};
use paychan_handler::{ClientConnection, CloseReason, PaymentChannelClient};
use paychan_protocol::codec::read_async;
use paychan_protocol::TwoWayChannelMessage;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::session::{spawn_writer, Outbound};

struct TcpTransport {
    log_prefix: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl SendSync for TcpTransport {}

impl TcpTransport {
    fn mark_closed(&self, reason: CloseReason) -> bool {
        self.closed.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(reason);
            true
        })
    }
}

impl ClientConnection for TcpTransport {
    fn send_to_server(&self, msg: TwoWayChannelMessage) {
        let _ = self.outbound.send(Outbound::Message(msg));
    }

    fn destroy_connection(&self, reason: CloseReason) {
        if self.mark_closed(reason) {
            debug!("{}: destroying connection: {}", self.log_prefix, reason);
        }
        let _ = self.outbound.send(Outbound::Close);
    }

    fn channel_open(&self, was_initiated: bool) {
        info!(
            "{}: channel open ({})",
            self.log_prefix,
            if was_initiated { "new" } else { "resumed" }
        );
    }
}

/// A client session with one server over TCP
pub struct PaymentChannelClientConnection {
    client: Arc<PaymentChannelClient>,
    transport: Arc<TcpTransport>,
    opened: Mutex<Option<oneshot::Receiver<OpenResult>>>,
    reader_task: JoinHandle<()>,
}

impl PaymentChannelClientConnection {
    /// Connect to `addr` and start opening or resuming a channel of `value`
    /// with `server_id`.
    ///
    /// Fails if the socket cannot be opened or the wallet cannot fund the
    /// channel.  Await [`Self::channel_open`] for the outcome of the
    /// negotiation.
    pub async fn connect(
        addr: SocketAddr,
        wallet: Arc<dyn Wallet>,
        registry: Arc<ClientChannelRegistry>,
        config: ClientConfig,
        server_id: ServerId,
        value: Amount,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let log_prefix = format!("client {}", addr);
        let (mut reader, writer) = stream.into_split();
        let (outbound_sender, outbound) = mpsc::unbounded_channel();
        spawn_writer(writer, outbound, log_prefix.clone());
        let (closed, _) = watch::channel(None);
        let transport = Arc::new(TcpTransport { log_prefix, outbound: outbound_sender, closed });
        let client =
            Arc::new(PaymentChannelClient::new(wallet, registry, config, transport.clone()));
        let opened = client.open(server_id, value)?;

        let reader_task = {
            let client = Arc::clone(&client);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                loop {
                    match read_async(&mut reader).await {
                        Ok(msg) => client.receive_message(msg),
                        Err(e) => {
                            debug!("{}: read ended: {}", transport.log_prefix, e);
                            break;
                        }
                    }
                }
                client.connection_closed();
                transport.mark_closed(CloseReason::ConnectionClosed);
                let _ = transport.outbound.send(Outbound::Close);
            })
        };
        Ok(PaymentChannelClientConnection {
            client,
            transport,
            opened: Mutex::new(Some(opened)),
            reader_task,
        })
    }

    /// Wait until the channel opens or the session ends first.
    ///
    /// Only the first call observes the outcome; later calls report the
    /// session as closed.
    pub async fn channel_open(&self) -> OpenResult {
        let opened = self.opened.lock().unwrap().take();
        match opened {
            Some(opened) => opened.await.unwrap_or(Err(CloseReason::ConnectionClosed)),
            None => Err(CloseReason::ConnectionClosed),
        }
    }

    /// Pay `amount` more.  The receiver resolves with the new total once the
    /// server acknowledged.
    pub fn increment_payment(
        &self,
        amount: Amount,
    ) -> payment_channel::Result<oneshot::Receiver<PaymentResult>> {
        self.client.increment_payment(amount)
    }

    /// Pay `amount` more and wait for the acknowledgement
    pub async fn pay(&self, amount: Amount) -> anyhow::Result<Amount> {
        let acked = self.increment_payment(amount)?;
        match acked.await {
            Ok(Ok(total)) => Ok(total),
            Ok(Err(reason)) => Err(anyhow::anyhow!("session closed: {}", reason)),
            Err(_) => Err(anyhow::anyhow!("session dropped")),
        }
    }

    /// Ask the server to settle the channel
    pub fn settle(&self) -> payment_channel::Result<()> {
        self.client.settle()
    }

    /// Drop the session, keeping the channel for a later resume
    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    /// The machine, for balance and state queries
    pub fn client(&self) -> &Arc<PaymentChannelClient> {
        &self.client
    }

    /// Wait for the session to end
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.transport.closed.subscribe();
        loop {
            if let Some(reason) = *closed.borrow_and_update() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return CloseReason::ConnectionClosed;
            }
        }
    }

    /// The channel this session uses, once there is one
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.client.channel().map(|c| c.lock().unwrap().id)
    }
}

impl Drop for PaymentChannelClientConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
