//! Accepts TCP connections and runs one server machine per connection.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::io;
use std::net::SocketAddr;

use log::{debug, error, info, warn};
use payment_channel::bitcoin::Amount;
use payment_channel::channel::ChannelId;
use payment_channel::config::ServerConfig;
use payment_channel::persist::ChannelStore;
use payment_channel::prelude::*;
use payment_channel::registry::ServerChannelRegistry;
use payment_channel::util::clock::Clock;
use payment_channel::wallet::{Broadcaster, Wallet};
use paychan_handler::{CloseReason, PaymentChannelServer, ServerConnection};
use paychan_protocol::{ErrorCode, TwoWayChannelMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

use crate::session::{spawn_reader, spawn_writer, Outbound, SessionHandle};

/// Listener policy
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// How long a session may wait for the client's next message before the
    /// channel is open
    pub read_timeout: Duration,
    /// Terms offered to clients
    pub server: ServerConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig { read_timeout: Duration::from_secs(30), server: ServerConfig::default() }
    }
}

/// Application callbacks for one session.
///
/// `channel_closed` is called exactly once per session, after any
/// `channel_open` and `payment_increase` calls.
pub trait ServerConnectionEventHandler: SendSync {
    /// The channel is open, new or resumed
    fn channel_open(&self, id: ChannelId);

    /// The client paid `by` more, for a total of `to`
    fn payment_increase(&self, by: Amount, to: Amount);

    /// The session ended
    fn channel_closed(&self, reason: CloseReason);

    /// The connection is gone and the handler will not be called again
    fn teardown(&self) {}
}

/// Creates a handler for each accepted connection
pub trait HandlerFactory: SendSync {
    /// Return `None` to refuse the connection
    fn on_new_connection(
        &self,
        addr: SocketAddr,
        session: SessionHandle,
    ) -> Option<Arc<dyn ServerConnectionEventHandler>>;
}

/// The transport side of one accepted session
struct ListenerConnection {
    log_prefix: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    handler: Arc<dyn ServerConnectionEventHandler>,
    open: AtomicBool,
    destroyed: Mutex<Option<CloseReason>>,
    destroyed_notify: Notify,
    notified: AtomicBool,
}

impl SendSync for ListenerConnection {}

impl ListenerConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> Option<CloseReason> {
        *self.destroyed.lock().unwrap()
    }

    /// Report the close to the handler, once
    fn finish(&self) {
        let reason = self.destroyed().unwrap_or(CloseReason::ConnectionClosed);
        if !self.notified.swap(true, Ordering::SeqCst) {
            info!("{}: channel closed: {}", self.log_prefix, reason);
            self.handler.channel_closed(reason);
            self.handler.teardown();
        }
    }
}

impl ServerConnection for ListenerConnection {
    fn send_to_client(&self, msg: TwoWayChannelMessage) {
        let _ = self.outbound.send(Outbound::Message(msg));
    }

    fn destroy_connection(&self, reason: CloseReason) {
        {
            let mut destroyed = self.destroyed.lock().unwrap();
            if destroyed.is_some() {
                return;
            }
            *destroyed = Some(reason);
        }
        debug!("{}: destroying connection: {}", self.log_prefix, reason);
        let _ = self.outbound.send(Outbound::Close);
        self.destroyed_notify.notify_one();
    }

    fn channel_open(&self, id: ChannelId) {
        self.open.store(true, Ordering::SeqCst);
        self.handler.channel_open(id);
    }

    fn payment_increase(&self, by: Amount, to: Amount) {
        self.handler.payment_increase(by, to);
    }
}

/// Runs payment channel sessions for every accepted connection
pub struct PaymentChannelServerListener {
    registry: Arc<ServerChannelRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    factory: Arc<dyn HandlerFactory>,
    config: ListenerConfig,
}

impl PaymentChannelServerListener {
    /// Create a listener and the registry its sessions share.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        wallet: Arc<dyn Wallet>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn ChannelStore>>,
        factory: Arc<dyn HandlerFactory>,
        config: ListenerConfig,
    ) -> payment_channel::Result<Self> {
        let registry = ServerChannelRegistry::new(
            wallet,
            Arc::clone(&broadcaster),
            clock,
            config.server.clone(),
            store,
        )?;
        Ok(PaymentChannelServerListener { registry, broadcaster, factory, config })
    }

    /// The registry of open channels
    pub fn registry(&self) -> &Arc<ServerChannelRegistry> {
        &self.registry
    }

    /// Bind to `addr` and serve until `shutdown` fires
    pub async fn bind_and_serve(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: triggered::Listener,
    ) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires.
    ///
    /// Sessions still running at shutdown are closed without settling.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: triggered::Listener,
    ) -> io::Result<()> {
        info!("listening for payment channels on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = shutdown.clone() => {
                    info!("listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(this.run_session(stream, addr, shutdown.clone()));
                    }
                    Err(e) => error!("accept failed: {}", e),
                },
            }
        }
    }

    async fn run_session(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: triggered::Listener,
    ) {
        let (handle, mut commands) = SessionHandle::new(addr);
        let Some(handler) = self.factory.on_new_connection(addr, handle) else {
            info!("refused connection from {}", addr);
            return;
        };
        let log_prefix = format!("session {}", addr);
        let (reader, writer) = stream.into_split();
        let (outbound_sender, outbound) = mpsc::unbounded_channel();
        let writer_task = spawn_writer(writer, outbound, log_prefix.clone());
        let (inbound_sender, mut inbound) = mpsc::unbounded_channel();
        let reader_task = spawn_reader(reader, inbound_sender);

        let conn = Arc::new(ListenerConnection {
            log_prefix: log_prefix.clone(),
            outbound: outbound_sender,
            handler,
            open: AtomicBool::new(false),
            destroyed: Mutex::new(None),
            destroyed_notify: Notify::new(),
            notified: AtomicBool::new(false),
        });
        let server = PaymentChannelServer::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.broadcaster),
            conn.clone(),
        );
        debug!("{}: accepted as session {}", log_prefix, server.session_id());

        while conn.destroyed().is_none() {
            let deadline =
                if conn.is_open() { None } else { Some(Instant::now() + self.config.read_timeout) };
            tokio::select! {
                _ = conn.destroyed_notify.notified() => {}
                _ = shutdown.clone() => {
                    server.close().await;
                    conn.destroy_connection(CloseReason::ServerRequestedClose);
                }
                Some(()) = commands.recv() => {
                    server.close().await;
                    conn.destroy_connection(CloseReason::ServerRequestedClose);
                }
                _ = expire(deadline) => {
                    warn!("{}: timed out waiting for a message", log_prefix);
                    conn.send_to_client(TwoWayChannelMessage::error(ErrorCode::Timeout, "read timeout"));
                    server.connection_closed().await;
                    conn.destroy_connection(CloseReason::ConnectionClosed);
                }
                received = inbound.recv() => match received {
                    Some(Ok(msg)) => server.receive_message(msg).await,
                    Some(Err(e)) => {
                        debug!("{}: read ended: {}", log_prefix, e);
                        server.connection_closed().await;
                        conn.destroy_connection(CloseReason::ConnectionClosed);
                    }
                    None => {
                        server.connection_closed().await;
                        conn.destroy_connection(CloseReason::ConnectionClosed);
                    }
                },
            }
        }

        // a session closed by the registry is destroyed from outside and
        // still owns its machine state
        server.connection_closed().await;
        reader_task.abort();
        let _ = writer_task.await;
        conn.finish();
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
