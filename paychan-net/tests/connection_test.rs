use std::net::SocketAddr;
use std::time::Duration;

use payment_channel::bitcoin::Amount;
use payment_channel::channel::ChannelId;
use payment_channel::config::{ClientConfig, ServerConfig};
use payment_channel::prelude::*;
use payment_channel::registry::ClientChannelRegistry;
use payment_channel::util::clock::StandardClock;
use payment_channel::util::test_utils::{make_server_id, MockBroadcaster, MockWallet};
use payment_channel::wallet::Wallet;
use paychan_handler::CloseReason;
use paychan_net::{
    HandlerFactory, ListenerConfig, PaymentChannelClientConnection, PaymentChannelServerListener,
    ServerConnectionEventHandler, SessionHandle,
};
use paychan_protocol::codec::{read_async, write_async};
use paychan_protocol::{ErrorCode, MessageType, TwoWayChannelMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const VALUE: Amount = Amount::from_sat(100_000);

#[derive(Debug, PartialEq)]
enum Event {
    Open(ChannelId),
    Payment(Amount, Amount),
    Closed(CloseReason),
}

struct RecordingHandler {
    events: mpsc::UnboundedSender<Event>,
}

impl SendSync for RecordingHandler {}

impl ServerConnectionEventHandler for RecordingHandler {
    fn channel_open(&self, id: ChannelId) {
        let _ = self.events.send(Event::Open(id));
    }

    fn payment_increase(&self, by: Amount, to: Amount) {
        let _ = self.events.send(Event::Payment(by, to));
    }

    fn channel_closed(&self, reason: CloseReason) {
        let _ = self.events.send(Event::Closed(reason));
    }
}

struct RecordingFactory {
    events: mpsc::UnboundedSender<Event>,
    sessions: mpsc::UnboundedSender<SessionHandle>,
    refuse: bool,
}

impl SendSync for RecordingFactory {}

impl HandlerFactory for RecordingFactory {
    fn on_new_connection(
        &self,
        _addr: SocketAddr,
        session: SessionHandle,
    ) -> Option<Arc<dyn ServerConnectionEventHandler>> {
        if self.refuse {
            return None;
        }
        let _ = self.sessions.send(session);
        Some(Arc::new(RecordingHandler { events: self.events.clone() }))
    }
}

struct Harness {
    addr: SocketAddr,
    listener: Arc<PaymentChannelServerListener>,
    server_broadcaster: Arc<MockBroadcaster>,
    server_wallet: Arc<MockWallet>,
    events: mpsc::UnboundedReceiver<Event>,
    sessions: mpsc::UnboundedReceiver<SessionHandle>,
    client_wallet: Arc<MockWallet>,
    client_registry: Arc<ClientChannelRegistry>,
    shutdown: triggered::Trigger,
}

impl Harness {
    async fn start(read_timeout: Duration) -> Self {
        Self::start_with(read_timeout, false).await
    }

    async fn start_with(read_timeout: Duration, refuse: bool) -> Self {
        let (events_sender, events) = mpsc::unbounded_channel();
        let (sessions_sender, sessions) = mpsc::unbounded_channel();
        let (server_broadcaster, _) = MockBroadcaster::new();
        let server_wallet = Arc::new(MockWallet::new(Amount::ZERO));
        let config = ListenerConfig {
            read_timeout,
            server: ServerConfig {
                min_accepted_channel_size: Amount::from_sat(1_000),
                ..ServerConfig::default()
            },
        };
        let listener = Arc::new(
            PaymentChannelServerListener::new(
                server_wallet.clone(),
                server_broadcaster.clone(),
                Arc::new(StandardClock()),
                None,
                Arc::new(RecordingFactory { events: events_sender, sessions: sessions_sender, refuse }),
                config,
            )
            .unwrap(),
        );
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let (shutdown, shutdown_signal) = triggered::trigger();
        tokio::spawn(listener.clone().serve(tcp, shutdown_signal));

        let (client_broadcaster, _) = MockBroadcaster::new();
        let client_registry = ClientChannelRegistry::new(
            client_broadcaster,
            Arc::new(StandardClock()),
            Duration::from_secs(300),
            None,
        )
        .unwrap();
        Harness {
            addr,
            listener,
            server_broadcaster,
            server_wallet,
            events,
            sessions,
            client_wallet: Arc::new(MockWallet::new(Amount::from_sat(1_000_000))),
            client_registry,
            shutdown,
        }
    }

    async fn connect(&self) -> PaymentChannelClientConnection {
        PaymentChannelClientConnection::connect(
            self.addr,
            self.client_wallet.clone(),
            self.client_registry.clone(),
            ClientConfig { refund_fee: Amount::ZERO, ..ClientConfig::default() },
            make_server_id(b"connection test"),
            VALUE,
        )
        .await
        .unwrap()
    }

    async fn next_event(&mut self) -> Event {
        timeout(Duration::from_secs(10), self.events.recv())
            .await
            .expect("event in time")
            .expect("listener alive")
    }
}

#[test_log::test(tokio::test)]
async fn pay_and_settle_over_tcp() {
    let mut harness = Harness::start(Duration::from_secs(30)).await;
    let conn = harness.connect().await;
    let id = conn.channel_open().await.expect("open");
    assert_eq!(harness.next_event().await, Event::Open(id));

    for total in 1..=3 {
        assert_eq!(conn.pay(Amount::from_sat(1_000)).await.unwrap(), Amount::from_sat(total * 1_000));
        assert_eq!(
            harness.next_event().await,
            Event::Payment(Amount::from_sat(1_000), Amount::from_sat(total * 1_000))
        );
    }

    conn.settle().unwrap();
    assert_eq!(conn.closed().await, CloseReason::ClientRequestedClose);
    assert_eq!(harness.next_event().await, Event::Closed(CloseReason::ClientRequestedClose));

    assert!(harness.listener.registry().is_empty());
    assert_eq!(harness.server_broadcaster.count(), 2);
    let settlement = harness.server_broadcaster.broadcasts.lock().unwrap()[1].clone();
    let payout = settlement
        .output
        .iter()
        .find(|o| o.script_pubkey == harness.server_wallet.receive_script())
        .expect("server output");
    assert_eq!(payout.value, Amount::from_sat(3_000));

    let record = harness.client_registry.channel(&id).expect("client record");
    assert_eq!(record.lock().unwrap().settlement.as_ref(), Some(&settlement));
}

#[test_log::test(tokio::test)]
async fn reconnect_resumes_channel() {
    let mut harness = Harness::start(Duration::from_secs(30)).await;
    let conn = harness.connect().await;
    let id = conn.channel_open().await.unwrap();
    assert_eq!(harness.next_event().await, Event::Open(id));
    conn.pay(Amount::from_sat(2_000)).await.unwrap();
    harness.next_event().await;
    conn.disconnect();
    assert_eq!(conn.closed().await, CloseReason::ConnectionClosed);
    assert_eq!(harness.next_event().await, Event::Closed(CloseReason::ConnectionClosed));

    let conn = harness.connect().await;
    assert_eq!(conn.channel_open().await, Ok(id));
    assert_eq!(harness.next_event().await, Event::Open(id));
    assert_eq!(conn.pay(Amount::from_sat(500)).await.unwrap(), Amount::from_sat(2_500));
    assert_eq!(
        harness.next_event().await,
        Event::Payment(Amount::from_sat(500), Amount::from_sat(2_500))
    );
    assert_eq!(harness.server_broadcaster.count(), 1);
}

#[test_log::test(tokio::test)]
async fn idle_connection_times_out() {
    let mut harness = Harness::start(Duration::from_millis(200)).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let msg = timeout(Duration::from_secs(10), read_async(&mut stream)).await.unwrap().unwrap();
    assert_eq!(msg.message_type(), Some(MessageType::Error));
    assert_eq!(msg.error_code(), Some(ErrorCode::Timeout));
    assert_eq!(harness.next_event().await, Event::Closed(CloseReason::ConnectionClosed));
}

#[test_log::test(tokio::test)]
async fn dropped_connection_is_reported() {
    let mut harness = Harness::start(Duration::from_secs(30)).await;
    drop(TcpStream::connect(harness.addr).await.unwrap());
    assert_eq!(harness.next_event().await, Event::Closed(CloseReason::ConnectionClosed));
}

#[test_log::test(tokio::test)]
async fn handler_can_close_session() {
    let mut harness = Harness::start(Duration::from_secs(30)).await;
    let conn = harness.connect().await;
    let id = conn.channel_open().await.unwrap();
    assert_eq!(harness.next_event().await, Event::Open(id));

    let session = harness.sessions.recv().await.unwrap();
    session.close();
    session.close();
    assert_eq!(conn.closed().await, CloseReason::ServerRequestedClose);
    assert_eq!(harness.next_event().await, Event::Closed(CloseReason::ServerRequestedClose));
    // closing does not settle
    assert_eq!(harness.listener.registry().len(), 1);
    assert_eq!(harness.server_broadcaster.count(), 1);
}

#[test_log::test(tokio::test)]
async fn refused_connection_is_dropped_without_negotiation() {
    let mut harness = Harness::start_with(Duration::from_secs(30), true).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let _ = write_async(&mut stream, &TwoWayChannelMessage::client_version(None)).await;
    let read = timeout(Duration::from_secs(10), read_async(&mut stream)).await.unwrap();
    assert!(read.is_err(), "unexpected {:?}", read.map(|m| m.message_type()));
    assert!(timeout(Duration::from_millis(200), harness.events.recv()).await.is_err());
    assert!(harness.sessions.try_recv().is_err());
}

#[test_log::test(tokio::test)]
async fn shutdown_closes_sessions_without_settling() {
    let mut harness = Harness::start(Duration::from_secs(30)).await;
    let conn = harness.connect().await;
    let id = conn.channel_open().await.unwrap();
    assert_eq!(harness.next_event().await, Event::Open(id));
    conn.pay(Amount::from_sat(1_000)).await.unwrap();
    harness.next_event().await;

    harness.shutdown.trigger();
    assert_eq!(conn.closed().await, CloseReason::ServerRequestedClose);
    assert_eq!(harness.next_event().await, Event::Closed(CloseReason::ServerRequestedClose));
    assert_eq!(harness.listener.registry().len(), 1);
    assert_eq!(harness.server_broadcaster.count(), 1);
    let record = harness.client_registry.channel(&id).unwrap();
    assert!(!record.lock().unwrap().is_settled());

    // no new connections are accepted
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(harness.addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused);
}
