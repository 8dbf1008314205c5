use std::collections::VecDeque;

use payment_channel::bitcoin::Amount;
use payment_channel::channel::{ChannelId, ServerId};
use payment_channel::config::{ClientConfig, ServerConfig};
use payment_channel::prelude::*;
use payment_channel::registry::{ClientChannelRegistry, ServerChannelRegistry};
use payment_channel::util::clock::ManualClock;
use payment_channel::util::test_utils::{make_server_id, MockBroadcaster, MockWallet};
use paychan_protocol::{MessageType, TwoWayChannelMessage};
use core::time::Duration;

use crate::{
    ClientConnection, CloseReason, PaymentChannelClient, PaymentChannelServer, ServerConnection,
};

pub const NOW: u64 = 1_700_000_000;

/// Something a machine reported to its transport, other than a message
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Destroyed(CloseReason),
    ClientOpen(bool),
    ServerOpen(ChannelId),
    Payment(Amount, Amount),
}

/// A transport that queues what the machine sends and reports
#[derive(Default)]
pub struct RecordingConnection {
    msgs: Mutex<VecDeque<TwoWayChannelMessage>>,
    events: Mutex<Vec<Event>>,
}

impl SendSync for RecordingConnection {}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingConnection::default())
    }

    pub fn pop_msg(&self) -> Option<TwoWayChannelMessage> {
        self.msgs.lock().unwrap().pop_front()
    }

    /// Take the next message, which must be of type `t`
    pub fn check_next_msg(&self, t: MessageType) -> TwoWayChannelMessage {
        let msg = self.pop_msg().unwrap_or_else(|| panic!("expected {:?}, nothing was sent", t));
        assert_eq!(msg.message_type(), Some(t), "unexpected message {:?}", msg.error);
        msg
    }

    pub fn has_msgs(&self) -> bool {
        !self.msgs.lock().unwrap().is_empty()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// The reason the connection was destroyed with, if it was
    pub fn destroyed(&self) -> Option<CloseReason> {
        self.events().into_iter().find_map(|e| match e {
            Event::Destroyed(reason) => Some(reason),
            _ => None,
        })
    }

    pub fn payments(&self) -> Vec<(Amount, Amount)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Payment(by, to) => Some((by, to)),
                _ => None,
            })
            .collect()
    }

    fn push_msg(&self, msg: TwoWayChannelMessage) {
        self.msgs.lock().unwrap().push_back(msg);
    }

    fn push_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl ClientConnection for RecordingConnection {
    fn send_to_server(&self, msg: TwoWayChannelMessage) {
        self.push_msg(msg);
    }

    fn destroy_connection(&self, reason: CloseReason) {
        self.push_event(Event::Destroyed(reason));
    }

    fn channel_open(&self, was_initiated: bool) {
        self.push_event(Event::ClientOpen(was_initiated));
    }
}

impl ServerConnection for RecordingConnection {
    fn send_to_client(&self, msg: TwoWayChannelMessage) {
        self.push_msg(msg);
    }

    fn destroy_connection(&self, reason: CloseReason) {
        self.push_event(Event::Destroyed(reason));
    }

    fn channel_open(&self, id: ChannelId) {
        self.push_event(Event::ServerOpen(id));
    }

    fn payment_increase(&self, by: Amount, to: Amount) {
        self.push_event(Event::Payment(by, to));
    }
}

/// Both sides' wallets, broadcasters and registries sharing one clock.
///
/// Must be created inside a tokio runtime.
pub struct Fixture {
    pub clock: ManualClock,
    pub server_id: ServerId,
    pub client_wallet: Arc<MockWallet>,
    pub server_wallet: Arc<MockWallet>,
    pub client_broadcaster: Arc<MockBroadcaster>,
    pub server_broadcaster: Arc<MockBroadcaster>,
    pub client_registry: Arc<ClientChannelRegistry>,
    pub server_registry: Arc<ServerChannelRegistry>,
    pub client_config: ClientConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_configs(client_config(), ServerConfig::default())
    }

    pub fn with_configs(client_config: ClientConfig, server_config: ServerConfig) -> Self {
        let clock = ManualClock::new(Duration::from_secs(NOW));
        let client_wallet = Arc::new(MockWallet::new(Amount::from_sat(10_000_000)));
        let server_wallet = Arc::new(MockWallet::new(Amount::ZERO));
        let (client_broadcaster, _) = MockBroadcaster::new();
        let (server_broadcaster, _) = MockBroadcaster::new();
        let client_registry = ClientChannelRegistry::new(
            client_broadcaster.clone(),
            Arc::new(clock.clone()),
            client_config.expiry_grace,
            None,
        )
        .expect("client registry");
        let server_registry = ServerChannelRegistry::new(
            server_wallet.clone(),
            server_broadcaster.clone(),
            Arc::new(clock.clone()),
            server_config,
            None,
        )
        .expect("server registry");
        Fixture {
            clock,
            server_id: make_server_id(b"test server"),
            client_wallet,
            server_wallet,
            client_broadcaster,
            server_broadcaster,
            client_registry,
            server_registry,
            client_config,
        }
    }

    pub fn client(&self) -> (PaymentChannelClient, Arc<RecordingConnection>) {
        let conn = RecordingConnection::new();
        let client = PaymentChannelClient::new(
            self.client_wallet.clone(),
            self.client_registry.clone(),
            self.client_config.clone(),
            conn.clone(),
        );
        (client, conn)
    }

    pub fn server(&self) -> (PaymentChannelServer, Arc<RecordingConnection>) {
        let conn = RecordingConnection::new();
        let server = PaymentChannelServer::new(
            self.server_registry.clone(),
            self.server_broadcaster.clone(),
            conn.clone(),
        );
        (server, conn)
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig { refund_fee: Amount::from_sat(1_000), ..ClientConfig::default() }
}

/// Deliver queued messages in both directions until neither side has more
/// to say
pub async fn pump(
    client: &PaymentChannelClient,
    client_conn: &RecordingConnection,
    server: &PaymentChannelServer,
    server_conn: &RecordingConnection,
) {
    loop {
        let mut moved = false;
        while let Some(msg) = client_conn.pop_msg() {
            server.receive_message(msg).await;
            moved = true;
        }
        while let Some(msg) = server_conn.pop_msg() {
            client.receive_message(msg);
            moved = true;
        }
        if !moved {
            return;
        }
    }
}
