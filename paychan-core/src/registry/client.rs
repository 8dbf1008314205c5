use core::time::Duration;

use bitcoin::{Amount, Transaction, Txid};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use super::scheduler::Scheduler;
use crate::channel::{ChannelId, ClientChannel, ServerId};
use crate::config::RETRY_DELAY;
use crate::persist::model::{from_bytes, to_bytes, ClientChannelEntry, ClientStatesEntry};
use crate::persist::{self, ChannelExtension, ChannelStore};
use crate::prelude::*;
use crate::util::clock::Clock;
use crate::wallet::Broadcaster;
use crate::Result;

/// The identifier the client registry is stored under
pub const CLIENT_EXTENSION_ID: &str = "payment_channel.client_channels";

/// A shared, lockable client channel record
pub type ClientChannelRef = Arc<Mutex<ClientChannel>>;

#[derive(Default)]
struct State {
    channels: OrderedMap<ChannelId, ClientChannelRef>,
    // insertion order per server, so the oldest usable channel is picked first
    by_server: Map<ServerId, Vec<ChannelId>>,
    timers: Map<ChannelId, JoinHandle<()>>,
}

impl State {
    fn insert(&mut self, channel: ClientChannel) -> ClientChannelRef {
        let id = channel.id;
        self.by_server.entry(channel.server_id).or_default().push(id);
        let channel = Arc::new(Mutex::new(channel));
        self.channels.insert(id, Arc::clone(&channel));
        channel
    }

    fn remove(&mut self, id: &ChannelId) -> Option<ClientChannelRef> {
        let channel = self.channels.remove(id)?;
        let server_id = channel.lock().unwrap().server_id;
        if let Some(ids) = self.by_server.get_mut(&server_id) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_server.remove(&server_id);
            }
        }
        Some(channel)
    }

    fn for_server(&self, server_id: &ServerId) -> Vec<ClientChannelRef> {
        self.by_server
            .get(server_id)
            .map(|ids| ids.iter().filter_map(|id| self.channels.get(id)).cloned().collect())
            .unwrap_or_default()
    }
}

/// The client's channels with every server.
///
/// Each stored channel has a timer firing `expiry_grace` after its refund
/// unlocks.  The timer broadcasts the escrow and the refund, and removes the
/// channel once both were accepted, so funds come back even if the server
/// never settles.
pub struct ClientChannelRegistry {
    state: Mutex<State>,
    broadcaster: Arc<dyn Broadcaster>,
    scheduler: Scheduler,
    expiry_grace: Duration,
    store: Option<Arc<dyn ChannelStore>>,
    this: Weak<Self>,
}

impl SendSync for ClientChannelRegistry {}

impl ClientChannelRegistry {
    /// Create an empty registry.
    ///
    /// Must be called within a tokio runtime, which runs the expiry timers.
    pub fn new(
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
        expiry_grace: Duration,
        store: Option<Arc<dyn ChannelStore>>,
    ) -> Result<Arc<Self>> {
        let scheduler = Scheduler::new(clock)?;
        Ok(Arc::new_cyclic(|this| ClientChannelRegistry {
            state: Mutex::new(State::default()),
            broadcaster,
            scheduler,
            expiry_grace,
            store,
            this: this.clone(),
        }))
    }

    /// The current time by the registry clock
    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    /// The grace period between refund unlock and reclaiming a channel
    pub fn expiry_grace(&self) -> Duration {
        self.expiry_grace
    }

    /// Store a new channel and arm its expiry timer
    pub fn put(&self, channel: ClientChannel) -> Result<ClientChannelRef> {
        let id = channel.id;
        let deadline = channel.expiry().saturating_add(self.expiry_grace.as_secs());
        let channel = {
            let mut state = self.state.lock().unwrap();
            if state.channels.contains_key(&id) {
                return Err(persist::Error::AlreadyExists(format!("channel {}", id)).into());
            }
            let channel = state.insert(channel);
            self.arm(&mut state, id, deadline);
            channel
        };
        info!("stored client channel {}", id);
        self.updated()?;
        Ok(channel)
    }

    /// Claim the oldest channel with `server_id` a new session may resume.
    ///
    /// The channel must be idle, unsettled, hold value and not expire within
    /// the grace window.  It is returned marked active.
    pub fn usable_channel(&self, server_id: &ServerId) -> Option<ClientChannelRef> {
        let not_before = self.scheduler.now().saturating_add(self.expiry_grace.as_secs());
        let state = self.state.lock().unwrap();
        for channel in state.for_server(server_id) {
            let mut c = channel.lock().unwrap();
            if c.is_resumable() && c.expiry() >= not_before {
                c.active = true;
                debug!("claimed channel {} for resume", c.id);
                drop(c);
                return Some(channel);
            }
        }
        None
    }

    /// Look up a channel with `server_id`
    pub fn get(&self, server_id: &ServerId, id: &ChannelId) -> Option<ClientChannelRef> {
        let channel = self.channel(id)?;
        let matches = channel.lock().unwrap().server_id == *server_id;
        if matches {
            Some(channel)
        } else {
            None
        }
    }

    /// Look up a channel by id
    pub fn channel(&self, id: &ChannelId) -> Option<ClientChannelRef> {
        self.state.lock().unwrap().channels.get(id).cloned()
    }

    /// All channels with `server_id`, oldest first
    pub fn channels_for(&self, server_id: &ServerId) -> Vec<ClientChannelRef> {
        self.state.lock().unwrap().for_server(server_id)
    }

    /// Forget a channel and disarm its timer.  Returns whether it was present.
    pub fn remove(&self, id: &ChannelId) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap();
            if let Some(timer) = state.timers.remove(id) {
                timer.abort();
            }
            state.remove(id).is_some()
        };
        if removed {
            info!("removed client channel {}", id);
            self.persist_logged();
        }
        removed
    }

    /// The value still spendable across unsettled channels with `server_id`
    pub fn balance_for_server(&self, server_id: &ServerId) -> Amount {
        let mut balance = Amount::ZERO;
        for channel in self.channels_for(server_id) {
            let c = channel.lock().unwrap();
            if !c.is_settled() {
                balance += c.value_remaining;
            }
        }
        balance
    }

    /// Seconds until the earliest unsettled channel with `server_id` is
    /// reclaimed, or `None` if there is no such channel
    pub fn seconds_until_expiry(&self, server_id: &ServerId) -> Option<u64> {
        let now = self.scheduler.now();
        let grace = self.expiry_grace.as_secs();
        let mut earliest = None;
        for channel in self.channels_for(server_id) {
            let c = channel.lock().unwrap();
            if !c.is_settled() {
                let remaining = c.expiry().saturating_add(grace).saturating_sub(now);
                earliest = Some(earliest.map_or(remaining, |e: u64| e.min(remaining)));
            }
        }
        earliest
    }

    /// The host's chain tracking saw a settlement confirm.
    ///
    /// Removes the channel it settled; returns whether there was one.
    pub fn settlement_confirmed(&self, txid: &Txid) -> bool {
        let id = {
            let state = self.state.lock().unwrap();
            state.channels.values().find_map(|c| {
                let c = c.lock().unwrap();
                match &c.settlement {
                    Some(tx) if tx.compute_txid() == *txid => Some(c.id),
                    _ => None,
                }
            })
        };
        match id {
            Some(id) => self.remove(&id),
            None => false,
        }
    }

    /// The number of stored channels
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().channels.len()
    }

    /// Whether no channels are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A record was changed by its session; write the registry out
    pub fn updated(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.put(CLIENT_EXTENSION_ID, self.serialize()?)?;
        }
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.updated() {
            error!("could not persist client channels: {}", e);
        }
    }

    fn arm(&self, state: &mut State, id: ChannelId, deadline: u64) {
        let this = self.this.clone();
        let timer = self.scheduler.schedule(deadline, async move {
            let mut escrow_sent = false;
            loop {
                let Some(registry) = this.upgrade() else { return };
                match registry.expire(&id, &mut escrow_sent).await {
                    Ok(()) => return,
                    Err(e) => warn!("could not reclaim channel {}, will retry: {}", id, e),
                }
                drop(registry);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        });
        if let Some(old) = state.timers.insert(id, timer) {
            old.abort();
        }
    }

    async fn expire(&self, id: &ChannelId, escrow_sent: &mut bool) -> Result<()> {
        let Some(channel) = self.channel(id) else { return Ok(()) };
        let (escrow, refund, settled): (Transaction, Transaction, bool) = {
            let c = channel.lock().unwrap();
            (c.escrow.clone(), c.refund.clone(), c.is_settled())
        };
        if settled {
            info!("settled channel {} expired, forgetting it", id);
        } else {
            info!("channel {} expired, broadcasting escrow and refund", id);
            if !*escrow_sent {
                self.broadcaster.broadcast(escrow).await?;
                *escrow_sent = true;
            }
            self.broadcaster.broadcast(refund).await?;
        }
        let removed = {
            let mut state = self.state.lock().unwrap();
            // this task is the timer, so it is dropped rather than aborted
            state.timers.remove(id);
            state.remove(id).is_some()
        };
        if removed {
            self.persist_logged();
        }
        Ok(())
    }
}

impl ChannelExtension for ClientChannelRegistry {
    fn extension_id(&self) -> &'static str {
        CLIENT_EXTENSION_ID
    }

    fn serialize(&self) -> core::result::Result<Vec<u8>, persist::Error> {
        let state = self.state.lock().unwrap();
        let channels =
            state.channels.values().map(|c| ClientChannelEntry::from(&*c.lock().unwrap())).collect();
        to_bytes(&ClientStatesEntry { channels })
    }

    fn deserialize(&self, data: &[u8]) -> core::result::Result<(), persist::Error> {
        let entry: ClientStatesEntry = from_bytes(data)?;
        let channels = entry
            .channels
            .into_iter()
            .map(ClientChannel::try_from)
            .collect::<core::result::Result<Vec<_>, _>>()?;
        let mut state = self.state.lock().unwrap();
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        *state = State::default();
        for channel in channels {
            let id = channel.id;
            let deadline = channel.expiry().saturating_add(self.expiry_grace.as_secs());
            state.insert(channel);
            self.arm(&mut state, id, deadline);
        }
        info!("loaded {} client channels", state.channels.len());
        Ok(())
    }
}

impl Drop for ClientChannelRegistry {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::util::clock::ManualClock;
    use crate::util::test_utils::*;
    use crate::Error;

    const NOW: u64 = 1_700_000_000;
    const DAY: u64 = 24 * 60 * 60;
    const GRACE: Duration = Duration::from_secs(5 * 60);

    fn setup() -> (
        Arc<ClientChannelRegistry>,
        Arc<MockBroadcaster>,
        tokio::sync::mpsc::UnboundedReceiver<Transaction>,
        ManualClock,
    ) {
        let clock = ManualClock::new(Duration::from_secs(NOW));
        let (broadcaster, rx) = MockBroadcaster::new();
        let registry =
            ClientChannelRegistry::new(broadcaster.clone(), Arc::new(clock.clone()), GRACE, None)
                .unwrap();
        (registry, broadcaster, rx, clock)
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn usable_channel_is_claimed_once() {
        let (registry, _b, _rx, _clock) = setup();
        let server_id = make_server_id(b"server");
        let channel = registry.put(make_client_channel(NOW + DAY, 100, 60)).unwrap();
        let id = channel.lock().unwrap().id;

        let claimed = registry.usable_channel(&server_id).unwrap();
        assert_eq!(claimed.lock().unwrap().id, id);
        assert!(channel.lock().unwrap().active);
        assert!(registry.usable_channel(&server_id).is_none());

        channel.lock().unwrap().active = false;
        assert!(registry.usable_channel(&make_server_id(b"other")).is_none());
        assert!(registry.usable_channel(&server_id).is_some());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn empty_settled_and_expiring_channels_are_not_usable() {
        let (registry, _b, _rx, _clock) = setup();
        let server_id = make_server_id(b"server");
        registry.put(make_client_channel(NOW + DAY, 100, 0)).unwrap();
        let mut settled = make_client_channel(NOW + DAY, 100, 50);
        settled.settlement = Some(settled.refund.clone());
        registry.put(settled).unwrap();
        registry.put(make_client_channel(NOW + 60, 100, 50)).unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.usable_channel(&server_id).is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn duplicate_put_is_rejected() {
        let (registry, _b, _rx, _clock) = setup();
        let channel = make_client_channel(NOW + DAY, 100, 60);
        registry.put(channel.clone()).unwrap();
        assert!(matches!(
            registry.put(channel),
            Err(Error::Persist(persist::Error::AlreadyExists(_)))
        ));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn balance_and_expiry_queries() {
        let (registry, _b, _rx, clock) = setup();
        let server_id = make_server_id(b"server");
        assert_eq!(registry.balance_for_server(&server_id), Amount::ZERO);
        assert_eq!(registry.seconds_until_expiry(&server_id), None);

        registry.put(make_client_channel(NOW + DAY, 100, 60)).unwrap();
        registry.put(make_client_channel(NOW + 2 * DAY, 100, 30)).unwrap();
        let mut settled = make_client_channel(NOW + 10, 100, 50);
        settled.settlement = Some(settled.refund.clone());
        registry.put(settled).unwrap();

        assert_eq!(registry.balance_for_server(&server_id), Amount::from_sat(90));
        assert_eq!(registry.seconds_until_expiry(&server_id), Some(DAY + GRACE.as_secs()));
        clock.advance(Duration::from_secs(240));
        assert_eq!(registry.seconds_until_expiry(&server_id), Some(DAY + 60));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn expiry_broadcasts_escrow_then_refund_once() {
        let (registry, broadcaster, mut rx, _clock) = setup();
        let channel = make_client_channel(NOW + DAY, 100, 60);
        let (escrow, refund) = (channel.escrow.clone(), channel.refund.clone());
        registry.put(channel).unwrap();

        tokio::time::sleep(Duration::from_secs(DAY)).await;
        assert_eq!(broadcaster.count(), 0);

        assert_eq!(rx.recv().await.unwrap(), escrow);
        assert_eq!(rx.recv().await.unwrap(), refund);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_secs(10 * DAY)).await;
        assert_eq!(broadcaster.count(), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn failed_expiry_broadcast_is_retried() {
        let (registry, broadcaster, mut rx, _clock) = setup();
        let channel = make_client_channel(NOW + 10, 100, 60);
        let id = channel.id;
        registry.put(channel).unwrap();
        broadcaster.set_fail(true);

        tokio::time::sleep(GRACE + Duration::from_secs(20)).await;
        assert_eq!(broadcaster.count(), 0);
        assert!(registry.channel(&id).is_some());

        broadcaster.set_fail(false);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.channel(&id).is_none());
        assert_eq!(broadcaster.count(), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn remove_is_idempotent_and_disarms() {
        let (registry, broadcaster, _rx, _clock) = setup();
        let channel = make_client_channel(NOW + 10, 100, 60);
        let id = channel.id;
        registry.put(channel).unwrap();
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        tokio::time::sleep(Duration::from_secs(DAY)).await;
        assert_eq!(broadcaster.count(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn settlement_confirmation_removes_channel() {
        let (registry, _b, _rx, _clock) = setup();
        let mut channel = make_client_channel(NOW + DAY, 100, 60);
        let settlement = make_funding_tx(bitcoin::ScriptBuf::new(), Amount::from_sat(40));
        channel.settlement = Some(settlement.clone());
        registry.put(channel).unwrap();
        let unrelated = make_funding_tx(bitcoin::ScriptBuf::new(), Amount::ONE_SAT);
        assert!(!registry.settlement_confirmed(&unrelated.compute_txid()));
        assert!(registry.settlement_confirmed(&settlement.compute_txid()));
        assert!(registry.is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn round_trip_rearms_timers_from_wall_clock() {
        let (registry, _b, _rx, clock) = setup();
        registry.put(make_client_channel(NOW + DAY, 100, 60)).unwrap();
        registry.put(make_client_channel(NOW + 2 * DAY, 200, 200)).unwrap();
        registry.usable_channel(&make_server_id(b"server")).unwrap();
        let bytes = registry.serialize().unwrap();

        // a restart a day and a bit later: the first channel is already due
        clock.advance(Duration::from_secs(DAY + GRACE.as_secs()));
        let (broadcaster, mut rx) = MockBroadcaster::new();
        let restored =
            ClientChannelRegistry::new(broadcaster.clone(), Arc::new(clock.clone()), GRACE, None)
                .unwrap();
        restored.deserialize(&bytes).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.serialize().unwrap(), bytes);
        for channel in registry.channels_for(&make_server_id(b"server")) {
            let c = channel.lock().unwrap();
            let r = restored.channel(&c.id).unwrap();
            let r = r.lock().unwrap();
            assert_eq!(r.value_remaining, c.value_remaining);
            assert_eq!(r.refund, c.refund);
            assert!(!r.active);
        }

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(restored.len(), 1);
        assert_eq!(broadcaster.count(), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn corrupt_blob_leaves_registry_unchanged() {
        let (registry, _b, _rx, _clock) = setup();
        registry.put(make_client_channel(NOW + DAY, 100, 60)).unwrap();
        let mut entry: ClientStatesEntry = from_bytes(&registry.serialize().unwrap()).unwrap();
        entry.channels[0].value_remaining = -5;
        let bytes = to_bytes(&entry).unwrap();

        let (other, _b2, _rx2, _clock2) = setup();
        other.put(make_client_channel(NOW + DAY, 300, 60)).unwrap();
        assert!(other.deserialize(&bytes).is_err());
        assert_eq!(other.len(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn changes_are_written_to_the_store() {
        let clock = ManualClock::new(Duration::from_secs(NOW));
        let (broadcaster, _rx) = MockBroadcaster::new();
        let store = Arc::new(MemoryStore::new());
        let registry = ClientChannelRegistry::new(
            broadcaster.clone(),
            Arc::new(clock.clone()),
            GRACE,
            Some(store.clone()),
        )
        .unwrap();
        let channel = make_client_channel(NOW + DAY, 100, 60);
        let id = channel.id;
        registry.put(channel).unwrap();

        let restored =
            ClientChannelRegistry::new(broadcaster, Arc::new(clock), GRACE, None).unwrap();
        assert!(persist::load_extension(&*store, &*restored).unwrap());
        assert!(restored.channel(&id).is_some());

        registry.remove(&id);
        let entry: ClientStatesEntry =
            from_bytes(&store.get(CLIENT_EXTENSION_ID).unwrap().unwrap()).unwrap();
        assert!(entry.channels.is_empty());
    }

    #[test_log::test]
    fn registry_needs_a_runtime() {
        let (broadcaster, _rx) = MockBroadcaster::new();
        let clock = Arc::new(ManualClock::new(Duration::from_secs(NOW)));
        assert!(matches!(
            ClientChannelRegistry::new(broadcaster, clock, GRACE, None),
            Err(Error::Runtime(_))
        ));
    }
}
