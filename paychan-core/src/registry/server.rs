use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::Transaction;
use log::{debug, error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::scheduler::Scheduler;
use crate::channel::{ActiveSession, ChannelId, ServerChannel};
use crate::config::{ServerConfig, RETRY_DELAY};
use crate::error::illegal_state;
use crate::persist::model::{from_bytes, to_bytes, ServerChannelEntry, ServerStatesEntry};
use crate::persist::{self, ChannelExtension, ChannelStore};
use crate::prelude::*;
use crate::tx::{self, SettlementParams};
use crate::util::clock::Clock;
use crate::wallet::{Broadcaster, Wallet};
use crate::Result;

/// The identifier the server registry is stored under
pub const SERVER_EXTENSION_ID: &str = "payment_channel.server_channels";

/// A shared, lockable server channel record
pub type ServerChannelRef = Arc<Mutex<ServerChannel>>;

/// Serializes settlement of one channel; holds the settlement once broadcast
type SettleGate = Arc<AsyncMutex<Option<Transaction>>>;

#[derive(Default)]
struct State {
    channels: OrderedMap<ChannelId, ServerChannelRef>,
    timers: Map<ChannelId, JoinHandle<()>>,
    settling: Map<ChannelId, SettleGate>,
}

/// The server's open channels.
///
/// Each channel has a timer firing `expire_offset` before the client's
/// refund unlocks, which settles the best payment received so far.
pub struct ServerChannelRegistry {
    state: Mutex<State>,
    wallet: Arc<dyn Wallet>,
    broadcaster: Arc<dyn Broadcaster>,
    scheduler: Scheduler,
    config: ServerConfig,
    store: Option<Arc<dyn ChannelStore>>,
    secp_ctx: Secp256k1<All>,
    this: Weak<Self>,
}

impl SendSync for ServerChannelRegistry {}

impl ServerChannelRegistry {
    /// Create an empty registry.
    ///
    /// Must be called within a tokio runtime, which runs the settlement timers.
    /// Settlements pay to the wallet's receive script.
    pub fn new(
        wallet: Arc<dyn Wallet>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
        config: ServerConfig,
        store: Option<Arc<dyn ChannelStore>>,
    ) -> Result<Arc<Self>> {
        let scheduler = Scheduler::new(clock)?;
        Ok(Arc::new_cyclic(|this| ServerChannelRegistry {
            state: Mutex::new(State::default()),
            wallet,
            broadcaster,
            scheduler,
            config,
            store,
            secp_ctx: Secp256k1::new(),
            this: this.clone(),
        }))
    }

    /// The policy this registry settles with
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The current time by the registry clock
    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    /// Store a newly opened channel and arm its settlement timer
    pub fn put(&self, channel: ServerChannel) -> Result<ServerChannelRef> {
        let id = channel.id;
        let deadline = self.deadline(&channel);
        let channel = {
            let mut state = self.state.lock().unwrap();
            if state.channels.contains_key(&id) {
                return Err(persist::Error::AlreadyExists(format!("channel {}", id)).into());
            }
            let channel = Arc::new(Mutex::new(channel));
            state.channels.insert(id, Arc::clone(&channel));
            self.arm(&mut state, id, deadline);
            channel
        };
        info!("stored server channel {}", id);
        self.updated()?;
        Ok(channel)
    }

    /// Look up a channel
    pub fn get(&self, id: &ChannelId) -> Option<ServerChannelRef> {
        self.state.lock().unwrap().channels.get(id).cloned()
    }

    /// Attach a session to an unsettled channel.
    ///
    /// A session already holding the channel is superseded, so at most one
    /// session drives a channel at any time.
    pub fn activate(
        &self,
        id: &ChannelId,
        session: Arc<dyn ActiveSession>,
    ) -> Option<ServerChannelRef> {
        let channel = self.get(id)?;
        let new_session = session.session_id();
        let previous = {
            let mut c = channel.lock().unwrap();
            if c.is_settled() {
                debug!("not activating settled channel {}", id);
                return None;
            }
            c.active.replace(session)
        };
        if let Some(previous) = previous {
            warn!(
                "channel {} resumed by session {}, superseding session {}",
                id,
                new_session,
                previous.session_id()
            );
            previous.supersede();
        }
        Some(channel)
    }

    /// Detach a session from a channel, if it is still the one holding it
    pub fn release(&self, id: &ChannelId, session_id: u64) -> bool {
        let Some(channel) = self.get(id) else { return false };
        let mut c = channel.lock().unwrap();
        match &c.active {
            Some(s) if s.session_id() == session_id => {
                c.active = None;
                true
            }
            _ => false,
        }
    }

    /// Settle a channel with the best payment received.
    ///
    /// The settlement is broadcast and the channel removed.  A session still
    /// holding the channel is handed the settlement.  Concurrent callers wait
    /// for the broadcast in flight and share its outcome; after a failed
    /// broadcast the next caller tries again.
    pub async fn close_channel(&self, id: &ChannelId) -> Result<Transaction> {
        let (channel, gate) = {
            let mut state = self.state.lock().unwrap();
            let channel = state
                .channels
                .get(id)
                .cloned()
                .ok_or_else(|| illegal_state(format!("no open channel {}", id)))?;
            (channel, Arc::clone(state.settling.entry(*id).or_default()))
        };
        let mut done = gate.lock().await;
        if let Some(settlement) = &*done {
            return Ok(settlement.clone());
        }
        if self.get(id).is_none() {
            return Err(illegal_state(format!("channel {} was removed", id)));
        }
        let settlement = {
            let mut c = channel.lock().unwrap();
            let script = c.multisig_script(&self.secp_ctx);
            let params = SettlementParams {
                escrow_txid: c.id,
                script: &script,
                value: c.value(),
                client_script: c.client_script.clone(),
                paid: c.best_value,
                client_sig: &c.best_signature,
                server_script: self.wallet.receive_script(),
                fee: self.config.settlement_fee,
            };
            let settlement = tx::build_settlement(&self.secp_ctx, params, &c.my_key)?;
            c.settlement = Some(settlement.clone());
            settlement
        };
        let txid = settlement.compute_txid();
        info!("settling channel {} with {}", id, txid);
        match self.broadcaster.broadcast(settlement).await {
            Ok(settlement) => {
                *done = Some(settlement.clone());
                let holder = channel.lock().unwrap().active.take();
                self.remove(id);
                if let Some(session) = holder {
                    info!("closing session {} on channel {}", session.session_id(), id);
                    session.settled(&settlement);
                }
                Ok(settlement)
            }
            Err(e) => {
                error!("settlement {} of channel {} failed: {}", txid, id, e);
                channel.lock().unwrap().settlement = None;
                Err(e)
            }
        }
    }

    /// Forget a channel and disarm its timer.  Returns whether it was present.
    pub fn remove(&self, id: &ChannelId) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap();
            if let Some(timer) = state.timers.remove(id) {
                timer.abort();
            }
            state.settling.remove(id);
            state.channels.remove(id).is_some()
        };
        if removed {
            info!("removed server channel {}", id);
            self.persist_logged();
        }
        removed
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
            store.put(SERVER_EXTENSION_ID, self.serialize()?)?;
        }
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.updated() {
            error!("could not persist server channels: {}", e);
        }
    }

    fn deadline(&self, channel: &ServerChannel) -> u64 {
        channel.refund_expiry.saturating_sub(self.config.expire_offset.as_secs())
    }

    fn arm(&self, state: &mut State, id: ChannelId, deadline: u64) {
        let this = self.this.clone();
        let timer = self.scheduler.schedule(deadline, async move {
            loop {
                let Some(registry) = this.upgrade() else { return };
                if registry.get(&id).is_none() {
                    return;
                }
                info!("channel {} is close to expiry, settling", id);
                match registry.close_channel(&id).await {
                    Ok(_) => return,
                    Err(e) => warn!("could not settle channel {}, will retry: {}", id, e),
                }
                drop(registry);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        });
        if let Some(old) = state.timers.insert(id, timer) {
            old.abort();
        }
    }
}

impl ChannelExtension for ServerChannelRegistry {
    fn extension_id(&self) -> &'static str {
        SERVER_EXTENSION_ID
    }

    fn serialize(&self) -> core::result::Result<Vec<u8>, persist::Error> {
        let state = self.state.lock().unwrap();
        let channels =
            state.channels.values().map(|c| ServerChannelEntry::from(&*c.lock().unwrap())).collect();
        to_bytes(&ServerStatesEntry { channels })
    }

    fn deserialize(&self, data: &[u8]) -> core::result::Result<(), persist::Error> {
        let entry: ServerStatesEntry = from_bytes(data)?;
        let channels = entry
            .channels
            .into_iter()
            .map(ServerChannel::try_from)
            .collect::<core::result::Result<Vec<_>, _>>()?;
        let mut state = self.state.lock().unwrap();
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        *state = State::default();
        for channel in channels {
            let id = channel.id;
            let deadline = self.deadline(&channel);
            state.channels.insert(id, Arc::new(Mutex::new(channel)));
            self.arm(&mut state, id, deadline);
        }
        info!("loaded {} server channels", state.channels.len());
        Ok(())
    }
}

impl Drop for ServerChannelRegistry {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
        }
    }
}
