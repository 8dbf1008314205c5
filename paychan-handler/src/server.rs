use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, error, info, warn};
use payment_channel::bitcoin::consensus::encode::{deserialize, serialize};
use payment_channel::bitcoin::hashes::Hash;
use payment_channel::bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use payment_channel::bitcoin::sighash::EcdsaSighashType;
use payment_channel::bitcoin::{Amount, ScriptBuf, Transaction, Txid};
use payment_channel::channel::{ActiveSession, ChannelId, ServerChannel};
use payment_channel::prelude::*;
use payment_channel::registry::ServerChannelRegistry;
use payment_channel::tx;
use payment_channel::wallet::Broadcaster;
use paychan_protocol::msgs::{Initiate, UpdatePayment, PROTOCOL_MAJOR_VERSION};
use paychan_protocol::{ErrorCode, MessageType, TwoWayChannelMessage};
use tokio::sync::Mutex as AsyncMutex;

use crate::{CloseReason, Fault};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// How the server machine reaches the client and the application
pub trait ServerConnection: SendSync {
    /// Queue a message for the client.  Must not block.
    fn send_to_client(&self, msg: TwoWayChannelMessage);

    /// Close the transport.  The machine has already cleaned up.
    fn destroy_connection(&self, reason: CloseReason);

    /// The channel is ready to receive payments
    fn channel_open(&self, id: ChannelId);

    /// The client paid `by` more, for a total of `to`
    fn payment_increase(&self, by: Amount, to: Amount);
}

/// Server protocol states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStep {
    /// Waiting for CLIENT_VERSION
    New,
    /// INITIATE sent
    AwaitingRefund,
    /// RETURN_REFUND sent
    AwaitingEscrow,
    /// Receiving payments
    Open,
    /// Ended normally
    Closed,
    /// Ended by a failure
    Error,
}

struct PendingRefund {
    client_key: PublicKey,
    client_script: ScriptBuf,
    escrow_txid: Txid,
    refund_expiry: u64,
}

struct Inner {
    step: ServerStep,
    channel_id: Option<ChannelId>,
    my_key: Option<SecretKey>,
    expire_time: u64,
    pending: Option<PendingRefund>,
}

/// The registry's view of this session, used to close it when another
/// session resumes the same channel or the registry settles it
struct SessionHolder {
    session_id: u64,
    detached: AtomicBool,
    conn: Arc<dyn ServerConnection>,
}

impl SendSync for SessionHolder {}

impl ActiveSession for SessionHolder {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn supersede(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("session {} superseded", self.session_id);
        self.conn.send_to_client(TwoWayChannelMessage::close(None));
        self.conn.destroy_connection(CloseReason::ServerRequestedClose);
    }

    fn settled(&self, settlement: &Transaction) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session {}: channel settled by {}", self.session_id, settlement.compute_txid());
        self.conn.send_to_client(TwoWayChannelMessage::close(Some(serialize(settlement))));
        self.conn.destroy_connection(CloseReason::ServerRequestedClose);
    }
}

/// The receiving side of one session.
///
/// Messages are handled one at a time; the escrow and settlement broadcasts
/// are awaited while the session is locked.
pub struct PaymentChannelServer {
    inner: AsyncMutex<Inner>,
    registry: Arc<ServerChannelRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
    conn: Arc<dyn ServerConnection>,
    holder: Arc<SessionHolder>,
    secp_ctx: Secp256k1<All>,
}

impl PaymentChannelServer {
    /// Create a server machine for one connection
    pub fn new(
        registry: Arc<ServerChannelRegistry>,
        broadcaster: Arc<dyn Broadcaster>,
        conn: Arc<dyn ServerConnection>,
    ) -> Self {
        let holder = Arc::new(SessionHolder {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            detached: AtomicBool::new(false),
            conn: Arc::clone(&conn),
        });
        let inner = Inner {
            step: ServerStep::New,
            channel_id: None,
            my_key: None,
            expire_time: 0,
            pending: None,
        };
        PaymentChannelServer {
            inner: AsyncMutex::new(inner),
            registry,
            broadcaster,
            conn,
            holder,
            secp_ctx: Secp256k1::new(),
        }
    }

    /// A process-unique number for log correlation
    pub fn session_id(&self) -> u64 {
        self.holder.session_id
    }

    /// The current protocol state
    pub async fn step(&self) -> ServerStep {
        self.inner.lock().await.step
    }

    /// The channel this session drives, once there is one
    pub async fn channel_id(&self) -> Option<ChannelId> {
        self.inner.lock().await.channel_id
    }

    /// Whether the registry closed this session, because another session
    /// took over its channel or the channel was settled
    pub fn is_detached(&self) -> bool {
        self.holder.detached.load(Ordering::SeqCst)
    }

    /// Handle a message from the client
    pub async fn receive_message(&self, msg: TwoWayChannelMessage) {
        let mut inner = self.inner.lock().await;
        if self.is_detached() || matches!(inner.step, ServerStep::Closed | ServerStep::Error) {
            debug!("session {}: ignoring message type {} after close", self.session_id(), msg.r#type);
            return;
        }
        let result = match (inner.step, msg.message_type()) {
            (_, Some(MessageType::Error)) => {
                let explanation = msg.error.as_ref().and_then(|e| e.explanation.clone());
                warn!(
                    "session {}: client sent error {:?}: {}",
                    self.session_id(),
                    msg.error_code(),
                    explanation.as_deref().unwrap_or("")
                );
                self.close_locally(&mut inner, CloseReason::RemoteSentError);
                Ok(())
            }
            (ServerStep::Open, Some(MessageType::Close)) => {
                self.settle(&mut inner, CloseReason::ClientRequestedClose).await;
                Ok(())
            }
            (_, Some(MessageType::Close)) => {
                info!("session {}: client closed before the channel opened", self.session_id());
                self.close_locally(&mut inner, CloseReason::ClientRequestedClose);
                Ok(())
            }
            (ServerStep::New, Some(MessageType::ClientVersion)) => {
                self.receive_version(&mut inner, msg)
            }
            (ServerStep::AwaitingRefund, Some(MessageType::ProvideRefund)) => {
                self.receive_refund(&mut inner, msg)
            }
            (ServerStep::AwaitingEscrow, Some(MessageType::ProvideContract)) => {
                self.receive_contract(&mut inner, msg).await
            }
            (ServerStep::Open, Some(MessageType::UpdatePayment)) => {
                self.receive_payment(&mut inner, msg).await
            }
            (step, t) => Err(Fault::invalid(format!("unexpected message {:?} in state {:?}", t, step))),
        };
        if let Err(fault) = result {
            self.fail(&mut inner, fault);
        }
    }

    /// The transport closed.  The channel stays stored and may be resumed.
    pub async fn connection_closed(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.step, ServerStep::Closed | ServerStep::Error) {
            return;
        }
        info!("session {}: connection closed", self.session_id());
        self.release(&mut inner);
        inner.step = ServerStep::Closed;
    }

    /// Close the session without settling, at the application's request
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.step, ServerStep::Closed | ServerStep::Error) {
            return;
        }
        info!("session {}: closing at the handler's request", self.session_id());
        self.conn.send_to_client(TwoWayChannelMessage::close(None));
        self.close_locally(&mut inner, CloseReason::ServerRequestedClose);
    }

    fn receive_version(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let version = msg.client_version.ok_or_else(|| Fault::invalid("missing client version"))?;
        if version.major != PROTOCOL_MAJOR_VERSION {
            return Err(Fault::new(
                ErrorCode::NoAcceptableVersion,
                CloseReason::NoAcceptableVersion,
                format!("client speaks major version {}", version.major),
            ));
        }
        if let Some(hash) = version.previous_channel_contract_hash {
            match Txid::from_slice(&hash) {
                Ok(id) => {
                    let holder: Arc<dyn ActiveSession> = self.holder.clone();
                    if self.registry.activate(&id, holder).is_some() {
                        info!("session {}: resuming channel {}", self.session_id(), id);
                        self.conn.send_to_client(TwoWayChannelMessage::server_version());
                        self.conn.send_to_client(TwoWayChannelMessage::channel_open(hash));
                        inner.channel_id = Some(id);
                        inner.step = ServerStep::Open;
                        self.conn.channel_open(id);
                        return Ok(());
                    }
                    info!("session {}: cannot resume {}, starting a new channel", self.session_id(), id);
                }
                Err(_) => warn!("session {}: ignoring malformed resume hash", self.session_id()),
            }
        }

        let config = self.registry.config();
        let my_key = tx::generate_key();
        let expire_time = self.registry.now().saturating_add(config.time_window.as_secs());
        let initiate = Initiate {
            multisig_key: PublicKey::from_secret_key(&self.secp_ctx, &my_key).serialize().to_vec(),
            min_accepted_channel_size: config.min_accepted_channel_size.to_sat(),
            expire_time_secs: expire_time,
            min_payment: config.min_payment.to_sat(),
        };
        self.conn.send_to_client(TwoWayChannelMessage::server_version());
        self.conn.send_to_client(TwoWayChannelMessage::initiate(initiate));
        inner.my_key = Some(my_key);
        inner.expire_time = expire_time;
        inner.step = ServerStep::AwaitingRefund;
        Ok(())
    }

    fn receive_refund(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let provided = msg.provide_refund.ok_or_else(|| Fault::invalid("missing refund"))?;
        let my_key = inner.my_key.ok_or_else(|| Fault::invalid("no key"))?;
        let client_key = PublicKey::from_slice(&provided.multisig_key)
            .map_err(|e| Fault::invalid(format!("client key: {}", e)))?;
        let refund: Transaction = deserialize(&provided.tx)
            .map_err(|e| Fault::bad_transaction(format!("refund: {}", e)))?;
        let out = tx::check_refund(&refund, inner.expire_time)
            .map_err(|e| Fault::bad_transaction(e.to_string()))?;
        let refund_expiry = tx::refund_expiry(&refund).unwrap_or(inner.expire_time);
        let script = tx::multisig_script(&client_key, &PublicKey::from_secret_key(&self.secp_ctx, &my_key));
        let sig = tx::sign_escrow_input(
            &self.secp_ctx,
            &refund,
            &script,
            &my_key,
            EcdsaSighashType::NonePlusAnyoneCanPay,
        )
        .map_err(|e| Fault::bad_transaction(e.to_string()))?;
        let escrow_txid = refund.input[0].previous_output.txid;
        debug!("session {}: signed refund for escrow {}", self.session_id(), escrow_txid);
        self.conn.send_to_client(TwoWayChannelMessage::return_refund(sig.to_vec()));
        inner.pending = Some(PendingRefund {
            client_key,
            client_script: out.script_pubkey,
            escrow_txid,
            refund_expiry,
        });
        inner.step = ServerStep::AwaitingEscrow;
        Ok(())
    }

    async fn receive_contract(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let contract = msg.provide_contract.ok_or_else(|| Fault::invalid("missing contract"))?;
        let my_key = inner.my_key.ok_or_else(|| Fault::invalid("no key"))?;
        let pending = inner.pending.take().ok_or_else(|| Fault::invalid("no refund signed"))?;
        let escrow: Transaction = deserialize(&contract.tx)
            .map_err(|e| Fault::bad_transaction(format!("escrow: {}", e)))?;
        let id = escrow.compute_txid();
        if id != pending.escrow_txid {
            return Err(Fault::bad_transaction(format!(
                "escrow {} is not the one the refund spends",
                id
            )));
        }
        let config = self.registry.config();
        let script =
            tx::multisig_script(&pending.client_key, &PublicKey::from_secret_key(&self.secp_ctx, &my_key));
        let value = tx::check_escrow(&escrow, &script, config.min_accepted_channel_size)
            .map_err(|e| Fault::bad_transaction(e.to_string()))?;
        let payment = contract.initial_payment.ok_or_else(|| Fault::invalid("missing initial payment"))?;
        let (paid, best_signature) =
            self.check_payment(id, &script, &pending.client_key, &pending.client_script, value, &payment)?;
        if paid < config.min_payment {
            return Err(Fault::invalid(format!(
                "initial payment {} is below the minimum {}",
                paid, config.min_payment
            )));
        }

        let txid = escrow.compute_txid();
        info!("session {}: broadcasting escrow {} of {}", self.session_id(), txid, value);
        let escrow = self.broadcaster.broadcast(escrow).await.map_err(|e| {
            Fault::new(ErrorCode::Other, CloseReason::ServerRequestedClose, e.to_string())
        })?;
        let holder: Arc<dyn ActiveSession> = self.holder.clone();
        let channel = ServerChannel {
            id,
            escrow,
            my_key,
            client_key: pending.client_key,
            client_script: pending.client_script,
            refund_expiry: pending.refund_expiry,
            best_value: paid,
            best_signature,
            settlement: None,
            active: Some(holder),
        };
        self.registry
            .put(channel)
            .map_err(|e| Fault::new(ErrorCode::Other, CloseReason::ServerRequestedClose, e.to_string()))?;
        inner.channel_id = Some(id);
        inner.step = ServerStep::Open;
        self.conn.send_to_client(TwoWayChannelMessage::channel_open(id.to_byte_array().to_vec()));
        self.conn.channel_open(id);
        if paid > Amount::ZERO {
            self.conn.payment_increase(paid, paid);
        }
        if paid == value {
            self.settle(inner, CloseReason::ServerRequestedClose).await;
        }
        Ok(())
    }

    async fn receive_payment(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let payment = msg.update_payment.ok_or_else(|| Fault::invalid("missing payment"))?;
        let id = inner.channel_id.ok_or_else(|| Fault::invalid("no channel"))?;
        let channel = self.registry.get(&id).ok_or_else(|| {
            Fault::new(ErrorCode::Other, CloseReason::ServerRequestedClose, format!("channel {} is gone", id))
        })?;
        let (by, to, exhausted) = {
            let mut c = channel.lock().unwrap();
            if c.is_settled() {
                return Err(Fault::invalid("channel is settling"));
            }
            let script = c.multisig_script(&self.secp_ctx);
            let value = c.value();
            let (paid, signature) =
                self.check_payment(id, &script, &c.client_key, &c.client_script, value, &payment)?;
            if paid <= c.best_value {
                return Err(Fault::invalid(format!(
                    "payment total {} does not exceed {}",
                    paid, c.best_value
                )));
            }
            let by = paid - c.best_value;
            c.best_value = paid;
            c.best_signature = signature;
            (by, paid, paid == value)
        };
        if let Err(e) = self.registry.updated() {
            error!("session {}: could not persist payment: {}", self.session_id(), e);
        }
        debug!("session {}: paid {} for a total of {}", self.session_id(), by, to);
        self.conn.send_to_client(TwoWayChannelMessage::payment_ack());
        self.conn.payment_increase(by, to);
        if exhausted {
            info!("session {}: channel {} exhausted", self.session_id(), id);
            self.settle(inner, CloseReason::ServerRequestedClose).await;
        }
        Ok(())
    }

    /// Verify a payment signature, returning the total paid
    fn check_payment(
        &self,
        id: ChannelId,
        script: &ScriptBuf,
        client_key: &PublicKey,
        client_script: &ScriptBuf,
        value: Amount,
        payment: &UpdatePayment,
    ) -> core::result::Result<(Amount, payment_channel::bitcoin::ecdsa::Signature), Fault> {
        let change = Amount::from_sat(payment.client_change_value);
        let paid = value
            .checked_sub(change)
            .ok_or_else(|| Fault::invalid(format!("change {} exceeds the escrow {}", change, value)))?;
        let signature =
            tx::parse_signature(&payment.signature).map_err(|e| Fault::bad_transaction(e.to_string()))?;
        let spend = tx::build_payment(id, client_script.clone(), change);
        tx::verify_escrow_input(
            &self.secp_ctx,
            &spend,
            script,
            client_key,
            &signature,
            tx::payment_sighash_type(change),
        )
        .map_err(|e| Fault::bad_transaction(e.to_string()))?;
        Ok((paid, signature))
    }

    async fn settle(&self, inner: &mut Inner, reason: CloseReason) {
        let Some(id) = inner.channel_id else {
            self.close_locally(inner, reason);
            return;
        };
        // this session reports the settlement itself
        self.registry.release(&id, self.session_id());
        match self.registry.close_channel(&id).await {
            Ok(settlement) => {
                info!("session {}: settled {} with {}", self.session_id(), id, settlement.compute_txid());
                self.conn.send_to_client(TwoWayChannelMessage::close(Some(serialize(&settlement))));
                self.close_locally(inner, reason);
            }
            Err(e) => {
                error!("session {}: could not settle {}: {}", self.session_id(), id, e);
                self.fail(inner, Fault::new(ErrorCode::Other, reason, format!("settlement failed: {}", e)));
            }
        }
    }

    fn fail(&self, inner: &mut Inner, fault: Fault) {
        error!("session {}: closing: {}", self.session_id(), fault.explanation);
        self.conn.send_to_client(TwoWayChannelMessage::error(fault.code, fault.explanation));
        self.close_locally(inner, fault.reason);
    }

    fn close_locally(&self, inner: &mut Inner, reason: CloseReason) {
        if matches!(inner.step, ServerStep::Closed | ServerStep::Error) {
            return;
        }
        info!("session {}: closed: {}", self.session_id(), reason);
        self.release(inner);
        inner.step = if reason.is_error() { ServerStep::Error } else { ServerStep::Closed };
        self.conn.destroy_connection(reason);
    }

    fn release(&self, inner: &mut Inner) {
        inner.pending = None;
        if let Some(id) = &inner.channel_id {
            self.registry.release(id, self.session_id());
        }
    }
}
