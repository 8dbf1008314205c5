use std::collections::VecDeque;

use log::{debug, error, info, warn};
use payment_channel::bitcoin::consensus::encode::{deserialize, serialize};
use payment_channel::bitcoin::hashes::Hash;
use payment_channel::bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use payment_channel::bitcoin::sighash::EcdsaSighashType;
use payment_channel::bitcoin::{Amount, Transaction, Txid};
use payment_channel::channel::{ChannelId, ClientChannel, ServerId};
use payment_channel::config::ClientConfig;
use payment_channel::error::{illegal_state, invalid_argument};
use payment_channel::prelude::*;
use payment_channel::registry::client::ClientChannelRef;
use payment_channel::registry::ClientChannelRegistry;
use payment_channel::tx;
use payment_channel::wallet::Wallet;
use payment_channel::{Error, Result};
use paychan_protocol::msgs::{Initiate, UpdatePayment, PROTOCOL_MAJOR_VERSION};
use paychan_protocol::{ErrorCode, MessageType, TwoWayChannelMessage};
use tokio::sync::oneshot;

use crate::{CloseReason, Fault};

/// How the client machine reaches the server and the application
pub trait ClientConnection: SendSync {
    /// Queue a message for the server.  Must not block.
    fn send_to_server(&self, msg: TwoWayChannelMessage);

    /// Close the transport.  The machine has already cleaned up.
    fn destroy_connection(&self, reason: CloseReason);

    /// The channel is ready for payments
    fn channel_open(&self, was_initiated: bool);
}

/// The resolution of [`PaymentChannelClient::open`]
pub type OpenResult = core::result::Result<ChannelId, CloseReason>;

/// The resolution of [`PaymentChannelClient::increment_payment`]: the total
/// paid once the server acknowledged
pub type PaymentResult = core::result::Result<Amount, CloseReason>;

/// Client protocol states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStep {
    /// Not opened yet
    New,
    /// CLIENT_VERSION sent
    WaitingForVersion,
    /// Waiting for the terms of a new channel, or for a resume to be confirmed
    WaitingForInitiate,
    /// PROVIDE_REFUND sent
    WaitingForRefundReturn,
    /// PROVIDE_CONTRACT sent
    WaitingForChannelOpen,
    /// Payments may be made
    Ready,
    /// CLOSE sent, waiting for the settlement
    Closing,
    /// Ended normally
    Closed,
    /// Ended by a failure
    Error,
}

struct Pending {
    escrow: Transaction,
    refund: Transaction,
    my_key: SecretKey,
    server_key: PublicKey,
    min_payment: Amount,
}

struct Inner {
    step: ClientStep,
    server_id: Option<ServerId>,
    value: Amount,
    channel: Option<ClientChannelRef>,
    resuming: bool,
    pending: Option<Pending>,
    open_sender: Option<oneshot::Sender<OpenResult>>,
    payments: VecDeque<(Amount, oneshot::Sender<PaymentResult>)>,
}

/// The paying side of one session.
///
/// Operations invoked by the application and messages received from the
/// transport are serialized by an internal lock.
pub struct PaymentChannelClient {
    inner: Mutex<Inner>,
    wallet: Arc<dyn Wallet>,
    registry: Arc<ClientChannelRegistry>,
    config: ClientConfig,
    conn: Arc<dyn ClientConnection>,
    secp_ctx: Secp256k1<All>,
}

impl PaymentChannelClient {
    /// Create a client machine for one connection
    pub fn new(
        wallet: Arc<dyn Wallet>,
        registry: Arc<ClientChannelRegistry>,
        config: ClientConfig,
        conn: Arc<dyn ClientConnection>,
    ) -> Self {
        let inner = Inner {
            step: ClientStep::New,
            server_id: None,
            value: Amount::ZERO,
            channel: None,
            resuming: false,
            pending: None,
            open_sender: None,
            payments: VecDeque::new(),
        };
        PaymentChannelClient {
            inner: Mutex::new(inner),
            wallet,
            registry,
            config,
            conn,
            secp_ctx: Secp256k1::new(),
        }
    }

    /// The current protocol state
    pub fn step(&self) -> ClientStep {
        self.inner.lock().unwrap().step
    }

    /// The channel this session uses, once there is one
    pub fn channel(&self) -> Option<ClientChannelRef> {
        self.inner.lock().unwrap().channel.clone()
    }

    /// Start a session with `server_id`, escrowing `value` if a new channel
    /// is needed.
    ///
    /// A stored channel with the server is offered for resume.  Fails
    /// without sending anything if the wallet cannot fund a new channel.
    /// The returned receiver resolves when the channel opens or the session
    /// ends first.
    pub fn open(
        &self,
        server_id: ServerId,
        value: Amount,
    ) -> Result<oneshot::Receiver<OpenResult>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.step != ClientStep::New {
            return Err(illegal_state(format!("open in state {:?}", inner.step)));
        }
        if value <= self.config.refund_fee {
            return Err(invalid_argument(format!(
                "channel value {} does not cover the refund fee {}",
                value, self.config.refund_fee
            )));
        }
        let resume = self.registry.usable_channel(&server_id);
        if resume.is_none() {
            let available = self.wallet.spendable_balance();
            if available < value {
                return Err(Error::InsufficientFunds { needed: value, available });
            }
        }
        let resume_hash = resume.as_ref().map(|c| {
            let id = c.lock().unwrap().id;
            info!("offering channel {} for resume", id);
            id.to_byte_array().to_vec()
        });
        let (sender, receiver) = oneshot::channel();
        inner.server_id = Some(server_id);
        inner.value = value;
        inner.resuming = resume.is_some();
        inner.channel = resume;
        inner.open_sender = Some(sender);
        inner.step = ClientStep::WaitingForVersion;
        self.conn.send_to_server(TwoWayChannelMessage::client_version(resume_hash));
        Ok(receiver)
    }

    /// Pay `amount` more over the open channel.
    ///
    /// The returned receiver resolves with the new total once the server
    /// acknowledges.
    pub fn increment_payment(&self, amount: Amount) -> Result<oneshot::Receiver<PaymentResult>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.step != ClientStep::Ready {
            return Err(illegal_state(format!("payment in state {:?}", inner.step)));
        }
        if amount == Amount::ZERO {
            return Err(invalid_argument("payment must be positive"));
        }
        let channel = inner.channel.clone().ok_or_else(|| illegal_state("no channel"))?;
        let (payment, total) = {
            let mut c = channel.lock().unwrap();
            if amount > c.value_remaining {
                return Err(Error::InsufficientFunds { needed: amount, available: c.value_remaining });
            }
            let change = c.value_remaining - amount;
            let signature = self.sign_payment(&c, change)?;
            c.value_remaining = change;
            (UpdatePayment { client_change_value: change.to_sat(), signature }, c.value_spent())
        };
        if let Err(e) = self.registry.updated() {
            error!("could not persist payment: {}", e);
        }
        debug!("paying {} for a total of {}", amount, total);
        let (sender, receiver) = oneshot::channel();
        inner.payments.push_back((total, sender));
        self.conn.send_to_server(TwoWayChannelMessage::update_payment(payment));
        Ok(receiver)
    }

    /// Ask the server to settle.  Repeated calls while closing are no-ops.
    pub fn settle(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.step {
            ClientStep::Ready => {
                info!("requesting settlement");
                inner.step = ClientStep::Closing;
                self.conn.send_to_server(TwoWayChannelMessage::close(None));
                Ok(())
            }
            ClientStep::Closing => Ok(()),
            step => Err(illegal_state(format!("settle in state {:?}", step))),
        }
    }

    /// Drop the session without settling.  The channel stays stored and can
    /// be resumed later.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.close(&mut inner, CloseReason::ConnectionClosed, true);
    }

    /// The transport closed
    pub fn connection_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.close(&mut inner, CloseReason::ConnectionClosed, false);
    }

    /// Handle a message from the server
    pub fn receive_message(&self, msg: TwoWayChannelMessage) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.step, ClientStep::Closed | ClientStep::Error) {
            debug!("ignoring message type {} after close", msg.r#type);
            return;
        }
        let result = match (inner.step, msg.message_type()) {
            (_, Some(MessageType::Error)) => {
                let explanation = msg.error.as_ref().and_then(|e| e.explanation.clone());
                warn!(
                    "server sent error {:?}: {}",
                    msg.error_code(),
                    explanation.as_deref().unwrap_or("")
                );
                self.close(&mut inner, CloseReason::RemoteSentError, true);
                Ok(())
            }
            (_, Some(MessageType::Close)) => self.receive_close(&mut inner, msg),
            (ClientStep::WaitingForVersion, Some(MessageType::ServerVersion)) => {
                self.receive_version(&mut inner, msg)
            }
            (ClientStep::WaitingForInitiate, Some(MessageType::Initiate)) => {
                self.receive_initiate(&mut inner, msg)
            }
            (ClientStep::WaitingForInitiate, Some(MessageType::ChannelOpen)) if inner.resuming => {
                self.receive_channel_open(&mut inner, msg)
            }
            (ClientStep::WaitingForRefundReturn, Some(MessageType::ReturnRefund)) => {
                self.receive_refund(&mut inner, msg)
            }
            (ClientStep::WaitingForChannelOpen, Some(MessageType::ChannelOpen)) => {
                self.receive_channel_open(&mut inner, msg)
            }
            (ClientStep::Ready | ClientStep::Closing, Some(MessageType::PaymentAck)) => {
                match inner.payments.pop_front() {
                    Some((total, sender)) => {
                        let _ = sender.send(Ok(total));
                        Ok(())
                    }
                    None => Err(Fault::invalid("acknowledgement without a payment")),
                }
            }
            (step, t) => Err(Fault::invalid(format!("unexpected message {:?} in state {:?}", t, step))),
        };
        if let Err(fault) = result {
            self.fail(&mut inner, fault);
        }
    }

    fn receive_version(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let version = msg.server_version.ok_or_else(|| Fault::invalid("missing server version"))?;
        if version.major != PROTOCOL_MAJOR_VERSION {
            return Err(Fault::new(
                ErrorCode::NoAcceptableVersion,
                CloseReason::NoAcceptableVersion,
                format!("server speaks major version {}", version.major),
            ));
        }
        inner.step = ClientStep::WaitingForInitiate;
        Ok(())
    }

    fn receive_initiate(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let initiate: Initiate = msg.initiate.ok_or_else(|| Fault::invalid("missing initiate"))?;
        if inner.resuming {
            info!("server did not resume, opening a new channel");
            release(inner);
            inner.resuming = false;
        }
        let now = self.registry.now();
        let max_expiry = now.saturating_add(self.config.max_time_window.as_secs());
        if initiate.expire_time_secs > max_expiry {
            return Err(Fault::new(
                ErrorCode::TimeWindowTooLarge,
                CloseReason::TimeWindowTooLarge,
                format!("expiry {} is beyond {}", initiate.expire_time_secs, max_expiry),
            ));
        }
        let min_size = Amount::from_sat(initiate.min_accepted_channel_size);
        if min_size > inner.value {
            return Err(Fault::new(
                ErrorCode::ChannelValueTooLarge,
                CloseReason::ServerRequestedTooMuchValue,
                format!("server requires {} but we offer {}", min_size, inner.value),
            ));
        }
        let min_payment = Amount::from_sat(initiate.min_payment);
        if min_payment > inner.value {
            return Err(Fault::new(
                ErrorCode::MinPaymentTooLarge,
                CloseReason::ServerRequestedTooMuchValue,
                format!("minimum payment {} exceeds {}", min_payment, inner.value),
            ));
        }
        let server_key = PublicKey::from_slice(&initiate.multisig_key)
            .map_err(|e| Fault::invalid(format!("server key: {}", e)))?;
        // checked again: a declined resume skipped the check in open
        let available = self.wallet.spendable_balance();
        if available < inner.value {
            return Err(Fault::new(
                ErrorCode::Other,
                CloseReason::InsufficientFunds,
                format!("cannot fund {}, {} available", inner.value, available),
            ));
        }

        let my_key = tx::generate_key();
        let my_pubkey = PublicKey::from_secret_key(&self.secp_ctx, &my_key);
        let script = tx::multisig_script(&my_pubkey, &server_key);
        let local = |e: Error| Fault::new(ErrorCode::Other, CloseReason::ClientRequestedClose, e.to_string());
        let escrow = self.wallet.create_escrow(script.clone(), inner.value).map_err(local)?;
        let refund_value = inner.value.checked_sub(self.config.refund_fee).unwrap_or(Amount::ZERO);
        let refund = tx::build_refund(
            escrow.compute_txid(),
            initiate.expire_time_secs,
            self.wallet.receive_script(),
            refund_value,
        )
        .map_err(local)?;
        debug!("proposing refund {} unlocking at {}", refund.compute_txid(), initiate.expire_time_secs);
        self.conn.send_to_server(TwoWayChannelMessage::provide_refund(
            my_pubkey.serialize().to_vec(),
            serialize(&refund),
        ));
        inner.pending = Some(Pending { escrow, refund, my_key, server_key, min_payment });
        inner.step = ClientStep::WaitingForRefundReturn;
        Ok(())
    }

    fn receive_refund(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let returned = msg.return_refund.ok_or_else(|| Fault::invalid("missing refund signature"))?;
        let Pending { escrow, mut refund, my_key, server_key, min_payment } =
            inner.pending.take().ok_or_else(|| Fault::invalid("no refund pending"))?;
        let my_pubkey = PublicKey::from_secret_key(&self.secp_ctx, &my_key);
        let script = tx::multisig_script(&my_pubkey, &server_key);
        let server_sig = tx::parse_signature(&returned.signature)
            .map_err(|e| Fault::bad_transaction(e.to_string()))?;
        tx::verify_escrow_input(
            &self.secp_ctx,
            &refund,
            &script,
            &server_key,
            &server_sig,
            EcdsaSighashType::NonePlusAnyoneCanPay,
        )
        .map_err(|e| Fault::bad_transaction(e.to_string()))?;

        let local = |e: Error| Fault::new(ErrorCode::Other, CloseReason::ClientRequestedClose, e.to_string());
        let my_sig = tx::sign_escrow_input(&self.secp_ctx, &refund, &script, &my_key, EcdsaSighashType::All)
            .map_err(local)?;
        tx::complete_escrow_spend(&mut refund, &my_sig, &server_sig).map_err(local)?;

        let server_id = inner.server_id.ok_or_else(|| Fault::invalid("no server"))?;
        let id = escrow.compute_txid();
        let change = inner.value - min_payment;
        let channel = ClientChannel {
            server_id,
            id,
            escrow: escrow.clone(),
            refund,
            my_key,
            server_key,
            value_remaining: change,
            refund_fee: self.config.refund_fee,
            settlement: None,
            active: true,
        };
        let signature = self.sign_payment(&channel, change).map_err(local)?;
        // the refund protects the escrow from here on
        let channel = self.registry.put(channel).map_err(local)?;
        inner.channel = Some(channel);
        self.wallet.commit(&escrow).map_err(local)?;
        info!("providing escrow {} of {}", id, inner.value);
        self.conn.send_to_server(TwoWayChannelMessage::provide_contract(
            serialize(&escrow),
            UpdatePayment { client_change_value: change.to_sat(), signature },
        ));
        inner.step = ClientStep::WaitingForChannelOpen;
        Ok(())
    }

    fn receive_channel_open(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let open = msg.channel_open.ok_or_else(|| Fault::invalid("missing contract hash"))?;
        let channel = inner.channel.clone().ok_or_else(|| Fault::invalid("no channel to open"))?;
        let id = channel.lock().unwrap().id;
        let confirmed = Txid::from_slice(&open.contract_hash)
            .map_err(|_| Fault::invalid("malformed contract hash"))?;
        if confirmed != id {
            return Err(Fault::invalid(format!("server opened {} instead of {}", confirmed, id)));
        }
        let was_initiated = !inner.resuming;
        inner.resuming = false;
        inner.step = ClientStep::Ready;
        info!("channel {} open ({})", id, if was_initiated { "new" } else { "resumed" });
        if let Some(sender) = inner.open_sender.take() {
            let _ = sender.send(Ok(id));
        }
        self.conn.channel_open(was_initiated);
        Ok(())
    }

    fn receive_close(&self, inner: &mut Inner, msg: TwoWayChannelMessage) -> core::result::Result<(), Fault> {
        let reason = if inner.step == ClientStep::Closing {
            CloseReason::ClientRequestedClose
        } else {
            CloseReason::ServerRequestedClose
        };
        if let Some(settlement) = msg.settlement {
            let settlement: Transaction = deserialize(&settlement.tx)
                .map_err(|e| Fault::bad_transaction(format!("settlement: {}", e)))?;
            match inner.channel.clone() {
                Some(channel) => {
                    {
                        let mut c = channel.lock().unwrap();
                        let change = check_settlement(&c, &settlement).map_err(Fault::bad_transaction)?;
                        if change > c.value_remaining {
                            // payments the server never acknowledged were not settled
                            warn!(
                                "channel {} settled with change {} instead of {}",
                                c.id, change, c.value_remaining
                            );
                            c.value_remaining = change;
                        }
                        info!("channel {} settled by {}", c.id, settlement.compute_txid());
                        c.settlement = Some(settlement);
                    }
                    if let Err(e) = self.registry.updated() {
                        error!("could not persist settlement: {}", e);
                    }
                }
                None => warn!("settlement without a channel"),
            }
        }
        self.close(inner, reason, true);
        Ok(())
    }

    fn sign_payment(&self, channel: &ClientChannel, change: Amount) -> Result<Vec<u8>> {
        let script = channel.multisig_script(&self.secp_ctx);
        let payment = tx::build_payment(channel.id, channel.client_script(), change);
        let sig = tx::sign_escrow_input(
            &self.secp_ctx,
            &payment,
            &script,
            &channel.my_key,
            tx::payment_sighash_type(change),
        )?;
        Ok(sig.to_vec())
    }

    fn fail(&self, inner: &mut Inner, fault: Fault) {
        error!("closing session: {}", fault.explanation);
        self.conn.send_to_server(TwoWayChannelMessage::error(fault.code, fault.explanation));
        self.close(inner, fault.reason, true);
    }

    fn close(&self, inner: &mut Inner, reason: CloseReason, destroy: bool) {
        if matches!(inner.step, ClientStep::Closed | ClientStep::Error) {
            return;
        }
        info!("session closed: {}", reason);
        inner.step = if reason.is_error() { ClientStep::Error } else { ClientStep::Closed };
        release(inner);
        inner.pending = None;
        if let Some(sender) = inner.open_sender.take() {
            let _ = sender.send(Err(reason));
        }
        for (_, sender) in inner.payments.drain(..) {
            let _ = sender.send(Err(reason));
        }
        if destroy {
            self.conn.destroy_connection(reason);
        }
    }
}

fn release(inner: &mut Inner) {
    if let Some(channel) = inner.channel.take() {
        channel.lock().unwrap().active = false;
    }
}

/// Check that `settlement` spends the escrow and pays us at least our
/// change, returning what it pays us
fn check_settlement(channel: &ClientChannel, settlement: &Transaction) -> core::result::Result<Amount, String> {
    let spends_escrow = settlement.input.len() == 1
        && settlement.input[0].previous_output.txid == channel.id
        && settlement.input[0].previous_output.vout == tx::ESCROW_VOUT;
    if !spends_escrow {
        return Err("settlement does not spend the escrow".to_string());
    }
    let client_script = channel.client_script();
    let change = settlement
        .output
        .first()
        .filter(|o| o.script_pubkey == client_script)
        .map(|o| o.value)
        .unwrap_or(Amount::ZERO);
    if change < channel.value_remaining {
        return Err(format!("settlement pays us {} instead of {}", change, channel.value_remaining));
    }
    if change > channel.value() {
        return Err(format!("settlement pays us {} out of {}", change, channel.value()));
    }
    Ok(change)
}
