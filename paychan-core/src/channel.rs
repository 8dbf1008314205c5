use core::fmt;

use bitcoin::ecdsa;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use bitcoin::{Amount, ScriptBuf, Transaction, Txid};

use crate::prelude::*;
use crate::tx;

/// A channel is identified by the hash of its escrow transaction
pub type ChannelId = Txid;

/// An opaque identifier of a server, stable across reconnects
pub type ServerId = sha256::Hash;

/// The client's record of a channel it funded
#[derive(Clone, Debug, PartialEq)]
pub struct ClientChannel {
    /// The server this channel pays
    pub server_id: ServerId,
    /// The escrow txid
    pub id: ChannelId,
    /// The signed escrow transaction
    pub escrow: Transaction,
    /// The fully signed, time-locked refund
    pub refund: Transaction,
    /// Our half of the escrow multisig
    pub my_key: SecretKey,
    /// The server's half of the escrow multisig
    pub server_key: PublicKey,
    /// Escrowed value not yet paid to the server
    pub value_remaining: Amount,
    /// The fee deducted from the refund
    pub refund_fee: Amount,
    /// Set once the server has settled the channel
    pub settlement: Option<Transaction>,
    /// A live session is using this record.  Not persisted.
    pub active: bool,
}

impl ClientChannel {
    /// The escrowed value
    pub fn value(&self) -> Amount {
        escrow_value(&self.escrow)
    }

    /// The total paid so far
    pub fn value_spent(&self) -> Amount {
        self.value().checked_sub(self.value_remaining).unwrap_or(Amount::ZERO)
    }

    /// The UNIX time the refund unlocks
    pub fn expiry(&self) -> u64 {
        tx::refund_expiry(&self.refund).unwrap_or(0)
    }

    /// Whether the channel has been settled
    pub fn is_settled(&self) -> bool {
        self.settlement.is_some()
    }

    /// Whether a new session may resume this channel
    pub fn is_resumable(&self) -> bool {
        !self.active && !self.is_settled() && self.value_remaining > Amount::ZERO
    }

    /// The escrow multisig
    pub fn multisig_script<C: Signing>(&self, secp_ctx: &Secp256k1<C>) -> ScriptBuf {
        tx::multisig_script(&PublicKey::from_secret_key(secp_ctx, &self.my_key), &self.server_key)
    }

    /// Where refunds and change are paid
    pub fn client_script(&self) -> ScriptBuf {
        self.refund.output.first().map(|o| o.script_pubkey.clone()).unwrap_or_default()
    }
}

/// A live session holding a server-side record.
///
/// When another session resumes the same channel the registry supersedes
/// the holder.  When the registry settles the channel on its own, the
/// holder is handed the settlement.
pub trait ActiveSession: SendSync {
    /// A process-unique session number
    fn session_id(&self) -> u64;

    /// Close the session because another one took over the channel.
    ///
    /// Must not block.
    fn supersede(&self);

    /// Close the session because the channel was settled by `settlement`,
    /// which has been broadcast.
    ///
    /// Must not block.
    fn settled(&self, settlement: &Transaction);
}

/// The server's record of an open channel
pub struct ServerChannel {
    /// The escrow txid
    pub id: ChannelId,
    /// The escrow transaction, as broadcast
    pub escrow: Transaction,
    /// Our half of the escrow multisig
    pub my_key: SecretKey,
    /// The client's half of the escrow multisig, also identifying the client
    pub client_key: PublicKey,
    /// Where the client's change is paid
    pub client_script: ScriptBuf,
    /// The UNIX time the client's refund unlocks
    pub refund_expiry: u64,
    /// The largest total the client has signed over to us
    pub best_value: Amount,
    /// The client's signature over the payment of `best_value`
    pub best_signature: ecdsa::Signature,
    /// Set once we have settled
    pub settlement: Option<Transaction>,
    /// The session using this record.  Not persisted.
    pub active: Option<Arc<dyn ActiveSession>>,
}

impl ServerChannel {
    /// The escrowed value
    pub fn value(&self) -> Amount {
        escrow_value(&self.escrow)
    }

    /// The escrowed value the client still holds
    pub fn client_change(&self) -> Amount {
        self.value().checked_sub(self.best_value).unwrap_or(Amount::ZERO)
    }

    /// Whether the channel has been settled
    pub fn is_settled(&self) -> bool {
        self.settlement.is_some()
    }

    /// Whether a live session holds this record
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// The escrow multisig
    pub fn multisig_script<C: Signing>(&self, secp_ctx: &Secp256k1<C>) -> ScriptBuf {
        tx::multisig_script(&self.client_key, &PublicKey::from_secret_key(secp_ctx, &self.my_key))
    }
}

impl fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerChannel")
            .field("id", &self.id)
            .field("client_key", &self.client_key)
            .field("refund_expiry", &self.refund_expiry)
            .field("best_value", &self.best_value)
            .field("settled", &self.is_settled())
            .field("active", &self.active.as_ref().map(|s| s.session_id()))
            .finish()
    }
}

fn escrow_value(escrow: &Transaction) -> Amount {
    escrow.output.get(tx::ESCROW_VOUT as usize).map(|o| o.value).unwrap_or(Amount::ZERO)
}
