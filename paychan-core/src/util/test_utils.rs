use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256, sha256d, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tokio::sync::mpsc;

use crate::channel::{ClientChannel, ServerChannel, ServerId};
use crate::prelude::*;
use crate::tx;
use crate::wallet::{Broadcaster, Wallet};
use crate::{Error, Result};

static NONCE: AtomicU64 = AtomicU64::new(1);

fn next_outpoint() -> OutPoint {
    let n = NONCE.fetch_add(1, Ordering::SeqCst);
    OutPoint::new(Txid::from_raw_hash(sha256d::Hash::hash(&n.to_be_bytes())), 0)
}

/// A transaction with a unique fake input paying `value` to `script_pubkey`
pub fn make_funding_tx(script_pubkey: ScriptBuf, value: Amount) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: next_outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value, script_pubkey }],
    }
}

pub fn make_server_id(seed: &[u8]) -> ServerId {
    sha256::Hash::hash(seed)
}

/// A wallet holding a single spendable balance
pub struct MockWallet {
    balance: Mutex<Amount>,
    script: ScriptBuf,
    pub committed: Mutex<Vec<Txid>>,
}

impl SendSync for MockWallet {}

impl MockWallet {
    pub fn new(balance: Amount) -> Self {
        let n = NONCE.fetch_add(1, Ordering::SeqCst);
        let script = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::hash(&n.to_be_bytes()));
        MockWallet { balance: Mutex::new(balance), script, committed: Mutex::new(Vec::new()) }
    }

    pub fn set_balance(&self, balance: Amount) {
        *self.balance.lock().unwrap() = balance;
    }
}

impl Wallet for MockWallet {
    fn spendable_balance(&self) -> Amount {
        *self.balance.lock().unwrap()
    }

    fn create_escrow(&self, script_pubkey: ScriptBuf, value: Amount) -> Result<Transaction> {
        let available = self.spendable_balance();
        if value > available {
            return Err(Error::InsufficientFunds { needed: value, available });
        }
        Ok(make_funding_tx(script_pubkey, value))
    }

    fn receive_script(&self) -> ScriptBuf {
        self.script.clone()
    }

    fn commit(&self, tx: &Transaction) -> Result<()> {
        let spent: Amount = tx.output.iter().map(|o| o.value).sum();
        let mut balance = self.balance.lock().unwrap();
        *balance = balance.checked_sub(spent).unwrap_or(Amount::ZERO);
        self.committed.lock().unwrap().push(tx.compute_txid());
        Ok(())
    }
}

/// A broadcaster that records transactions and can be told to fail or to
/// hold broadcasts in flight
pub struct MockBroadcaster {
    pub broadcasts: Mutex<Vec<Transaction>>,
    sender: mpsc::UnboundedSender<Transaction>,
    fail: AtomicBool,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl SendSync for MockBroadcaster {}

impl MockBroadcaster {
    /// Create a broadcaster and a receiver of everything it broadcasts
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Transaction>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let broadcaster = MockBroadcaster {
            broadcasts: Mutex::new(Vec::new()),
            sender,
            fail: AtomicBool::new(false),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        };
        (Arc::new(broadcaster), receiver)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Broadcasts block until the returned guard is dropped
    pub async fn hold(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }

    pub fn count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn broadcast(&self, tx: Transaction) -> Result<Transaction> {
        let _gate = self.gate.lock().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Broadcast("mock broadcaster is failing".to_string()));
        }
        self.broadcasts.lock().unwrap().push(tx.clone());
        let _ = self.sender.send(tx.clone());
        Ok(tx)
    }
}

/// A client channel with an unsigned refund, for registry tests
pub fn make_client_channel(expiry: u64, value_sat: u64, remaining_sat: u64) -> ClientChannel {
    make_client_channel_for(make_server_id(b"server"), expiry, value_sat, remaining_sat)
}

pub fn make_client_channel_for(
    server_id: ServerId,
    expiry: u64,
    value_sat: u64,
    remaining_sat: u64,
) -> ClientChannel {
    let secp_ctx = Secp256k1::new();
    let my_key = tx::generate_key();
    let server_key = PublicKey::from_secret_key(&secp_ctx, &tx::generate_key());
    let script = tx::multisig_script(&PublicKey::from_secret_key(&secp_ctx, &my_key), &server_key);
    let escrow = make_funding_tx(script, Amount::from_sat(value_sat));
    let id = escrow.compute_txid();
    let refund = tx::build_refund(id, expiry, ScriptBuf::new(), Amount::from_sat(value_sat))
        .expect("refund");
    ClientChannel {
        server_id,
        id,
        escrow,
        refund,
        my_key,
        server_key,
        value_remaining: Amount::from_sat(remaining_sat),
        refund_fee: Amount::ZERO,
        settlement: None,
        active: false,
    }
}

/// A server channel holding a valid client signature over `paid_sat`
pub fn make_server_channel(expiry: u64, value_sat: u64, paid_sat: u64) -> ServerChannel {
    let secp_ctx = Secp256k1::new();
    let client_secret = tx::generate_key();
    let client_key = PublicKey::from_secret_key(&secp_ctx, &client_secret);
    let my_key = tx::generate_key();
    let script = tx::multisig_script(&client_key, &PublicKey::from_secret_key(&secp_ctx, &my_key));
    let value = Amount::from_sat(value_sat);
    let escrow = make_funding_tx(script.clone(), value);
    let id = escrow.compute_txid();
    let client_script = ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::hash(b"client"));
    let paid = Amount::from_sat(paid_sat);
    let change = value - paid;
    let payment = tx::build_payment(id, client_script.clone(), change);
    let best_signature = tx::sign_escrow_input(
        &secp_ctx,
        &payment,
        &script,
        &client_secret,
        tx::payment_sighash_type(change),
    )
    .expect("sign");
    ServerChannel {
        id,
        escrow,
        my_key,
        client_key,
        client_script,
        refund_expiry: expiry,
        best_value: paid,
        best_signature,
        settlement: None,
        active: None,
    }
}

/// A session that records how the registry closed it
pub struct MockSession {
    pub id: u64,
    pub superseded: AtomicBool,
    pub settlements: Mutex<Vec<Transaction>>,
}

impl SendSync for MockSession {}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(MockSession {
            id: NONCE.fetch_add(1, Ordering::SeqCst),
            superseded: AtomicBool::new(false),
            settlements: Mutex::new(Vec::new()),
        })
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    pub fn settlements(&self) -> Vec<Transaction> {
        self.settlements.lock().unwrap().clone()
    }
}

impl crate::channel::ActiveSession for MockSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
    }

    fn settled(&self, settlement: &Transaction) {
        self.settlements.lock().unwrap().push(settlement.clone());
    }
}
