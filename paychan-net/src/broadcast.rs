//! The daemon's chain collaborators: an outbox file standing in for a
//! network broadcaster, and a receive-only wallet paying out to a fixed
//! script.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::info;
use payment_channel::bitcoin::consensus::encode::serialize_hex;
use payment_channel::bitcoin::{Amount, ScriptBuf, Transaction};
use payment_channel::error::illegal_state;
use payment_channel::prelude::*;
use payment_channel::wallet::{Broadcaster, Wallet};
use payment_channel::{Error, Result};

/// Appends each transaction as a hex line to an outbox file, for an
/// external relay to pick up
pub struct FileBroadcaster {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SendSync for FileBroadcaster {}

impl FileBroadcaster {
    /// Broadcast into `path`, creating its directory if needed
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        if let Some(dir) = path.as_ref().parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(FileBroadcaster { path: path.as_ref().to_path_buf(), lock: Mutex::new(()) })
    }

    fn append(&self, tx: &Transaction) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serialize_hex(tx))?;
        file.sync_data()
    }
}

#[async_trait]
impl Broadcaster for FileBroadcaster {
    async fn broadcast(&self, tx: Transaction) -> Result<Transaction> {
        self.append(&tx).map_err(|e| Error::Broadcast(format!("outbox: {}", e)))?;
        info!("queued {} for broadcast", tx.compute_txid());
        Ok(tx)
    }
}

/// A wallet that only receives, paying settlements to one script
pub struct PayoutWallet {
    script: ScriptBuf,
}

impl SendSync for PayoutWallet {}

impl PayoutWallet {
    /// Pay out to `script`
    pub fn new(script: ScriptBuf) -> Self {
        PayoutWallet { script }
    }
}

impl Wallet for PayoutWallet {
    fn spendable_balance(&self) -> Amount {
        Amount::ZERO
    }

    fn create_escrow(&self, _script_pubkey: ScriptBuf, _value: Amount) -> Result<Transaction> {
        Err(illegal_state("the payout wallet cannot fund channels"))
    }

    fn receive_script(&self) -> ScriptBuf {
        self.script.clone()
    }

    fn commit(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }
}
