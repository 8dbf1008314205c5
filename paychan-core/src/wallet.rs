use async_trait::async_trait;
use bitcoin::{Amount, ScriptBuf, Transaction};

use crate::prelude::*;
use crate::Result;

/// The on-chain wallet backing one side of the channel.
///
/// Escrow scripting, signing and verification are done by [`crate::tx`];
/// the wallet only funds outputs and receives value.
pub trait Wallet: SendSync {
    /// The value the wallet could spend right now
    fn spendable_balance(&self) -> Amount;

    /// Create a signed transaction paying `value` to `script_pubkey` at output 0.
    ///
    /// The transaction must not be broadcast and its inputs must stay
    /// available until [`Wallet::commit`] is called.
    fn create_escrow(&self, script_pubkey: ScriptBuf, value: Amount) -> Result<Transaction>;

    /// The script refunds, change and settlements are paid to
    fn receive_script(&self) -> ScriptBuf;

    /// Mark the inputs of a transaction created by this wallet as spent
    fn commit(&self, tx: &Transaction) -> Result<()>;
}

/// Propagates transactions to the network
#[async_trait]
pub trait Broadcaster: SendSync {
    /// Broadcast a transaction, resolving once it has been handed to peers
    async fn broadcast(&self, tx: Transaction) -> Result<Transaction>;
}
