use core::time::Duration;

use bitcoin::Amount;

/// Delay before a failed expiry broadcast or settlement is retried
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Policy of the paying side
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The longest refund lock the client accepts from a server
    pub max_time_window: Duration,
    /// Fee deducted from the refund output
    pub refund_fee: Amount,
    /// How long after the refund unlocks the client broadcasts it
    pub expiry_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_time_window: Duration::from_secs(24 * 60 * 60),
            refund_fee: Amount::from_sat(10_000),
            expiry_grace: Duration::from_secs(5 * 60),
        }
    }
}

/// Policy of the receiving side
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The smallest escrow the server accepts
    pub min_accepted_channel_size: Amount,
    /// The smallest payment, also charged when the channel opens
    pub min_payment: Amount,
    /// How far in the future the proposed refund unlocks
    pub time_window: Duration,
    /// Fee deducted from the server's settlement output
    pub settlement_fee: Amount,
    /// How long before the refund unlocks the server settles on its own
    pub expire_offset: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            min_accepted_channel_size: Amount::from_sat(100_000),
            min_payment: Amount::ZERO,
            time_window: Duration::from_secs(24 * 60 * 60),
            settlement_fee: Amount::ZERO,
            expire_offset: Duration::from_secs(2 * 60 * 60),
        }
    }
}
