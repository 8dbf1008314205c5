use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::ecdsa;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Amount, ScriptBuf, Transaction, Txid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;

use super::Error;
use crate::channel::{ClientChannel, ServerChannel, ServerId};

/// A persisted client channel.
///
/// Monetary fields are signed so that out-of-range values in a damaged blob
/// are detected rather than wrapped.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientChannelEntry {
    pub server_id: ServerId,
    pub id: Txid,
    #[serde_as(as = "Hex")]
    pub escrow: Vec<u8>,
    #[serde_as(as = "Hex")]
    pub refund: Vec<u8>,
    #[serde_as(as = "Hex")]
    pub my_key: Vec<u8>,
    pub server_key: PublicKey,
    pub value_remaining: i64,
    pub refund_fee: i64,
    #[serde(default)]
    #[serde_as(as = "Option<Hex>")]
    pub settlement: Option<Vec<u8>>,
}

/// All persisted client channels, ordered by channel id
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ClientStatesEntry {
    pub channels: Vec<ClientChannelEntry>,
}

/// A persisted server channel
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerChannelEntry {
    pub id: Txid,
    #[serde_as(as = "Hex")]
    pub escrow: Vec<u8>,
    #[serde_as(as = "Hex")]
    pub my_key: Vec<u8>,
    pub client_key: PublicKey,
    #[serde_as(as = "Hex")]
    pub client_script: Vec<u8>,
    pub refund_expiry: u64,
    pub best_value: i64,
    #[serde_as(as = "Hex")]
    pub best_signature: Vec<u8>,
    #[serde(default)]
    #[serde_as(as = "Option<Hex>")]
    pub settlement: Option<Vec<u8>>,
}

/// All persisted server channels, ordered by channel id
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ServerStatesEntry {
    pub channels: Vec<ServerChannelEntry>,
}

impl From<&ClientChannel> for ClientChannelEntry {
    fn from(c: &ClientChannel) -> Self {
        ClientChannelEntry {
            server_id: c.server_id,
            id: c.id,
            escrow: serialize(&c.escrow),
            refund: serialize(&c.refund),
            my_key: c.my_key.secret_bytes().to_vec(),
            server_key: c.server_key,
            value_remaining: c.value_remaining.to_sat() as i64,
            refund_fee: c.refund_fee.to_sat() as i64,
            settlement: c.settlement.as_ref().map(serialize),
        }
    }
}

impl TryFrom<ClientChannelEntry> for ClientChannel {
    type Error = Error;

    fn try_from(e: ClientChannelEntry) -> Result<Self, Error> {
        let escrow = decode_tx(&e.escrow, "escrow")?;
        if escrow.compute_txid() != e.id {
            return Err(Error::Corrupt(format!("escrow does not hash to {}", e.id)));
        }
        let channel = ClientChannel {
            server_id: e.server_id,
            id: e.id,
            escrow,
            refund: decode_tx(&e.refund, "refund")?,
            my_key: decode_key(&e.my_key)?,
            server_key: e.server_key,
            value_remaining: money(e.value_remaining, "value_remaining")?,
            refund_fee: money(e.refund_fee, "refund_fee")?,
            settlement: e.settlement.as_deref().map(|s| decode_tx(s, "settlement")).transpose()?,
            active: false,
        };
        if channel.value_remaining > channel.value() {
            return Err(Error::Corrupt(format!(
                "{}: remaining value {} exceeds escrow {}",
                e.id,
                channel.value_remaining,
                channel.value()
            )));
        }
        Ok(channel)
    }
}

impl From<&ServerChannel> for ServerChannelEntry {
    fn from(c: &ServerChannel) -> Self {
        ServerChannelEntry {
            id: c.id,
            escrow: serialize(&c.escrow),
            my_key: c.my_key.secret_bytes().to_vec(),
            client_key: c.client_key,
            client_script: c.client_script.to_bytes(),
            refund_expiry: c.refund_expiry,
            best_value: c.best_value.to_sat() as i64,
            best_signature: c.best_signature.to_vec(),
            settlement: c.settlement.as_ref().map(serialize),
        }
    }
}

impl TryFrom<ServerChannelEntry> for ServerChannel {
    type Error = Error;

    fn try_from(e: ServerChannelEntry) -> Result<Self, Error> {
        let escrow = decode_tx(&e.escrow, "escrow")?;
        if escrow.compute_txid() != e.id {
            return Err(Error::Corrupt(format!("escrow does not hash to {}", e.id)));
        }
        let channel = ServerChannel {
            id: e.id,
            escrow,
            my_key: decode_key(&e.my_key)?,
            client_key: e.client_key,
            client_script: ScriptBuf::from_bytes(e.client_script),
            refund_expiry: e.refund_expiry,
            best_value: money(e.best_value, "best_value")?,
            best_signature: ecdsa::Signature::from_slice(&e.best_signature)
                .map_err(|err| Error::Corrupt(format!("best_signature: {}", err)))?,
            settlement: e.settlement.as_deref().map(|s| decode_tx(s, "settlement")).transpose()?,
            active: None,
        };
        if channel.best_value > channel.value() {
            return Err(Error::Corrupt(format!(
                "{}: paid value {} exceeds escrow {}",
                e.id,
                channel.best_value,
                channel.value()
            )));
        }
        Ok(channel)
    }
}

fn money(value: i64, name: &str) -> Result<Amount, Error> {
    let value = u64::try_from(value)
        .map_err(|_| Error::Corrupt(format!("{} is negative: {}", name, value)))?;
    let amount = Amount::from_sat(value);
    if amount > Amount::MAX_MONEY {
        return Err(Error::Corrupt(format!("{} exceeds the supply: {}", name, amount)));
    }
    Ok(amount)
}

fn decode_tx(bytes: &[u8], name: &str) -> Result<Transaction, Error> {
    deserialize(bytes).map_err(|e| Error::Corrupt(format!("{}: {}", name, e)))
}

fn decode_key(bytes: &[u8]) -> Result<SecretKey, Error> {
    SecretKey::from_slice(bytes).map_err(|e| Error::Corrupt(format!("key: {}", e)))
}

/// Encode a persistence model
pub fn to_bytes<T: Serialize>(entry: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(entry).map_err(|e| Error::Internal(format!("encode: {}", e)))
}

/// Decode a persistence model
pub fn from_bytes<T: DeserializeOwned>(data: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(data).map_err(|e| Error::Corrupt(format!("decode: {}", e)))
}
