use bitcoin::absolute::LockTime;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2};
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::error::{bad_transaction, invalid_argument};
use crate::Result;

/// The escrow output is always the first output of the escrow transaction
pub const ESCROW_VOUT: u32 = 0;

/// Generate a fresh key for the escrow multisig
pub fn generate_key() -> SecretKey {
    SecretKey::new(&mut OsRng)
}

/// The bare 2-of-2 multisig locking the escrowed value.
///
/// The client key is always first, so signatures are pushed in the same order.
pub fn multisig_script(client_key: &PublicKey, server_key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_PUSHNUM_2)
        .push_key(&bitcoin::PublicKey::new(*client_key))
        .push_key(&bitcoin::PublicKey::new(*server_key))
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

fn escrow_input(escrow_txid: Txid, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output: OutPoint::new(escrow_txid, ESCROW_VOUT),
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    }
}

/// Check that output 0 of the escrow pays at least `min_value` to `script`,
/// returning the escrowed value
pub fn check_escrow(escrow: &Transaction, script: &Script, min_value: Amount) -> Result<Amount> {
    if escrow.input.is_empty() {
        return Err(bad_transaction("escrow has no inputs"));
    }
    let out = escrow
        .output
        .get(ESCROW_VOUT as usize)
        .ok_or_else(|| bad_transaction("escrow has no outputs"))?;
    if out.script_pubkey.as_script() != script {
        return Err(bad_transaction("escrow output 0 is not the expected multisig"));
    }
    if out.value < min_value {
        return Err(bad_transaction(format!(
            "escrow value {} is below the minimum {}",
            out.value, min_value
        )));
    }
    if out.value > Amount::MAX_MONEY {
        return Err(bad_transaction("escrow value exceeds the supply"));
    }
    Ok(out.value)
}

/// Build the unsigned refund of an escrow.
///
/// The refund is non-final until `expiry` (a UNIX time), so it cannot be
/// mined before the channel expires.
pub fn build_refund(
    escrow_txid: Txid,
    expiry: u64,
    script_pubkey: ScriptBuf,
    value: Amount,
) -> Result<Transaction> {
    let expiry = u32::try_from(expiry).map_err(|_| invalid_argument("expiry out of range"))?;
    let lock_time = LockTime::from_time(expiry)
        .map_err(|e| invalid_argument(format!("expiry is not a time lock: {}", e)))?;
    if value == Amount::ZERO {
        return Err(invalid_argument("refund would be empty"));
    }
    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![escrow_input(escrow_txid, Sequence::ZERO)],
        output: vec![TxOut { value, script_pubkey }],
    })
}

/// The UNIX time a refund unlocks at, if it is time-locked
pub fn refund_expiry(refund: &Transaction) -> Option<u64> {
    match refund.lock_time {
        LockTime::Seconds(t) => Some(t.to_consensus_u32() as u64),
        LockTime::Blocks(_) => None,
    }
}

/// Check a refund the client asked the server to sign.
///
/// It must spend only the escrow, be non-final and unlock no earlier than
/// `min_expiry`. Returns the refund's single output.
pub fn check_refund(refund: &Transaction, min_expiry: u64) -> Result<TxOut> {
    if refund.input.len() != 1 {
        return Err(bad_transaction("refund must have exactly one input"));
    }
    if refund.output.len() != 1 {
        return Err(bad_transaction("refund must have exactly one output"));
    }
    let input = &refund.input[0];
    if input.previous_output.vout != ESCROW_VOUT {
        return Err(bad_transaction("refund does not spend the escrow output"));
    }
    if input.sequence == Sequence::MAX {
        return Err(bad_transaction("refund input is final"));
    }
    if !input.script_sig.is_empty() || !input.witness.is_empty() {
        return Err(bad_transaction("refund is already signed"));
    }
    let expiry = refund_expiry(refund).ok_or_else(|| bad_transaction("refund is not time-locked"))?;
    if expiry < min_expiry {
        return Err(bad_transaction(format!(
            "refund unlocks at {} which is before {}",
            expiry, min_expiry
        )));
    }
    let out = refund.output[0].clone();
    if out.value == Amount::ZERO || out.value > Amount::MAX_MONEY {
        return Err(bad_transaction("refund output value out of range"));
    }
    Ok(out)
}

/// The sighash type of the client's payment signature.
///
/// The client commits only to its own change output, or to no output once it
/// has no change left, so the server can add its own output freely.
pub fn payment_sighash_type(change: Amount) -> EcdsaSighashType {
    if change == Amount::ZERO {
        EcdsaSighashType::NonePlusAnyoneCanPay
    } else {
        EcdsaSighashType::SinglePlusAnyoneCanPay
    }
}

/// Build the transaction a payment signature commits to: the escrow input and
/// the client's change output, if any.
pub fn build_payment(escrow_txid: Txid, client_script: ScriptBuf, change: Amount) -> Transaction {
    let output = if change == Amount::ZERO {
        vec![]
    } else {
        vec![TxOut { value: change, script_pubkey: client_script }]
    };
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![escrow_input(escrow_txid, Sequence::MAX)],
        output,
    }
}

fn sighash_message(
    tx: &Transaction,
    script: &Script,
    sighash_type: EcdsaSighashType,
) -> Result<Message> {
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(0, script, sighash_type.to_u32())
        .map_err(|e| bad_transaction(format!("sighash: {}", e)))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Sign the escrow input of `tx`
pub fn sign_escrow_input<C: Signing>(
    secp_ctx: &Secp256k1<C>,
    tx: &Transaction,
    script: &Script,
    key: &SecretKey,
    sighash_type: EcdsaSighashType,
) -> Result<ecdsa::Signature> {
    let message = sighash_message(tx, script, sighash_type)?;
    Ok(ecdsa::Signature { signature: secp_ctx.sign_ecdsa(&message, key), sighash_type })
}

/// Verify a signature over the escrow input of `tx`, which must carry the
/// expected sighash type
pub fn verify_escrow_input<C: Verification>(
    secp_ctx: &Secp256k1<C>,
    tx: &Transaction,
    script: &Script,
    key: &PublicKey,
    sig: &ecdsa::Signature,
    sighash_type: EcdsaSighashType,
) -> Result<()> {
    if sig.sighash_type != sighash_type {
        return Err(bad_transaction(format!(
            "signature has sighash type {} instead of {}",
            sig.sighash_type, sighash_type
        )));
    }
    let message = sighash_message(tx, script, sighash_type)?;
    secp_ctx
        .verify_ecdsa(&message, &sig.signature, key)
        .map_err(|_| bad_transaction("signature does not verify"))
}

/// Decode a signature with a trailing sighash byte
pub fn parse_signature(bytes: &[u8]) -> Result<ecdsa::Signature> {
    ecdsa::Signature::from_slice(bytes)
        .map_err(|e| bad_transaction(format!("malformed signature: {}", e)))
}

/// Fill in the multisig spend of the escrow input
pub fn complete_escrow_spend(
    tx: &mut Transaction,
    client_sig: &ecdsa::Signature,
    server_sig: &ecdsa::Signature,
) -> Result<()> {
    let client_sig = PushBytesBuf::try_from(client_sig.to_vec())
        .map_err(|_| bad_transaction("client signature too long"))?;
    let server_sig = PushBytesBuf::try_from(server_sig.to_vec())
        .map_err(|_| bad_transaction("server signature too long"))?;
    let input = tx.input.get_mut(0).ok_or_else(|| bad_transaction("no escrow input"))?;
    input.script_sig = Builder::new()
        .push_opcode(OP_0)
        .push_slice(client_sig)
        .push_slice(server_sig)
        .into_script();
    Ok(())
}

/// Everything needed to turn the best payment into a settlement
pub struct SettlementParams<'a> {
    /// The escrow being spent
    pub escrow_txid: Txid,
    /// The escrow multisig
    pub script: &'a Script,
    /// The escrowed value
    pub value: Amount,
    /// Where the client's change goes
    pub client_script: ScriptBuf,
    /// The total the client has paid
    pub paid: Amount,
    /// The client's signature over the payment
    pub client_sig: &'a ecdsa::Signature,
    /// Where the server's share goes
    pub server_script: ScriptBuf,
    /// Deducted from the server's share
    pub fee: Amount,
}

/// Build and sign the settlement of the best payment.
///
/// The client's change output comes first, as its signature requires; the
/// server's share minus the fee follows.
pub fn build_settlement<C: Signing>(
    secp_ctx: &Secp256k1<C>,
    params: SettlementParams,
    server_key: &SecretKey,
) -> Result<Transaction> {
    let change = params
        .value
        .checked_sub(params.paid)
        .ok_or_else(|| bad_transaction("payment exceeds the escrow"))?;
    let mut tx = build_payment(params.escrow_txid, params.client_script, change);
    let server_value = params.paid.checked_sub(params.fee).unwrap_or(Amount::ZERO);
    if server_value > Amount::ZERO {
        tx.output.push(TxOut { value: server_value, script_pubkey: params.server_script });
    }
    if tx.output.is_empty() {
        return Err(bad_transaction("settlement would have no outputs"));
    }
    let server_sig =
        sign_escrow_input(secp_ctx, &tx, params.script, server_key, EcdsaSighashType::All)?;
    complete_escrow_spend(&mut tx, params.client_sig, &server_sig)?;
    Ok(tx)
}
