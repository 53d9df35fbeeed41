//! The Chain B hash-time-locked contract: redeem script, P2SH address
//! and the two spending input scripts.

use crate::{
    secret::{Secret, SecretHash},
    timestamp::Timestamp,
};
use anyhow::{anyhow, Context, Result};
use bitcoin::{
    blockdata::{
        opcodes,
        script::{Builder, Script},
    },
    hashes::Hash,
    util::address::Payload,
    Address, Network, PrivateKey, PublicKey, Transaction,
};
use std::str::FromStr;

const SIGHASH_ALL: u32 = 0x01;

/// Byte length the redeeming party audits the preimage against. Guards
/// against fraud between chains with different maximum data sizes.
pub const SECRET_SIZE: usize = 32;

/// The atomic swap contract between two P2PKH identities.
///
/// The redeem branch pays whoever reveals the preimage to
/// `secret_hash` before anything else; the refund branch pays the funder
/// after `locktime`.
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcContract {
    pub refund_address: Address,
    pub redeem_address: Address,
    pub locktime: Timestamp,
    pub secret_hash: SecretHash,
}

impl HtlcContract {
    pub fn new(
        refund_address: &str,
        redeem_address: &str,
        locktime: Timestamp,
        secret_hash: SecretHash,
    ) -> Result<Self> {
        Ok(HtlcContract {
            refund_address: parse_address(refund_address)?,
            redeem_address: parse_address(redeem_address)?,
            locktime,
            secret_hash,
        })
    }

    pub fn script(&self) -> Result<Script> {
        let refund_pubkey_hash = pubkey_hash(&self.refund_address)?;
        let redeem_pubkey_hash = pubkey_hash(&self.redeem_address)?;

        Ok(Builder::new()
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(SECRET_SIZE as i64)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(self.secret_hash.as_raw())
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(&redeem_pubkey_hash)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(self.locktime.into_secs() as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(&refund_pubkey_hash)
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script())
    }

    pub fn address(&self, network: Network) -> Result<Address> {
        Ok(Address::p2sh(&self.script()?, network)?)
    }

    /// `<sigB> <pkB> <preimage> 1 <redeemScript>`
    pub fn redeem_input_script(
        &self,
        signature: &[u8],
        pubkey: &PublicKey,
        preimage: &Secret,
    ) -> Result<Script> {
        let script = self.script()?;

        Ok(Builder::new()
            .push_slice(signature)
            .push_slice(&pubkey.to_bytes())
            .push_slice(preimage.as_raw_secret())
            .push_int(1)
            .push_slice(script.as_bytes())
            .into_script())
    }

    /// `<sigA> <pkA> 0 <redeemScript>`
    pub fn refund_input_script(&self, signature: &[u8], pubkey: &PublicKey) -> Result<Script> {
        let script = self.script()?;

        Ok(Builder::new()
            .push_slice(signature)
            .push_slice(&pubkey.to_bytes())
            .push_int(0)
            .push_slice(script.as_bytes())
            .into_script())
    }
}

/// Legacy sighash endorsement of `input_index` against the redeem script.
pub fn sign_input(
    tx: &Transaction,
    input_index: usize,
    redeem_script: &Script,
    key: &PrivateKey,
) -> Result<Vec<u8>> {
    let secp = bitcoin::secp256k1::Secp256k1::new();
    let sighash = tx.signature_hash(input_index, redeem_script, SIGHASH_ALL);
    let message = bitcoin::secp256k1::Message::from_slice(&sighash[..])
        .context("sighash is not a valid signing message")?;

    let signature = secp.sign_ecdsa(&message, &key.inner);
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(SIGHASH_ALL as u8);

    Ok(bytes)
}

fn parse_address(address: &str) -> Result<Address> {
    Address::from_str(address).with_context(|| format!("failed to parse address {}", address))
}

fn pubkey_hash(address: &Address) -> Result<Vec<u8>> {
    match &address.payload {
        Payload::PubkeyHash(hash) => Ok(hash.as_hash().into_inner().to_vec()),
        _ => Err(anyhow!("address {} is not P2PKH", address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::script::Instruction;

    fn contract() -> HtlcContract {
        // Regtest P2PKH addresses.
        HtlcContract::new(
            "mh5CE8Nbj38iND267s4XnvhSmhDW7yWc6Q",
            "midSACfDe3qAxJZZXA9gkwBZgPqJJUpy1w",
            Timestamp::from(1_700_172_800),
            SecretHash::new(Secret::from([7u8; 32])),
        )
        .unwrap()
    }

    fn opcodes_of(script: &Script) -> Vec<opcodes::All> {
        script
            .instructions()
            .filter_map(|instruction| match instruction.unwrap() {
                Instruction::Op(op) => Some(op),
                Instruction::PushBytes(_) => None,
            })
            .collect()
    }

    #[test]
    fn contract_script_has_the_expected_branch_structure() {
        let script = contract().script().unwrap();

        let ops = opcodes_of(&script);
        let expected = vec![
            opcodes::all::OP_IF,
            opcodes::all::OP_SIZE,
            opcodes::all::OP_EQUALVERIFY,
            opcodes::all::OP_SHA256,
            opcodes::all::OP_EQUALVERIFY,
            opcodes::all::OP_DUP,
            opcodes::all::OP_HASH160,
            opcodes::all::OP_ELSE,
            opcodes::all::OP_CLTV,
            opcodes::all::OP_DROP,
            opcodes::all::OP_DUP,
            opcodes::all::OP_HASH160,
            opcodes::all::OP_ENDIF,
            opcodes::all::OP_EQUALVERIFY,
            opcodes::all::OP_CHECKSIG,
        ];

        assert_eq!(ops, expected);
    }

    #[test]
    fn contract_script_commits_to_the_secret_hash() {
        let htlc = contract();
        let script = htlc.script().unwrap();

        let pushed: Vec<Vec<u8>> = script
            .instructions()
            .filter_map(|instruction| match instruction.unwrap() {
                Instruction::PushBytes(bytes) => Some(bytes.to_vec()),
                Instruction::Op(_) => None,
            })
            .collect();

        assert!(pushed.contains(&htlc.secret_hash.as_raw().to_vec()));
    }

    #[test]
    fn address_is_p2sh() {
        let address = contract().address(Network::Regtest).unwrap();

        assert!(matches!(address.payload, Payload::ScriptHash(_)));
    }

    #[test]
    fn redeem_input_script_carries_preimage_and_contract() {
        let htlc = contract();
        let key = PrivateKey::from_wif("cMceqPhHedrhbcR9eXgzmfWy7kRqLyAxMYwFT6ABDWsiwUp9Nsq9")
            .unwrap();
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let pubkey = key.public_key(&secp);
        let preimage = Secret::from([7u8; 32]);

        let input = htlc
            .redeem_input_script(&[0x30, 0x44, 0x01], &pubkey, &preimage)
            .unwrap();

        let pushed: Vec<Vec<u8>> = input
            .instructions()
            .filter_map(|instruction| match instruction.unwrap() {
                Instruction::PushBytes(bytes) => Some(bytes.to_vec()),
                Instruction::Op(_) => None,
            })
            .collect();

        assert!(pushed.contains(&preimage.as_raw_secret().to_vec()));
        assert_eq!(
            pushed.last().unwrap(),
            &htlc.script().unwrap().as_bytes().to_vec()
        );
    }

    #[test]
    fn both_parties_derive_the_same_contract() {
        // Each side constructs the script from its own copy of the
        // addresses; the scripts must hash to the same P2SH address.
        let a = contract();
        let b = contract();

        assert_eq!(
            a.address(Network::Regtest).unwrap(),
            b.address(Network::Regtest).unwrap()
        );
    }
}
