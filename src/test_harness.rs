//! In-process fakes for both chains and harness glue for driving two
//! swap parties against each other without any network.

use crate::{
    beam::{self, Amount, BeamNode, Coin, Height, Kernel, KernelId},
    bitcoind::{
        BitcoindRpc, FundedTransaction, JsonRpcError, SignedTransaction, TransactionInput, TxOut,
    },
    crypto::KeyChain,
    database::ParamStore,
    params::apply_peer_message,
    swap::{channel::DuplexChannel, AtomicSwap},
    swap_id::SwapId,
};
use anyhow::{anyhow, Context, Result};
use bitcoin::{
    consensus::encode::{deserialize, serialize_hex},
    hashes::{sha256, sha256d, Hash},
    Address, Network, OutPoint, PrivateKey, Txid,
};
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tempfile::TempDir;

/// A Chain A node that mines registered transactions immediately.
pub struct FakeBeamNode {
    tip: Mutex<Height>,
    kernels: Mutex<HashMap<KernelId, (Height, Kernel)>>,
    registered: AtomicU64,
}

impl FakeBeamNode {
    pub fn new(tip: Height) -> Self {
        FakeBeamNode {
            tip: Mutex::new(tip),
            kernels: Mutex::new(HashMap::new()),
            registered: AtomicU64::new(0),
        }
    }

    pub fn advance_tip(&self, blocks: Height) {
        *self.tip.lock().unwrap() += blocks;
    }

    pub fn registered_count(&self) -> u64 {
        self.registered.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BeamNode for FakeBeamNode {
    async fn register_tx(&self, _tx_id: SwapId, tx: beam::Transaction) -> Result<bool> {
        if !tx.is_valid() {
            return Ok(false);
        }

        let mut tip = self.tip.lock().unwrap();
        let height = *tip + 1;

        if tx.kernels.iter().any(|kernel| kernel.min_height > height) {
            return Ok(false);
        }

        let mut kernels = self.kernels.lock().unwrap();
        for kernel in &tx.kernels {
            kernels.insert(kernel.id(), (height, kernel.clone()));
        }
        *tip = height;
        self.registered.fetch_add(1, Ordering::SeqCst);

        Ok(true)
    }

    async fn confirm_kernel(&self, kernel_id: KernelId) -> Result<Option<Height>> {
        Ok(self
            .kernels
            .lock()
            .unwrap()
            .get(&kernel_id)
            .map(|(height, _)| *height))
    }

    async fn get_kernel(&self, kernel_id: KernelId) -> Result<Option<Kernel>> {
        Ok(self
            .kernels
            .lock()
            .unwrap()
            .get(&kernel_id)
            .map(|(_, kernel)| kernel.clone()))
    }

    async fn get_tip(&self) -> Result<Height> {
        Ok(*self.tip.lock().unwrap())
    }
}

/// Wallet with a fixed set of spendable coins; selection is stable so a
/// restarted negotiation re-derives the same inputs.
pub struct FakeWallet {
    coins: Vec<Coin>,
    next_id: AtomicU64,
}

impl FakeWallet {
    pub fn new(funds: &[Amount]) -> Self {
        let coins = funds
            .iter()
            .enumerate()
            .map(|(index, amount)| Coin {
                id: index as u64 + 1,
                amount: *amount,
            })
            .collect();

        FakeWallet {
            coins,
            next_id: AtomicU64::new(1_000),
        }
    }
}

impl beam::Wallet for FakeWallet {
    fn select_coins(&self, target: Amount) -> Result<Vec<Coin>> {
        let mut selected = Vec::new();
        let mut total = 0;
        for coin in &self.coins {
            selected.push(*coin);
            total += coin.amount;
            if total >= target {
                return Ok(selected);
            }
        }

        Err(anyhow!("insufficient funds: {} < {}", total, target))
    }

    fn allocate_coin(&self, amount: Amount) -> Result<Coin> {
        Ok(Coin {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            amount,
        })
    }
}

#[derive(Default)]
struct BitcoindState {
    next_key: u64,
    next_funding: u64,
    keys: HashMap<String, PrivateKey>,
    txs: HashMap<String, bitcoin::Transaction>,
    confirmations: HashMap<String, u32>,
    fund_calls: u32,
    send_calls: u32,
}

/// A bitcoind stand-in shared by both parties: one key-value wallet, one
/// mempool, instant confirmations.
pub struct FakeBitcoind {
    network: Network,
    state: Mutex<BitcoindState>,
    fail_sends: std::sync::atomic::AtomicBool,
}

impl FakeBitcoind {
    pub fn new(network: Network) -> Self {
        FakeBitcoind {
            network,
            state: Mutex::new(BitcoindState::default()),
            fail_sends: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Makes every broadcast fail with a node error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fund_calls(&self) -> u32 {
        self.state.lock().unwrap().fund_calls
    }

    pub fn send_calls(&self) -> u32 {
        self.state.lock().unwrap().send_calls
    }

    pub fn knows_tx(&self, txid: &str) -> bool {
        self.state.lock().unwrap().txs.contains_key(txid)
    }
}

#[async_trait::async_trait]
impl BitcoindRpc for FakeBitcoind {
    async fn get_raw_change_address(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_key += 1;

        let seed = sha256::Hash::hash(&state.next_key.to_le_bytes());
        let secret = bitcoin::secp256k1::SecretKey::from_slice(&seed[..])
            .context("derived key is invalid")?;
        let key = PrivateKey {
            compressed: true,
            network: self.network,
            inner: secret,
        };

        let secp = bitcoin::secp256k1::Secp256k1::new();
        let address = Address::p2pkh(&key.public_key(&secp), self.network).to_string();
        state.keys.insert(address.clone(), key);

        Ok(address)
    }

    async fn fund_raw_transaction(&self, hex: &str) -> Result<FundedTransaction> {
        let mut state = self.state.lock().unwrap();
        state.fund_calls += 1;
        state.next_funding += 1;

        let mut tx: bitcoin::Transaction = deserialize(&hex::decode(hex)?)?;

        let funding = sha256::Hash::hash(&state.next_funding.to_le_bytes());
        tx.input.push(bitcoin::TxIn {
            previous_output: OutPoint {
                txid: Txid::from_hash(sha256d::Hash::from_inner(funding.into_inner())),
                vout: 0,
            },
            script_sig: Default::default(),
            sequence: u32::MAX,
            witness: Default::default(),
        });

        // Change lands in front, so the value output moves to index 1.
        tx.output.insert(
            0,
            bitcoin::TxOut {
                value: 1_000,
                script_pubkey: Default::default(),
            },
        );

        Ok(FundedTransaction {
            hex: serialize_hex(&tx),
            changepos: 0,
            fee: 0.0001,
        })
    }

    async fn sign_raw_transaction(&self, hex: &str) -> Result<SignedTransaction> {
        Ok(SignedTransaction {
            hex: hex.to_owned(),
            complete: true,
        })
    }

    async fn create_raw_transaction(
        &self,
        inputs: Vec<TransactionInput>,
        outputs: Vec<(String, f64)>,
        locktime: Option<u32>,
    ) -> Result<String> {
        let input = inputs
            .into_iter()
            .map(|input| {
                Ok(bitcoin::TxIn {
                    previous_output: OutPoint {
                        txid: Txid::from_str(&input.txid)?,
                        vout: input.vout,
                    },
                    script_sig: Default::default(),
                    sequence: input.sequence,
                    witness: Default::default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let output = outputs
            .into_iter()
            .map(|(address, btc)| {
                let address = Address::from_str(&address)?;
                Ok(bitcoin::TxOut {
                    value: (btc * 100_000_000.0).round() as u64,
                    script_pubkey: address.script_pubkey(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let tx = bitcoin::Transaction {
            version: 2,
            lock_time: locktime.unwrap_or(0),
            input,
            output,
        };

        Ok(serialize_hex(&tx))
    }

    async fn dump_priv_key(&self, address: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        let key = state.keys.get(address).ok_or_else(|| {
            anyhow::Error::new(JsonRpcError {
                code: -4,
                message: format!("unknown address {}", address),
            })
        })?;

        Ok(key.to_wif())
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(JsonRpcError {
                code: -26,
                message: "rejected".to_owned(),
            }
            .into());
        }

        let mut state = self.state.lock().unwrap();
        state.send_calls += 1;

        let tx: bitcoin::Transaction = deserialize(&hex::decode(hex)?)?;
        let txid = tx.txid().to_string();

        // A re-broadcast of a known transaction succeeds with the same id.
        if state.txs.contains_key(&txid) {
            return Ok(txid);
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        if tx.lock_time != 0 && u64::from(tx.lock_time) > now {
            return Err(JsonRpcError {
                code: -26,
                message: "non-final".to_owned(),
            }
            .into());
        }

        for input in &tx.input {
            let prev = input.previous_output.txid.to_string();
            if let Some(funding) = state.txs.get(&prev) {
                if funding.output.len() <= input.previous_output.vout as usize {
                    return Err(JsonRpcError {
                        code: -25,
                        message: "missing inputs".to_owned(),
                    }
                    .into());
                }
            }
        }

        state.txs.insert(txid.clone(), tx);
        state.confirmations.insert(txid.clone(), 6);

        Ok(txid)
    }

    async fn get_tx_out(&self, txid: &str, vout: u32) -> Result<Option<TxOut>> {
        let state = self.state.lock().unwrap();

        Ok(state.txs.get(txid).and_then(|tx| {
            tx.output.get(vout as usize).map(|out| TxOut {
                confirmations: *state.confirmations.get(txid).unwrap_or(&0),
                value: out.value as f64 / 100_000_000.0,
            })
        }))
    }
}

/// One side of a swap under test.
pub struct Party {
    pub dir: TempDir,
    pub store: ParamStore,
    pub swap: AtomicSwap,
    pub channel: Arc<DuplexChannel>,
    pub wallet: Arc<FakeWallet>,
    pub node: Arc<FakeBeamNode>,
    pub bitcoind: Arc<FakeBitcoind>,
}

impl Party {
    pub fn new(
        id: SwapId,
        master: [u8; 32],
        funds: &[Amount],
        node: Arc<FakeBeamNode>,
        bitcoind: Arc<FakeBitcoind>,
        channel: DuplexChannel,
    ) -> Party {
        let dir = TempDir::new().unwrap();
        let store = ParamStore::new(dir.path()).unwrap();
        let channel = Arc::new(channel);
        let wallet = Arc::new(FakeWallet::new(funds));

        let swap = AtomicSwap {
            id,
            store: store.clone(),
            keychain: KeyChain::new(master),
            wallet: wallet.clone(),
            node: node.clone(),
            bitcoind: bitcoind.clone(),
            channel: channel.clone(),
            network: Network::Regtest,
            btc_fee_rate: 90_000,
        };

        Party {
            dir,
            store,
            swap,
            channel,
            wallet,
            node,
            bitcoind,
        }
    }

    /// Simulates a process restart: everything in memory is dropped and
    /// the engine is rebuilt from the on-disk store alone.
    pub fn restart(self, master: [u8; 32]) -> Party {
        let Party {
            dir,
            store,
            swap,
            channel,
            wallet,
            node,
            bitcoind,
        } = self;

        let id = swap.id;
        drop(swap);
        drop(store);

        let store = ParamStore::new(dir.path()).unwrap();
        let swap = AtomicSwap {
            id,
            store: store.clone(),
            keychain: KeyChain::new(master),
            wallet: wallet.clone(),
            node: node.clone(),
            bitcoind: bitcoind.clone(),
            channel: channel.clone(),
            network: Network::Regtest,
            btc_fee_rate: 90_000,
        };

        Party {
            dir,
            store,
            swap,
            channel,
            wallet,
            node,
            bitcoind,
        }
    }

    /// Drains this party's inbox into its parameter store. Returns
    /// whether anything changed.
    pub fn deliver_inbound(&self) -> bool {
        let mut changed = false;
        while let Some(msg) = self.channel.try_recv() {
            changed |= apply_peer_message(&self.store, &msg).unwrap();
        }

        changed
    }
}
