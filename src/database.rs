//! The parameter store: a typed façade over the wallet database.
//!
//! Per-swap rows are keyed by `(TxID, SubTxID, ParameterID)`; the
//! settings provider shares the same tree under its own string keys.
//! Values are the canonical CBOR encoding of their typed form. The store
//! owns no business logic.

use crate::{
    params::{ParameterId, SubTxId},
    swap_id::SwapId,
};
use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Serialize};

const SWAP_PREFIX: &[u8] = b"swap/";

#[derive(Clone, Debug)]
pub struct ParamStore {
    db: sled::Db,
}

impl ParamStore {
    pub fn new(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open DB at {}", path.display()))?;

        Ok(ParamStore { db })
    }

    fn swap_key(tx_id: SwapId, sub_tx: SubTxId, id: ParameterId) -> Vec<u8> {
        let mut key = Vec::with_capacity(SWAP_PREFIX.len() + 18);
        key.extend_from_slice(SWAP_PREFIX);
        key.extend_from_slice(tx_id.as_bytes());
        key.push(sub_tx.into());
        key.push(id.into());

        key
    }

    pub fn get<T>(&self, tx_id: SwapId, sub_tx: SubTxId, id: ParameterId) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let value = match self.db.get(Self::swap_key(tx_id, sub_tx, id))? {
            Some(bytes) => serde_cbor::from_slice(&bytes)
                .with_context(|| format!("failed to decode parameter {:?}", id))?,
            None => return Ok(None),
        };

        Ok(Some(value))
    }

    pub fn get_mandatory<T>(&self, tx_id: SwapId, sub_tx: SubTxId, id: ParameterId) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.get(tx_id, sub_tx, id)?
            .ok_or_else(|| anyhow!("missing mandatory parameter {:?} for {}/{:?}", id, tx_id, sub_tx))
    }

    /// Idempotent upsert. Returns whether the stored value changed; with
    /// `persist` the write reaches storage before this returns.
    pub fn put<T>(
        &self,
        tx_id: SwapId,
        sub_tx: SubTxId,
        id: ParameterId,
        value: &T,
        persist: bool,
    ) -> Result<bool>
    where
        T: Serialize,
    {
        let bytes = serde_cbor::to_vec(value)
            .with_context(|| format!("failed to encode parameter {:?}", id))?;

        self.put_raw(tx_id, sub_tx, id, &bytes, persist)
    }

    pub fn put_raw(
        &self,
        tx_id: SwapId,
        sub_tx: SubTxId,
        id: ParameterId,
        bytes: &[u8],
        persist: bool,
    ) -> Result<bool> {
        let key = Self::swap_key(tx_id, sub_tx, id);

        if let Some(existing) = self.db.get(&key)? {
            if existing.as_ref() == bytes {
                return Ok(false);
            }
        }

        self.db.insert(key, bytes)?;
        if persist {
            self.db.flush().context("failed to flush db")?;
        }

        Ok(true)
    }

    /// Drops a single parameter.
    pub fn remove(&self, tx_id: SwapId, sub_tx: SubTxId, id: ParameterId) -> Result<()> {
        self.db.remove(Self::swap_key(tx_id, sub_tx, id))?;
        self.db.flush().context("failed to flush db")?;

        Ok(())
    }

    /// Drops every row of a swap.
    pub fn remove_swap(&self, tx_id: SwapId) -> Result<()> {
        let mut prefix = Vec::with_capacity(SWAP_PREFIX.len() + 16);
        prefix.extend_from_slice(SWAP_PREFIX);
        prefix.extend_from_slice(tx_id.as_bytes());

        self.remove_prefix(&prefix)
    }

    fn remove_prefix(&self, prefix: &[u8]) -> Result<()> {
        for item in self.db.scan_prefix(prefix) {
            let (key, _) = item?;
            self.db.remove(key)?;
        }
        self.db.flush().context("failed to flush db")?;

        Ok(())
    }

    pub fn get_setting<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let value = match self.db.get(name.as_bytes())? {
            Some(bytes) => serde_cbor::from_slice(&bytes)
                .with_context(|| format!("failed to decode setting {}", name))?,
            None => return Ok(None),
        };

        Ok(Some(value))
    }

    pub fn put_setting<T>(&self, name: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let bytes = serde_cbor::to_vec(value)
            .with_context(|| format!("failed to encode setting {}", name))?;

        self.db.insert(name.as_bytes(), bytes)?;
        self.db.flush().context("failed to flush db")?;

        Ok(())
    }

    pub fn remove_settings(&self, prefix: &str) -> Result<()> {
        self.remove_prefix(prefix.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use tempfile::TempDir;

    fn store() -> (ParamStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ParamStore::new(dir.path()).unwrap();

        (store, dir)
    }

    #[test]
    fn get_after_put_returns_the_value_written() {
        let (store, _dir) = store();
        let tx_id = SwapId::default();

        store
            .put(tx_id, SubTxId::BeamLock, ParameterId::Fee, &123u64, true)
            .unwrap();

        let fee: Option<u64> = store.get(tx_id, SubTxId::BeamLock, ParameterId::Fee).unwrap();
        assert_eq!(fee, Some(123));
    }

    #[test]
    fn parameters_are_scoped_by_sub_tx() {
        let (store, _dir) = store();
        let tx_id = SwapId::default();

        store
            .put(tx_id, SubTxId::BeamLock, ParameterId::KernelProofHeight, &10u64, true)
            .unwrap();
        store
            .put(tx_id, SubTxId::BeamRedeem, ParameterId::KernelProofHeight, &20u64, true)
            .unwrap();

        let lock: u64 = store
            .get_mandatory(tx_id, SubTxId::BeamLock, ParameterId::KernelProofHeight)
            .unwrap();
        let redeem: u64 = store
            .get_mandatory(tx_id, SubTxId::BeamRedeem, ParameterId::KernelProofHeight)
            .unwrap();

        assert_eq!((lock, redeem), (10, 20));
    }

    #[test]
    fn rewriting_the_same_value_reports_unchanged() {
        let (store, _dir) = store();
        let tx_id = SwapId::default();

        assert!(store
            .put(tx_id, SubTxId::Lock, ParameterId::TransactionRegistered, &true, true)
            .unwrap());
        assert!(!store
            .put(tx_id, SubTxId::Lock, ParameterId::TransactionRegistered, &true, true)
            .unwrap());
    }

    #[test]
    fn values_survive_reopening_the_database() {
        let dir = TempDir::new().unwrap();
        let tx_id = SwapId::default();

        {
            let store = ParamStore::new(dir.path()).unwrap();
            store
                .put(tx_id, SubTxId::Default, ParameterId::State, &3u8, true)
                .unwrap();
        }

        let store = ParamStore::new(dir.path()).unwrap();
        let state: u8 = store
            .get_mandatory(tx_id, SubTxId::Default, ParameterId::State)
            .unwrap();

        assert_eq!(state, 3);
    }

    #[test]
    fn remove_swap_only_touches_that_swap() {
        let (store, _dir) = store();
        let kept = SwapId::default();
        let removed = SwapId::default();

        for tx_id in &[kept, removed] {
            store
                .put(*tx_id, SubTxId::Default, ParameterId::State, &1u8, true)
                .unwrap();
        }

        store.remove_swap(removed).unwrap();

        let gone: Option<u8> = store.get(removed, SubTxId::Default, ParameterId::State).unwrap();
        let there: Option<u8> = store.get(kept, SubTxId::Default, ParameterId::State).unwrap();
        assert_eq!(gone, None);
        assert_eq!(there, Some(1));
    }

    quickcheck! {
        fn roundtrips_arbitrary_bytes(bytes: Vec<u8>) -> bool {
            let (store, _dir) = store();
            let tx_id = SwapId::default();

            store
                .put(tx_id, SubTxId::Redeem, ParameterId::RawTransaction, &bytes, false)
                .unwrap();

            let read: Vec<u8> = store
                .get_mandatory(tx_id, SubTxId::Redeem, ParameterId::RawTransaction)
                .unwrap();

            read == bytes
        }
    }
}
