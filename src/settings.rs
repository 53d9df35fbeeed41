//! Chain B connection settings, persisted per-field under the
//! `BTCSettings` namespace of the wallet database.

use crate::database::ParamStore;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

const SETTINGS_NAME: &str = "BTCSettings";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub user_name: String,
    pub pass: String,
    pub address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectrumConnection {
    pub address: String,
    pub secret_words: Vec<String>,
    pub address_version: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConnectionType {
    Core,
    Electrum,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub connection: NodeConnection,
    pub electrum: ElectrumConnection,
    /// Satoshi per 1000 vbytes.
    pub fee_rate: u64,
    pub min_fee_rate: u64,
    pub tx_min_confirmations: u32,
    pub lock_time_in_blocks: u32,
    pub connection_type: ConnectionType,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            connection: NodeConnection::default(),
            electrum: ElectrumConnection::default(),
            fee_rate: 90_000,
            min_fee_rate: 50_000,
            tx_min_confirmations: 6,
            lock_time_in_blocks: 2 * 24 * 6,
            connection_type: ConnectionType::Core,
        }
    }
}

fn key(suffix: &str) -> String {
    format!("{}_{}", SETTINGS_NAME, suffix)
}

/// Reference-counted access to the settings: readers [`borrow`] a
/// snapshot, and mutation is only allowed while no borrow is
/// outstanding. A successful mutation persists before it is visible.
///
/// [`borrow`]: SettingsProvider::borrow
#[derive(Debug)]
pub struct SettingsProvider {
    store: ParamStore,
    settings: Mutex<Settings>,
    ref_count: AtomicUsize,
}

impl SettingsProvider {
    pub fn new(store: ParamStore) -> Result<Self> {
        let mut settings = Settings::default();

        load(&store, "UserName", &mut settings.connection.user_name)?;
        load(&store, "Pass", &mut settings.connection.pass)?;
        load(&store, "Address", &mut settings.connection.address)?;
        load(&store, "ElectrumAddress", &mut settings.electrum.address)?;
        load(&store, "SecretWords", &mut settings.electrum.secret_words)?;
        load(&store, "AddressVersion", &mut settings.electrum.address_version)?;
        load(&store, "FeeRate", &mut settings.fee_rate)?;
        load(&store, "MinFeeRate", &mut settings.min_fee_rate)?;
        load(&store, "TxMinConfirmations", &mut settings.tx_min_confirmations)?;
        load(&store, "LockTimeInBlocks", &mut settings.lock_time_in_blocks)?;
        load(&store, "ConnectionType", &mut settings.connection_type)?;

        Ok(SettingsProvider {
            store,
            settings: Mutex::new(settings),
            ref_count: AtomicUsize::new(0),
        })
    }

    pub fn borrow(&self) -> SettingsGuard<'_> {
        self.ref_count.fetch_add(1, Ordering::SeqCst);

        SettingsGuard {
            provider: self,
            snapshot: self.settings.lock().expect("settings lock poisoned").clone(),
        }
    }

    pub fn can_modify(&self) -> bool {
        self.ref_count.load(Ordering::SeqCst) == 0
    }

    pub fn set_settings(&self, settings: Settings) -> Result<()> {
        if !self.can_modify() {
            bail!("settings are borrowed and cannot be modified");
        }

        self.store.put_setting(&key("UserName"), &settings.connection.user_name)?;
        self.store.put_setting(&key("Pass"), &settings.connection.pass)?;
        self.store.put_setting(&key("Address"), &settings.connection.address)?;
        self.store.put_setting(&key("ElectrumAddress"), &settings.electrum.address)?;
        self.store.put_setting(&key("SecretWords"), &settings.electrum.secret_words)?;
        self.store.put_setting(&key("AddressVersion"), &settings.electrum.address_version)?;
        self.store.put_setting(&key("FeeRate"), &settings.fee_rate)?;
        self.store.put_setting(&key("MinFeeRate"), &settings.min_fee_rate)?;
        self.store.put_setting(&key("TxMinConfirmations"), &settings.tx_min_confirmations)?;
        self.store.put_setting(&key("LockTimeInBlocks"), &settings.lock_time_in_blocks)?;
        self.store.put_setting(&key("ConnectionType"), &settings.connection_type)?;

        *self.settings.lock().expect("settings lock poisoned") = settings;

        Ok(())
    }

    pub fn reset_settings(&self) -> Result<()> {
        if !self.can_modify() {
            bail!("settings are borrowed and cannot be modified");
        }

        self.store.remove_settings(SETTINGS_NAME)?;
        *self.settings.lock().expect("settings lock poisoned") = Settings::default();

        Ok(())
    }
}

fn load<T: serde::de::DeserializeOwned>(
    store: &ParamStore,
    suffix: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(value) = store.get_setting(&key(suffix))? {
        *target = value;
    }

    Ok(())
}

pub struct SettingsGuard<'a> {
    provider: &'a SettingsProvider,
    snapshot: Settings,
}

impl std::ops::Deref for SettingsGuard<'_> {
    type Target = Settings;

    fn deref(&self) -> &Settings {
        &self.snapshot
    }
}

impl Drop for SettingsGuard<'_> {
    fn drop(&mut self) {
        self.provider.ref_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider() -> (SettingsProvider, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ParamStore::new(dir.path()).unwrap();

        (SettingsProvider::new(store).unwrap(), dir)
    }

    fn sample() -> Settings {
        Settings {
            connection: NodeConnection {
                user_name: "alice".into(),
                pass: "hunter2".into(),
                address: "127.0.0.1:8332".into(),
            },
            fee_rate: 120_000,
            ..Settings::default()
        }
    }

    #[test]
    fn settings_survive_a_new_provider_over_the_same_store() {
        let dir = TempDir::new().unwrap();
        let store = ParamStore::new(dir.path()).unwrap();

        let provider = SettingsProvider::new(store.clone()).unwrap();
        provider.set_settings(sample()).unwrap();
        drop(provider);

        let provider = SettingsProvider::new(store).unwrap();
        assert_eq!(*provider.borrow(), sample());
    }

    #[test]
    fn mutation_is_rejected_while_borrowed() {
        let (provider, _dir) = provider();

        let guard = provider.borrow();
        assert!(!provider.can_modify());
        assert!(provider.set_settings(sample()).is_err());

        drop(guard);
        assert!(provider.can_modify());
        provider.set_settings(sample()).unwrap();
    }

    #[test]
    fn reset_restores_defaults() {
        let (provider, _dir) = provider();

        provider.set_settings(sample()).unwrap();
        provider.reset_settings().unwrap();

        assert_eq!(*provider.borrow(), Settings::default());
    }
}
