#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod beam;
pub mod bitcoind;
pub mod crypto;
pub mod database;
pub mod htlc;
pub mod params;
pub mod secret;
pub mod settings;
pub mod swap;
pub mod swap_id;
pub mod timestamp;
pub mod trace;

#[cfg(test)]
pub mod test_harness;

pub use self::{
    database::ParamStore,
    secret::{Secret, SecretHash},
    swap::AtomicSwap,
    swap_id::SwapId,
    timestamp::Timestamp,
};
