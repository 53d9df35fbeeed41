//! Async JSON-RPC client for a bitcoind-style node, reduced to the
//! calls the swap engine consumes.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;

pub const SATOSHI_PER_BITCOIN: u64 = 100_000_000;

pub fn sat_to_btc(sat: u64) -> f64 {
    sat as f64 / SATOSHI_PER_BITCOIN as f64
}

/// The RPC surface the engine consumes. Implemented by [`Client`] and by
/// the in-process node used in tests.
#[async_trait::async_trait]
pub trait BitcoindRpc: Send + Sync {
    async fn get_raw_change_address(&self) -> Result<String>;
    async fn fund_raw_transaction(&self, hex: &str) -> Result<FundedTransaction>;
    async fn sign_raw_transaction(&self, hex: &str) -> Result<SignedTransaction>;
    async fn create_raw_transaction(
        &self,
        inputs: Vec<TransactionInput>,
        outputs: Vec<(String, f64)>,
        locktime: Option<u32>,
    ) -> Result<String>;
    async fn dump_priv_key(&self, address: &str) -> Result<String>;
    async fn send_raw_transaction(&self, hex: &str) -> Result<String>;
    async fn get_tx_out(&self, txid: &str, vout: u32) -> Result<Option<TxOut>>;
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FundedTransaction {
    pub hex: String,
    pub changepos: i32,
    pub fee: f64,
}

impl FundedTransaction {
    /// Index of the non-change output carrying the swap value.
    pub fn value_output_index(&self) -> u32 {
        if self.changepos == 0 {
            1
        } else {
            0
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SignedTransaction {
    pub hex: String,
    pub complete: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TransactionInput {
    pub txid: String,
    pub vout: u32,
    #[serde(rename = "Sequence")]
    pub sequence: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TxOut {
    pub confirmations: u32,
    #[serde(default)]
    pub value: f64,
}

#[derive(Clone, Debug)]
pub struct Client {
    inner: reqwest::Client,
    url: url::Url,
    user_name: String,
    pass: String,
}

impl Client {
    pub fn new(url: url::Url, user_name: String, pass: String) -> Self {
        Client {
            inner: reqwest::Client::new(),
            url,
            user_name,
            pass,
        }
    }

    async fn send<Res>(&self, method: &str, params: serde_json::Value) -> Result<Res>
    where
        Res: Debug + DeserializeOwned,
    {
        self.send_raw(method, params)
            .await?
            .into_result()?
            .with_context(|| format!("JSON-RPC call {} returned no result", method))
    }

    /// Like `send` but treats a `null` result without an error as absent,
    /// which is how `gettxout` reports an unknown or spent output.
    async fn send_opt<Res>(&self, method: &str, params: serde_json::Value) -> Result<Option<Res>>
    where
        Res: Debug + DeserializeOwned,
    {
        self.send_raw(method, params).await?.into_result()
    }

    async fn send_raw<Res>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Response<Res>>
    where
        Res: Debug + DeserializeOwned,
    {
        let request = Request {
            id: "1",
            jsonrpc: "1.0",
            method,
            params,
        };

        let response = self
            .inner
            .post(self.url.clone())
            .basic_auth(&self.user_name, Some(&self.pass))
            .json(&request)
            .send()
            .await
            .map_err(ConnectionFailed)?
            .json::<Response<Res>>()
            .await
            .context("failed to deserialize response as JSON-RPC reply")?;

        Ok(response)
    }
}

#[derive(Serialize, Debug, Clone)]
struct Request<'a> {
    id: &'a str,
    jsonrpc: &'a str,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct Response<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

impl<R> Response<R> {
    fn into_result(self) -> Result<Option<R>> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result),
        }
    }
}

/// A non-empty `"error"` field in the node's reply.
#[derive(Debug, Deserialize, thiserror::Error, PartialEq)]
#[error("JSON-RPC request failed with code {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Transport-level loss; the caller retries on the next tick.
#[derive(Debug, thiserror::Error)]
#[error("connection error: {0}")]
pub struct ConnectionFailed(#[from] reqwest::Error);

#[async_trait::async_trait]
impl BitcoindRpc for Client {
    async fn get_raw_change_address(&self) -> Result<String> {
        self.send("getrawchangeaddress", serde_json::json!(["legacy"]))
            .await
    }

    async fn fund_raw_transaction(&self, hex: &str) -> Result<FundedTransaction> {
        self.send("fundrawtransaction", serde_json::json!([hex])).await
    }

    async fn sign_raw_transaction(&self, hex: &str) -> Result<SignedTransaction> {
        self.send("signrawtransaction", serde_json::json!([hex])).await
    }

    async fn create_raw_transaction(
        &self,
        inputs: Vec<TransactionInput>,
        outputs: Vec<(String, f64)>,
        locktime: Option<u32>,
    ) -> Result<String> {
        let outputs: Vec<serde_json::Value> = outputs
            .into_iter()
            .map(|(address, amount)| serde_json::json!({ address: amount }))
            .collect();

        let params = match locktime {
            Some(locktime) => serde_json::json!([inputs, outputs, locktime]),
            None => serde_json::json!([inputs, outputs]),
        };

        self.send("createrawtransaction", params).await
    }

    async fn dump_priv_key(&self, address: &str) -> Result<String> {
        self.send("dumpprivkey", serde_json::json!([address])).await
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String> {
        self.send("sendrawtransaction", serde_json::json!([hex])).await
    }

    async fn get_tx_out(&self, txid: &str, vout: u32) -> Result<Option<TxOut>> {
        self.send_opt("gettxout", serde_json::json!([txid, vout])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_funded_transaction_reply() {
        let reply = r#"{"result":{"hex":"0200ab","changepos":1,"fee":0.0000451},"error":null,"id":"1"}"#;

        let response: Response<FundedTransaction> = serde_json::from_str(reply).unwrap();
        let funded = response.into_result().unwrap().unwrap();

        assert_eq!(funded.hex, "0200ab");
        assert_eq!(funded.value_output_index(), 0);
    }

    #[test]
    fn change_at_index_zero_selects_output_one() {
        let funded = FundedTransaction {
            hex: String::new(),
            changepos: 0,
            fee: 0.0,
        };

        assert_eq!(funded.value_output_index(), 1);
    }

    #[test]
    fn node_error_surfaces_as_rpc_failure() {
        let reply = r#"{"result":null,"error":{"code":-25,"message":"Missing inputs"},"id":"1"}"#;

        let response: Response<String> = serde_json::from_str(reply).unwrap();
        let error = response.into_result().unwrap_err();

        let rpc_error = error.downcast_ref::<JsonRpcError>().unwrap();
        assert_eq!(rpc_error.code, -25);
    }

    #[test]
    fn null_gettxout_result_is_absent_not_an_error() {
        let reply = r#"{"result":null,"error":null,"id":"1"}"#;

        let response: Response<TxOut> = serde_json::from_str(reply).unwrap();

        assert_eq!(response.into_result().unwrap(), None);
    }

    #[test]
    fn transaction_input_uses_capitalised_sequence_key() {
        let input = TransactionInput {
            txid: "ab".into(),
            vout: 1,
            sequence: 0xFFFF_FFFE,
        };

        let json = serde_json::to_value(&input).unwrap();

        assert_eq!(json["Sequence"], serde_json::json!(4294967294u32));
    }
}
