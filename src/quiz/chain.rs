use std::future::Future;

use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::quiz::{QuizError, QuizResult, WalletAddress};

/// Signing capability handed to anything that touches the escrow contract.
///
/// Implementations own key material and wait for transactions to be mined;
/// callers only ever see a receipt or a `ChainTransaction` error.
pub trait Wallet: Send + Sync {
    fn address(&self) -> Option<&WalletAddress>;

    /// `getAllQuizzes()` on the escrow contract.
    fn all_quizzes(&self) -> impl Future<Output = QuizResult<OnChainQuizzes>> + Send;

    fn sign_and_send(&self, tx: EscrowTx) -> impl Future<Output = QuizResult<TxReceipt>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowCall {
    CreateQuiz {
        quiz_id: String,
        question_count: u32,
        reward_per_score: u128,
        value: u128,
    },
    EndQuiz {
        contract_index: u64,
    },
    JoinQuiz {
        contract_index: u64,
        score: u64,
    },
}

impl EscrowCall {
    pub fn method(&self) -> &'static str {
        match self {
            EscrowCall::CreateQuiz { .. } => "createQuiz",
            EscrowCall::EndQuiz { .. } => "endQuiz",
            EscrowCall::JoinQuiz { .. } => "joinQuiz",
        }
    }

    // uint256 arguments travel as decimal strings
    pub fn args(&self) -> Vec<Value> {
        match self {
            EscrowCall::CreateQuiz {
                quiz_id,
                question_count,
                reward_per_score,
                ..
            } => vec![
                json!(quiz_id),
                json!(question_count.to_string()),
                json!(reward_per_score.to_string()),
            ],
            EscrowCall::EndQuiz { contract_index } => vec![json!(contract_index.to_string())],
            EscrowCall::JoinQuiz {
                contract_index,
                score,
            } => vec![json!(contract_index.to_string()), json!(score.to_string())],
        }
    }

    /// Amount attached to the call, in base units.
    pub fn value(&self) -> u128 {
        match self {
            EscrowCall::CreateQuiz { value, .. } => *value,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowTx {
    pub call: EscrowCall,
    pub idempotency_key: Option<String>,
}

impl EscrowTx {
    pub fn new(call: EscrowCall) -> Self {
        Self {
            call,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(call: EscrowCall, key: impl Into<String>) -> Self {
        Self {
            call,
            idempotency_key: Some(key.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

/// Parallel arrays returned by `getAllQuizzes()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnChainQuizzes {
    pub ids: Vec<String>,
    pub quiz_ids: Vec<String>,
}

impl OnChainQuizzes {
    pub fn position_of(&self, quiz_id: &str) -> Option<usize> {
        self.quiz_ids.iter().position(|q| q == quiz_id)
    }
}

/// Converts a decimal amount such as `"0.25"` into integer base units.
pub fn parse_units(amount: &str, decimals: u32) -> QuizResult<u128> {
    let amount = amount.trim();
    let invalid = || QuizError::Validation(format!("'{}' is not a valid amount", amount));
    if amount.is_empty() {
        return Err(invalid());
    }

    let (whole, fraction) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if fraction.len() > decimals as usize {
        return Err(QuizError::Validation(format!(
            "'{}' has more than {} decimal places",
            amount, decimals
        )));
    }

    let scale = 10u128.checked_pow(decimals).ok_or_else(invalid)?;
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let fraction_units: u128 = if fraction.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", fraction, width = decimals as usize);
        padded.parse().map_err(|_| invalid())?
    };

    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(fraction_units))
        .ok_or_else(invalid)
}

pub fn format_units(value: u128, decimals: u32) -> String {
    let scale = 10u128.pow(decimals);
    let whole = value / scale;
    let fraction = value % scale;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{:0>width$}", fraction, width = decimals as usize);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}

/// Talks to an external signer relay that holds the account's keys.
///
/// `POST {relay}/call` runs a view function, `POST {relay}/send` signs,
/// broadcasts and answers once the transaction is mined or reverted.
#[derive(Clone)]
pub struct RelayWallet {
    client: Client,
    relay_url: String,
    contract: String,
    address: Option<WalletAddress>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest<'a> {
    contract: &'a str,
    from: &'a WalletAddress,
    method: &'a str,
    args: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllQuizzesResponse {
    #[serde(default)]
    ids: Vec<Value>,
    #[serde(default)]
    quiz_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    status: String,
    tx_hash: Option<String>,
    block_number: Option<u64>,
    revert_reason: Option<String>,
}

#[derive(Deserialize)]
struct RelayErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl RelayWallet {
    pub fn new(
        client: Client,
        relay_url: impl Into<String>,
        contract: impl Into<String>,
        address: Option<WalletAddress>,
    ) -> Self {
        Self {
            client,
            relay_url: relay_url.into().trim_end_matches('/').to_string(),
            contract: contract.into(),
            address,
        }
    }

    fn signer(&self) -> QuizResult<&WalletAddress> {
        self.address.as_ref().ok_or(QuizError::UnauthorizedWallet)
    }

    async fn post(&self, path: &str, body: &RelayRequest<'_>) -> QuizResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.relay_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| QuizError::ChainTransaction(format!("signer relay unreachable: {}", e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<RelayErrorBody>(&text)
            .ok()
            .and_then(|b| b.error.or(b.message))
            .unwrap_or_else(|| format!("signer relay responded with {}", status));
        Err(QuizError::ChainTransaction(reason))
    }
}

impl Wallet for RelayWallet {
    fn address(&self) -> Option<&WalletAddress> {
        self.address.as_ref()
    }

    async fn all_quizzes(&self) -> QuizResult<OnChainQuizzes> {
        let from = self.signer()?;
        debug!("Fetching quizzes from escrow {}", self.contract);
        let request = RelayRequest {
            contract: &self.contract,
            from,
            method: "getAllQuizzes",
            args: Vec::new(),
            value: None,
            idempotency_key: None,
        };
        let response: AllQuizzesResponse = self
            .post("/call", &request)
            .await?
            .json()
            .await
            .map_err(|e| QuizError::ChainTransaction(format!("malformed getAllQuizzes result: {}", e)))?;
        let ids = response
            .ids
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        Ok(OnChainQuizzes {
            ids,
            quiz_ids: response.quiz_ids,
        })
    }

    async fn sign_and_send(&self, tx: EscrowTx) -> QuizResult<TxReceipt> {
        let from = self.signer()?;
        let value = tx.call.value();
        debug!("Sending {} from {} (value {})", tx.call.method(), from, value);
        let request = RelayRequest {
            contract: &self.contract,
            from,
            method: tx.call.method(),
            args: tx.call.args(),
            value: (value > 0).then(|| value.to_string()),
            idempotency_key: tx.idempotency_key.as_deref(),
        };
        let response: SendResponse = self
            .post("/send", &request)
            .await?
            .json()
            .await
            .map_err(|e| QuizError::ChainTransaction(format!("malformed relay receipt: {}", e)))?;

        match (response.status.as_str(), response.tx_hash) {
            ("mined", Some(tx_hash)) => Ok(TxReceipt {
                tx_hash,
                block_number: response.block_number,
            }),
            ("reverted", _) => {
                let reason = response.revert_reason.unwrap_or_else(|| "execution reverted".to_string());
                warn!("{} reverted: {}", tx.call.method(), reason);
                Err(QuizError::ChainTransaction(reason))
            }
            (status, _) => Err(QuizError::ChainTransaction(format!(
                "transaction was not mined (status: {})",
                status
            ))),
        }
    }
}
