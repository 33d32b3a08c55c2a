use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::{debug, info, warn};

use crate::quiz::chain::{EscrowCall, EscrowTx, TxReceipt, Wallet};
use crate::quiz::{QuizError, QuizResult, WalletAddress};

/// Extra share of the reward pool deposited on top of the exact payout, in percent.
pub const FUNDING_BUFFER_PERCENT: u128 = 10;

/// Escrow funding needed for a quiz: `reward × participants × questions × 1.10`,
/// computed in base units.
pub fn funding_budget(reward_per_score: u128, participants: u32, question_count: u32) -> QuizResult<u128> {
    reward_per_score
        .checked_mul(participants as u128)
        .and_then(|v| v.checked_mul(question_count as u128))
        .and_then(|v| v.checked_mul(100 + FUNDING_BUFFER_PERCENT))
        .map(|v| v / 100)
        .ok_or_else(|| QuizError::Validation("Reward budget is too large".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClaimKey {
    quiz_id: String,
    wallet: WalletAddress,
}

#[derive(Debug, Clone)]
enum ClaimStatus {
    InFlight,
    Failed,
    Confirmed(TxReceipt),
}

#[derive(Debug, Clone)]
struct ClaimRecord {
    token: String,
    status: ClaimStatus,
}

/// Maps off-chain quiz ids onto the escrow contract and sends every
/// transaction that moves reward funds.
#[derive(Default)]
pub struct SettlementCoordinator {
    contract_indices: Mutex<HashMap<String, u64>>,
    claims: Mutex<HashMap<ClaimKey, ClaimRecord>>,
}

impl SettlementCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known_contract_index(&self, quiz_id: &str) -> Option<u64> {
        self.indices().get(quiz_id).copied()
    }

    pub fn forget_contract_index(&self, quiz_id: &str) {
        if self.indices().remove(quiz_id).is_some() {
            debug!("Dropped cached contract index for quiz {}", quiz_id);
        }
    }

    /// Looks the quiz up in `getAllQuizzes()` and returns its 1-based contract index.
    ///
    /// A hit is cached; the next lookup for the same quiz skips the scan until
    /// [`forget_contract_index`](Self::forget_contract_index) is called.
    pub async fn resolve_contract_index<W: Wallet>(&self, wallet: &W, quiz_id: &str) -> QuizResult<u64> {
        require_wallet(wallet)?;
        if let Some(index) = self.known_contract_index(quiz_id) {
            return Ok(index);
        }

        let quizzes = wallet.all_quizzes().await?;
        let position = quizzes
            .position_of(quiz_id)
            .ok_or_else(|| QuizError::NotFoundOnChain(quiz_id.to_string()))?;
        let index = position as u64 + 1;
        info!("Quiz {} resolved to contract index {}", quiz_id, index);
        self.indices().insert(quiz_id.to_string(), index);
        Ok(index)
    }

    /// Claims the reward for `score` on behalf of the wallet.
    ///
    /// At most one claim per `(quiz, wallet)` is ever confirmed. A failed claim
    /// keeps its idempotence token so the retry is recognisable to the relay.
    pub async fn submit_score<W: Wallet>(
        &self,
        wallet: &W,
        quiz_id: &str,
        contract_index: u64,
        score: i64,
    ) -> QuizResult<TxReceipt> {
        let score = claimable_score(score)?;
        let key = ClaimKey {
            quiz_id: quiz_id.to_string(),
            wallet: require_wallet(wallet)?.clone(),
        };
        let token = self.begin_claim(&key)?;

        let call = EscrowCall::JoinQuiz {
            contract_index,
            score,
        };
        let result = wallet
            .sign_and_send(EscrowTx::with_idempotency_key(call, token))
            .await;

        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = claims.get_mut(&key) {
            record.status = match &result {
                Ok(receipt) => ClaimStatus::Confirmed(receipt.clone()),
                Err(_) => ClaimStatus::Failed,
            };
        }
        drop(claims);

        match &result {
            Ok(receipt) => info!(
                "Reward claimed for {} on quiz {}: {}",
                key.wallet, quiz_id, receipt.tx_hash
            ),
            Err(err) => {
                warn!("Reward claim for {} on quiz {} failed: {}", key.wallet, quiz_id, err);
                self.forget_contract_index(quiz_id);
            }
        }
        result
    }

    /// Resolves the contract index and claims in one step.
    pub async fn settle<W: Wallet>(&self, wallet: &W, quiz_id: &str, score: i64) -> QuizResult<TxReceipt> {
        claimable_score(score)?;
        let contract_index = self.resolve_contract_index(wallet, quiz_id).await?;
        self.submit_score(wallet, quiz_id, contract_index, score).await
    }

    pub async fn fund_quiz<W: Wallet>(
        &self,
        wallet: &W,
        quiz_id: &str,
        question_count: u32,
        reward_per_score: u128,
        participants: u32,
    ) -> QuizResult<TxReceipt> {
        require_wallet(wallet)?;
        let value = funding_budget(reward_per_score, participants, question_count)?;
        info!("Funding quiz {} with {} base units", quiz_id, value);
        let call = EscrowCall::CreateQuiz {
            quiz_id: quiz_id.to_string(),
            question_count,
            reward_per_score,
            value,
        };
        wallet.sign_and_send(EscrowTx::new(call)).await
    }

    pub async fn end_quiz<W: Wallet>(&self, wallet: &W, quiz_id: &str, contract_index: u64) -> QuizResult<TxReceipt> {
        require_wallet(wallet)?;
        let result = wallet
            .sign_and_send(EscrowTx::new(EscrowCall::EndQuiz { contract_index }))
            .await;
        if result.is_err() {
            self.forget_contract_index(quiz_id);
        }
        result
    }

    fn begin_claim(&self, key: &ClaimKey) -> QuizResult<String> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get_mut(key) {
            Some(ClaimRecord {
                status: ClaimStatus::Confirmed(receipt),
                ..
            }) => Err(QuizError::AlreadyClaimed {
                tx_hash: receipt.tx_hash.clone(),
            }),
            Some(ClaimRecord {
                status: ClaimStatus::InFlight,
                ..
            }) => Err(QuizError::ClaimInProgress),
            Some(record) => {
                record.status = ClaimStatus::InFlight;
                Ok(record.token.clone())
            }
            None => {
                let token = format!("{:032x}", rand::random::<u128>());
                claims.insert(
                    key.clone(),
                    ClaimRecord {
                        token: token.clone(),
                        status: ClaimStatus::InFlight,
                    },
                );
                Ok(token)
            }
        }
    }

    fn indices(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.contract_indices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn claimable_score(score: i64) -> QuizResult<u64> {
    if score <= 0 {
        return Err(QuizError::Validation(
            "Score must be greater than 0 to claim a reward.".to_string(),
        ));
    }
    Ok(score as u64)
}

fn require_wallet<W: Wallet>(wallet: &W) -> QuizResult<&WalletAddress> {
    wallet.address().ok_or(QuizError::UnauthorizedWallet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::testing::{address, FakeWallet, PLAYER};

    fn wallet(quiz_ids: &[&str]) -> FakeWallet {
        FakeWallet::connected(address(PLAYER), quiz_ids)
    }

    #[test]
    fn budget_includes_ten_percent_buffer() {
        assert_eq!(funding_budget(10, 5, 4).unwrap(), 220);
        assert_eq!(
            funding_budget(1_000_000_000_000_000_000, 3, 10).unwrap(),
            33_000_000_000_000_000_000
        );
        assert!(funding_budget(u128::MAX, 2, 2).is_err());
    }

    #[tokio::test]
    async fn resolves_one_based_index() {
        let wallet = wallet(&["x", "y", "z"]);
        let settlement = SettlementCoordinator::new();
        assert_eq!(settlement.resolve_contract_index(&wallet, "y").await, Ok(2));
        assert_eq!(settlement.resolve_contract_index(&wallet, "x").await, Ok(1));
    }

    #[tokio::test]
    async fn missing_quiz_is_not_found_on_chain() {
        let wallet = wallet(&["x", "y"]);
        let settlement = SettlementCoordinator::new();
        assert_eq!(
            settlement.resolve_contract_index(&wallet, "q").await,
            Err(QuizError::NotFoundOnChain("q".to_string()))
        );
        assert_eq!(settlement.known_contract_index("q"), None);
    }

    #[tokio::test]
    async fn resolved_index_is_cached() {
        let wallet = wallet(&["x", "y", "z"]);
        let settlement = SettlementCoordinator::new();
        settlement.resolve_contract_index(&wallet, "z").await.unwrap();
        settlement.resolve_contract_index(&wallet, "z").await.unwrap();
        assert_eq!(wallet.enumerations(), 1);
    }

    #[tokio::test]
    async fn non_positive_score_never_reaches_the_chain() {
        let wallet = wallet(&["x"]);
        let settlement = SettlementCoordinator::new();
        for score in [0, -3] {
            let err = settlement.submit_score(&wallet, "x", 1, score).await.unwrap_err();
            assert!(matches!(err, QuizError::Validation(_)));
            let err = settlement.settle(&wallet, "x", score).await.unwrap_err();
            assert!(matches!(err, QuizError::Validation(_)));
        }
        assert!(wallet.sent().is_empty());
        assert_eq!(wallet.enumerations(), 0);
    }

    #[tokio::test]
    async fn settle_sends_join_quiz_with_resolved_index() {
        let wallet = wallet(&["x", "y", "z"]);
        let settlement = SettlementCoordinator::new();
        settlement.settle(&wallet, "y", 3).await.unwrap();
        let sent = wallet.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].call,
            EscrowCall::JoinQuiz {
                contract_index: 2,
                score: 3
            }
        );
        assert!(sent[0].idempotency_key.is_some());
    }

    #[tokio::test]
    async fn confirmed_claim_is_not_resent() {
        let wallet = wallet(&["x"]);
        let settlement = SettlementCoordinator::new();
        let receipt = settlement.submit_score(&wallet, "x", 1, 4).await.unwrap();
        let err = settlement.submit_score(&wallet, "x", 1, 4).await.unwrap_err();
        assert_eq!(
            err,
            QuizError::AlreadyClaimed {
                tx_hash: receipt.tx_hash
            }
        );
        assert_eq!(wallet.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_claim_retries_with_same_token() {
        let wallet = wallet(&["x"]);
        let settlement = SettlementCoordinator::new();
        wallet.fail_next_send(QuizError::ChainTransaction("nonce too low".to_string()));

        let err = settlement.settle(&wallet, "x", 2).await.unwrap_err();
        assert_eq!(err, QuizError::ChainTransaction("nonce too low".to_string()));
        assert_eq!(settlement.known_contract_index("x"), None);

        settlement.settle(&wallet, "x", 2).await.unwrap();
        let sent = wallet.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].idempotency_key, sent[1].idempotency_key);
        assert_eq!(wallet.enumerations(), 2);
    }

    #[tokio::test]
    async fn fund_quiz_attaches_budget() {
        let wallet = wallet(&[]);
        let settlement = SettlementCoordinator::new();
        settlement.fund_quiz(&wallet, "quiz-1", 4, 10, 5).await.unwrap();
        assert_eq!(
            wallet.sent()[0].call,
            EscrowCall::CreateQuiz {
                quiz_id: "quiz-1".to_string(),
                question_count: 4,
                reward_per_score: 10,
                value: 220,
            }
        );
    }

    #[tokio::test]
    async fn every_chain_operation_requires_a_wallet() {
        let wallet = FakeWallet::disconnected();
        let settlement = SettlementCoordinator::new();
        assert_eq!(
            settlement.resolve_contract_index(&wallet, "x").await,
            Err(QuizError::UnauthorizedWallet)
        );
        assert_eq!(
            settlement.submit_score(&wallet, "x", 1, 5).await,
            Err(QuizError::UnauthorizedWallet)
        );
        assert_eq!(
            settlement.fund_quiz(&wallet, "x", 1, 1, 1).await,
            Err(QuizError::UnauthorizedWallet)
        );
        assert_eq!(settlement.end_quiz(&wallet, "x", 1).await, Err(QuizError::UnauthorizedWallet));
    }
}
