use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::quiz::api::{CreateQuizRequest, QuizApi, QuizStatusUpdate};
use crate::quiz::chain::{parse_units, TxReceipt, Wallet};
use crate::quiz::settlement::{funding_budget, SettlementCoordinator};
use crate::quiz::{Quiz, QuizError, QuizResult, WalletAddress};

pub const MAX_QUESTIONS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftField {
    CreatorName,
    Prompt,
    Participants,
    QuestionCount,
    RewardPerScore,
}

/// Quiz creation form, filled one field at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizDraft {
    pub creator_name: Option<String>,
    pub prompt: Option<String>,
    pub participants: Option<u32>,
    pub question_count: Option<u32>,
    pub reward_per_score: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DraftLimits {
    pub max_questions: u32,
    pub reward_decimals: u32,
}

impl Default for DraftLimits {
    fn default() -> Self {
        Self {
            max_questions: MAX_QUESTIONS,
            reward_decimals: 18,
        }
    }
}

/// A validated draft with amounts converted to base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizPlan {
    pub creator_name: String,
    pub prompt: String,
    pub participants: u32,
    pub question_count: u32,
    pub reward_per_score: u128,
    pub total_cost: u128,
}

impl QuizDraft {
    pub fn next_field(&self) -> Option<DraftField> {
        if self.creator_name.is_none() {
            Some(DraftField::CreatorName)
        } else if self.prompt.is_none() {
            Some(DraftField::Prompt)
        } else if self.participants.is_none() {
            Some(DraftField::Participants)
        } else if self.question_count.is_none() {
            Some(DraftField::QuestionCount)
        } else if self.reward_per_score.is_none() {
            Some(DraftField::RewardPerScore)
        } else {
            None
        }
    }

    /// Stores `input` into `field`, rejecting values that can never validate.
    pub fn fill(&mut self, field: DraftField, input: &str, limits: &DraftLimits) -> QuizResult<()> {
        let input = input.trim();
        if input.is_empty() {
            return Err(QuizError::Validation("All fields are required".to_string()));
        }
        match field {
            DraftField::CreatorName => self.creator_name = Some(input.to_string()),
            DraftField::Prompt => self.prompt = Some(input.to_string()),
            DraftField::Participants => self.participants = Some(parse_count(input, "Number of participants", u32::MAX)?),
            DraftField::QuestionCount => {
                self.question_count = Some(parse_count(input, "Question count", limits.max_questions)?)
            }
            DraftField::RewardPerScore => {
                parse_units(input, limits.reward_decimals)?;
                self.reward_per_score = Some(input.to_string());
            }
        }
        Ok(())
    }

    pub fn validate(&self, limits: &DraftLimits) -> QuizResult<QuizPlan> {
        let required = || QuizError::Validation("All fields are required".to_string());
        let creator_name = self.creator_name.clone().filter(|s| !s.trim().is_empty()).ok_or_else(required)?;
        let prompt = self.prompt.clone().filter(|s| !s.trim().is_empty()).ok_or_else(required)?;
        let participants = self.participants.ok_or_else(required)?;
        let question_count = self.question_count.ok_or_else(required)?;
        let reward = self.reward_per_score.as_deref().ok_or_else(required)?;

        if participants == 0 {
            return Err(QuizError::Validation("Number of participants must be at least 1".to_string()));
        }
        if question_count == 0 || question_count > limits.max_questions {
            return Err(QuizError::Validation(format!(
                "Question count must be between 1 and {}",
                limits.max_questions
            )));
        }
        let reward_per_score = parse_units(reward, limits.reward_decimals)?;
        if reward_per_score == 0 {
            return Err(QuizError::Validation("Reward per score must be greater than 0".to_string()));
        }
        let total_cost = funding_budget(reward_per_score, participants, question_count)?;

        Ok(QuizPlan {
            creator_name,
            prompt,
            participants,
            question_count,
            reward_per_score,
            total_cost,
        })
    }
}

/// Funding terms recorded in the quiz document at creation time.
fn plan_from_document(quiz: &Quiz) -> Option<QuizPlan> {
    let participants = quiz.num_participants.filter(|n| *n > 0)?;
    let question_count = u32::try_from(quiz.question_count()).ok().filter(|n| *n > 0)?;
    let reward_per_score = quiz
        .reward_per_score
        .as_deref()?
        .trim()
        .parse::<u128>()
        .ok()
        .filter(|r| *r > 0)?;
    let total_cost = funding_budget(reward_per_score, participants, question_count).ok()?;
    Some(QuizPlan {
        creator_name: quiz.creator_name.clone(),
        prompt: String::new(),
        participants,
        question_count,
        reward_per_score,
        total_cost,
    })
}

fn parse_count(input: &str, what: &str, max: u32) -> QuizResult<u32> {
    let n: u32 = input
        .parse()
        .map_err(|_| QuizError::Validation(format!("{} must be a whole number", what)))?;
    if n == 0 {
        return Err(QuizError::Validation(format!("{} cannot be 0", what)));
    }
    if n > max {
        return Err(QuizError::Validation(format!("{} cannot be more than {}", what, max)));
    }
    Ok(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Open,
    Closed,
}

/// Outcome of closing a quiz. Both halves run even if the first one fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub api: QuizResult<()>,
    pub chain: QuizResult<TxReceipt>,
}

impl StopReport {
    pub fn is_complete(&self) -> bool {
        self.api.is_ok() && self.chain.is_ok()
    }
}

/// Creator-side state of one quiz: create, fund, open, close.
#[derive(Debug, Clone)]
pub struct QuizLifecycle {
    quiz_id: String,
    creator: WalletAddress,
    plan: Option<QuizPlan>,
    state: LifecycleState,
    funded: bool,
    stop_requested: bool,
    contract_index: Option<u64>,
    closed_on_chain: bool,
}

impl QuizLifecycle {
    /// Creates the quiz in the store. Funding is a separate step so that it
    /// can be retried without creating a second quiz.
    pub async fn create<A: QuizApi, W: Wallet>(api: &A, wallet: &W, plan: QuizPlan) -> QuizResult<Self> {
        let creator = wallet.address().cloned().ok_or(QuizError::UnauthorizedWallet)?;
        let request = CreateQuizRequest {
            creator_name: plan.creator_name.clone(),
            prompt: plan.prompt.clone(),
            num_participants: plan.participants,
            question_count: plan.question_count,
            reward_per_score: plan.reward_per_score.to_string(),
            creator_wallet: creator.to_string(),
            total_cost: plan.total_cost.to_string(),
        };
        let quiz_id = api.create_quiz(&request).await?;
        info!("Quiz {} created by {}", quiz_id, creator);
        Ok(Self {
            quiz_id,
            creator,
            plan: Some(plan),
            state: LifecycleState::Created,
            funded: false,
            stop_requested: false,
            contract_index: None,
            closed_on_chain: false,
        })
    }

    /// Rebuilds the controller for an existing quiz from its stored document.
    ///
    /// A quiz that is still running counts as funded only if the escrow
    /// contract lists it. A finished quiz is taken as fully closed.
    pub async fn resume<A: QuizApi, W: Wallet>(
        api: &A,
        settlement: &SettlementCoordinator,
        wallet: &W,
        quiz_id: &str,
    ) -> QuizResult<Self> {
        let creator = wallet.address().cloned().ok_or(QuizError::UnauthorizedWallet)?;
        let quiz = api.verify_quiz(quiz_id, &creator).await?;
        let owner = quiz
            .creator_wallet
            .as_deref()
            .and_then(|o| o.parse::<WalletAddress>().ok());
        if owner.as_ref() != Some(&creator) {
            return Err(QuizError::UnauthorizedWallet);
        }

        let state = if quiz.is_finished {
            LifecycleState::Closed
        } else if quiz.is_public {
            LifecycleState::Open
        } else {
            LifecycleState::Created
        };
        let contract_index = if quiz.is_finished {
            None
        } else {
            match settlement.resolve_contract_index(wallet, quiz_id).await {
                Ok(index) => Some(index),
                Err(QuizError::NotFoundOnChain(_)) => None,
                Err(err) => return Err(err),
            }
        };
        info!(
            "Quiz {} resumed ({:?}, contract index {:?})",
            quiz_id, state, contract_index
        );

        Ok(Self {
            quiz_id: quiz_id.to_string(),
            creator,
            plan: plan_from_document(&quiz),
            state,
            funded: quiz.is_finished || contract_index.is_some(),
            stop_requested: quiz.is_finished,
            contract_index,
            closed_on_chain: quiz.is_finished,
        })
    }

    pub fn quiz_id(&self) -> &str {
        &self.quiz_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_funded(&self) -> bool {
        self.funded
    }

    pub fn contract_index(&self) -> Option<u64> {
        self.contract_index
    }

    pub fn can_stop(&self) -> bool {
        self.state == LifecycleState::Open && !self.stop_requested
    }

    /// Whether the on-chain half of closing still needs a manual retry.
    pub fn needs_chain_retry(&self) -> bool {
        self.stop_requested && !self.closed_on_chain
    }

    pub async fn fund<W: Wallet>(&mut self, settlement: &SettlementCoordinator, wallet: &W) -> QuizResult<TxReceipt> {
        self.require_creator(wallet)?;
        if self.funded {
            return Err(QuizError::InvalidState("the quiz is already funded"));
        }
        if self.state == LifecycleState::Closed || self.stop_requested {
            return Err(QuizError::QuizNotOpen { finished: true });
        }
        let plan = self
            .plan
            .as_ref()
            .ok_or(QuizError::InvalidState("the stored quiz has no funding details"))?;
        let receipt = settlement
            .fund_quiz(
                wallet,
                &self.quiz_id,
                plan.question_count,
                plan.reward_per_score,
                plan.participants,
            )
            .await?;
        self.funded = true;
        Ok(receipt)
    }

    pub async fn start<A: QuizApi, W: Wallet>(&mut self, api: &A, wallet: &W) -> QuizResult<()> {
        self.require_creator(wallet)?;
        if self.state == LifecycleState::Closed || self.stop_requested {
            return Err(QuizError::QuizNotOpen { finished: true });
        }
        api.update_quiz(&self.quiz_id, QuizStatusUpdate::open()).await?;
        self.state = LifecycleState::Open;
        info!("Quiz {} is open", self.quiz_id);
        Ok(())
    }

    /// Closes the quiz in the store, then on the escrow contract.
    ///
    /// Can only be invoked once; what fails afterwards is repeated with
    /// [`retry_close`](Self::retry_close).
    pub async fn stop<A: QuizApi, W: Wallet>(
        &mut self,
        api: &A,
        settlement: &SettlementCoordinator,
        wallet: &W,
    ) -> QuizResult<StopReport> {
        self.require_creator(wallet)?;
        if self.stop_requested {
            return Err(QuizError::InvalidState("the quiz is already being closed"));
        }
        if self.state != LifecycleState::Open {
            return Err(QuizError::InvalidState("the quiz is not open"));
        }
        self.stop_requested = true;

        let api_result = self.finish_in_store(api).await;
        let chain = self.close_on_chain(settlement, wallet).await;
        Ok(StopReport { api: api_result, chain })
    }

    pub async fn retry_close<A: QuizApi, W: Wallet>(
        &mut self,
        api: &A,
        settlement: &SettlementCoordinator,
        wallet: &W,
    ) -> QuizResult<StopReport> {
        self.require_creator(wallet)?;
        if !self.stop_requested {
            return Err(QuizError::InvalidState("the quiz has not been stopped"));
        }
        let api_result = if self.state == LifecycleState::Closed {
            Ok(())
        } else {
            self.finish_in_store(api).await
        };
        let chain = if self.closed_on_chain {
            Err(QuizError::InvalidState("the quiz is already closed on chain"))
        } else {
            self.close_on_chain(settlement, wallet).await
        };
        Ok(StopReport { api: api_result, chain })
    }

    async fn finish_in_store<A: QuizApi>(&mut self, api: &A) -> QuizResult<()> {
        let result = api.update_quiz(&self.quiz_id, QuizStatusUpdate::finish()).await;
        match &result {
            Ok(()) => {
                self.state = LifecycleState::Closed;
                info!("Quiz {} is finished", self.quiz_id);
            }
            Err(err) => warn!("Finishing quiz {} in the store failed: {}", self.quiz_id, err),
        }
        result
    }

    async fn close_on_chain<W: Wallet>(&mut self, settlement: &SettlementCoordinator, wallet: &W) -> QuizResult<TxReceipt> {
        let index = settlement.resolve_contract_index(wallet, &self.quiz_id).await?;
        self.contract_index = Some(index);
        let receipt = settlement.end_quiz(wallet, &self.quiz_id, index).await?;
        self.closed_on_chain = true;
        info!("Quiz {} closed on chain in {}", self.quiz_id, receipt.tx_hash);
        Ok(receipt)
    }

    fn require_creator<W: Wallet>(&self, wallet: &W) -> QuizResult<()> {
        match wallet.address() {
            Some(address) if *address == self.creator => Ok(()),
            _ => Err(QuizError::UnauthorizedWallet),
        }
    }
}
