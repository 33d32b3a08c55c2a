//! In-memory stand-ins for the quiz store and the signer, shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::quiz::api::{CreateQuizRequest, LeaderboardData, QuizApi, QuizStatusUpdate, ScoreReport, Submission};
use crate::quiz::chain::{EscrowTx, OnChainQuizzes, TxReceipt, Wallet};
use crate::quiz::{Participant, Question, Quiz, QuizError, QuizOption, QuizResult, WalletAddress};

pub const CREATOR: &str = "0x00000000000000000000000000000000000000c0";
pub const PLAYER: &str = "0x00000000000000000000000000000000000000a1";

pub fn address(s: &str) -> WalletAddress {
    s.parse().unwrap()
}

/// A quiz with `n` questions `Q1..Qn`, each offering options A, B and C.
pub fn sample_quiz(id: &str, n: usize) -> Quiz {
    let questions = (1..=n)
        .map(|i| {
            Question::new(
                format!("Q{}", i),
                format!("Question {}", i),
                vec![
                    QuizOption::new("A", "alpha"),
                    QuizOption::new("B", "beta"),
                    QuizOption::new("C", "gamma"),
                ],
            )
        })
        .collect();
    let mut quiz = Quiz::new(id, questions);
    quiz.creator_wallet = Some(CREATOR.to_string());
    quiz
}

#[derive(Default)]
pub struct FakeApiState {
    pub quiz: Quiz,
    pub participants: Vec<Participant>,
    pub created: Vec<CreateQuizRequest>,
    pub updates: Vec<QuizStatusUpdate>,
    pub submissions: Vec<Submission>,
    pub score: i64,
    pub fail_next: VecDeque<QuizError>,
}

#[derive(Default)]
pub struct FakeApi {
    pub state: Mutex<FakeApiState>,
}

impl FakeApi {
    pub fn with_quiz(quiz: Quiz) -> Self {
        let api = Self::default();
        api.state.lock().unwrap().quiz = quiz;
        api
    }

    pub fn set_score(&self, score: i64) {
        self.state.lock().unwrap().score = score;
    }

    pub fn fail_next(&self, err: QuizError) {
        self.state.lock().unwrap().fail_next.push_back(err);
    }

    pub fn updates(&self) -> Vec<QuizStatusUpdate> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    fn take_failure(&self) -> QuizResult<()> {
        match self.state.lock().unwrap().fail_next.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl QuizApi for FakeApi {
    async fn create_quiz(&self, request: &CreateQuizRequest) -> QuizResult<String> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.created.push(request.clone());
        Ok(state.quiz.quiz_id.clone())
    }

    async fn verify_quiz(&self, _quiz_id: &str, _wallet: &WalletAddress) -> QuizResult<Quiz> {
        self.take_failure()?;
        Ok(self.state.lock().unwrap().quiz.clone())
    }

    async fn join_quiz(&self, _quiz_id: &str, wallet: &WalletAddress, participant_name: &str) -> QuizResult<()> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        if !state.quiz.is_open() {
            return Err(QuizError::QuizNotOpen {
                finished: state.quiz.is_finished,
            });
        }
        if state.participants.iter().any(|p| p.wallet_address == wallet.as_str()) {
            return Err(QuizError::AlreadyJoined);
        }
        state
            .participants
            .push(Participant::new(wallet.as_str(), participant_name, 0));
        Ok(())
    }

    async fn update_quiz(&self, _quiz_id: &str, update: QuizStatusUpdate) -> QuizResult<()> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.updates.push(update);
        if let Some(is_public) = update.is_public {
            state.quiz.is_public = is_public;
        }
        if let Some(is_finished) = update.is_finished {
            state.quiz.is_finished = is_finished;
        }
        Ok(())
    }

    async fn submit_answers(&self, submission: &Submission) -> QuizResult<ScoreReport> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.submissions.push(submission.clone());
        Ok(ScoreReport {
            quiz_id: submission.quiz_id.clone(),
            score: state.score,
        })
    }

    async fn leaderboard(&self, _quiz_id: &str) -> QuizResult<LeaderboardData> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        Ok(LeaderboardData {
            quiz: Some(state.quiz.clone()),
            participants: state.participants.clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeWallet {
    pub address: Option<WalletAddress>,
    pub quizzes: Mutex<OnChainQuizzes>,
    pub sent: Mutex<Vec<EscrowTx>>,
    pub enumerations: Mutex<usize>,
    pub fail_sends: Mutex<VecDeque<QuizError>>,
}

impl FakeWallet {
    pub fn connected(address: WalletAddress, quiz_ids: &[&str]) -> Self {
        let wallet = Self {
            address: Some(address),
            ..Self::default()
        };
        wallet.set_quizzes(quiz_ids);
        wallet
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn set_quizzes(&self, quiz_ids: &[&str]) {
        let mut quizzes = self.quizzes.lock().unwrap();
        quizzes.ids = (1..=quiz_ids.len()).map(|i| i.to_string()).collect();
        quizzes.quiz_ids = quiz_ids.iter().map(|q| q.to_string()).collect();
    }

    pub fn fail_next_send(&self, err: QuizError) {
        self.fail_sends.lock().unwrap().push_back(err);
    }

    pub fn sent(&self) -> Vec<EscrowTx> {
        self.sent.lock().unwrap().clone()
    }

    pub fn enumerations(&self) -> usize {
        *self.enumerations.lock().unwrap()
    }
}

impl Wallet for FakeWallet {
    fn address(&self) -> Option<&WalletAddress> {
        self.address.as_ref()
    }

    async fn all_quizzes(&self) -> QuizResult<OnChainQuizzes> {
        if self.address.is_none() {
            return Err(QuizError::UnauthorizedWallet);
        }
        *self.enumerations.lock().unwrap() += 1;
        Ok(self.quizzes.lock().unwrap().clone())
    }

    async fn sign_and_send(&self, tx: EscrowTx) -> QuizResult<TxReceipt> {
        if self.address.is_none() {
            return Err(QuizError::UnauthorizedWallet);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(tx);
        let n = sent.len();
        drop(sent);
        if let Some(err) = self.fail_sends.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(TxReceipt {
            tx_hash: format!("0xtx{}", n),
            block_number: Some(n as u64),
        })
    }
}
