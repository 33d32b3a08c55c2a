use log::{info, warn};

use crate::quiz::api::{QuizApi, Submission};
use crate::quiz::chain::Wallet;
use crate::quiz::settlement::SettlementCoordinator;
use crate::quiz::{Answer, Answers, Question, Quiz, QuizError, QuizResult, WalletAddress};

pub const DEFAULT_QUESTION_SECONDS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    NotJoined,
    Joined,
    Answering { index: usize },
    Submitted(SubmissionState),
}

/// Progress of a finished session through scoring and the reward claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionState {
    Pending,
    Sending,
    /// The quiz store did not accept the answers; they have to be sent again.
    Failed { reason: String },
    Scored { score: i64 },
    Claiming { score: i64 },
    ClaimFailed { score: i64, reason: String },
    NothingToClaim { score: i64 },
    Settled { score: i64, tx_hash: String },
}

impl SubmissionState {
    pub fn score(&self) -> Option<i64> {
        match self {
            SubmissionState::Scored { score }
            | SubmissionState::Claiming { score }
            | SubmissionState::ClaimFailed { score, .. }
            | SubmissionState::NothingToClaim { score }
            | SubmissionState::Settled { score, .. } => Some(*score),
            _ => None,
        }
    }

    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            SubmissionState::Failed { .. } | SubmissionState::ClaimFailed { .. }
        )
    }
}

/// Where the session went after leaving a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Question(usize),
    Finished,
}

/// A button press on one specific question. Presses on a question the
/// session has already left are rejected, never applied to the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionAction {
    Choose { index: usize, key: String },
    Next { index: usize },
}

impl QuestionAction {
    pub fn index(&self) -> usize {
        match self {
            QuestionAction::Choose { index, .. } | QuestionAction::Next { index } => *index,
        }
    }

    /// Compact form for chat button payloads: `c:{index}:{key}` or `n:{index}`.
    pub fn encode(&self) -> String {
        match self {
            QuestionAction::Choose { index, key } => format!("c:{}:{}", index, key),
            QuestionAction::Next { index } => format!("n:{}", index),
        }
    }

    pub fn decode(data: &str) -> Option<Self> {
        let mut parts = data.splitn(3, ':');
        let kind = parts.next()?;
        let index = parts.next()?.parse().ok()?;
        match (kind, parts.next()) {
            ("c", Some(key)) if !key.is_empty() => Some(QuestionAction::Choose {
                index,
                key: key.to_string(),
            }),
            ("n", None) => Some(QuestionAction::Next { index }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Remaining(u32),
    TimedOut(Step),
}

/// One participant's run through one quiz.
///
/// Holds the in-flight answers and the countdown for the current question.
/// Nothing here touches the network; see [`join_quiz`] and [`submit`].
#[derive(Debug, Clone)]
pub struct ParticipantSession {
    quiz: Quiz,
    wallet: WalletAddress,
    participant_name: String,
    phase: SessionPhase,
    answers: Answers,
    question_seconds: u32,
    seconds_left: u32,
}

impl ParticipantSession {
    pub fn new(quiz: Quiz, wallet: WalletAddress, question_seconds: u32) -> Self {
        let question_seconds = question_seconds.max(1);
        Self {
            quiz,
            wallet,
            participant_name: String::new(),
            phase: SessionPhase::NotJoined,
            answers: Answers::new(),
            question_seconds,
            seconds_left: question_seconds,
        }
    }

    pub fn quiz(&self) -> &Quiz {
        &self.quiz
    }

    pub fn wallet(&self) -> &WalletAddress {
        &self.wallet
    }

    pub fn participant_name(&self) -> &str {
        &self.participant_name
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn answers(&self) -> &Answers {
        &self.answers
    }

    pub fn seconds_left(&self) -> u32 {
        self.seconds_left
    }

    pub fn question_seconds(&self) -> u32 {
        self.question_seconds
    }

    pub fn current_index(&self) -> Option<usize> {
        match self.phase {
            SessionPhase::Answering { index } => Some(index),
            _ => None,
        }
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.current_index().and_then(|i| self.quiz.questions.get(i))
    }

    pub fn current_answer(&self) -> Option<&Answer> {
        self.current_question().and_then(|q| self.answers.get(&q.id))
    }

    pub fn submission(&self) -> Option<&SubmissionState> {
        match &self.phase {
            SessionPhase::Submitted(state) => Some(state),
            _ => None,
        }
    }

    pub fn ensure_joinable(&self) -> QuizResult<()> {
        if self.phase != SessionPhase::NotJoined {
            return Err(QuizError::AlreadyJoined);
        }
        if !self.quiz.is_open() {
            return Err(QuizError::QuizNotOpen {
                finished: self.quiz.is_finished,
            });
        }
        Ok(())
    }

    /// Records a successful registration with the quiz store.
    pub fn mark_joined(&mut self, participant_name: &str) -> QuizResult<()> {
        self.ensure_joinable()?;
        self.participant_name = participant_name.to_string();
        self.phase = SessionPhase::Joined;
        Ok(())
    }

    /// Presents the first question with a fresh countdown.
    pub fn begin(&mut self) -> QuizResult<Step> {
        if self.phase != SessionPhase::Joined {
            return Err(QuizError::InvalidState("the quiz has not been joined"));
        }
        self.seconds_left = self.question_seconds;
        if self.quiz.questions.is_empty() {
            self.phase = SessionPhase::Submitted(SubmissionState::Pending);
            return Ok(Step::Finished);
        }
        self.phase = SessionPhase::Answering { index: 0 };
        Ok(Step::Question(0))
    }

    /// Replaces any earlier answer for the question. Only the question on
    /// screen accepts answers; option keys are passed through unchecked.
    pub fn record_answer(&mut self, question_id: &str, option_key: &str) -> QuizResult<()> {
        let current = self
            .current_question()
            .ok_or(QuizError::InvalidState("no question is being answered"))?;
        if current.id != question_id {
            return Err(QuizError::InvalidState("that question is no longer active"));
        }
        self.answers
            .insert(question_id.to_string(), Answer::Selected(option_key.to_string()));
        Ok(())
    }

    /// Applies a press made on question `index`. Returns the step taken for
    /// `Next` and `None` for a choice.
    pub fn apply(&mut self, action: &QuestionAction) -> QuizResult<Option<Step>> {
        if self.current_index() != Some(action.index()) {
            return Err(QuizError::InvalidState("that question is no longer active"));
        }
        match action {
            QuestionAction::Choose { index, key } => {
                let question_id = self.quiz.questions[*index].id.clone();
                self.record_answer(&question_id, key)?;
                Ok(None)
            }
            QuestionAction::Next { .. } => self.advance().map(Some),
        }
    }

    /// Leaves the current question. An unanswered question is recorded as
    /// `no_answer`, and the countdown restarts for whatever comes next.
    pub fn advance(&mut self) -> QuizResult<Step> {
        let index = self
            .current_index()
            .ok_or(QuizError::InvalidState("no question is being answered"))?;
        let question_id = self.quiz.questions[index].id.clone();
        self.answers.entry(question_id).or_insert(Answer::NoAnswer);
        self.seconds_left = self.question_seconds;

        if index + 1 < self.quiz.questions.len() {
            self.phase = SessionPhase::Answering { index: index + 1 };
            Ok(Step::Question(index + 1))
        } else {
            self.phase = SessionPhase::Submitted(SubmissionState::Pending);
            Ok(Step::Finished)
        }
    }

    /// One second of countdown. Reaching zero is the same as [`advance`](Self::advance).
    pub fn tick(&mut self) -> Tick {
        if self.current_index().is_none() {
            return Tick::Idle;
        }
        self.seconds_left = self.seconds_left.saturating_sub(1);
        if self.seconds_left > 0 {
            return Tick::Remaining(self.seconds_left);
        }
        match self.advance() {
            Ok(step) => Tick::TimedOut(step),
            Err(_) => Tick::Idle,
        }
    }

    fn take_submission(&mut self) -> QuizResult<Submission> {
        match &self.phase {
            SessionPhase::Submitted(SubmissionState::Pending)
            | SessionPhase::Submitted(SubmissionState::Failed { .. }) => {
                self.phase = SessionPhase::Submitted(SubmissionState::Sending);
                Ok(Submission {
                    quiz_id: self.quiz.quiz_id.clone(),
                    wallet_address: self.wallet.clone(),
                    answers: self.answers.clone(),
                })
            }
            _ => Err(QuizError::InvalidState("answers are not waiting to be submitted")),
        }
    }

    fn take_claim(&mut self) -> Option<i64> {
        match &self.phase {
            SessionPhase::Submitted(SubmissionState::Scored { score })
            | SessionPhase::Submitted(SubmissionState::ClaimFailed { score, .. }) => {
                let score = *score;
                self.phase = SessionPhase::Submitted(SubmissionState::Claiming { score });
                Some(score)
            }
            _ => None,
        }
    }

    fn set_submission(&mut self, state: SubmissionState) {
        self.phase = SessionPhase::Submitted(state);
    }
}

/// Verifies the quiz with the store and opens a session for the wallet.
pub async fn open_session<A: QuizApi>(
    api: &A,
    quiz_id: &str,
    wallet: &WalletAddress,
    question_seconds: u32,
) -> QuizResult<ParticipantSession> {
    let quiz = api.verify_quiz(quiz_id, wallet).await?;
    let session = ParticipantSession::new(quiz, wallet.clone(), question_seconds);
    if session.quiz().is_finished {
        return Err(QuizError::QuizNotOpen { finished: true });
    }
    Ok(session)
}

/// Registers the participant with the quiz store, then marks the session joined.
pub async fn join_quiz<A: QuizApi>(api: &A, session: &mut ParticipantSession, participant_name: &str) -> QuizResult<()> {
    let participant_name = participant_name.trim();
    if participant_name.is_empty() {
        return Err(QuizError::Validation("Please enter your name.".to_string()));
    }
    session.ensure_joinable()?;
    api.join_quiz(&session.quiz.quiz_id, &session.wallet, participant_name)
        .await?;
    info!(
        "{} joined quiz {} as {}",
        session.wallet, session.quiz.quiz_id, participant_name
    );
    session.mark_joined(participant_name)
}

/// Sends the answers for scoring and claims the reward for the score.
///
/// Calling it again after a failure resumes at the failed step: answers are
/// resent only if the store never scored them.
pub async fn submit<A: QuizApi, W: Wallet>(
    api: &A,
    settlement: &SettlementCoordinator,
    wallet: &W,
    session: &mut ParticipantSession,
) -> QuizResult<SubmissionState> {
    if matches!(
        session.submission(),
        Some(SubmissionState::Pending) | Some(SubmissionState::Failed { .. })
    ) {
        let submission = session.take_submission()?;
        match api.submit_answers(&submission).await {
            Ok(report) => {
                info!("Quiz {} scored {} for {}", report.quiz_id, report.score, session.wallet);
                session.set_submission(SubmissionState::Scored { score: report.score });
            }
            Err(err) => {
                warn!("Submitting answers for quiz {} failed: {}", submission.quiz_id, err);
                session.set_submission(SubmissionState::Failed {
                    reason: err.to_string(),
                });
                return Err(err);
            }
        }
    }

    let score = match session.take_claim() {
        Some(score) => score,
        None => {
            return session
                .submission()
                .cloned()
                .ok_or(QuizError::InvalidState("the quiz has not been finished"));
        }
    };

    if score <= 0 {
        let state = SubmissionState::NothingToClaim { score };
        session.set_submission(state.clone());
        return Ok(state);
    }

    let quiz_id = session.quiz.quiz_id.clone();
    let state = match settlement.settle(wallet, &quiz_id, score).await {
        Ok(receipt) => SubmissionState::Settled {
            score,
            tx_hash: receipt.tx_hash,
        },
        Err(QuizError::AlreadyClaimed { tx_hash }) => SubmissionState::Settled { score, tx_hash },
        Err(err) => {
            session.set_submission(SubmissionState::ClaimFailed {
                score,
                reason: err.to_string(),
            });
            return Err(err);
        }
    };
    session.set_submission(state.clone());
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::chain::EscrowCall;
    use crate::quiz::testing::{address, sample_quiz, FakeApi, FakeWallet, PLAYER};
    use crate::quiz::timer::Repeating;
    use std::ops::ControlFlow;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn open_quiz(n: usize) -> Quiz {
        let mut quiz = sample_quiz("quiz-1", n);
        quiz.is_public = true;
        quiz
    }

    fn answering(n: usize) -> ParticipantSession {
        let mut session = ParticipantSession::new(open_quiz(n), address(PLAYER), DEFAULT_QUESTION_SECONDS);
        session.mark_joined("ana").unwrap();
        session.begin().unwrap();
        session
    }

    fn answer(session: &ParticipantSession, id: &str) -> Option<String> {
        session.answers().get(id).cloned().map(String::from)
    }

    #[test]
    fn timed_out_question_is_recorded_as_no_answer() {
        let mut session = answering(3);

        session.record_answer("Q1", "A").unwrap();
        assert_eq!(session.advance().unwrap(), Step::Question(1));

        for left in (1..DEFAULT_QUESTION_SECONDS).rev() {
            assert_eq!(session.tick(), Tick::Remaining(left));
        }
        assert_eq!(session.tick(), Tick::TimedOut(Step::Question(2)));

        session.record_answer("Q3", "C").unwrap();
        assert_eq!(session.advance().unwrap(), Step::Finished);

        assert_eq!(answer(&session, "Q1").as_deref(), Some("A"));
        assert_eq!(answer(&session, "Q2").as_deref(), Some("no_answer"));
        assert_eq!(answer(&session, "Q3").as_deref(), Some("C"));
        assert_eq!(session.submission(), Some(&SubmissionState::Pending));
    }

    #[test]
    fn advancing_resets_the_countdown() {
        let mut session = answering(2);
        session.tick();
        session.tick();
        assert_eq!(session.seconds_left(), DEFAULT_QUESTION_SECONDS - 2);
        session.advance().unwrap();
        assert_eq!(session.seconds_left(), DEFAULT_QUESTION_SECONDS);
    }

    #[test]
    fn later_answer_overwrites_earlier_one() {
        let mut session = answering(1);
        session.record_answer("Q1", "A").unwrap();
        session.record_answer("Q1", "not-a-key").unwrap();
        assert_eq!(answer(&session, "Q1").as_deref(), Some("not-a-key"));
    }

    #[test]
    fn left_questions_do_not_accept_answers() {
        let mut session = answering(2);
        session.advance().unwrap();
        assert!(session.record_answer("Q1", "B").is_err());
        assert_eq!(answer(&session, "Q1").as_deref(), Some("no_answer"));
    }

    #[test]
    fn ticks_after_finishing_are_ignored() {
        let mut session = answering(1);
        session.advance().unwrap();
        assert_eq!(session.tick(), Tick::Idle);
        assert!(session.advance().is_err());
    }

    #[test]
    fn empty_quiz_finishes_immediately() {
        let mut session = ParticipantSession::new(open_quiz(0), address(PLAYER), 30);
        session.mark_joined("ana").unwrap();
        assert_eq!(session.begin().unwrap(), Step::Finished);
    }

    #[tokio::test]
    async fn finished_quiz_rejects_join_without_calling_the_store() {
        let mut quiz = sample_quiz("quiz-1", 2);
        quiz.is_finished = true;
        let api = FakeApi::with_quiz(quiz.clone());
        let mut session = ParticipantSession::new(quiz, address(PLAYER), 30);

        let err = join_quiz(&api, &mut session, "ana").await.unwrap_err();
        assert_eq!(err, QuizError::QuizNotOpen { finished: true });
        assert_eq!(session.phase(), &SessionPhase::NotJoined);
        assert!(api.state.lock().unwrap().participants.is_empty());
    }

    #[tokio::test]
    async fn open_session_refuses_finished_quiz() {
        let mut quiz = sample_quiz("quiz-1", 2);
        quiz.is_finished = true;
        let api = FakeApi::with_quiz(quiz);
        let err = open_session(&api, "quiz-1", &address(PLAYER), 30).await.unwrap_err();
        assert_eq!(err, QuizError::QuizNotOpen { finished: true });
    }

    #[tokio::test]
    async fn second_join_from_same_wallet_conflicts() {
        let api = FakeApi::with_quiz(open_quiz(2));
        let mut first = ParticipantSession::new(open_quiz(2), address(PLAYER), 30);
        join_quiz(&api, &mut first, "ana").await.unwrap();
        assert_eq!(first.phase(), &SessionPhase::Joined);

        let mut second = ParticipantSession::new(open_quiz(2), address(PLAYER), 30);
        let err = join_quiz(&api, &mut second, "ana again").await.unwrap_err();
        assert_eq!(err, QuizError::AlreadyJoined);
        assert_eq!(second.phase(), &SessionPhase::NotJoined);
    }

    #[tokio::test]
    async fn blank_name_is_a_validation_error() {
        let api = FakeApi::with_quiz(open_quiz(1));
        let mut session = ParticipantSession::new(open_quiz(1), address(PLAYER), 30);
        let err = join_quiz(&api, &mut session, "   ").await.unwrap_err();
        assert!(matches!(err, QuizError::Validation(_)));
    }

    #[tokio::test]
    async fn submit_scores_and_claims_once() {
        let api = FakeApi::with_quiz(open_quiz(1));
        api.set_score(3);
        let wallet = FakeWallet::connected(address(PLAYER), &["other", "quiz-1"]);
        let settlement = SettlementCoordinator::new();
        let mut session = answering(1);
        session.record_answer("Q1", "B").unwrap();
        session.advance().unwrap();

        let state = submit(&api, &settlement, &wallet, &mut session).await.unwrap();
        assert_eq!(
            state,
            SubmissionState::Settled {
                score: 3,
                tx_hash: "0xtx1".to_string()
            }
        );
        assert_eq!(
            wallet.sent()[0].call,
            EscrowCall::JoinQuiz {
                contract_index: 2,
                score: 3
            }
        );

        // nothing left to do
        submit(&api, &settlement, &wallet, &mut session).await.unwrap();
        assert_eq!(api.submissions().len(), 1);
        assert_eq!(wallet.sent().len(), 1);
    }

    #[tokio::test]
    async fn zero_score_skips_the_claim() {
        let api = FakeApi::with_quiz(open_quiz(1));
        api.set_score(0);
        let wallet = FakeWallet::connected(address(PLAYER), &["quiz-1"]);
        let settlement = SettlementCoordinator::new();
        let mut session = answering(1);
        session.advance().unwrap();

        let state = submit(&api, &settlement, &wallet, &mut session).await.unwrap();
        assert_eq!(state, SubmissionState::NothingToClaim { score: 0 });
        assert!(wallet.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_store_submission_can_be_retried() {
        let api = FakeApi::with_quiz(open_quiz(1));
        api.set_score(2);
        api.fail_next(QuizError::Api("Server busy".to_string()));
        let wallet = FakeWallet::connected(address(PLAYER), &["quiz-1"]);
        let settlement = SettlementCoordinator::new();
        let mut session = answering(1);
        session.advance().unwrap();

        let err = submit(&api, &settlement, &wallet, &mut session).await.unwrap_err();
        assert_eq!(err, QuizError::Api("Server busy".to_string()));
        assert!(session.submission().unwrap().can_retry());
        assert!(wallet.sent().is_empty());

        let state = submit(&api, &settlement, &wallet, &mut session).await.unwrap();
        assert_eq!(state.score(), Some(2));
        assert_eq!(api.submissions().len(), 1);
    }

    #[tokio::test]
    async fn failed_claim_retry_does_not_resend_answers() {
        let api = FakeApi::with_quiz(open_quiz(1));
        api.set_score(5);
        let wallet = FakeWallet::connected(address(PLAYER), &[]);
        let settlement = SettlementCoordinator::new();
        let mut session = answering(1);
        session.advance().unwrap();

        let err = submit(&api, &settlement, &wallet, &mut session).await.unwrap_err();
        assert_eq!(err, QuizError::NotFoundOnChain("quiz-1".to_string()));
        assert!(matches!(
            session.submission(),
            Some(SubmissionState::ClaimFailed { score: 5, .. })
        ));

        wallet.set_quizzes(&["quiz-1"]);
        let state = submit(&api, &settlement, &wallet, &mut session).await.unwrap();
        assert!(matches!(state, SubmissionState::Settled { score: 5, .. }));
        assert_eq!(api.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_timer_drives_the_session() {
        let session = Arc::new(Mutex::new(answering(2)));
        let mut timer = Repeating::new();
        let ticked = session.clone();
        timer.start(Duration::from_secs(1), move || {
            let session = ticked.clone();
            async move {
                match session.lock().await.tick() {
                    Tick::TimedOut(Step::Finished) => ControlFlow::Break(()),
                    _ => ControlFlow::Continue(()),
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(30_500)).await;
        assert_eq!(session.lock().await.current_index(), Some(1));

        tokio::time::sleep(Duration::from_secs(30)).await;
        let session = session.lock().await;
        assert_eq!(session.submission(), Some(&SubmissionState::Pending));
        assert_eq!(session.answers().len(), 2);
        assert!(!timer.is_running());
    }
    #[test]
    fn presses_on_a_left_question_are_dropped() {
        let mut session = answering(3);
        for _ in 0..DEFAULT_QUESTION_SECONDS {
            session.tick();
        }
        assert_eq!(session.current_index(), Some(1));

        let late_next = QuestionAction::Next { index: 0 };
        assert!(matches!(session.apply(&late_next), Err(QuizError::InvalidState(_))));
        assert_eq!(session.current_index(), Some(1));

        let late_choice = QuestionAction::Choose {
            index: 0,
            key: "A".to_string(),
        };
        assert!(session.apply(&late_choice).is_err());
        assert_eq!(session.current_answer(), None);
        assert_eq!(answer(&session, "Q1").as_deref(), Some("no_answer"));

        let choice = QuestionAction::Choose {
            index: 1,
            key: "B".to_string(),
        };
        assert_eq!(session.apply(&choice).unwrap(), None);
        assert_eq!(session.current_answer(), Some(&Answer::Selected("B".to_string())));
        assert_eq!(
            session.apply(&QuestionAction::Next { index: 1 }).unwrap(),
            Some(Step::Question(2))
        );
    }

    #[test]
    fn question_actions_survive_button_payloads() {
        let choice = QuestionAction::Choose {
            index: 4,
            key: "B".to_string(),
        };
        assert_eq!(choice.encode(), "c:4:B");
        assert_eq!(QuestionAction::decode("c:4:B"), Some(choice));
        assert_eq!(QuestionAction::decode("n:2"), Some(QuestionAction::Next { index: 2 }));
        assert_eq!(QuestionAction::decode("n:x"), None);
        assert_eq!(QuestionAction::decode("c:1:"), None);
        assert_eq!(QuestionAction::decode("Next question"), None);
    }

    #[tokio::test]
    async fn participant_name_is_kept_after_joining() {
        let api = FakeApi::with_quiz(open_quiz(2));
        let mut session = open_session(&api, "quiz-1", &address(PLAYER), DEFAULT_QUESTION_SECONDS)
            .await
            .unwrap();
        join_quiz(&api, &mut session, "  ana ").await.unwrap();
        assert_eq!(session.participant_name(), "ana");
    }
}
