use std::future::Future;

use log::debug;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::quiz::{Answers, Participant, Quiz, QuizError, QuizResult, WalletAddress};

/// The external quiz store. It owns every record that survives a restart.
pub trait QuizApi: Send + Sync {
    fn create_quiz(&self, request: &CreateQuizRequest) -> impl Future<Output = QuizResult<String>> + Send;

    fn verify_quiz(
        &self,
        quiz_id: &str,
        wallet: &WalletAddress,
    ) -> impl Future<Output = QuizResult<Quiz>> + Send;

    fn join_quiz(
        &self,
        quiz_id: &str,
        wallet: &WalletAddress,
        participant_name: &str,
    ) -> impl Future<Output = QuizResult<()>> + Send;

    fn update_quiz(
        &self,
        quiz_id: &str,
        update: QuizStatusUpdate,
    ) -> impl Future<Output = QuizResult<()>> + Send;

    fn submit_answers(&self, submission: &Submission) -> impl Future<Output = QuizResult<ScoreReport>> + Send;

    fn leaderboard(&self, quiz_id: &str) -> impl Future<Output = QuizResult<LeaderboardData>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuizRequest {
    pub creator_name: String,
    pub prompt: String,
    pub num_participants: u32,
    pub question_count: u32,
    /// Base units, as a decimal string.
    pub reward_per_score: String,
    pub creator_wallet: String,
    /// Base units, as a decimal string.
    pub total_cost: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateQuizResponse {
    quiz_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizStatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_finished: Option<bool>,
}

impl QuizStatusUpdate {
    pub fn open() -> Self {
        Self {
            is_public: Some(true),
            is_finished: None,
        }
    }

    pub fn finish() -> Self {
        Self {
            is_public: Some(false),
            is_finished: Some(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub quiz_id: String,
    pub wallet_address: WalletAddress,
    pub answers: Answers,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreReport {
    pub quiz_id: String,
    pub score: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LeaderboardData {
    #[serde(default)]
    pub quiz: Option<Quiz>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody<'a> {
    wallet_address: &'a WalletAddress,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody<'a> {
    wallet_address: &'a WalletAddress,
    participant_name: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

pub struct HttpQuizApi {
    client: Client,
    base_url: String,
}

impl HttpQuizApi {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> QuizResult<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }
        Ok(response.json::<T>().await?)
    }

    async fn call_unit(&self, request: RequestBuilder) -> QuizResult<()> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }
        Ok(())
    }
}

impl QuizApi for HttpQuizApi {
    async fn create_quiz(&self, request: &CreateQuizRequest) -> QuizResult<String> {
        debug!("Creating quiz for creator {}", request.creator_wallet);
        let response: CreateQuizResponse = self
            .call(self.client.post(self.url("/quiz/create/prompt")).json(request))
            .await?;
        Ok(response.quiz_id)
    }

    async fn verify_quiz(&self, quiz_id: &str, wallet: &WalletAddress) -> QuizResult<Quiz> {
        debug!("Verifying quiz {} for {}", quiz_id, wallet);
        let body = VerifyBody {
            wallet_address: wallet,
        };
        let mut quiz: Quiz = self
            .call(self.client.post(self.url(&format!("/quiz/verify/{}", quiz_id))).json(&body))
            .await?;
        if quiz.quiz_id.is_empty() {
            quiz.quiz_id = quiz_id.to_string();
        }
        Ok(quiz)
    }

    async fn join_quiz(&self, quiz_id: &str, wallet: &WalletAddress, participant_name: &str) -> QuizResult<()> {
        debug!("Joining quiz {} as {} ({})", quiz_id, participant_name, wallet);
        let body = JoinBody {
            wallet_address: wallet,
            participant_name,
        };
        let response = self
            .client
            .post(self.url(&format!("/quiz/join/{}", quiz_id)))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(QuizError::AlreadyJoined);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }
        Ok(())
    }

    async fn update_quiz(&self, quiz_id: &str, update: QuizStatusUpdate) -> QuizResult<()> {
        debug!("Updating quiz {}: {:?}", quiz_id, update);
        self.call_unit(self.client.put(self.url(&format!("/quiz/update/{}", quiz_id))).json(&update))
            .await
    }

    async fn submit_answers(&self, submission: &Submission) -> QuizResult<ScoreReport> {
        debug!(
            "Submitting {} answers for quiz {}",
            submission.answers.len(),
            submission.quiz_id
        );
        self.call(self.client.post(self.url("/quiz/submit")).json(submission))
            .await
    }

    async fn leaderboard(&self, quiz_id: &str) -> QuizResult<LeaderboardData> {
        self.call(self.client.get(self.url(&format!("/quiz/leaderboards/{}", quiz_id))))
            .await
    }
}

fn api_error(status: StatusCode, body: &str) -> QuizError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error.or(b.message))
        .unwrap_or_else(|| format!("Quiz API responded with {}", status));
    QuizError::Api(message)
}
