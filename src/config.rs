use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::quiz::lifecycle::{DraftLimits, MAX_QUESTIONS};
use crate::quiz::session::DEFAULT_QUESTION_SECONDS;

#[derive(Debug, Clone)]
pub struct Config {
    pub quiz_api_url: String,
    pub signer_relay_url: String,
    pub escrow_contract: String,
    pub question_seconds: u32,
    pub participant_poll: Duration,
    pub reward_decimals: u32,
    pub max_questions: u32,
    pub dialogue_db: String,
}

impl Config {
    /// Reads the process environment. Call after `dotenv()`.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| format!("{} is not set", key))
        };

        let config = Self {
            quiz_api_url: required("QUIZ_API_URL")?,
            signer_relay_url: required("SIGNER_RELAY_URL")?,
            escrow_contract: required("ESCROW_CONTRACT_ADDRESS")?,
            question_seconds: parsed(&lookup, "QUESTION_SECONDS", DEFAULT_QUESTION_SECONDS)?,
            participant_poll: Duration::from_secs(parsed(&lookup, "PARTICIPANT_POLL_SECONDS", 3u64)?),
            reward_decimals: parsed(&lookup, "REWARD_DECIMALS", 18)?,
            max_questions: parsed(&lookup, "MAX_QUESTIONS", MAX_QUESTIONS)?,
            dialogue_db: lookup("DIALOGUE_DB").unwrap_or_else(|| "db.sqlite".to_string()),
        };

        if config.question_seconds == 0 {
            return Err("QUESTION_SECONDS must be at least 1".into());
        }
        if config.participant_poll.is_zero() {
            return Err("PARTICIPANT_POLL_SECONDS must be at least 1".into());
        }
        if config.reward_decimals > 30 {
            return Err("REWARD_DECIMALS cannot exceed 30".into());
        }
        Ok(config)
    }

    pub fn draft_limits(&self) -> DraftLimits {
        DraftLimits {
            max_questions: self.max_questions,
            reward_decimals: self.reward_decimals,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, String> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value: {}", key, value)),
        None => Ok(default),
    }
}
