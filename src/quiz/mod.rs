pub mod api;
pub mod chain;
pub mod error;
pub mod leaderboard;
pub mod lifecycle;
pub mod session;
pub mod settlement;
pub mod timer;

#[cfg(test)]
pub mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::{QuizError, QuizResult};

/// Wire value recorded for a question the participant left without answering.
pub const NO_ANSWER: &str = "no_answer";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    #[serde(default)]
    pub quiz_id: String,
    #[serde(default)]
    pub creator_name: String,
    #[serde(default)]
    pub creator_wallet: Option<String>,
    #[serde(default)]
    pub questions: Vec<Question>,
    /// Base units, as sent when the quiz was created.
    #[serde(default)]
    pub reward_per_score: Option<String>,
    #[serde(default)]
    pub num_participants: Option<u32>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_finished: bool,
}

impl Quiz {
    pub fn new(quiz_id: impl Into<String>, questions: Vec<Question>) -> Self {
        Self {
            quiz_id: quiz_id.into(),
            questions,
            ..Self::default()
        }
    }

    /// Accepting joins and answers.
    pub fn is_open(&self) -> bool {
        self.is_public && !self.is_finished
    }

    pub fn status(&self) -> QuizStatus {
        if self.is_finished {
            QuizStatus::Finished
        } else if self.is_public {
            QuizStatus::Open
        } else {
            QuizStatus::NotStarted
        }
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizStatus {
    NotStarted,
    Open,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "question")]
    pub text: String,
    /// Display order is the order the keys arrived in.
    #[serde(with = "option_map")]
    pub options: Vec<QuizOption>,
}

impl Question {
    pub fn new(id: impl Into<String>, text: impl Into<String>, options: Vec<QuizOption>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            options,
        }
    }

    pub fn option(&self, key: &str) -> Option<&QuizOption> {
        self.options.iter().find(|o| o.key == key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuizOption {
    pub key: String,
    pub text: String,
}

impl QuizOption {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
        }
    }
}

mod option_map {
    use super::QuizOption;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::{Map, Value};

    pub fn serialize<S: Serializer>(options: &[QuizOption], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(options.len()))?;
        for option in options {
            map.serialize_entry(&option.key, &option.text)?;
        }
        map.end()
    }

    // serde_json is built with `preserve_order`, so the map iterates in document order
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<QuizOption>, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(map
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                QuizOption { key, text }
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Answer {
    Selected(String),
    NoAnswer,
}

impl From<String> for Answer {
    fn from(value: String) -> Self {
        if value == NO_ANSWER {
            Answer::NoAnswer
        } else {
            Answer::Selected(value)
        }
    }
}

impl From<Answer> for String {
    fn from(answer: Answer) -> Self {
        match answer {
            Answer::Selected(key) => key,
            Answer::NoAnswer => NO_ANSWER.to_string(),
        }
    }
}

/// questionId -> answer
pub type Answers = BTreeMap<String, Answer>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub wallet_address: String,
    pub participant_name: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub answers: Answers,
}

impl Participant {
    pub fn new(wallet_address: impl Into<String>, participant_name: impl Into<String>, score: i64) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            participant_name: participant_name.into(),
            score,
            answers: Answers::new(),
        }
    }
}

/// An EVM account address, stored lowercased so comparisons ignore checksum casing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for WalletAddress {
    type Err = QuizError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| QuizError::Validation("Wallet address must start with 0x".to_string()))?;
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(QuizError::Validation(
                "Wallet address must be 40 hex characters after 0x".to_string(),
            ));
        }
        Ok(WalletAddress(format!("0x{}", hex.to_ascii_lowercase())))
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = QuizError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WalletAddress> for String {
    fn from(address: WalletAddress) -> Self {
        address.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
