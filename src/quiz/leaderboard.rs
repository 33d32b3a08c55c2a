use std::cmp::Ordering;

use crate::quiz::api::LeaderboardData;
use crate::quiz::{Participant, Quiz, QuizStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SortOrder {
    #[default]
    Name,
    Score,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry<'a> {
    pub rank: usize,
    pub participant: &'a Participant,
}

/// Read-only projection over the participants of one quiz, in fetch order.
#[derive(Debug, Clone, Default)]
pub struct Leaderboard {
    quiz: Option<Quiz>,
    participants: Vec<Participant>,
}

impl Leaderboard {
    pub fn new(quiz: Option<Quiz>, participants: Vec<Participant>) -> Self {
        Self { quiz, participants }
    }

    pub fn quiz(&self) -> Option<&Quiz> {
        self.quiz.as_ref()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn question_count(&self) -> usize {
        self.quiz.as_ref().map_or(0, |q| q.question_count())
    }

    pub fn is_open(&self) -> bool {
        self.quiz.as_ref().map_or(false, |q| q.status() == QuizStatus::Open)
    }

    /// Participants whose name contains `filter` (ignoring case), sorted.
    /// Both sorts are stable, so equal keys keep fetch order.
    pub fn view(&self, filter: &str, order: SortOrder) -> Vec<RankedEntry<'_>> {
        let needle = filter.trim().to_lowercase();
        let mut matching: Vec<&Participant> = self
            .participants
            .iter()
            .filter(|p| needle.is_empty() || p.participant_name.to_lowercase().contains(&needle))
            .collect();

        matching.sort_by(|a, b| compare(a, b, order));

        matching
            .into_iter()
            .enumerate()
            .map(|(i, participant)| RankedEntry {
                rank: i + 1,
                participant,
            })
            .collect()
    }
}

impl From<LeaderboardData> for Leaderboard {
    fn from(data: LeaderboardData) -> Self {
        Self::new(data.quiz, data.participants)
    }
}

fn compare(a: &Participant, b: &Participant, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Name => a
            .participant_name
            .to_lowercase()
            .cmp(&b.participant_name.to_lowercase())
            .then_with(|| a.participant_name.cmp(&b.participant_name)),
        SortOrder::Score => b.score.cmp(&a.score),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> Leaderboard {
        Leaderboard::new(
            None,
            vec![
                Participant::new("0x1", "mila", 4),
                Participant::new("0x2", "Andriy", 7),
                Participant::new("0x3", "Milan", 7),
                Participant::new("0x4", "bob", 1),
            ],
        )
    }

    fn names(entries: &[RankedEntry<'_>]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.participant.participant_name.clone())
            .collect()
    }

    #[test]
    fn filter_is_case_insensitive_substring() {
        let board = board();
        assert_eq!(names(&board.view("MIL", SortOrder::Name)), vec!["mila", "Milan"]);
        assert_eq!(board.view("  ", SortOrder::Name).len(), 4);
        assert!(board.view("zzz", SortOrder::Name).is_empty());
    }

    #[test]
    fn score_sort_is_descending_with_fetch_order_ties() {
        let board = board();
        let view = board.view("", SortOrder::Score);
        assert_eq!(names(&view), vec!["Andriy", "Milan", "mila", "bob"]);
        assert_eq!(view[0].rank, 1);
        assert_eq!(view[3].rank, 4);
    }

    #[test]
    fn name_sort_ignores_case() {
        let board = board();
        assert_eq!(
            names(&board.view("", SortOrder::Name)),
            vec!["Andriy", "bob", "mila", "Milan"]
        );

        let board = Leaderboard::new(
            None,
            vec![
                Participant::new("0x1", "bob", 1),
                Participant::new("0x2", "Zed", 2),
                Participant::new("0x3", "alice", 3),
                Participant::new("0x4", "Alice", 4),
            ],
        );
        assert_eq!(
            names(&board.view("", SortOrder::Name)),
            vec!["Alice", "alice", "bob", "Zed"]
        );
    }

    #[test]
    fn stats_come_from_the_quiz_document() {
        let mut quiz = crate::quiz::testing::sample_quiz("q", 3);
        quiz.is_public = true;
        let board = Leaderboard::new(Some(quiz), vec![Participant::new("0x1", "a", 1)]);
        assert_eq!(board.question_count(), 3);
        assert_eq!(board.participant_count(), 1);
        assert!(board.is_open());
        assert!(!Leaderboard::default().is_open());
    }
}
