use stagger_core::{LeaderboardEntry, Question, QuestionOption, QuizProgress, QuizService};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_QUESTION_COUNT: usize = 10;

const OPTION_LETTERS: [char; 4] = ['a', 'b', 'c', 'd'];

#[derive(Debug, Error)]
pub enum QuizError {
    #[error("Quiz state Mutex is poisoned")]
    PoisonData,
}

impl<T> From<PoisonError<T>> for QuizError {
    fn from(_value: PoisonError<T>) -> Self {
        Self::PoisonData
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Standing {
    progress: usize,
    score: u64,
}

/// A quiz kept entirely in memory.
///
/// Every question has options `<id>_a` through `<id>_d`; `<id>_b` is correct. Answers create the
/// participant if needed, score when correct and only advance progress when they answer the
/// participant's current question.
pub struct InMemoryQuiz {
    questions: Vec<Question>,
    sessions: Mutex<HashMap<String, HashMap<String, Standing>>>,
    db_path: Option<PathBuf>,
}

impl InMemoryQuiz {
    pub fn new(question_count: usize) -> Self {
        Self {
            questions: (0..question_count).map(question).collect(),
            sessions: Mutex::new(HashMap::new()),
            db_path: None,
        }
    }

    /// Open against a database path. Nothing is persisted; the path is only recorded.
    pub fn open(db_path: &Path) -> Result<Self, QuizError> {
        debug!("Opening in-memory quiz (db path {} unused)", db_path.display());
        Ok(Self {
            db_path: Some(db_path.to_path_buf()),
            ..Self::new(DEFAULT_QUESTION_COUNT)
        })
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn participants(&self, session_id: &str) -> Result<usize, QuizError> {
        Ok(self
            .sessions
            .lock()?
            .get(session_id)
            .map_or(0, |participants| participants.len()))
    }

    pub fn score(&self, session_id: &str, user_id: &str) -> Result<u64, QuizError> {
        Ok(self
            .sessions
            .lock()?
            .get(session_id)
            .and_then(|participants| participants.get(user_id))
            .map_or(0, |standing| standing.score))
    }

    /// Top `limit` participants by score, ties broken by user id.
    pub fn leaderboard(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>, QuizError> {
        let sessions = self.sessions.lock()?;
        let Some(participants) = sessions.get(session_id) else {
            return Ok(vec![]);
        };
        let mut entries: Vec<LeaderboardEntry> = participants
            .iter()
            .map(|(user_id, standing)| LeaderboardEntry {
                user_id: user_id.clone(),
                score: standing.score,
            })
            .collect();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.user_id.cmp(&b.user_id)));
        entries.truncate(limit);
        Ok(entries)
    }

    fn progress(&self, standing: Standing) -> QuizProgress {
        QuizProgress {
            progress: standing.progress,
            next_question: self.questions.get(standing.progress).cloned(),
        }
    }
}

impl QuizService for InMemoryQuiz {
    type Error = QuizError;

    fn join(&self, session_id: &str, user_id: &str) -> Result<QuizProgress, QuizError> {
        let mut sessions = self.sessions.lock()?;
        let standing = *sessions
            .entry(session_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default();
        Ok(self.progress(standing))
    }

    fn answer(
        &self,
        session_id: &str,
        user_id: &str,
        question_id: &str,
        choice_id: &str,
        _sent_at_epoch_ms: i64,
    ) -> Result<QuizProgress, QuizError> {
        let mut sessions = self.sessions.lock()?;
        let standing = sessions
            .entry(session_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default();

        if is_correct(question_id, choice_id) {
            standing.score += 1;
        }
        let current = self.questions.get(standing.progress);
        if current.is_some_and(|question| question.question_id == question_id) {
            standing.progress += 1;
        }
        let standing = *standing;
        Ok(self.progress(standing))
    }
}

fn question(idx: usize) -> Question {
    let question_id = format!("q{}", idx + 1);
    Question {
        options: OPTION_LETTERS
            .iter()
            .map(|letter| QuestionOption {
                id: format!("{question_id}_{letter}"),
                text: format!("Option {}", letter.to_ascii_uppercase()),
            })
            .collect(),
        prompt: format!("Question {}", idx + 1),
        question_id,
    }
}

fn is_correct(question_id: &str, choice_id: &str) -> bool {
    choice_id
        .strip_prefix(question_id)
        .is_some_and(|suffix| suffix == "_b")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_idempotent() {
        let quiz = InMemoryQuiz::new(3);
        let first = quiz.join("s", "u1").unwrap();
        assert_eq!(first.progress, 0);
        assert_eq!(first.next_question.unwrap().question_id, "q1");

        quiz.answer("s", "u1", "q1", "q1_b", 0).unwrap();
        let rejoined = quiz.join("s", "u1").unwrap();
        assert_eq!(rejoined.progress, 1);
        assert_eq!(quiz.participants("s").unwrap(), 1);
    }

    #[test]
    fn answers_walk_to_completion() {
        let quiz = InMemoryQuiz::new(2);
        quiz.join("s", "u1").unwrap();

        let next = quiz.answer("s", "u1", "q1", "q1_a", 0).unwrap();
        assert_eq!(next.next_question.unwrap().question_id, "q2");

        // Answering a question that is not current scores but does not advance.
        let same = quiz.answer("s", "u1", "q1", "q1_b", 0).unwrap();
        assert_eq!(same.progress, 1);

        let done = quiz.answer("s", "u1", "q2", "", 0).unwrap();
        assert!(done.is_complete());
        assert_eq!(done.progress, 2);
    }

    #[test]
    fn leaderboard_orders_by_score() {
        let quiz = InMemoryQuiz::new(5);
        for user in ["carol", "alice", "bob"] {
            quiz.join("s", user).unwrap();
        }
        quiz.answer("s", "bob", "q1", "q1_b", 0).unwrap();
        quiz.answer("s", "bob", "q2", "q2_b", 0).unwrap();
        quiz.answer("s", "carol", "q1", "q1_b", 0).unwrap();

        let board = quiz.leaderboard("s", 2).unwrap();
        let names: Vec<_> = board.iter().map(|entry| entry.user_id.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol"]);
        assert_eq!(board[0].score, 2);
        assert_eq!(quiz.score("s", "alice").unwrap(), 0);
        assert!(quiz.leaderboard("other", 10).unwrap().is_empty());
    }

    #[test]
    fn options_follow_naming() {
        let quiz = InMemoryQuiz::open(Path::new("/tmp/quiz.sqlite")).unwrap();
        assert_eq!(quiz.question_count(), DEFAULT_QUESTION_COUNT);
        assert_eq!(quiz.db_path(), Some(Path::new("/tmp/quiz.sqlite")));

        let question = quiz.join("s", "u").unwrap().next_question.unwrap();
        let ids: Vec<_> = question.options.iter().map(|option| option.id.as_str()).collect();
        assert_eq!(ids, vec!["q1_a", "q1_b", "q1_c", "q1_d"]);
        assert!(is_correct("q1", "q1_b"));
        assert!(!is_correct("q1", "q10_b"));
    }
}
