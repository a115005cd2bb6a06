use crate::Question;

/// Where a participant stands after a join or answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuizProgress {
    /// Zero-based index of the next unanswered question.
    pub progress: usize,
    /// `None` once the participant has answered everything.
    pub next_question: Option<Question>,
}

impl QuizProgress {
    pub fn is_complete(&self) -> bool {
        self.next_question.is_none()
    }
}

/// The quiz domain, called in-process by the service driver.
///
/// Calls are synchronous; the driver invokes them from within an operation slot.
pub trait QuizService: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn join(&self, session_id: &str, user_id: &str) -> Result<QuizProgress, Self::Error>;

    fn answer(
        &self,
        session_id: &str,
        user_id: &str,
        question_id: &str,
        choice_id: &str,
        sent_at_epoch_ms: i64,
    ) -> Result<QuizProgress, Self::Error>;
}
