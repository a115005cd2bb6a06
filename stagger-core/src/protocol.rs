//! JSON envelopes exchanged with the quiz server over WebSocket text frames.
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question_id: String,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub user_id: String,
    pub score: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        session_id: String,
        user_id: String,
    },
    Answer {
        session_id: String,
        user_id: String,
        question_id: String,
        choice_id: String,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> RequestKind {
        match self {
            ClientMessage::Join { .. } => RequestKind::Join,
            ClientMessage::Answer { .. } => RequestKind::Answer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Join,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Joined {
        session_id: String,
        user_id: String,
    },
    Question {
        question_id: String,
        prompt: String,
        options: Vec<QuestionOption>,
    },
    QuizComplete {
        #[serde(default)]
        score: u64,
    },
    LeaderboardUpdate {
        session_id: String,
        leaderboard: Vec<LeaderboardEntry>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<Question> for ServerMessage {
    fn from(question: Question) -> Self {
        ServerMessage::Question {
            question_id: question.question_id,
            prompt: question.prompt,
            options: question.options,
        }
    }
}
