//! A quiz server to aim Stagger at.
//!
//! [`InMemoryQuiz`] implements the quiz domain for in-process runs, and [`serve`] exposes the
//! same quiz over a WebSocket on `/`.
mod quiz;
mod server;

pub use quiz::{InMemoryQuiz, QuizError, DEFAULT_QUESTION_COUNT};
pub use server::{router, run, serve, ServerOptions};
