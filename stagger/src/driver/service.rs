use super::{should_join, Choice, Driver};
use crate::error::DriverError;
use rand::Rng;
use stagger_core::{
    BenchmarkConfig, Mode, OperationOutcome, QuizProgress, QuizService, StageNotes, TrafficMix,
    ANSWER_PICK_RETRIES,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use time::OffsetDateTime;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Upper bound on how far back an answer's client timestamp is backdated.
const SENT_AT_JITTER_MS: i64 = 8_000;

struct Participant {
    user_id: String,
    current_question_id: Option<String>,
    progress: usize,
    complete: bool,
}

impl Participant {
    fn apply(&mut self, progress: QuizProgress) {
        self.progress = progress.progress;
        self.complete = progress.is_complete();
        self.current_question_id = progress.next_question.map(|question| question.question_id);
    }
}

/// Drives a [`QuizService`] in-process. Every operation is a join or an answer.
pub struct ServiceDriver<S> {
    service: S,
    session_id: String,
    traffic: TrafficMix,
    participants: Mutex<Vec<Participant>>,
    next_user: AtomicU64,
    join_ops: AtomicU64,
    answer_ops: AtomicU64,
}

impl<S: QuizService> ServiceDriver<S> {
    pub fn new(service: S, config: &BenchmarkConfig) -> Self {
        Self {
            service,
            session_id: config.session_id.clone(),
            traffic: config.traffic,
            participants: Mutex::new(Vec::new()),
            next_user: AtomicU64::new(0),
            join_ops: AtomicU64::new(0),
            answer_ops: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn population(&self) -> usize {
        self.participants.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn join(&self) -> Result<(), DriverError> {
        let idx = self.next_user.fetch_add(1, Ordering::Relaxed) + 1;
        let user_id = format!("stress-user-{idx:08}");

        let progress = self
            .service
            .join(&self.session_id, &user_id)
            .map_err(|err| DriverError::Service(Box::new(err)))?;

        let mut participant = Participant {
            user_id,
            current_question_id: None,
            progress: 0,
            complete: false,
        };
        participant.apply(progress);
        self.participants.lock()?.push(participant);
        Ok(())
    }

    fn answer(&self) -> Result<(), DriverError> {
        let picked = {
            let mut participants = self.participants.lock()?;
            let mut rng = rand::thread_rng();
            pick_unfinished(&mut rng, &participants).map(|idx| {
                let participant = &mut participants[idx];
                match participant.current_question_id.clone() {
                    Some(question_id) => Some((idx, participant.user_id.clone(), question_id)),
                    None => {
                        participant.complete = true;
                        None
                    }
                }
            })
        };

        let (idx, user_id, question_id) = match picked {
            None => {
                // Nobody left to answer for, so this operation becomes a join.
                self.join()?;
                self.join_ops.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Some(None) => {
                self.answer_ops.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Some(Some(target)) => target,
        };

        let (choice_id, sent_at) = {
            let mut rng = rand::thread_rng();
            let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
            (
                Choice::draw(&mut rng).option_id(&question_id),
                now_ms - rng.gen_range(0..SENT_AT_JITTER_MS),
            )
        };

        let progress = self
            .service
            .answer(&self.session_id, &user_id, &question_id, &choice_id, sent_at)
            .map_err(|err| DriverError::Service(Box::new(err)))?;
        self.answer_ops.fetch_add(1, Ordering::Relaxed);

        if let Some(participant) = self.participants.lock()?.get_mut(idx) {
            participant.apply(progress);
        }
        Ok(())
    }
}

/// Random index of a participant with questions left, giving up after a bounded number of draws.
fn pick_unfinished<R: Rng + ?Sized>(rng: &mut R, participants: &[Participant]) -> Option<usize> {
    if participants.is_empty() {
        return None;
    }
    (0..ANSWER_PICK_RETRIES)
        .map(|_| rng.gen_range(0..participants.len()))
        .find(|idx| !participants[*idx].complete)
}

impl<S: QuizService> Driver for ServiceDriver<S> {
    fn mode(&self) -> Mode {
        Mode::Service
    }

    async fn warmup_one(&self) -> Result<(), DriverError> {
        self.join()
    }

    async fn operation(&self) -> Result<OperationOutcome, DriverError> {
        let join = should_join(&mut rand::thread_rng(), self.traffic.join_ratio());
        if join {
            self.join()?;
            self.join_ops.fetch_add(1, Ordering::Relaxed);
        } else {
            self.answer()?;
        }
        Ok(OperationOutcome::success())
    }

    fn take_notes(&self) -> StageNotes {
        StageNotes::from([
            ("joinOps".to_string(), self.join_ops.swap(0, Ordering::Relaxed)),
            ("answerOps".to_string(), self.answer_ops.swap(0, Ordering::Relaxed)),
            ("users".to_string(), self.population() as u64),
        ])
    }

    async fn shutdown(&self) {
        debug!(
            "Service driver finished with {} participants",
            self.population()
        );
    }
}
