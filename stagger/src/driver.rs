//! Workloads the stage runner can drive.
use crate::error::DriverError;
use rand::Rng;
use stagger_core::{Mode, OperationOutcome, StageNotes};

mod connection;
mod service;

pub use connection::ConnectionDriver;
pub use service::ServiceDriver;

/// A workload: a population of simulated participants and one operation kind to issue against it.
///
/// The orchestrator calls `warmup_one` to build the population, then `operation` at the paced
/// rate for every stage, collecting `take_notes` after each. `shutdown` is always called last,
/// including after a failed run.
#[allow(async_fn_in_trait)]
pub trait Driver {
    fn mode(&self) -> Mode;

    /// Add one participant before measurement starts. An error here aborts the run.
    async fn warmup_one(&self) -> Result<(), DriverError>;

    async fn operation(&self) -> Result<OperationOutcome, DriverError>;

    /// Counters gathered since the previous call.
    fn take_notes(&self) -> StageNotes;

    async fn shutdown(&self);
}

/// Answer choice drawn for a simulated participant.
///
/// Option ids are `<questionId>_<letter>` and `_b` is the answer participants mostly pick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Choice {
    Likely,
    Alternate,
    Invalid,
}

impl Choice {
    pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let draw: f64 = rng.gen();
        if draw < 0.8 {
            Choice::Likely
        } else if draw < 0.95 {
            Choice::Alternate
        } else {
            Choice::Invalid
        }
    }

    pub fn option_id(&self, question_id: &str) -> String {
        match self {
            Choice::Likely => format!("{question_id}_b"),
            Choice::Alternate => format!("{question_id}_a"),
            Choice::Invalid => String::new(),
        }
    }
}

pub(crate) fn should_join<R: Rng + ?Sized>(rng: &mut R, join_ratio: f64) -> bool {
    rng.gen::<f64>() < join_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn choice_distribution() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut likely = 0;
        let mut invalid = 0;
        for _ in 0..10_000 {
            match Choice::draw(&mut rng) {
                Choice::Likely => likely += 1,
                Choice::Invalid => invalid += 1,
                Choice::Alternate => {}
            }
        }
        assert!((7_600..8_400).contains(&likely), "likely={likely}");
        assert!((300..700).contains(&invalid), "invalid={invalid}");
    }

    #[test]
    fn option_ids() {
        assert_eq!(Choice::Likely.option_id("q3"), "q3_b");
        assert_eq!(Choice::Alternate.option_id("q3"), "q3_a");
        assert_eq!(Choice::Invalid.option_id("q3"), "");
    }

    #[test]
    fn join_ratio_extremes() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!((0..100).all(|_| !should_join(&mut rng, 0.)));
        assert!((0..100).all(|_| should_join(&mut rng, 1.)));
    }
}
