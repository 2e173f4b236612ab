//! Synthetic grip readings.
//!
//! A [`Generator`] only owns its random source; the active mode is passed on every call and
//! the cadence belongs to whoever calls [`Generator::tick`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    mode::{ModeProfile, SimulationMode},
    reading::{GripReading, MAX_VALUE},
};

/// Derives the aggregate score from the six sensor values (L1..L3, R1..R3).
///
/// Implementations must be pure and non-decreasing in every sensor value.
pub trait ScorePolicy: Send + Sync {
    fn score(&self, mode: SimulationMode, sensors: [u16; 6]) -> u16;
}

impl<P: ScorePolicy + ?Sized> ScorePolicy for Arc<P> {
    fn score(&self, mode: SimulationMode, sensors: [u16; 6]) -> u16 {
        (**self).score(mode, sensors)
    }
}

/// Weighted mean of the sensors mapped onto 0..=100, with per-mode weights.
#[derive(Default, Clone, Copy, Debug)]
pub struct WeightedMeanScore;

impl WeightedMeanScore {
    pub fn weights(mode: SimulationMode) -> [u32; 6] {
        match mode {
            SimulationMode::Normal => [1, 1, 1, 1, 1, 1],
            // fingertip sensors dominate a power grip
            SimulationMode::Exercise => [2, 2, 1, 2, 2, 1],
            SimulationMode::Rest => [1, 1, 2, 1, 1, 2],
        }
    }
}

impl ScorePolicy for WeightedMeanScore {
    fn score(&self, mode: SimulationMode, sensors: [u16; 6]) -> u16 {
        let weights = Self::weights(mode);
        let total: u32 = weights.iter().sum();
        let weighted: u32 = sensors
            .iter()
            .zip(weights)
            .map(|(value, weight)| u32::from(*value) * weight)
            .sum();
        let score = weighted * 100 / (total * u32::from(MAX_VALUE));
        score.min(100) as u16
    }
}

pub struct Generator<P: ScorePolicy = WeightedMeanScore> {
    rng: StdRng,
    policy: P,
}

impl Generator {
    /// Reproducible generator for tests and demos.
    #[must_use]
    pub fn seeded(seed: u64) -> Generator {
        Generator::with_policy(StdRng::seed_from_u64(seed), WeightedMeanScore)
    }

    #[must_use]
    pub fn from_entropy() -> Generator {
        Generator::with_policy(StdRng::from_os_rng(), WeightedMeanScore)
    }

    #[must_use]
    pub fn new(seed: Option<u64>) -> Generator {
        Generator::from_seed(seed, WeightedMeanScore)
    }
}

impl<P: ScorePolicy> Generator<P> {
    pub fn with_policy(rng: StdRng, policy: P) -> Generator<P> {
        Generator { rng, policy }
    }

    pub fn from_seed(seed: Option<u64>, policy: P) -> Generator<P> {
        Generator::with_policy(rng(seed), policy)
    }

    /// Restarts the random sequence; `None` draws a fresh seed from OS entropy.
    pub fn reseed(&mut self, seed: Option<u64>) {
        self.rng = rng(seed);
    }

    pub fn set_policy(&mut self, policy: P) {
        self.policy = policy;
    }

    pub fn tick(&mut self, mode: SimulationMode) -> GripReading {
        self.tick_at(mode, Utc::now())
    }

    pub fn tick_at(&mut self, mode: SimulationMode, generated_at: DateTime<Utc>) -> GripReading {
        let profile = mode.profile();
        let direction: i32 = if self.rng.random_bool(0.5) { 1 } else { -1 };
        let left = profile
            .left_base
            .map(|base| sample(&mut self.rng, base, &profile, direction));
        let right = profile
            .right_base
            .map(|base| sample(&mut self.rng, base, &profile, direction));

        let [l1, l2, l3] = left;
        let [r1, r2, r3] = right;
        let score = self.policy.score(mode, [l1, l2, l3, r1, r2, r3]);
        GripReading::clamped(left, right, score, generated_at)
    }
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn sample(rng: &mut StdRng, base: u16, profile: &ModeProfile, direction: i32) -> u16 {
    let variation = i32::from(profile.variation);
    let offset = rng.random_range(-variation..=variation);
    let trend = direction * rng.random_range(0..=i32::from(profile.trend));
    (i32::from(base) + offset + trend).clamp(0, i32::from(MAX_VALUE)) as u16
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use crate::{mode::SimulationMode, reading::MAX_VALUE};

    use super::{Generator, ScorePolicy, WeightedMeanScore};

    #[test]
    fn seeded_generators_agree() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let mut a = Generator::seeded(7);
        let mut b = Generator::seeded(7);
        for mode in SimulationMode::ALL {
            assert_eq!(a.tick_at(mode, at), b.tick_at(mode, at));
        }
    }

    #[test]
    fn reseed_restarts_sequence() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let mut generator = Generator::seeded(11);
        let first = generator.tick_at(SimulationMode::Normal, at);
        generator.tick_at(SimulationMode::Normal, at);
        generator.reseed(Some(11));
        assert_eq!(generator.tick_at(SimulationMode::Normal, at), first);
    }

    #[test]
    fn custom_policy_behind_arc() {
        struct Fixed;
        impl ScorePolicy for Fixed {
            fn score(&self, _mode: SimulationMode, _sensors: [u16; 6]) -> u16 {
                55
            }
        }

        let policy: Arc<dyn ScorePolicy> = Arc::new(Fixed);
        let mut generator = Generator::from_seed(Some(1), policy);
        assert_eq!(generator.tick(SimulationMode::Rest).score(), 55);
        generator.set_policy(Arc::new(WeightedMeanScore));
        assert!(generator.tick(SimulationMode::Rest).score() <= 100);
    }

    #[test]
    fn values_stay_in_range() {
        let mut generator = Generator::seeded(42);
        for mode in SimulationMode::ALL {
            for _ in 0..500 {
                let reading = generator.tick(mode);
                for value in reading.sensors() {
                    assert!(value <= MAX_VALUE);
                }
                assert!(reading.score() <= MAX_VALUE);
            }
        }
    }

    #[test]
    fn values_follow_mode_profile() {
        let mut generator = Generator::seeded(3);
        for mode in SimulationMode::ALL {
            let profile = mode.profile();
            let spread = profile.variation + profile.trend;
            let bases: Vec<u16> = profile
                .left_base
                .iter()
                .chain(profile.right_base.iter())
                .copied()
                .collect();
            for _ in 0..200 {
                let reading = generator.tick(mode);
                for (value, base) in reading.sensors().iter().zip(&bases) {
                    assert!(*value >= base.saturating_sub(spread));
                    assert!(*value <= base + spread);
                }
            }
        }
    }

    #[test]
    fn score_bounds() {
        let policy = WeightedMeanScore;
        for mode in SimulationMode::ALL {
            assert_eq!(policy.score(mode, [0; 6]), 0);
            assert_eq!(policy.score(mode, [MAX_VALUE; 6]), 100);
        }
    }

    #[test]
    fn score_is_monotonic() {
        let policy = WeightedMeanScore;
        let base = [300, 300, 300, 300, 300, 300];
        for mode in SimulationMode::ALL {
            let before = policy.score(mode, base);
            for index in 0..6 {
                let mut raised = base;
                raised[index] = 900;
                assert!(policy.score(mode, raised) >= before);
            }
        }
    }

    #[test]
    fn score_weighting_depends_on_mode() {
        let policy = WeightedMeanScore;
        let fingertips = [999, 999, 0, 999, 999, 0];
        assert!(
            policy.score(SimulationMode::Exercise, fingertips)
                > policy.score(SimulationMode::Rest, fingertips)
        );
    }
}
