//! Sequential probability ratio test for two-player matches.
//!
//! Each finished game contributes its score (1, ½ or 0 for the first player) to a
//! log-likelihood ratio of H1 (`elo1`) against H0 (`elo0`) under the logistic Elo model.
//! The match can stop as soon as the ratio leaves `[lower, upper]`.

use anyhow::ensure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SprtResult {
    Continue,
    AcceptH0,
    AcceptH1,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SprtStatus {
    pub llr: f64,
    pub lower: f64,
    pub upper: f64,
    pub result: SprtResult,
}

#[derive(Debug, Clone)]
pub struct Sprt {
    elo0: f64,
    elo1: f64,
    alpha: f64,
    beta: f64,
    lower: f64,
    upper: f64,
    llr: f64,
    result: SprtResult,
}

/// Expected score of a player `elo` points stronger than its opponent.
fn expected_score(elo: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf(-elo / 400.0))
}

impl Sprt {
    pub fn new(elo0: f64, elo1: f64, alpha: f64, beta: f64) -> anyhow::Result<Self> {
        ensure!(elo0 < elo1, "SPRT needs elo0 < elo1, got {elo0} and {elo1}");
        ensure!(
            alpha > 0.0 && alpha < 0.5 && beta > 0.0 && beta < 0.5,
            "SPRT error rates must be in (0, 0.5), got alpha {alpha} and beta {beta}"
        );
        Ok(Sprt {
            elo0,
            elo1,
            alpha,
            beta,
            lower: (beta / (1.0 - alpha)).ln(),
            upper: ((1.0 - beta) / alpha).ln(),
            llr: 0.0,
            result: SprtResult::Continue,
        })
    }

    /// Account for one game where the first player scored `score`.
    pub fn add_game_result(&mut self, score: f64) {
        let p0 = expected_score(self.elo0);
        let p1 = expected_score(self.elo1);
        self.llr += score * (p1 / p0).ln() + (1.0 - score) * ((1.0 - p1) / (1.0 - p0)).ln();

        if self.result == SprtResult::Continue {
            if self.llr >= self.upper {
                self.result = SprtResult::AcceptH1;
            } else if self.llr <= self.lower {
                self.result = SprtResult::AcceptH0;
            }
        }
    }

    pub fn status(&self) -> SprtStatus {
        SprtStatus {
            llr: self.llr,
            lower: self.lower,
            upper: self.upper,
            result: self.result,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.result != SprtResult::Continue
    }

    pub fn hypotheses(&self) -> (f64, f64) {
        (self.elo0, self.elo1)
    }

    pub fn error_rates(&self) -> (f64, f64) {
        (self.alpha, self.beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(scores: &[f64]) -> SprtStatus {
        let mut sprt = Sprt::new(0.0, 100.0, 0.05, 0.05).unwrap();
        for &score in scores {
            sprt.add_game_result(score);
        }
        sprt.status()
    }

    #[test]
    fn bounds() {
        let status = Sprt::new(0.0, 5.0, 0.05, 0.05).unwrap().status();
        assert!((status.lower + 2.944).abs() < 1e-3);
        assert!((status.upper - 2.944).abs() < 1e-3);
        assert_eq!(status.llr, 0.0);
        assert_eq!(status.result, SprtResult::Continue);

        assert!(Sprt::new(5.0, 5.0, 0.05, 0.05).is_err());
        assert!(Sprt::new(0.0, 5.0, 0.0, 0.05).is_err());
        assert!(Sprt::new(0.0, 5.0, 0.05, 0.5).is_err());
    }

    #[test]
    fn deterministic_replay() {
        let scores = [1.0, 0.5, 0.0, 1.0, 1.0, 0.5, 0.0, 1.0];
        assert_eq!(run(&scores), run(&scores));
        assert!(run(&scores).llr > 0.0);
        assert_eq!(run(&[0.5; 10]).result, SprtResult::Continue);
    }

    #[test]
    fn terminal_results_stick() {
        assert_eq!(run(&[1.0; 11]).result, SprtResult::Continue);
        assert_eq!(run(&[1.0; 12]).result, SprtResult::AcceptH1);

        let mut scores = vec![1.0; 12];
        scores.extend([0.0; 30]);
        let status = run(&scores);
        assert_eq!(status.result, SprtResult::AcceptH1);
        assert!(status.llr < status.lower);

        assert_eq!(run(&[0.0; 8]).result, SprtResult::Continue);
        assert_eq!(run(&[0.0; 9]).result, SprtResult::AcceptH0);
    }
}
