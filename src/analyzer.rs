//! A module which contains the per-proposer analyzer used in dynamic-weight mode. The analyzer
//! tracks, for every acceptor, how many protocol messages the proposer has sent to it versus how
//! many responses came back, and shifts voting weight away from acceptors whose response ratio
//! keeps degrading. The freed weight is reassigned to acceptors that are still responsive, so the
//! live part of the cohort can keep forming majorities on its own.

use std::collections::HashMap;

/// All weight arithmetic is rounded to two decimal places at each mutation; equality against the
/// nominal weight is therefore checked with a tolerance rather than `==`.
const WEIGHT_EPS: f64 = 1e-6;

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub struct Analyzer {
    acceptor_ids: Vec<usize>,
    num_acceptors: usize,

    // The adjustment step. Each time an acceptor falls below its threshold it loses one `factor`
    // of weight and its threshold drops by another `factor`.
    factor: f64,

    // The weight a fully healthy acceptor is expected to hold. Raised (up to `ceiling`) when no
    // acceptor sits at the nominal weight anymore and freed weight still needs a home.
    nominal: f64,
    ceiling: f64,

    pub weights: HashMap<usize, f64>,

    msgs_sent: HashMap<usize, u64>,
    msgs_recvd: HashMap<usize, u64>,
    pub msg_ratios: HashMap<usize, f64>,
    thresholds: HashMap<usize, f64>,

    pub weight_changed: bool,
}

impl Analyzer {
    pub fn new(acceptor_ids: Vec<usize>) -> Self {
        Analyzer::with_factor(acceptor_ids, 0.05)
    }

    pub fn with_factor(acceptor_ids: Vec<usize>, factor: f64) -> Self {
        let num_acceptors = acceptor_ids.len();
        assert!(num_acceptors > 0, "the analyzer needs at least one acceptor");
        let nominal = 1.0 / num_acceptors as f64;

        let mut weights = HashMap::new();
        let mut msgs_sent = HashMap::new();
        let mut msgs_recvd = HashMap::new();
        let mut msg_ratios = HashMap::new();
        let mut thresholds = HashMap::new();
        for &pid in &acceptor_ids {
            weights.insert(pid, nominal);
            msgs_sent.insert(pid, 0);
            msgs_recvd.insert(pid, 0);
            msg_ratios.insert(pid, 0.0);
            thresholds.insert(pid, round2(1.0 - factor));
        }

        Analyzer {
            acceptor_ids,
            num_acceptors,
            factor,
            nominal,
            ceiling: 0.5,
            weights,
            msgs_sent,
            msgs_recvd,
            msg_ratios,
            thresholds,
            weight_changed: false,
        }
    }

    /// Records one protocol message sent to the acceptor. Called once per acceptor every time a
    /// Prepare or Accept is broadcast.
    pub fn add_send(&mut self, pid: usize) {
        *self.msgs_sent.get_mut(&pid).expect("unknown acceptor pid") += 1;
    }

    /// Records one response received from the acceptor and refreshes its response ratio.
    pub fn add_recvd(&mut self, pid: usize) {
        *self.msgs_recvd.get_mut(&pid).expect("unknown acceptor pid") += 1;
        let sent = self.msgs_sent[&pid];
        if sent > 0 {
            self.msg_ratios
                .insert(pid, round2(self.msgs_recvd[&pid] as f64 / sent as f64));
        }
    }

    /// Runs one adjustment pass over every acceptor. Invoked by the proposer when an instance
    /// first crosses its accept-phase weighted majority.
    pub fn check(&mut self) {
        for i in 0..self.num_acceptors {
            let pid = self.acceptor_ids[i];
            self.check_threshold(pid);
        }
    }

    fn check_threshold(&mut self, pid: usize) {
        if self.msg_ratios[&pid] <= self.thresholds[&pid] {
            let lowered = round2(self.thresholds[&pid] - self.factor);
            self.thresholds.insert(pid, lowered);
            self.lower_weight(pid);
        }
    }

    fn lower_weight(&mut self, pid: usize) {
        let current = self.weights[&pid];
        if current <= WEIGHT_EPS {
            // Nothing left to take away, so there is nothing to reallocate either.
            return;
        }
        let lowered = round2(current - self.factor);
        let clamped = if lowered > 0.0 { lowered } else { 0.0 };
        self.weights.insert(pid, clamped);
        self.raise_weight();
        self.weight_changed = true;
    }

    /// Reassigns the freed `factor` unit of weight: the first acceptor (in PID order) still
    /// sitting at the nominal weight gets it, clamped at the ceiling. If a full pass finds no
    /// such acceptor, the nominal level itself rises by `factor` and the scan repeats, until the
    /// nominal level hits the ceiling.
    fn raise_weight(&mut self) {
        while self.ceiling - self.nominal > WEIGHT_EPS {
            for i in 0..self.num_acceptors {
                let pid = self.acceptor_ids[i];
                if (self.weights[&pid] - self.nominal).abs() < WEIGHT_EPS {
                    let raised = round2(self.weights[&pid] + self.factor);
                    let capped = if raised < self.ceiling { raised } else { self.ceiling };
                    self.weights.insert(pid, capped);
                    return;
                }
            }
            self.nominal = round2(self.nominal + self.factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // Drives an analyzer the way a proposer does: one send per acceptor per round, one receive
    // unless the seeded coin says the message was lost.
    fn run_rounds(analyzer: &mut Analyzer, fail_rates: &[f64], rounds: usize, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let pids: Vec<usize> = analyzer.acceptor_ids.clone();
        for _ in 0..rounds {
            for (i, &pid) in pids.iter().enumerate() {
                analyzer.add_send(pid);
                if rng.gen::<f64>() >= fail_rates[i] {
                    analyzer.add_recvd(pid);
                }
            }
            analyzer.check();
        }
    }

    fn total_weight(analyzer: &Analyzer) -> f64 {
        analyzer.weights.values().sum()
    }

    #[test]
    fn a_fully_responsive_cohort_keeps_its_uniform_weights() {
        let mut analyzer = Analyzer::new(vec![1, 2, 3, 4]);
        run_rounds(&mut analyzer, &[0.0, 0.0, 0.0, 0.0], 200, 7);
        assert!(!analyzer.weight_changed);
        for pid in 1..=4 {
            assert!((analyzer.weights[&pid] - 0.25).abs() < WEIGHT_EPS);
        }
    }

    #[test]
    fn a_lossy_acceptor_loses_weight_to_a_healthy_one() {
        let mut analyzer = Analyzer::new(vec![1, 2, 3, 4]);
        run_rounds(&mut analyzer, &[0.0, 0.0, 0.3, 0.0], 300, 11);
        assert!(analyzer.weight_changed);
        assert!(analyzer.weights[&3] < 0.25);
        // The freed weight landed on other acceptors, so the total stays at 1.
        assert!((total_weight(&analyzer) - 1.0).abs() < 0.01 + WEIGHT_EPS);
    }

    #[test]
    fn an_acceptor_with_a_perfect_ratio_is_never_reduced() {
        let mut analyzer = Analyzer::new(vec![1, 2, 3]);
        run_rounds(&mut analyzer, &[0.0, 0.0, 0.5], 400, 3);
        assert!((analyzer.msg_ratios[&1] - 1.0).abs() < WEIGHT_EPS);
        assert!(analyzer.weights[&1] >= 1.0 / 3.0 - WEIGHT_EPS);
    }

    #[test]
    fn weights_stay_between_zero_and_the_ceiling() {
        let mut analyzer = Analyzer::new(vec![1, 2, 3, 4, 5]);
        run_rounds(&mut analyzer, &[0.0, 0.0, 0.2, 0.3, 0.4], 1000, 17);
        for &pid in &[1usize, 2, 3, 4, 5] {
            let w = analyzer.weights[&pid];
            assert!(w >= 0.0, "weight of {} went negative: {}", pid, w);
            assert!(w <= 0.5 + WEIGHT_EPS, "weight of {} exceeded the ceiling: {}", pid, w);
        }
    }

    #[test]
    fn a_dead_acceptor_is_driven_to_zero() {
        let mut analyzer = Analyzer::new(vec![1, 2, 3]);
        run_rounds(&mut analyzer, &[0.0, 0.0, 1.0], 200, 5);
        assert_eq!(analyzer.msgs_recvd[&3], 0);
        assert!(analyzer.weights[&3] < WEIGHT_EPS);
    }

    #[test]
    fn the_freed_weight_goes_to_the_first_nominal_acceptor_in_pid_order() {
        let mut analyzer = Analyzer::new(vec![1, 2, 3, 4]);
        for pid in 1..=4 {
            analyzer.add_send(pid);
        }
        for pid in 1..=3 {
            analyzer.add_recvd(pid);
        }
        analyzer.check();
        // Acceptor 4 lost one factor; acceptor 1 (first at nominal) gained it.
        assert!((analyzer.weights[&4] - 0.20).abs() < WEIGHT_EPS);
        assert!((analyzer.weights[&1] - 0.30).abs() < WEIGHT_EPS);
        assert!((analyzer.weights[&2] - 0.25).abs() < WEIGHT_EPS);
        assert!((analyzer.weights[&3] - 0.25).abs() < WEIGHT_EPS);
    }

    #[test]
    fn ratios_are_rounded_to_two_decimals() {
        let mut analyzer = Analyzer::new(vec![1]);
        analyzer.add_send(1);
        analyzer.add_send(1);
        analyzer.add_send(1);
        analyzer.add_recvd(1);
        analyzer.add_recvd(1);
        assert!((analyzer.msg_ratios[&1] - 0.67).abs() < WEIGHT_EPS);
    }
}
