//! A module that contains the static description of a simulated cohort (how many proposers,
//! acceptors and learners, their voting weights, timeouts and failure rates), plus the functions
//! required to read, parse and return such a description from a TOML file.

use std::collections::HashSet;
use std::time::Duration;

use config::{Config, File};

use crate::analyzer::round2;

/// By convention the proposer with PID 0 acts as the leader: the driver sends every client
/// request to it, and lagging learners address their retries to it.
pub const LEADER: usize = 0;

/// Encapsulates the configuration of a system, i.e. the process IDs of all the proposer, acceptor
/// and learner processes, together with the voting weights of the acceptors.
///
/// PIDs are assigned contiguously: proposers first (starting at 0), then acceptors, then learners.
/// The configuration is broadcast to every agent as the first message of a run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SystemConfig {
    pub num_proposers: usize,
    pub num_acceptors: usize,
    pub num_learners: usize,

    pub proposer_ids: Vec<usize>,
    pub acceptor_ids: Vec<usize>,
    pub learner_ids: Vec<usize>,

    // Acceptor PID -> voting weight. Mutated on a learner when an AdjustWeights message arrives.
    pub weights: Vec<(usize, f64)>,
    pub total_weight: f64,

    // Per-destination-PID message drop probabilities. Empty means a lossless network.
    pub fail_rates: Vec<f64>,

    // Seconds. The mailbox goes idle after 3 of these without traffic; an ordering learner waits
    // 5 of these before asking for a retry.
    pub message_timeout: f64,

    pub num_test_requests: u64,

    pub dynamic_weights: bool,

    // When true, learners log results in strict instance order through a background ordering
    // thread, and ask the leader to re-run instances they are missing.
    pub ordered_learners: bool,

    pub proposer_sequence_start: Option<i64>,
    pub proposer_sequence_step: Option<i64>,
}

impl SystemConfig {
    /// Builds a configuration with equal static weights of 1 per acceptor, a lossless network and
    /// a half-second message timeout. The builder-style `with_*` methods refine it from there.
    pub fn new(num_proposers: usize, num_acceptors: usize, num_learners: usize) -> Self {
        assert!(num_proposers > 0, "a system needs at least one proposer");
        assert!(num_acceptors > 0, "a system needs at least one acceptor");
        assert!(num_learners > 0, "a system needs at least one learner");

        let proposer_ids: Vec<usize> = (0..num_proposers).collect();
        let acceptor_ids: Vec<usize> = (num_proposers..num_proposers + num_acceptors).collect();
        let learner_ids: Vec<usize> =
            (num_proposers + num_acceptors..num_proposers + num_acceptors + num_learners).collect();

        let weights: Vec<(usize, f64)> = acceptor_ids.iter().map(|&pid| (pid, 1.0)).collect();

        SystemConfig {
            num_proposers,
            num_acceptors,
            num_learners,
            proposer_ids,
            acceptor_ids,
            learner_ids,
            weights,
            total_weight: num_acceptors as f64,
            fail_rates: Vec::new(),
            message_timeout: 0.5,
            num_test_requests: 0,
            dynamic_weights: false,
            ordered_learners: false,
            proposer_sequence_start: None,
            proposer_sequence_step: None,
        }
    }

    /// Replaces the default equal weights with an explicit static weight per acceptor, in acceptor
    /// PID order. The list length must match the acceptor count.
    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        assert_eq!(
            weights.len(),
            self.num_acceptors,
            "need exactly one weight per acceptor"
        );
        self.total_weight = weights.iter().sum();
        self.weights = self
            .acceptor_ids
            .iter()
            .cloned()
            .zip(weights.into_iter())
            .collect();
        self
    }

    /// Switches to dynamic weighting: every acceptor starts at `1/N` (rounded to two decimals)
    /// with a total weight of exactly 1, and each proposer runs an analyzer that reassigns weight
    /// away from acceptors that stop responding.
    pub fn with_dynamic_weights(mut self) -> Self {
        let nominal = round2(1.0 / self.num_acceptors as f64);
        self.weights = self.acceptor_ids.iter().map(|&pid| (pid, nominal)).collect();
        self.total_weight = 1.0;
        self.dynamic_weights = true;
        self
    }

    /// Sets one drop probability per destination PID. The list length must match the total number
    /// of processes in the system.
    pub fn with_fail_rates(mut self, fail_rates: Vec<f64>) -> Self {
        assert_eq!(
            fail_rates.len(),
            self.num_processes(),
            "need exactly one fail rate per process"
        );
        self.fail_rates = fail_rates;
        self
    }

    /// Sets the same drop probability for every destination PID.
    pub fn with_fail_rate(self, fail_rate: f64) -> Self {
        let n = self.num_processes();
        self.with_fail_rates(vec![fail_rate; n])
    }

    pub fn with_message_timeout(mut self, seconds: f64) -> Self {
        assert!(seconds > 0.0, "the message timeout must be positive");
        self.message_timeout = seconds;
        self
    }

    pub fn with_num_test_requests(mut self, num_test_requests: u64) -> Self {
        self.num_test_requests = num_test_requests;
        self
    }

    pub fn with_ordered_learners(mut self) -> Self {
        self.ordered_learners = true;
        self
    }

    /// Overrides the proposal number progression. Without this, each proposer starts at its own
    /// PID and steps by the number of proposers, which keeps the progressions disjoint.
    pub fn with_sequence(mut self, start: i64, step: i64) -> Self {
        assert!(step > 0, "the proposal sequence step must be positive");
        self.proposer_sequence_start = Some(start);
        self.proposer_sequence_step = Some(step);
        self
    }

    pub fn num_processes(&self) -> usize {
        self.num_proposers + self.num_acceptors + self.num_learners
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.message_timeout)
    }

    /// The weight currently assigned to an acceptor; PIDs outside the weight table count for 0.
    pub fn weight_of(&self, pid: usize) -> f64 {
        self.weights
            .iter()
            .find(|&&(p, _)| p == pid)
            .map(|&(_, w)| w)
            .unwrap_or(0.0)
    }

    /// Whether the given set of acceptors forms a weighted majority, i.e. whether their summed
    /// weight strictly exceeds half of the total weight.
    pub fn is_weighted_majority(&self, acceptors: &HashSet<usize>) -> bool {
        let current: f64 = acceptors.iter().map(|&pid| self.weight_of(pid)).sum();
        current > self.total_weight / 2.0
    }

    /// Replaces the whole weight table, keeping acceptor PID order. Used by learners when an
    /// AdjustWeights broadcast arrives; the analyzer keeps the total at 1 by construction.
    pub fn replace_weights(&mut self, weights: &std::collections::HashMap<usize, f64>) {
        self.weights = self
            .acceptor_ids
            .iter()
            .map(|&pid| (pid, weights.get(&pid).cloned().unwrap_or(0.0)))
            .collect();
    }
}

#[derive(Debug, Deserialize)]
struct CohortSection {
    proposers: usize,
    acceptors: usize,
    learners: usize,
}

#[derive(Debug, Deserialize)]
struct RunSection {
    requests: u64,
    message_timeout: f64,
    #[serde(default)]
    dynamic_weights: bool,
    #[serde(default)]
    ordered_learners: bool,
    #[serde(default)]
    weights: Vec<f64>,
    #[serde(default)]
    fail_rates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct SimFile {
    cohort: CohortSection,
    run: RunSection,
}

/// Reads a simulation description from `<file_name>.toml` and turns it into a `SystemConfig`.
pub fn load(file_name: &str) -> SystemConfig {
    let mut c = Config::default();
    c.merge(File::with_name(file_name))
        .expect("could not read the configuration file");
    let sim: SimFile = c.try_into().expect("could not parse the configuration file");

    let mut config = SystemConfig::new(sim.cohort.proposers, sim.cohort.acceptors, sim.cohort.learners)
        .with_message_timeout(sim.run.message_timeout)
        .with_num_test_requests(sim.run.requests);
    if sim.run.dynamic_weights {
        config = config.with_dynamic_weights();
    } else if !sim.run.weights.is_empty() {
        config = config.with_weights(sim.run.weights);
    }
    if !sim.run.fail_rates.is_empty() {
        config = config.with_fail_rates(sim.run.fail_rates);
    }
    if sim.run.ordered_learners {
        config = config.with_ordered_learners();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_partitioned_contiguously() {
        let config = SystemConfig::new(2, 3, 2);
        assert_eq!(config.proposer_ids, vec![0, 1]);
        assert_eq!(config.acceptor_ids, vec![2, 3, 4]);
        assert_eq!(config.learner_ids, vec![5, 6]);
        assert_eq!(config.num_processes(), 7);
    }

    #[test]
    fn static_weights_default_to_one_each() {
        let config = SystemConfig::new(1, 3, 1);
        assert_eq!(config.total_weight, 3.0);
        for &pid in &config.acceptor_ids {
            assert_eq!(config.weight_of(pid), 1.0);
        }
    }

    #[test]
    #[should_panic(expected = "one weight per acceptor")]
    fn weight_list_length_must_match_acceptor_count() {
        SystemConfig::new(1, 3, 1).with_weights(vec![1.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "one fail rate per process")]
    fn fail_rate_list_length_must_match_process_count() {
        SystemConfig::new(1, 1, 1).with_fail_rates(vec![0.0]);
    }

    #[test]
    fn dynamic_weights_are_uniform_with_unit_total() {
        let config = SystemConfig::new(1, 5, 2).with_dynamic_weights();
        assert_eq!(config.total_weight, 1.0);
        for &pid in &config.acceptor_ids {
            assert!((config.weight_of(pid) - 0.2).abs() < 1e-9);
        }
    }

    #[test]
    fn majority_is_strictly_more_than_half_the_total_weight() {
        let config = SystemConfig::new(3, 3, 3);
        let one: HashSet<usize> = [3].iter().cloned().collect();
        let two: HashSet<usize> = [3, 4].iter().cloned().collect();
        assert!(!config.is_weighted_majority(&one));
        assert!(config.is_weighted_majority(&two));
    }

    #[test]
    fn a_heavy_acceptor_can_form_a_majority_alone() {
        let config = SystemConfig::new(3, 3, 3).with_weights(vec![1.0, 1.0, 3.0]);
        let heavy: HashSet<usize> = [5].iter().cloned().collect();
        let light: HashSet<usize> = [3, 4].iter().cloned().collect();
        assert!(config.is_weighted_majority(&heavy));
        assert!(!config.is_weighted_majority(&light));
    }

    #[test]
    fn unknown_pids_carry_no_weight() {
        let config = SystemConfig::new(1, 3, 1);
        let strangers: HashSet<usize> = [40, 41].iter().cloned().collect();
        assert!(!config.is_weighted_majority(&strangers));
    }
}
