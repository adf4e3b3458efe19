//! The module that wires a simulated cohort together. A `System` owns the mailbox router thread,
//! the result-logger thread and one thread per agent; the driver talks to it through `start`,
//! `submit`, `shutdown_agents` and `quit`. The module also contains the result log filled by the
//! learners and the end-of-run summary derived from it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::configurations::{SystemConfig, LEADER};
use crate::mailbox::{Mailbox, MailboxCounts};
use crate::message::{ClientRequest, Message};
use crate::paxos::{Acceptor, Learner, Proposer, Runnable};

pub(crate) enum LogEvent<T> {
    Result { source: usize, instance: u64, value: T },
    Quit,
}

/// The producer half of the result log: a clonable handle through which learners record the
/// values they saw decided.
pub struct ResultLogger<T> {
    tx: Sender<LogEvent<T>>,
}

// Implemented manually to avoid the unnecessary `T: Clone` bound a derive would add.
impl<T> Clone for ResultLogger<T> {
    fn clone(&self) -> Self {
        ResultLogger { tx: self.tx.clone() }
    }
}

impl<T> ResultLogger<T> {
    pub(crate) fn channel() -> (Self, Receiver<LogEvent<T>>) {
        let (tx, rx) = mpsc::channel();
        (ResultLogger { tx }, rx)
    }

    pub fn log_result(&self, source: usize, instance: u64, value: T) {
        // The consumer going away during teardown is not the producer's problem.
        let _ = self.tx.send(LogEvent::Result { source, instance, value });
    }

    pub(crate) fn quit(&self) {
        let _ = self.tx.send(LogEvent::Quit);
    }
}

/// The single-consumer loop of the result log. Runs on its own thread; returns the finished log
/// once a quit event arrives, keeping any results that were already queued behind it.
pub(crate) fn run_logger<T>(rx: Receiver<LogEvent<T>>) -> ResultLog<T> {
    info!("logger started");
    let mut results: BTreeMap<usize, BTreeMap<u64, T>> = BTreeMap::new();
    loop {
        match rx.recv() {
            Ok(LogEvent::Result { source, instance, value }) => {
                results.entry(source).or_insert_with(BTreeMap::new).insert(instance, value);
            }
            Ok(LogEvent::Quit) | Err(_) => break,
        }
    }
    while let Ok(event) = rx.try_recv() {
        if let LogEvent::Result { source, instance, value } = event {
            results.entry(source).or_insert_with(BTreeMap::new).insert(instance, value);
        }
    }
    info!("logger shutting down");
    ResultLog { results }
}

/// Everything the learners logged, keyed by learner PID and instance.
pub struct ResultLog<T> {
    pub results: BTreeMap<usize, BTreeMap<u64, T>>,
}

impl<T> ResultLog<T>
where
    T: Copy + Debug + PartialEq,
{
    pub fn get(&self, pid: usize, instance: u64) -> Option<T> {
        self.results.get(&pid).and_then(|r| r.get(&instance)).cloned()
    }

    pub fn print_results(&self, config: &SystemConfig) {
        println!("Process result log:");
        for &pid in &config.learner_ids {
            let row: Vec<(u64, Option<T>)> = (1..=config.num_test_requests)
                .map(|instance| (instance, self.get(pid, instance)))
                .collect();
            println!("  {}: {:?}", pid, row);
        }
    }

    /// Whether every learner logged exactly the same values for exactly the same instances.
    pub fn is_consistent(&self, config: &SystemConfig) -> bool {
        let mut learners = config.learner_ids.iter();
        let reference = match learners.next() {
            Some(&pid) => self.results.get(&pid),
            None => return true,
        };
        learners.all(|&pid| self.results.get(&pid).eq(&reference))
    }

    pub fn summary(&self, config: &SystemConfig) -> ResultSummary {
        ResultSummary::new(self, config)
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

/// Per-run accounting over the configured instance range: how many values each learner actually
/// learned, and a per-instance classification. `good`/`bad` split instances by cross-learner
/// agreement; `empty`/`incomplete`/`complete` split them by how many learners learned a value.
#[derive(Debug, Clone)]
pub struct ResultSummary {
    pub learned_values: usize,
    pub missing_values: usize,
    pub total_values: usize,
    pub learned_values_percent: f64,
    pub missing_values_percent: f64,

    pub good_instances: usize,
    pub bad_instances: usize,
    pub empty_instances: usize,
    pub incomplete_instances: usize,
    pub complete_instances: usize,
    pub good_instances_percent: f64,
    pub bad_instances_percent: f64,
    pub empty_instances_percent: f64,
    pub incomplete_instances_percent: f64,
    pub complete_instances_percent: f64,

    pub num_instances: u64,

    pub consistent: bool,
}

impl ResultSummary {
    fn new<T>(log: &ResultLog<T>, config: &SystemConfig) -> Self
    where
        T: Copy + Debug + PartialEq,
    {
        let pids = &config.learner_ids;
        let num_instances = config.num_test_requests;

        let mut learned_values = 0;
        let mut missing_values = 0;
        let mut good_instances = 0;
        let mut bad_instances = 0;
        let mut empty_instances = 0;
        let mut incomplete_instances = 0;
        let mut complete_instances = 0;

        for instance in 1..=num_instances {
            let mut distinct: Vec<T> = Vec::new();
            let mut num_missing = 0;
            for &pid in pids {
                match log.get(pid, instance) {
                    Some(value) => {
                        learned_values += 1;
                        if !distinct.contains(&value) {
                            distinct.push(value);
                        }
                    }
                    None => {
                        missing_values += 1;
                        num_missing += 1;
                    }
                }
            }
            match distinct.len() {
                0 => {
                    good_instances += 1;
                    empty_instances += 1;
                }
                1 => {
                    good_instances += 1;
                    if num_missing == 0 {
                        complete_instances += 1;
                    } else {
                        incomplete_instances += 1;
                    }
                }
                _ => bad_instances += 1,
            }
        }

        let total_values = learned_values + missing_values;
        let instance_total = num_instances as usize;

        ResultSummary {
            learned_values,
            missing_values,
            total_values,
            learned_values_percent: percent(learned_values, total_values),
            missing_values_percent: percent(missing_values, total_values),
            good_instances,
            bad_instances,
            empty_instances,
            incomplete_instances,
            complete_instances,
            good_instances_percent: percent(good_instances, instance_total),
            bad_instances_percent: percent(bad_instances, instance_total),
            empty_instances_percent: percent(empty_instances, instance_total),
            incomplete_instances_percent: percent(incomplete_instances, instance_total),
            complete_instances_percent: percent(complete_instances, instance_total),
            num_instances,
            consistent: bad_instances == 0,
        }
    }

    pub fn print(&self) {
        println!(
            "\
Values:
    Learned: {:>6} {:>6.1}%
    Missing: {:>6} {:>6.1}%
    =======================
      Total: {:>6}

Instances:
    Consistent: {:>6} {:>6.1}%
  Inconsistent: {:>6} {:>6.1}%
    --------------------------
         Empty: {:>6} {:>6.1}%
    Incomplete: {:>6} {:>6.1}%
      Complete: {:>6} {:>6.1}%
    ==========================
         Total: {:>6}",
            self.learned_values,
            self.learned_values_percent,
            self.missing_values,
            self.missing_values_percent,
            self.total_values,
            self.good_instances,
            self.good_instances_percent,
            self.bad_instances,
            self.bad_instances_percent,
            self.empty_instances,
            self.empty_instances_percent,
            self.incomplete_instances,
            self.incomplete_instances_percent,
            self.complete_instances,
            self.complete_instances_percent,
            self.num_instances,
        );
    }

    fn headings() -> [&'static str; 16] {
        [
            "learned_values",
            "learned_values_percent",
            "missing_values",
            "missing_values_percent",
            "total_values",
            "good_instances",
            "good_instances_percent",
            "bad_instances",
            "bad_instances_percent",
            "empty_instances",
            "empty_instances_percent",
            "incomplete_instances",
            "incomplete_instances_percent",
            "complete_instances",
            "complete_instances_percent",
            "total_instances",
        ]
    }

    fn data(&self) -> Vec<String> {
        vec![
            self.learned_values.to_string(),
            format!("{:.1}", self.learned_values_percent),
            self.missing_values.to_string(),
            format!("{:.1}", self.missing_values_percent),
            self.total_values.to_string(),
            self.good_instances.to_string(),
            format!("{:.1}", self.good_instances_percent),
            self.bad_instances.to_string(),
            format!("{:.1}", self.bad_instances_percent),
            self.empty_instances.to_string(),
            format!("{:.1}", self.empty_instances_percent),
            self.incomplete_instances.to_string(),
            format!("{:.1}", self.incomplete_instances_percent),
            self.complete_instances.to_string(),
            format!("{:.1}", self.complete_instances_percent),
            self.num_instances.to_string(),
        ]
    }
}

/// What a finished run hands back to the driver: the configuration it ran under, the mailbox
/// traffic counters and everything the learners logged.
pub struct RunReport<T> {
    pub config: SystemConfig,
    pub counts: MailboxCounts,
    pub log: ResultLog<T>,
}

impl<T> RunReport<T>
where
    T: Copy + Debug + PartialEq,
{
    pub fn summary(&self) -> ResultSummary {
        self.log.summary(&self.config)
    }

    pub fn print_results(&self) {
        self.log.print_results(&self.config);
    }

    pub fn print_summary(&self) {
        self.summary().print();
        println!(
            "\
Messages:
    Sent: {:>6} {:>6.1}%
    Fail: {:>6} {:>6.1}%
   ==============
   Total: {:>6}
   --------------
    Recv: {:>6}",
            self.counts.sent,
            percent(self.counts.sent, self.counts.total()),
            self.counts.failed,
            percent(self.counts.failed, self.counts.total()),
            self.counts.total(),
            self.counts.recv,
        );
    }

    /// Appends one CSV row for this run, writing the heading row first if the file is new.
    pub fn append_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let write_headings = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if write_headings {
            let mut headings: Vec<&str> = vec!["agents", "fail_rates"];
            headings.extend_from_slice(&ResultSummary::headings());
            headings.extend_from_slice(&[
                "messages_sent",
                "messages_sent_percent",
                "failed_messages",
                "failed_messages_percent",
                "total_messages",
                "received_messages",
            ]);
            writeln!(file, "{}", headings.join(","))?;
        }
        let mut row = vec![
            format!(
                "\"({}, {}, {})\"",
                self.config.num_proposers, self.config.num_acceptors, self.config.num_learners
            ),
            format!("\"{:?}\"", self.config.fail_rates),
        ];
        row.extend(self.summary().data());
        row.push(self.counts.sent.to_string());
        row.push(format!("{:.1}", percent(self.counts.sent, self.counts.total())));
        row.push(self.counts.failed.to_string());
        row.push(format!("{:.1}", percent(self.counts.failed, self.counts.total())));
        row.push(self.counts.total().to_string());
        row.push(self.counts.recv.to_string());
        writeln!(file, "{}", row.join(","))?;
        Ok(())
    }
}

/// A simulated network of Paxos agents living inside one process, one thread per agent.
pub struct System<T> {
    pub config: SystemConfig,
    mailbox: Arc<Mailbox<T>>,
    mailbox_thread: Option<thread::JoinHandle<()>>,
    logger: ResultLogger<T>,
    logger_thread: Option<thread::JoinHandle<ResultLog<T>>>,
    agents: Vec<thread::JoinHandle<()>>,
}

impl<T> System<T>
where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug + PartialEq + Send + 'static,
{
    /// A system over a lossless mailbox.
    pub fn new(config: SystemConfig) -> Self {
        let mailbox = Mailbox::new(&config);
        System::with_mailbox(config, mailbox)
    }

    /// A system over an explicitly built mailbox, e.g. one with a drop model.
    pub fn with_mailbox(config: SystemConfig, mailbox: Mailbox<T>) -> Self {
        info!("system starting: {:?}", config);
        let mailbox = Arc::new(mailbox);

        let mailbox_thread = {
            let mailbox = Arc::clone(&mailbox);
            thread::Builder::new()
                .name("mailbox".to_string())
                .spawn(move || mailbox.run())
                .expect("could not spawn the mailbox thread")
        };

        let (logger, rx) = ResultLogger::channel();
        let logger_thread = thread::Builder::new()
            .name("logger".to_string())
            .spawn(move || run_logger(rx))
            .expect("could not spawn the logger thread");

        let agents = System::launch_agents(&config, &mailbox, &logger);

        System {
            config,
            mailbox,
            mailbox_thread: Some(mailbox_thread),
            logger,
            logger_thread: Some(logger_thread),
            agents,
        }
    }

    fn launch_agents(
        config: &SystemConfig,
        mailbox: &Arc<Mailbox<T>>,
        logger: &ResultLogger<T>,
    ) -> Vec<thread::JoinHandle<()>> {
        let mut agents = Vec::with_capacity(config.num_processes());
        for &pid in &config.proposer_ids {
            let mailbox = Arc::clone(mailbox);
            let handle = thread::Builder::new()
                .name(format!("proposer-{}", pid))
                .spawn(move || {
                    let mut proposer = Proposer::new(pid, mailbox);
                    proposer.run();
                })
                .expect("could not spawn a proposer thread");
            agents.push(handle);
        }
        for &pid in &config.acceptor_ids {
            let mailbox = Arc::clone(mailbox);
            let handle = thread::Builder::new()
                .name(format!("acceptor-{}", pid))
                .spawn(move || {
                    let mut acceptor = Acceptor::new(pid, mailbox);
                    acceptor.run();
                })
                .expect("could not spawn an acceptor thread");
            agents.push(handle);
        }
        for &pid in &config.learner_ids {
            let mailbox = Arc::clone(mailbox);
            let logger = logger.clone();
            let handle = thread::Builder::new()
                .name(format!("learner-{}", pid))
                .spawn(move || {
                    let mut learner = Learner::new(pid, mailbox, logger);
                    learner.run();
                })
                .expect("could not spawn a learner thread");
            agents.push(handle);
        }
        agents
    }

    /// Broadcasts the configuration to every agent as the first message of the run.
    pub fn start(&self) {
        for pid in 0..self.config.num_processes() {
            self.mailbox.send(pid, &Message::Config(self.config.clone()));
        }
    }

    /// Sends a client request to the leader proposer, opening a new instance.
    pub fn submit(&self, value: T) {
        self.submit_to(LEADER, value);
    }

    pub fn submit_to(&self, pid: usize, value: T) {
        self.mailbox
            .send(pid, &Message::ClientRequest(ClientRequest { source: None, value }));
    }

    pub fn mailbox(&self) -> &Arc<Mailbox<T>> {
        &self.mailbox
    }

    /// Waits for the mailbox to go idle, then sends quit to every agent and joins their threads.
    pub fn shutdown_agents(&mut self) {
        info!("system waiting for the mailbox to go idle");
        self.mailbox.join();
        info!("system shutting down agents");
        for pid in 0..self.config.num_processes() {
            self.mailbox.send(pid, &Message::Quit);
        }
        for handle in self.agents.drain(..) {
            handle.join().expect("an agent thread panicked");
        }
    }

    /// Stops the logger and the mailbox router and hands back the run's results.
    pub fn quit(mut self) -> RunReport<T> {
        self.logger.quit();
        let log = self
            .logger_thread
            .take()
            .expect("the logger was already joined")
            .join()
            .expect("the logger thread panicked");
        self.mailbox.quit();
        if let Some(handle) = self.mailbox_thread.take() {
            handle.join().expect("the mailbox thread panicked");
        }
        info!("system terminated");
        RunReport {
            counts: self.mailbox.counts(),
            config: self.config.clone(),
            log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_from(entries: &[(usize, u64, u32)]) -> ResultLog<u32> {
        let mut results: BTreeMap<usize, BTreeMap<u64, u32>> = BTreeMap::new();
        for &(pid, instance, value) in entries {
            results.entry(pid).or_insert_with(BTreeMap::new).insert(instance, value);
        }
        ResultLog { results }
    }

    #[test]
    fn the_logger_thread_collects_results_until_quit() {
        let (logger, rx) = ResultLogger::<u32>::channel();
        let consumer = thread::spawn(move || run_logger(rx));

        logger.log_result(4, 1, 10);
        logger.log_result(5, 1, 10);
        logger.log_result(4, 2, 20);
        logger.quit();

        let log = consumer.join().unwrap();
        assert_eq!(log.get(4, 1), Some(10));
        assert_eq!(log.get(5, 1), Some(10));
        assert_eq!(log.get(4, 2), Some(20));
        assert_eq!(log.get(5, 2), None);
    }

    #[test]
    fn the_summary_classifies_instances() {
        let config = SystemConfig::new(1, 1, 2).with_num_test_requests(4);
        // Learners are pids 2 and 3. Instance 1 complete, 2 incomplete, 3 empty, 4 inconsistent.
        let log = log_from(&[
            (2, 1, 10),
            (3, 1, 10),
            (2, 2, 20),
            (2, 4, 40),
            (3, 4, 41),
        ]);
        let summary = log.summary(&config);

        assert_eq!(summary.complete_instances, 1);
        assert_eq!(summary.incomplete_instances, 1);
        assert_eq!(summary.empty_instances, 1);
        assert_eq!(summary.good_instances, 3);
        assert_eq!(summary.bad_instances, 1);
        assert!(!summary.consistent);

        assert_eq!(summary.learned_values, 5);
        assert_eq!(summary.missing_values, 3);
        assert_eq!(summary.total_values, 8);
        assert!((summary.bad_instances_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn an_all_complete_run_is_consistent() {
        let config = SystemConfig::new(1, 1, 2).with_num_test_requests(2);
        let log = log_from(&[(2, 1, 1), (3, 1, 1), (2, 2, 2), (3, 2, 2)]);
        let summary = log.summary(&config);
        assert_eq!(summary.complete_instances, 2);
        assert_eq!(summary.bad_instances, 0);
        assert!(summary.consistent);
        assert!(log.is_consistent(&config));
    }

    #[test]
    fn learners_with_different_logs_are_inconsistent() {
        let config = SystemConfig::new(1, 1, 2).with_num_test_requests(2);
        let log = log_from(&[(2, 1, 1), (3, 1, 1), (2, 2, 2)]);
        assert!(!log.is_consistent(&config));
    }

    #[test]
    fn csv_rows_accumulate_under_one_heading() {
        let path = std::env::temp_dir().join(format!("weighted-paxos-log-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let report = RunReport {
            config: SystemConfig::new(1, 1, 1).with_num_test_requests(1),
            counts: MailboxCounts { sent: 10, recv: 8, failed: 2 },
            log: log_from(&[(2, 1, 5)]),
        };
        report.append_csv(&path).unwrap();
        report.append_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("agents,fail_rates,learned_values"));
        assert_eq!(lines[1], lines[2]);

        std::fs::remove_file(&path).unwrap();
    }
}
