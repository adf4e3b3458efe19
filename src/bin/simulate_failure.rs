//! Compares how a 5-5-5 cohort with two mildly and two badly lossy acceptors fares under equal
//! static weights versus weights biased towards the reliable acceptors.
//!
//! Run this binary as follows
//!     RUST_LOG=weighted_paxos=info cargo run --bin simulate_failure

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rand;
extern crate weighted_paxos;

use std::thread;

use weighted_paxos::configurations::SystemConfig;
use weighted_paxos::mailbox::Mailbox;
use weighted_paxos::system::System;

const REQUESTS: u64 = 100;

fn fail_rates() -> Vec<f64> {
    // Proposers and learners are reliable; acceptors 7, 8 lose a fifth and 9, 10 two fifths of
    // their inbound messages.
    vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.2, 0.2, 0.4, 0.4, 0.0, 0.0, 0.0, 0.0, 0.0]
}

fn run(config: SystemConfig) {
    let pace = config.timeout() / 2;
    let mailbox = Mailbox::with_fail_rates(&config, rand::random());
    let mut system = System::<u64>::with_mailbox(config, mailbox);
    system.start();
    for value in 1..=REQUESTS {
        system.submit(value);
        thread::sleep(pace);
    }
    system.shutdown_agents();

    let report = system.quit();
    report.print_results();
    report.print_summary();
    report.append_csv("log.txt").expect("could not append the run summary");
}

fn main() {
    env_logger::init();

    info!("equal weights: the lossy acceptors count as much as the reliable ones");
    let equal = SystemConfig::new(5, 5, 5)
        .with_num_test_requests(REQUESTS)
        .with_message_timeout(0.1)
        .with_fail_rates(fail_rates());
    run(equal);

    info!("biased weights: the reliable acceptors can form a majority on their own");
    let biased = SystemConfig::new(5, 5, 5)
        .with_num_test_requests(REQUESTS)
        .with_message_timeout(0.1)
        .with_weights(vec![3.0, 2.0, 2.0, 1.0, 1.0])
        .with_fail_rates(fail_rates());
    run(biased);
}
