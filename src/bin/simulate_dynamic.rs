//! Runs a 1-5-2 cohort with three lossy acceptors and dynamic weights: each proposer's analyzer
//! shifts voting weight away from acceptors that stop answering, and ordered learners retry the
//! instances they miss.
//!
//! Run this binary as follows
//!     RUST_LOG=weighted_paxos=info cargo run --bin simulate_dynamic

extern crate env_logger;
extern crate rand;
extern crate weighted_paxos;

use std::thread;

use weighted_paxos::configurations::SystemConfig;
use weighted_paxos::mailbox::Mailbox;
use weighted_paxos::system::System;

fn main() {
    env_logger::init();

    let config = SystemConfig::new(1, 5, 2)
        .with_num_test_requests(100)
        .with_message_timeout(0.5)
        .with_dynamic_weights()
        .with_ordered_learners()
        .with_fail_rates(vec![0.0, 0.0, 0.0, 0.2, 0.3, 0.4, 0.0, 0.0]);

    let pace = config.timeout();
    let requests = config.num_test_requests;
    let mailbox = Mailbox::with_fail_rates(&config, rand::random());
    let mut system = System::<u64>::with_mailbox(config, mailbox);
    system.start();
    for value in 1..=requests {
        system.submit(value);
        thread::sleep(pace);
    }
    system.shutdown_agents();

    let report = system.quit();
    report.print_results();
    report.print_summary();
    report.append_csv("log.txt").expect("could not append the run summary");
}
