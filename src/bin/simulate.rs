//! Runs one simulation described by `Sim.toml` at the crate root.
//!
//! Run this binary as follows
//!     RUST_LOG=weighted_paxos=info cargo run --bin simulate

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rand;
extern crate weighted_paxos;

use std::thread;

use weighted_paxos::configurations;
use weighted_paxos::mailbox::Mailbox;
use weighted_paxos::system::System;

fn main() {
    env_logger::init();

    let config = configurations::load("Sim");
    info!("configuration: {:?}", config);

    let pace = config.timeout() / 2;
    let requests = config.num_test_requests;

    let mut system = if config.fail_rates.is_empty() {
        System::<u64>::new(config)
    } else {
        let mailbox = Mailbox::with_fail_rates(&config, rand::random());
        System::with_mailbox(config, mailbox)
    };
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
