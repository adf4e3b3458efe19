//! A driver which reads proposal values from the standard input (or from its command-line
//! arguments) and submits them to a small cohort, one Paxos instance per value.
//!
//! Run this binary as follows
//!     RUST_LOG=weighted_paxos=info cargo run --bin interactive
//! and enter one unsigned value per prompt; 0 ends the run. Or pass the values directly:
//!     cargo run --bin interactive -- 7 11 42

extern crate env_logger;
#[macro_use]
extern crate text_io;
extern crate weighted_paxos;

use std::env;
use std::io;
use std::io::prelude::*;

use weighted_paxos::configurations::SystemConfig;
use weighted_paxos::system::System;

fn main() {
    env_logger::init();

    let config = SystemConfig::new(1, 3, 2).with_message_timeout(0.2);
    let mut system = System::<u64>::new(config);
    system.start();

    let args: Vec<String> = env::args().collect();
    let mut submitted: u64 = 0;

    if args.len() > 1 {
        for arg in args.iter().skip(1) {
            let value: u64 = match arg.parse() {
                Ok(value) => value,
                Err(_) => {
                    eprintln!("only unsigned integer values are supported: {}", arg);
                    continue;
                }
            };
            system.submit(value);
            submitted += 1;
        }
    } else {
        loop {
            print!("Enter a value (0 quits): ");
            io::stdout().flush().expect("could not flush stdout"); // print! is not very clever.
            let value: u64 = read!();
            if value == 0 {
                break;
            }
            system.submit(value);
            submitted += 1;
        }
    }

    system.shutdown_agents();
    let mut report = system.quit();
    report.config.num_test_requests = submitted;
    report.print_results();
    report.print_summary();
}
