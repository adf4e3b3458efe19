extern crate bincode;
extern crate config;
#[macro_use]
extern crate log;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod analyzer;
pub mod configurations;
pub mod mailbox;
pub mod message;
pub mod paxos;
pub mod system;
