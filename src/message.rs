//! A module which contains the definition of the messages exchanged between the agents of the
//! weighted Paxos simulation.

use std::collections::HashMap;

use crate::configurations::SystemConfig;

/// A numbered proposal for one consensus instance.
///
/// `number` is globally unique and totally ordered across proposers, because every proposer draws
/// its numbers from a disjoint arithmetic progression. `value` stays `None` until the proposer has
/// decided which value to push in phase 2.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct Proposal<T> {
    pub number: i64,

    // The consensus slot this proposal belongs to.
    pub instance: u64,

    // PID of the proposer that created this proposal.
    pub pid: usize,

    pub value: Option<T>,
}

/// An enum which contains all types of messages which the agents of the simulation can exchange.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message<T> {
    Config(SystemConfig),
    ClientRequest(ClientRequest<T>),
    Prepare(Prepare<T>),
    PrepareResponse(PrepareResponse<T>),
    Accept(Accept<T>),
    AcceptResponse(AcceptResponse<T>),
    Retry(Retry),
    AdjustWeights(AdjustWeights),
    Quit,
}

/// A request from a client (the driver) asking a proposer to start a new Paxos instance for the
/// given value. `source` is `None` because the driver is not part of the cohort.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct ClientRequest<T> {
    pub source: Option<usize>,

    pub value: T,
}

/// Phase 1a: sent from one proposer to ALL acceptors.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct Prepare<T> {
    pub source: usize,

    pub proposal: Proposal<T>,
}

/// Phase 1b, the promise: sent from one acceptor back to the proposer of the prepare.
/// `highest_accepted` carries the highest-numbered proposal this acceptor has accepted for the
/// instance, if any, so that the proposer can preserve a value that may already have been chosen.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct PrepareResponse<T> {
    pub source: usize,

    pub proposal: Proposal<T>,

    pub highest_accepted: Option<Proposal<T>>,
}

/// Phase 2a: sent from one proposer to ALL acceptors, now with `proposal.value` filled in.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct Accept<T> {
    pub source: usize,

    pub proposal: Proposal<T>,
}

/// Phase 2b: sent from one acceptor to the proposer of the accept and to every learner.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct AcceptResponse<T> {
    pub source: usize,

    pub proposal: Proposal<T>,
}

/// Sent by a lagging learner to the leader proposer, asking it to re-run the protocol for an
/// instance the learner never saw decided.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct Retry {
    pub source: usize,

    pub instance: u64,
}

/// The full acceptor weight vector, broadcast by a proposer whose analyzer has adjusted weights.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdjustWeights {
    pub source: usize,

    pub weights: HashMap<usize, f64>,
}

impl<T> Message<T> {
    /// The PID of the sending agent, when the message has one. Configuration and quit messages
    /// come from the system itself, and client requests come from outside the cohort.
    pub fn source(&self) -> Option<usize> {
        match *self {
            Message::Config(_) | Message::Quit => None,
            Message::ClientRequest(ref m) => m.source,
            Message::Prepare(ref m) => Some(m.source),
            Message::PrepareResponse(ref m) => Some(m.source),
            Message::Accept(ref m) => Some(m.source),
            Message::AcceptResponse(ref m) => Some(m.source),
            Message::Retry(ref m) => Some(m.source),
            Message::AdjustWeights(ref m) => Some(m.source),
        }
    }

    /// Control-plane messages are exempt from the mailbox drop model: losing one of these would
    /// not model a lossy network, it would break the simulation harness itself.
    pub fn is_control(&self) -> bool {
        match *self {
            Message::Config(_)
            | Message::ClientRequest(_)
            | Message::AdjustWeights(_)
            | Message::Quit => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_plane_messages_are_exempt_from_dropping() {
        assert!(Message::<u32>::Quit.is_control());
        assert!(Message::Config::<u32>(crate::configurations::SystemConfig::new(1, 1, 1)).is_control());
        assert!(Message::ClientRequest(ClientRequest { source: None, value: 7u32 }).is_control());
        assert!(Message::<u32>::AdjustWeights(AdjustWeights { source: 0, weights: HashMap::new() })
            .is_control());

        let proposal = Proposal { number: 0, instance: 1, pid: 0, value: Some(7u32) };
        assert!(!Message::Prepare(Prepare { source: 0, proposal }).is_control());
        assert!(!Message::AcceptResponse(AcceptResponse { source: 1, proposal }).is_control());
        assert!(!Message::<u32>::Retry(Retry { source: 2, instance: 1 }).is_control());
    }

    #[test]
    fn source_is_absent_for_system_messages() {
        assert_eq!(Message::<u32>::Quit.source(), None);
        assert_eq!(Message::ClientRequest(ClientRequest { source: None, value: 1u32 }).source(), None);
        assert_eq!(Message::<u32>::Retry(Retry { source: 8, instance: 3 }).source(), Some(8));
    }

    #[test]
    fn messages_survive_the_wire_codec() {
        let proposal = Proposal { number: 4, instance: 2, pid: 1, value: Some(42u32) };
        let m = Message::PrepareResponse(PrepareResponse {
            source: 3,
            proposal,
            highest_accepted: None,
        });
        let encoded = bincode::serialize(&m).unwrap();
        let decoded: Message<u32> = bincode::deserialize(&encoded).unwrap();
        match decoded {
            Message::PrepareResponse(r) => {
                assert_eq!(r.source, 3);
                assert_eq!(r.proposal, proposal);
                assert!(r.highest_accepted.is_none());
            }
            other => panic!("decoded into the wrong variant: {:?}", other),
        }
    }
}
