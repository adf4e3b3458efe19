//! The module that contains the structs representing proposers, acceptors and learners of the
//! weighted Paxos simulation. It also contains the main logic of the protocol: the per-instance
//! two-phase state machine on the proposer side, promise/accept bookkeeping on the acceptor side,
//! and weighted quorum detection on the learner side.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::Level;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::analyzer::Analyzer;
use crate::configurations::{SystemConfig, LEADER};
use crate::mailbox::Mailbox;
use crate::message::{
    Accept, AcceptResponse, AdjustWeights, ClientRequest, Message, Prepare, PrepareResponse,
    Proposal, Retry,
};
use crate::system::ResultLogger;

/// Implement this trait if you are an agent which needs to run in a receive loop until told to
/// quit.
pub trait Runnable {
    fn run(&mut self);
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Phase {
    PrepareSent,
    AcceptSent,
}

/// The state a proposer keeps for one round (one proposal number) of one instance. Messages can
/// arrive out of order and rounds for the same instance can overlap after a retry, so each round
/// carries its own responder sets.
struct ProposerRound<T> {
    // The client value this round would like to get chosen, if no earlier value gets in the way.
    request: Option<T>,

    // The proposal of this round; `value` is filled in when phase 2 starts.
    proposal: Proposal<T>,

    prepare_responders: HashSet<usize>,

    // The highest-numbered previously-accepted proposal reported in any promise. If it carries a
    // value, Paxos obliges this round to adopt it.
    highest_promise: Option<Proposal<T>>,

    accept_responders: HashSet<usize>,

    phase: Phase,

    // Latched once the accept responders first form a weighted majority, so the analyzer runs one
    // check per round.
    adjusted: bool,
}

impl<T> ProposerRound<T> {
    fn new(proposal: Proposal<T>, request: Option<T>) -> Self {
        ProposerRound {
            request,
            proposal,
            prepare_responders: HashSet::new(),
            highest_promise: None,
            accept_responders: HashSet::new(),
            phase: Phase::PrepareSent,
            adjusted: false,
        }
    }
}

/// The struct representing the proposer in the Paxos algorithm.
///
/// Each proposer owns a disjoint arithmetic progression of proposal numbers: unless the
/// configuration overrides them, the progression starts at the proposer's PID and steps by the
/// number of proposers, which keeps numbers globally unique and totally ordered.
pub struct Proposer<T> {
    pid: usize,

    mailbox: Arc<Mailbox<T>>,

    config: Option<SystemConfig>,

    active: bool,

    // The next proposal number to hand out, and how far to jump after handing it out.
    sequence: i64,
    sequence_step: i64,

    // The instance the next client request will open.
    next_instance: u64,

    // instance -> proposal number -> round state. Keys are never reused.
    instances: HashMap<u64, HashMap<i64, ProposerRound<T>>>,

    // The original client value attached to each instance, so a retry can re-propose it.
    requests: HashMap<u64, T>,

    // Present only when the configuration enables dynamic weights.
    analyzer: Option<Analyzer>,
}

impl<T> Proposer<T>
where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug + PartialEq,
{
    pub fn new(pid: usize, mailbox: Arc<Mailbox<T>>) -> Self {
        Proposer {
            pid,
            mailbox,
            config: None,
            active: true,
            sequence: pid as i64,
            sequence_step: 1,
            next_instance: 1,
            instances: HashMap::new(),
            requests: HashMap::new(),
            analyzer: None,
        }
    }

    fn set_config(&mut self, config: SystemConfig) {
        if let Some(start) = config.proposer_sequence_start {
            self.sequence = start;
        }
        self.sequence_step = config
            .proposer_sequence_step
            .unwrap_or(config.num_proposers as i64);
        if config.dynamic_weights {
            self.analyzer = Some(Analyzer::new(config.acceptor_ids.clone()));
        }
        self.config = Some(config);
    }

    fn handle_message(&mut self, msg: Message<T>) {
        match msg {
            Message::Config(config) => self.set_config(config),
            Message::ClientRequest(request) => self.handle_client_request(request),
            Message::PrepareResponse(promise) => self.handle_prepare_response(promise),
            Message::AcceptResponse(accepted) => self.handle_accept_response(accepted),
            Message::Retry(retry) => self.handle_retry(retry),
            Message::Quit => self.active = false,
            other => debug!("[P={}] unexpected message, ignoring: {:?}", self.pid, other),
        }
    }

    /// Starts a new Paxos instance for the client's value.
    fn handle_client_request(&mut self, request: ClientRequest<T>) {
        if log_enabled!(Level::Debug) {
            debug!("[P={}] handling client request: {:?}", self.pid, request);
        }
        self.start_round(Some(request.value), None);
    }

    /// Re-runs the protocol for an instance some learner is missing, with a fresh higher number.
    /// The value proposed is the original client value recorded when the instance was first
    /// opened; if any acceptor already accepted a value, phase 1 forces that value anyway.
    fn handle_retry(&mut self, retry: Retry) {
        let value = self.requests.get(&retry.instance).cloned();
        if log_enabled!(Level::Info) {
            info!(
                "[P={}] learner {} asked to re-run instance {}",
                self.pid, retry.source, retry.instance
            );
        }
        self.start_round(value, Some(retry.instance));
    }

    fn create_proposal(&mut self, instance: Option<u64>) -> Proposal<T> {
        let fresh = instance.is_none();
        let instance = instance.unwrap_or(self.next_instance);
        let proposal = Proposal {
            number: self.sequence,
            instance,
            pid: self.pid,
            value: None,
        };
        self.sequence += self.sequence_step;
        // Only advance the instance counter if we weren't told which instance to use.
        if fresh {
            self.next_instance += 1;
        }
        proposal
    }

    fn start_round(&mut self, value: Option<T>, instance: Option<u64>) {
        let acceptors = match self.config {
            Some(ref config) => config.acceptor_ids.clone(),
            None => {
                warn!("[P={}] request before configuration, dropping", self.pid);
                return;
            }
        };

        let proposal = self.create_proposal(instance);
        if let Some(v) = value {
            self.requests.entry(proposal.instance).or_insert(v);
        }
        self.instances
            .entry(proposal.instance)
            .or_insert_with(HashMap::new)
            .insert(proposal.number, ProposerRound::new(proposal, value));

        if log_enabled!(Level::Info) {
            info!("[P={}] sending prepares for {:?}", self.pid, proposal);
        }
        for &pid in &acceptors {
            self.mailbox
                .send(pid, &Message::Prepare(Prepare { source: self.pid, proposal }));
        }
        if let Some(ref mut analyzer) = self.analyzer {
            for &pid in &acceptors {
                analyzer.add_send(pid);
            }
        }
    }

    /// Handles a promise. Once a weighted majority of acceptors has promised, picks the value
    /// (a previously accepted one if any promise reported it, else the client's) and broadcasts
    /// the accept requests.
    fn handle_prepare_response(&mut self, promise: PrepareResponse<T>) {
        if let Some(ref mut analyzer) = self.analyzer {
            analyzer.add_recvd(promise.source);
        }
        let config = match self.config {
            Some(ref config) => config,
            None => return,
        };
        let round = match self
            .instances
            .get_mut(&promise.proposal.instance)
            .and_then(|rounds| rounds.get_mut(&promise.proposal.number))
        {
            Some(round) => round,
            None => {
                debug!("[P={}] promise for unknown round: {:?}", self.pid, promise.proposal);
                return;
            }
        };

        round.prepare_responders.insert(promise.source);
        if let Some(reported) = promise.highest_accepted {
            let replace = match round.highest_promise {
                Some(ref current) => reported.number > current.number,
                None => true,
            };
            if replace {
                round.highest_promise = Some(reported);
            }
        }

        if round.phase != Phase::PrepareSent {
            return;
        }
        if !config.is_weighted_majority(&round.prepare_responders) {
            return;
        }

        // If any promise reported an accepted value we must adopt it; otherwise we are free to
        // choose and use the client's value.
        let chosen = round.highest_promise.as_ref().and_then(|p| p.value).or(round.request);
        let value = match chosen {
            Some(value) => value,
            None => {
                warn!(
                    "[P={}] no value to propose for instance {}, waiting for a retry",
                    self.pid, promise.proposal.instance
                );
                return;
            }
        };
        round.proposal.value = Some(value);
        round.phase = Phase::AcceptSent;
        let proposal = round.proposal;

        if log_enabled!(Level::Info) {
            info!("[P={}] majority of promises, sending accepts for {:?}", self.pid, proposal);
        }
        for &pid in &config.acceptor_ids {
            self.mailbox
                .send(pid, &Message::Accept(Accept { source: self.pid, proposal }));
        }
        if let Some(ref mut analyzer) = self.analyzer {
            for &pid in &config.acceptor_ids {
                analyzer.add_send(pid);
            }
        }
    }

    /// Handles an accepted notification. The proposer does not conclude the instance (learners
    /// do); it only feeds the analyzer when the accept responders first form a weighted majority.
    fn handle_accept_response(&mut self, accepted: AcceptResponse<T>) {
        if let Some(ref mut analyzer) = self.analyzer {
            analyzer.add_recvd(accepted.source);
        }
        let config = match self.config {
            Some(ref config) => config,
            None => return,
        };
        let crossed = match self
            .instances
            .get_mut(&accepted.proposal.instance)
            .and_then(|rounds| rounds.get_mut(&accepted.proposal.number))
        {
            Some(round) => {
                round.accept_responders.insert(accepted.source);
                if !round.adjusted && config.is_weighted_majority(&round.accept_responders) {
                    round.adjusted = true;
                    true
                } else {
                    false
                }
            }
            None => {
                debug!("[P={}] accepted for unknown round: {:?}", self.pid, accepted.proposal);
                return;
            }
        };
        if crossed {
            self.adjust_weights();
        }
    }

    /// Runs an analyzer pass and, if any weight moved, broadcasts the new weight vector to the
    /// learners. Without an analyzer (static weights) this is a no-op.
    fn adjust_weights(&mut self) {
        let weights = match self.analyzer {
            Some(ref mut analyzer) => {
                analyzer.check();
                if !analyzer.weight_changed {
                    return;
                }
                analyzer.weight_changed = false;
                if log_enabled!(Level::Info) {
                    info!("[P={}] response ratios: {:?}", self.pid, analyzer.msg_ratios);
                    info!("[P={}] adjusted weights: {:?}", self.pid, analyzer.weights);
                }
                analyzer.weights.clone()
            }
            None => return,
        };
        let learners = match self.config {
            Some(ref config) => config.learner_ids.clone(),
            None => return,
        };
        for &pid in &learners {
            self.mailbox.send(
                pid,
                &Message::AdjustWeights(AdjustWeights { source: self.pid, weights: weights.clone() }),
            );
        }
    }
}

impl<T> Runnable for Proposer<T>
where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug + PartialEq,
{
    fn run(&mut self) {
        info!("[P={}] proposer started", self.pid);
        while self.active {
            let msg = self.mailbox.recv(self.pid);
            self.handle_message(msg);
        }
        info!("[P={}] proposer shutting down", self.pid);
    }
}

/// The promise/accept state an acceptor keeps for one instance.
struct AcceptorSlot<T> {
    // The highest proposal number this acceptor has promised not to undercut. Monotone
    // non-decreasing; -1 until the first promise.
    promised: i64,

    // The last proposal accepted for this instance, reported back in later promises.
    accepted: Option<Proposal<T>>,
}

// Implemented manually to avoid the unnecessary `T: Default` bound a derive would add.
// See https://github.com/rust-lang/rust/issues/45036.
impl<T> Default for AcceptorSlot<T> {
    fn default() -> Self {
        AcceptorSlot { promised: -1, accepted: None }
    }
}

/// The struct representing the acceptor in the Paxos algorithm.
pub struct Acceptor<T> {
    pid: usize,

    mailbox: Arc<Mailbox<T>>,

    config: Option<SystemConfig>,

    active: bool,

    instances: HashMap<u64, AcceptorSlot<T>>,
}

impl<T> Acceptor<T>
where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug + PartialEq,
{
    pub fn new(pid: usize, mailbox: Arc<Mailbox<T>>) -> Self {
        Acceptor {
            pid,
            mailbox,
            config: None,
            active: true,
            instances: HashMap::new(),
        }
    }

    fn handle_message(&mut self, msg: Message<T>) {
        match msg {
            Message::Config(config) => self.config = Some(config),
            Message::Prepare(prepare) => self.handle_prepare(prepare),
            Message::Accept(accept) => self.handle_accept(accept),
            Message::Quit => self.active = false,
            other => debug!("[A={}] unexpected message, ignoring: {:?}", self.pid, other),
        }
    }

    /// Promises not to accept lower-numbered proposals, if the prepare's number is strictly
    /// higher than anything promised so far for the instance. Stale prepares are silently
    /// dropped.
    fn handle_prepare(&mut self, prepare: Prepare<T>) {
        let slot = self.instances.entry(prepare.proposal.instance).or_default();
        if prepare.proposal.number > slot.promised {
            slot.promised = prepare.proposal.number;
            let response = PrepareResponse {
                source: self.pid,
                proposal: prepare.proposal,
                highest_accepted: slot.accepted,
            };
            if log_enabled!(Level::Debug) {
                debug!("[A={}] promising: {:?}", self.pid, response);
            }
            self.mailbox.send(prepare.source, &Message::PrepareResponse(response));
        } else {
            debug!(
                "[A={}] stale prepare {:?}, already promised {}",
                self.pid, prepare.proposal, slot.promised
            );
        }
    }

    /// Accepts the proposal unless a higher number has been promised. Equality is deliberate:
    /// the normal case is accepting the very number we promised. Accepting also raises the
    /// promise floor so the accepted number can never regress.
    fn handle_accept(&mut self, accept: Accept<T>) {
        if accept.proposal.value.is_none() {
            warn!("[A={}] accept without a value, dropping: {:?}", self.pid, accept.proposal);
            return;
        }
        let learners = match self.config {
            Some(ref config) => config.learner_ids.clone(),
            None => {
                warn!("[A={}] accept before configuration, dropping", self.pid);
                return;
            }
        };
        let slot = self.instances.entry(accept.proposal.instance).or_default();
        if accept.proposal.number >= slot.promised {
            slot.promised = accept.proposal.number;
            slot.accepted = Some(accept.proposal);
            let response = AcceptResponse { source: self.pid, proposal: accept.proposal };
            if log_enabled!(Level::Debug) {
                debug!("[A={}] accepting: {:?}", self.pid, response);
            }
            // The proposer learns about its majority, and every learner gets a vote.
            self.mailbox.send(accept.source, &Message::AcceptResponse(response));
            for &pid in &learners {
                self.mailbox.send(pid, &Message::AcceptResponse(response));
            }
        } else {
            debug!(
                "[A={}] stale accept {:?}, already promised {}",
                self.pid, accept.proposal, slot.promised
            );
        }
    }
}

impl<T> Runnable for Acceptor<T>
where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug + PartialEq,
{
    fn run(&mut self) {
        info!("[A={}] acceptor started", self.pid);
        while self.active {
            let msg = self.mailbox.recv(self.pid);
            self.handle_message(msg);
        }
        info!("[A={}] acceptor shutting down", self.pid);
    }
}

/// Vote bookkeeping a learner keeps for one instance: which acceptors voted for which value, and
/// whether the instance has been decided. Decidedness is latched, which makes duplicate votes
/// harmless.
struct LearnerSlot<T> {
    votes: Vec<(T, HashSet<usize>)>,
    decided: bool,
}

impl<T> LearnerSlot<T> {
    fn new() -> Self {
        LearnerSlot { votes: Vec::new(), decided: false }
    }
}

/// What the receive loop shares with the background ordering thread in ordered mode.
struct OrderedState<T> {
    results: HashMap<u64, T>,

    // The highest instance a result has been recorded for. The ordering thread never waits for
    // instances beyond this, otherwise it would retry instances that haven't been opened yet.
    highest_instance: u64,

    active: bool,
}

/// The struct representing the learner in the Paxos algorithm.
///
/// In basic mode a decided instance is logged immediately, in arrival order. In ordered mode
/// (`SystemConfig::ordered_learners`) results are recorded into a shared map and a background
/// ordering thread logs them in strict instance order, asking the leader to re-run any instance
/// that stays missing for five message timeouts.
pub struct Learner<T> {
    pid: usize,

    mailbox: Arc<Mailbox<T>>,

    logger: ResultLogger<T>,

    config: Option<SystemConfig>,

    active: bool,

    instances: HashMap<u64, LearnerSlot<T>>,

    ordered: Option<Arc<Mutex<OrderedState<T>>>>,
    orderer: Option<thread::JoinHandle<()>>,
}

impl<T> Learner<T>
where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug + PartialEq + Send + 'static,
{
    pub fn new(pid: usize, mailbox: Arc<Mailbox<T>>, logger: ResultLogger<T>) -> Self {
        Learner {
            pid,
            mailbox,
            logger,
            config: None,
            active: true,
            instances: HashMap::new(),
            ordered: None,
            orderer: None,
        }
    }

    fn set_config(&mut self, config: SystemConfig) {
        if config.ordered_learners && self.ordered.is_none() {
            let shared = Arc::new(Mutex::new(OrderedState {
                results: HashMap::new(),
                highest_instance: 0,
                active: true,
            }));
            let thread_shared = Arc::clone(&shared);
            let mailbox = Arc::clone(&self.mailbox);
            let logger = self.logger.clone();
            let pid = self.pid;
            let message_timeout = config.timeout();
            let orderer = thread::Builder::new()
                .name(format!("orderer-{}", pid))
                .spawn(move || order_results(pid, thread_shared, mailbox, logger, message_timeout))
                .expect("could not spawn the ordering thread");
            self.ordered = Some(shared);
            self.orderer = Some(orderer);
        }
        self.config = Some(config);
    }

    fn handle_message(&mut self, msg: Message<T>) {
        match msg {
            Message::Config(config) => self.set_config(config),
            Message::AcceptResponse(accepted) => self.handle_accept_response(accepted),
            Message::AdjustWeights(adjust) => self.handle_adjust_weights(adjust),
            Message::Quit => self.handle_quit(),
            other => debug!("[L={}] unexpected message, ignoring: {:?}", self.pid, other),
        }
    }

    /// Counts the vote and, when some value first gathers a weighted majority of acceptors,
    /// marks the instance decided and delivers the result.
    fn handle_accept_response(&mut self, accepted: AcceptResponse<T>) {
        let value = match accepted.proposal.value {
            Some(value) => value,
            None => {
                warn!("[L={}] vote without a value, dropping: {:?}", self.pid, accepted.proposal);
                return;
            }
        };
        let config = match self.config {
            Some(ref config) => config,
            None => {
                warn!("[L={}] vote before configuration, dropping", self.pid);
                return;
            }
        };

        let instance = accepted.proposal.instance;
        let slot = self.instances.entry(instance).or_insert_with(LearnerSlot::new);
        if slot.decided {
            return;
        }
        let idx = match slot.votes.iter().position(|entry| entry.0 == value) {
            Some(idx) => idx,
            None => {
                slot.votes.push((value, HashSet::new()));
                slot.votes.len() - 1
            }
        };
        slot.votes[idx].1.insert(accepted.source);
        if !config.is_weighted_majority(&slot.votes[idx].1) {
            return;
        }
        slot.decided = true;

        if log_enabled!(Level::Info) {
            info!("[L={}] instance {} decided: {:?}", self.pid, instance, value);
        }
        match self.ordered {
            Some(ref shared) => {
                let mut state = shared.lock().expect("ordering state lock poisoned");
                state.results.insert(instance, value);
                if instance > state.highest_instance {
                    state.highest_instance = instance;
                }
            }
            None => self.logger.log_result(self.pid, instance, value),
        }
    }

    /// A proposer's analyzer redistributed the voting weights; adopt them for all future quorum
    /// checks.
    fn handle_adjust_weights(&mut self, adjust: AdjustWeights) {
        if let Some(ref mut config) = self.config {
            if log_enabled!(Level::Info) {
                info!("[L={}] replacing weights: {:?}", self.pid, adjust.weights);
            }
            config.replace_weights(&adjust.weights);
        }
    }

    fn handle_quit(&mut self) {
        if let Some(ref shared) = self.ordered {
            shared.lock().expect("ordering state lock poisoned").active = false;
        }
        if let Some(orderer) = self.orderer.take() {
            orderer.join().expect("the ordering thread panicked");
        }
        self.active = false;
    }
}

impl<T> Runnable for Learner<T>
where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug + PartialEq + Send + 'static,
{
    fn run(&mut self) {
        info!("[L={}] learner started", self.pid);
        while self.active {
            let msg = self.mailbox.recv(self.pid);
            self.handle_message(msg);
        }
        info!("[L={}] learner shutting down", self.pid);
    }
}

/// The body of a learner's background ordering thread. Emits results to the logger in strict
/// instance order; when the next expected instance stays missing for five message timeouts it
/// asks the leader to re-run that instance, indefinitely while the learner is active. During
/// shutdown it drains what it has and gives up on instances that never arrive.
fn order_results<T>(
    pid: usize,
    shared: Arc<Mutex<OrderedState<T>>>,
    mailbox: Arc<Mailbox<T>>,
    logger: ResultLogger<T>,
    message_timeout: Duration,
) where
    T: Serialize + DeserializeOwned + Copy + Clone + Debug,
{
    let poll = message_timeout / 2;
    let retry_wait = message_timeout * 5;
    let mut counter: u64 = 1;
    loop {
        let (active, highest, value) = {
            let state = shared.lock().expect("ordering state lock poisoned");
            (state.active, state.highest_instance, state.results.get(&counter).cloned())
        };
        if let Some(value) = value {
            if log_enabled!(Level::Info) {
                info!("[L={}] logging result for instance {}: {:?}", pid, counter, value);
            }
            logger.log_result(pid, counter, value);
            shared.lock().expect("ordering state lock poisoned").results.remove(&counter);
            counter += 1;
            continue;
        }
        if counter > highest {
            // Caught up with everything seen so far.
            if !active {
                break;
            }
            thread::sleep(poll);
            continue;
        }
        // A gap: give the instance time to decide, then ask the leader to re-run it.
        thread::sleep(retry_wait);
        let (still_missing, still_active) = {
            let state = shared.lock().expect("ordering state lock poisoned");
            (!state.results.contains_key(&counter), state.active)
        };
        if still_missing {
            if still_active {
                info!("[L={}] instance {} still missing, asking the leader to retry", pid, counter);
                mailbox.send(LEADER, &Message::Retry(Retry { source: pid, instance: counter }));
            } else {
                warn!("[L={}] giving up on instance {} during shutdown", pid, counter);
                counter += 1;
            }
        }
    }
}
