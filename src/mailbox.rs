//! A module which contains the in-process transport fabric of the simulation. Every message is
//! encoded with bincode on `send` and decoded on `recv`, funneled through a single router thread,
//! and delivered into the destination PID's FIFO inbox. The mailbox also implements the optional
//! drop model: protocol messages destined to a PID can be discarded with a configured
//! probability, which is what makes weighted voting worth simulating in the first place.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bincode::{deserialize, serialize};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::configurations::SystemConfig;
use crate::message::Message;

/// Send/receive/drop totals across a whole run, for the end-of-run summary.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MailboxCounts {
    pub sent: usize,
    pub recv: usize,
    pub failed: usize,
}

impl MailboxCounts {
    /// Everything that entered `send`, whether it was delivered or dropped.
    pub fn total(&self) -> usize {
        self.sent + self.failed
    }
}

enum DropModel<T> {
    /// Per-destination drop probabilities; a PID outside the vector degrades to a rate of 0.
    FailRates { rates: Vec<f64>, rng: Mutex<StdRng> },

    /// An arbitrary predicate deciding, per send, whether to drop. Used by tests that need to
    /// lose specific messages rather than a random fraction.
    Filter(Mutex<Box<dyn FnMut(usize, &Message<T>) -> bool + Send>>),
}

struct Inbox {
    queue: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

pub struct Mailbox<T> {
    funnel_tx: Sender<(usize, Vec<u8>)>,
    funnel_rx: Mutex<Receiver<(usize, Vec<u8>)>>,
    inboxes: Vec<Inbox>,

    // Idle detection: `active` flips to false (one way) once no message has passed through the
    // funnel for `idle_threshold`. `terminate` is the driver's explicit kill switch; the router
    // exits when both have triggered.
    idle_threshold: Duration,
    poll: Duration,
    last_seen: Mutex<Option<Instant>>,
    active: AtomicBool,
    terminate: AtomicBool,

    num_sent: AtomicUsize,
    num_recv: AtomicUsize,
    num_failed: AtomicUsize,

    drop_model: Option<DropModel<T>>,
}

impl<T> Mailbox<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug,
{
    /// A lossless mailbox: every send is delivered.
    pub fn new(config: &SystemConfig) -> Self {
        Mailbox::build(config, None)
    }

    /// A lossy mailbox dropping protocol messages per the configuration's `fail_rates`. The RNG
    /// is seeded so that runs can be replayed.
    pub fn with_fail_rates(config: &SystemConfig, seed: u64) -> Self {
        Mailbox::build(
            config,
            Some(DropModel::FailRates {
                rates: config.fail_rates.clone(),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }),
        )
    }

    /// A mailbox dropping exactly the protocol messages for which `filter` returns true.
    pub fn with_filter<F>(config: &SystemConfig, filter: F) -> Self
    where
        F: FnMut(usize, &Message<T>) -> bool + Send + 'static,
    {
        Mailbox::build(config, Some(DropModel::Filter(Mutex::new(Box::new(filter)))))
    }

    fn build(config: &SystemConfig, drop_model: Option<DropModel<T>>) -> Self {
        let (funnel_tx, funnel_rx) = mpsc::channel();
        let inboxes = (0..config.num_processes())
            .map(|_| Inbox { queue: Mutex::new(VecDeque::new()), ready: Condvar::new() })
            .collect();

        // The router polls at a fraction of the message timeout so that idle detection stays
        // responsive even for short timeouts.
        let poll = Duration::from_secs_f64((config.message_timeout / 2.0).max(0.01));

        Mailbox {
            funnel_tx,
            funnel_rx: Mutex::new(funnel_rx),
            inboxes,
            idle_threshold: config.timeout() * 3,
            poll,
            last_seen: Mutex::new(None),
            active: AtomicBool::new(true),
            terminate: AtomicBool::new(false),
            num_sent: AtomicUsize::new(0),
            num_recv: AtomicUsize::new(0),
            num_failed: AtomicUsize::new(0),
            drop_model,
        }
    }

    /// Enqueues `msg` for delivery to the PID `to`. Delivery is at-most-once: the drop model may
    /// discard protocol messages here, before they ever reach the funnel. Control-plane messages
    /// are always delivered.
    pub fn send(&self, to: usize, msg: &Message<T>) {
        if !msg.is_control() && self.dropped(to, msg) {
            self.num_failed.fetch_add(1, Ordering::Relaxed);
            debug!("message to {} dropped: {:?}", to, msg);
            return;
        }
        let frame = serialize(msg).expect("could not encode the message");
        self.num_sent.fetch_add(1, Ordering::Relaxed);
        // The router is gone only during teardown; late messages just disappear.
        let _ = self.funnel_tx.send((to, frame));
    }

    fn dropped(&self, to: usize, msg: &Message<T>) -> bool {
        match self.drop_model {
            None => false,
            Some(DropModel::FailRates { ref rates, ref rng }) => {
                let fail_rate = rates.get(to).cloned().unwrap_or(0.0);
                fail_rate > 0.0 && rng.lock().expect("rng lock poisoned").gen::<f64>() < fail_rate
            }
            Some(DropModel::Filter(ref filter)) => {
                (filter.lock().expect("filter lock poisoned"))(to, msg)
            }
        }
    }

    /// Blocking receive of the next message destined to `pid`.
    pub fn recv(&self, pid: usize) -> Message<T> {
        let inbox = &self.inboxes[pid];
        let mut queue = inbox.queue.lock().expect("inbox lock poisoned");
        while queue.is_empty() {
            queue = inbox.ready.wait(queue).expect("inbox lock poisoned");
        }
        let frame = queue.pop_front().expect("inbox emptied under the lock");
        drop(queue);
        self.decode(frame)
    }

    /// Like `recv`, but gives up after `timeout`. Mostly useful for asserting that a message was
    /// *not* sent.
    pub fn recv_timeout(&self, pid: usize, timeout: Duration) -> Option<Message<T>> {
        let deadline = Instant::now() + timeout;
        let inbox = &self.inboxes[pid];
        let mut queue = inbox.queue.lock().expect("inbox lock poisoned");
        while queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = inbox
                .ready
                .wait_timeout(queue, deadline - now)
                .expect("inbox lock poisoned");
            queue = guard;
        }
        let frame = queue.pop_front().expect("inbox emptied under the lock");
        drop(queue);
        Some(self.decode(frame))
    }

    fn decode(&self, frame: Vec<u8>) -> Message<T> {
        let msg: Message<T> = deserialize(&frame).expect("could not decode the message");
        if msg.source().is_some() {
            self.num_recv.fetch_add(1, Ordering::Relaxed);
        }
        msg
    }

    /// The router loop: moves frames from the funnel into the per-PID inboxes, stamping the idle
    /// clock along the way. Runs on its own thread until the mailbox has gone inactive and the
    /// driver has called `quit`.
    pub fn run(&self) {
        info!("mailbox started");
        let funnel = self.funnel_rx.lock().expect("funnel lock poisoned");
        loop {
            let idle = {
                let last_seen = self.last_seen.lock().expect("idle clock lock poisoned");
                match *last_seen {
                    Some(t) => t.elapsed() > self.idle_threshold,
                    None => false,
                }
            };
            if self.active.load(Ordering::SeqCst) && idle {
                info!("mailbox went idle");
                self.active.store(false, Ordering::SeqCst);
            }
            if self.terminate.load(Ordering::SeqCst) && !self.active.load(Ordering::SeqCst) {
                break;
            }
            match funnel.recv_timeout(self.poll) {
                Ok((to, frame)) => {
                    *self.last_seen.lock().expect("idle clock lock poisoned") =
                        Some(Instant::now());
                    self.deliver(to, frame);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("mailbox shutting down");
    }

    fn deliver(&self, to: usize, frame: Vec<u8>) {
        match self.inboxes.get(to) {
            Some(inbox) => {
                inbox.queue.lock().expect("inbox lock poisoned").push_back(frame);
                inbox.ready.notify_one();
            }
            None => warn!("no inbox for pid {}; message discarded", to),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Blocks until the mailbox has seen no traffic for the idle threshold.
    pub fn join(&self) {
        while self.is_active() {
            thread::sleep(self.poll);
        }
    }

    /// Asks the router to exit once the idle state has been reached.
    pub fn quit(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn counts(&self) -> MailboxCounts {
        MailboxCounts {
            sent: self.num_sent.load(Ordering::Relaxed),
            recv: self.num_recv.load(Ordering::Relaxed),
            failed: self.num_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::message::{AcceptResponse, ClientRequest, Prepare, Proposal, Retry};

    fn quick_config() -> SystemConfig {
        SystemConfig::new(1, 1, 1).with_message_timeout(0.05)
    }

    fn spawn_router(mailbox: &Arc<Mailbox<u32>>) -> thread::JoinHandle<()> {
        let mb = Arc::clone(mailbox);
        thread::spawn(move || mb.run())
    }

    fn proposal(number: i64, instance: u64) -> Proposal<u32> {
        Proposal { number, instance, pid: 0, value: None }
    }

    #[test]
    fn delivery_preserves_per_destination_fifo_order() {
        let mailbox = Arc::new(Mailbox::<u32>::new(&quick_config()));
        let router = spawn_router(&mailbox);

        for n in 0..5 {
            mailbox.send(1, &Message::Prepare(Prepare { source: 0, proposal: proposal(n, 1) }));
        }
        for n in 0..5 {
            match mailbox.recv(1) {
                Message::Prepare(m) => assert_eq!(m.proposal.number, n),
                other => panic!("unexpected message: {:?}", other),
            }
        }

        mailbox.quit();
        router.join().unwrap();
    }

    #[test]
    fn counts_track_sends_receives_and_drops() {
        let config = quick_config().with_fail_rates(vec![0.0, 1.0, 0.0]);
        let mailbox = Arc::new(Mailbox::<u32>::with_fail_rates(&config, 42));
        let router = spawn_router(&mailbox);

        // Protocol messages to pid 1 always fail; to pid 2 they always pass.
        mailbox.send(1, &Message::Prepare(Prepare { source: 0, proposal: proposal(0, 1) }));
        mailbox.send(2, &Message::Prepare(Prepare { source: 0, proposal: proposal(1, 1) }));
        assert!(mailbox.recv_timeout(2, Duration::from_secs(1)).is_some());

        let counts = mailbox.counts();
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.recv, 1);
        assert_eq!(counts.total(), 2);

        mailbox.quit();
        router.join().unwrap();
    }

    #[test]
    fn control_plane_messages_pass_through_a_fully_lossy_network() {
        let config = quick_config().with_fail_rate(1.0);
        let mailbox = Arc::new(Mailbox::<u32>::with_fail_rates(&config, 7));
        let router = spawn_router(&mailbox);

        mailbox.send(0, &Message::ClientRequest(ClientRequest { source: None, value: 9 }));
        mailbox.send(0, &Message::Quit);
        match mailbox.recv(0) {
            Message::ClientRequest(m) => assert_eq!(m.value, 9),
            other => panic!("unexpected message: {:?}", other),
        }
        match mailbox.recv(0) {
            Message::Quit => {}
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(mailbox.counts().failed, 0);

        mailbox.quit();
        router.join().unwrap();
    }

    #[test]
    fn a_retry_is_subject_to_the_drop_model() {
        let config = quick_config().with_fail_rate(1.0);
        let mailbox = Arc::new(Mailbox::<u32>::with_fail_rates(&config, 7));
        let router = spawn_router(&mailbox);

        mailbox.send(0, &Message::Retry(Retry { source: 2, instance: 3 }));
        assert!(mailbox.recv_timeout(0, Duration::from_millis(100)).is_none());
        assert_eq!(mailbox.counts().failed, 1);

        // Unblock the idle clock so the router can exit.
        mailbox.send(0, &Message::Quit);
        mailbox.quit();
        router.join().unwrap();
    }

    #[test]
    fn a_destination_beyond_the_fail_rate_vector_degrades_to_lossless() {
        // Only one rate configured; sends to pid 2 must still go through.
        let mut config = quick_config();
        config.fail_rates = vec![1.0];
        let mailbox = Arc::new(Mailbox::<u32>::with_fail_rates(&config, 3));
        let router = spawn_router(&mailbox);

        let accepted =
            Message::AcceptResponse(AcceptResponse { source: 1, proposal: proposal(0, 1) });
        mailbox.send(2, &accepted);
        assert!(mailbox.recv_timeout(2, Duration::from_secs(1)).is_some());

        mailbox.quit();
        router.join().unwrap();
    }

    #[test]
    fn the_mailbox_goes_idle_after_three_message_timeouts_of_silence() {
        let mailbox = Arc::new(Mailbox::<u32>::new(&quick_config()));
        let router = spawn_router(&mailbox);

        mailbox.send(0, &Message::Quit);
        assert!(mailbox.recv_timeout(0, Duration::from_secs(1)).is_some());
        assert!(mailbox.is_active());

        // 3 * 0.05s plus scheduling slack.
        thread::sleep(Duration::from_millis(400));
        assert!(!mailbox.is_active());

        mailbox.quit();
        router.join().unwrap();
    }

    #[test]
    fn seeded_drop_models_replay_identically() {
        let config = quick_config().with_fail_rates(vec![0.5, 0.5, 0.5]);
        let a = Mailbox::<u32>::with_fail_rates(&config, 99);
        let b = Mailbox::<u32>::with_fail_rates(&config, 99);

        let msg = Message::Prepare(Prepare { source: 0, proposal: proposal(0, 1) });
        for to in (0..3).cycle().take(60) {
            assert_eq!(a.dropped(to, &msg), b.dropped(to, &msg));
        }
    }
}
