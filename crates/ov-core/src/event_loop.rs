//! Event loop adapter.
//!
//! A cooperative, single-threaded dispatcher: producers (accept tasks,
//! per-connection readers, timers) push [`Command`]s through a cloneable
//! [`EventLoopHandle`]; [`EventLoop::run`] drains them one at a time so every
//! registered callback observes a consistent, serialized view of the world,
//! even though the producers themselves run as ordinary tokio tasks.
//!
//! Timers are not auto-rearmed: a callback that wants to repeat calls
//! `timer_set` again itself via the handle passed into it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

pub type SocketId = u64;

/// Readiness kinds the loop notifies registered sockets for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    In,
    Err,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type SocketCallback = Box<dyn FnMut(SocketId, Interest) + Send>;
type TimerCallback = Box<dyn FnMut(&EventLoopHandle) + Send>;

enum Command {
    SetSocket(SocketId, SocketCallback),
    UnsetSocket(SocketId),
    Ready(SocketId, Interest),
    TimerSet(u64, Instant, TimerCallback),
    TimerUnset(u64),
    Stop,
}

/// Cheaply cloneable producer-side handle. Every callback receives one so it
/// can register follow-up work (a re-armed timer, a new socket, a stop
/// request) without reaching back into `EventLoop` directly.
#[derive(Clone)]
pub struct EventLoopHandle {
    tx: mpsc::UnboundedSender<Command>,
    next_timer_id: Arc<AtomicU64>,
}

impl EventLoopHandle {
    /// Register (or replace) the callback for a socket. Mirrors `ov_event_loop`'s
    /// `set(socket, events, userdata, cb)`; `userdata` is folded into the
    /// closure's captures, the idiomatic replacement for a void-pointer slot.
    pub fn set(&self, socket: SocketId, cb: impl FnMut(SocketId, Interest) + Send + 'static) {
        let _ = self.tx.send(Command::SetSocket(socket, Box::new(cb)));
    }

    pub fn unset(&self, socket: SocketId) {
        let _ = self.tx.send(Command::UnsetSocket(socket));
    }

    /// Called by an IO producer task when a socket becomes ready.
    pub fn notify(&self, socket: SocketId, interest: Interest) {
        let _ = self.tx.send(Command::Ready(socket, interest));
    }

    pub fn timer_set(
        &self,
        delay: Duration,
        cb: impl FnMut(&EventLoopHandle) + Send + 'static,
    ) -> TimerId {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let _ = self.tx.send(Command::TimerSet(id, deadline, Box::new(cb)));
        TimerId(id)
    }

    pub fn timer_unset(&self, id: TimerId) {
        let _ = self.tx.send(Command::TimerUnset(id.0));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

/// Owns socket callbacks, pending timers, and the command queue. `run` is the
/// only place state is mutated, which is what makes the "all callbacks run in
/// the loop thread" guarantee hold.
pub struct EventLoop {
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    next_timer_id: Arc<AtomicU64>,
    sockets: HashMap<SocketId, SocketCallback>,
    timer_cbs: HashMap<u64, TimerCallback>,
    timer_heap: BinaryHeap<Reverse<(Instant, u64)>>,
    cancelled_timers: HashSet<u64>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        EventLoop {
            tx,
            rx,
            next_timer_id: Arc::new(AtomicU64::new(1)),
            sockets: HashMap::new(),
            timer_cbs: HashMap::new(),
            timer_heap: BinaryHeap::new(),
            cancelled_timers: HashSet::new(),
        }
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            tx: self.tx.clone(),
            next_timer_id: self.next_timer_id.clone(),
        }
    }

    fn apply(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetSocket(socket, cb) => {
                self.sockets.insert(socket, cb);
            }
            Command::UnsetSocket(socket) => {
                self.sockets.remove(&socket);
            }
            Command::Ready(socket, interest) => {
                if let Some(cb) = self.sockets.get_mut(&socket) {
                    cb(socket, interest);
                }
            }
            Command::TimerSet(id, deadline, cb) => {
                self.timer_cbs.insert(id, cb);
                self.timer_heap.push(Reverse((deadline, id)));
            }
            Command::TimerUnset(id) => {
                self.cancelled_timers.insert(id);
                self.timer_cbs.remove(&id);
            }
            Command::Stop => return false,
        }
        true
    }

    fn fire_due_timers(&mut self, handle: &EventLoopHandle) {
        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = self.timer_heap.peek() {
            if deadline > now {
                break;
            }
            self.timer_heap.pop();
            if self.cancelled_timers.remove(&id) {
                continue;
            }
            if let Some(mut cb) = self.timer_cbs.remove(&id) {
                cb(handle);
            }
        }
    }

    /// Run until `Stop`, or `max` elapses (`None` runs indefinitely).
    pub async fn run(&mut self, max: Option<Duration>) {
        let handle = self.handle();
        let run_until = max.map(|d| Instant::now() + d);

        loop {
            if let Some(end) = run_until {
                if Instant::now() >= end {
                    break;
                }
            }

            let next_timer = self.timer_heap.peek().map(|Reverse((deadline, _))| *deadline);
            let sleep = async {
                match next_timer {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        None => break,
                        Some(cmd) => {
                            if !self.apply(cmd) {
                                break;
                            }
                        }
                    }
                }
                _ = sleep => {
                    self.fire_due_timers(&handle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once_and_is_not_auto_rearmed() {
        let mut loop_ = EventLoop::new();
        let handle = loop_.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        handle.timer_set(Duration::from_millis(10), move |_h| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let run = tokio::spawn(async move {
            loop_.run(Some(Duration::from_millis(50))).await;
        });
        tokio::time::advance(Duration::from_millis(60)).await;
        run.await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_does_not_fire() {
        let mut loop_ = EventLoop::new();
        let handle = loop_.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = handle.timer_set(Duration::from_millis(10), move |_h| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        handle.timer_unset(id);

        let run = tokio::spawn(async move {
            loop_.run(Some(Duration::from_millis(50))).await;
        });
        tokio::time::advance(Duration::from_millis(60)).await;
        run.await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn socket_callback_invoked_on_notify() {
        let mut loop_ = EventLoop::new();
        let handle = loop_.handle();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        handle.set(7, move |socket, interest| {
            assert_eq!(socket, 7);
            assert_eq!(interest, Interest::In);
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        handle.notify(7, Interest::In);
        handle.stop();
        loop_.run(Some(Duration::from_secs(1))).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unset_socket_stops_delivery() {
        let mut loop_ = EventLoop::new();
        let handle = loop_.handle();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        handle.set(1, move |_s, _i| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        handle.unset(1);
        handle.notify(1, Interest::In);
        handle.stop();
        loop_.run(Some(Duration::from_secs(1))).await;

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
