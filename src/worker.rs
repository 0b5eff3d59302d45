//! Worker threads.
//!
//! Each worker runs its own poll loop over the sessions it owns. The
//! listener talks to a worker through exactly two channels: the worker's
//! pending-socket queue (pushed under its mutex) and the worker's waker.
//! A wakeup either means "new sockets are queued" or "shut down"; the
//! shutdown flag disambiguates. No session state is ever touched from
//! another thread.

use crate::session::{self, Flow, IoCtx, Session};
use crate::timer::TimerQueue;
use crate::tunnel_error::TunnelResult;
use crate::tunnel_server::SharedState;
use crate::util::unwrap_poison;
use crate::{debug_log, error_log, info_log, warn_log};
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

pub(crate) const WAKER_TOKEN: Token = Token(0);

/// The listener-side face of a worker: the dispatch queue, the waker and
/// the shutdown flag. The thread handle is joined by the server after
/// shutdown has been requested.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
  pub(crate) index: usize,
  queue: Arc<Mutex<VecDeque<TcpStream>>>,
  waker: Arc<Waker>,
  shutdown: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
  /// Creates the worker's poll and waker, then starts its thread. The
  /// returned handle is immediately usable for dispatch; there is no
  /// bring-up window in which a wakeup could be lost.
  pub(crate) fn spawn(index: usize, shared: Arc<SharedState>) -> TunnelResult<WorkerHandle> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let shutdown = Arc::new(AtomicBool::new(false));

    let worker = Worker {
      index,
      poll,
      shared,
      queue: Arc::clone(&queue),
      shutdown: Arc::clone(&shutdown),
      sessions: HashMap::new(),
      timers: TimerQueue::new(),
      next_key: 0,
    };

    let thread =
      std::thread::Builder::new().name(format!("tlstun-worker-{index}")).spawn(move || worker.run())?;

    Ok(WorkerHandle { index, queue, waker, shutdown, thread: Some(thread) })
  }

  /// Hands an accepted socket to this worker.
  pub(crate) fn dispatch(&self, stream: TcpStream) -> TunnelResult<()> {
    unwrap_poison(self.queue.lock())?.push_back(stream);
    self.waker.wake()?;
    Ok(())
  }

  pub(crate) fn request_shutdown(&self) {
    self.shutdown.store(true, SeqCst);
    if let Err(err) = self.waker.wake() {
      error_log!("tlstun: worker {}: shutdown wakeup failed: {}", self.index, err);
    }
  }

  pub(crate) fn join(mut self) {
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        error_log!("tlstun: worker {}: thread panicked", self.index);
      }
    }
  }
}

struct Worker {
  index: usize,
  poll: Poll,
  shared: Arc<SharedState>,
  queue: Arc<Mutex<VecDeque<TcpStream>>>,
  shutdown: Arc<AtomicBool>,
  sessions: HashMap<usize, Session>,
  timers: TimerQueue,
  /// Monotonic; session keys are never reused, so a stale token or timer
  /// can never reach a younger session.
  next_key: usize,
}

impl Worker {
  fn run(mut self) {
    info_log!("tlstun: worker {}: event loop started", self.index);

    let mut events = Events::with_capacity(256);
    loop {
      let timeout = self.timers.next_timeout(Instant::now());
      if let Err(err) = self.poll.poll(&mut events, timeout) {
        if err.kind() == ErrorKind::Interrupted {
          continue;
        }
        error_log!("tlstun: worker {}: poll failed: {}", self.index, err);
        break;
      }

      if self.shutdown.load(SeqCst) {
        self.drain();
        break;
      }

      for event in events.iter() {
        match event.token() {
          WAKER_TOKEN => self.on_accept_dispatch(),
          token => self.on_session_event(token, event.is_readable(), event.is_writable()),
        }
      }

      self.fire_timers();
    }

    info_log!("tlstun: worker {}: event loop stopped", self.index);
  }

  /// The listener woke us: pull everything queued for this worker and turn
  /// each socket into a session.
  fn on_accept_dispatch(&mut self) {
    loop {
      let next = match unwrap_poison(self.queue.lock()) {
        Ok(mut guard) => guard.pop_front(),
        Err(err) => {
          error_log!("tlstun: worker {}: pending queue unusable: {}", self.index, err);
          return;
        }
      };
      let Some(stream) = next else { break };
      self.start_session(stream);
    }
  }

  fn start_session(&mut self, stream: TcpStream) {
    let key = self.next_key;
    self.next_key += 1;

    let peer = match stream.peer_addr() {
      Ok(addr) => addr.to_string(),
      Err(_) => "unknown".to_string(),
    };

    match Session::connect(
      key,
      stream,
      Arc::clone(&self.shared.tls_config),
      &self.shared.config.destination_name,
      &self.shared.config.destination_port,
      self.shared.config.buffer_size,
      self.poll.registry(),
    ) {
      Ok(session) => {
        info_log!("tlstun: worker {}: session {} started for {}", self.index, key, peer);
        self.sessions.insert(key, session);
      }
      Err(err) => {
        warn_log!("tlstun: worker {}: cannot start session for {}: {}", self.index, peer, err);
      }
    }
  }

  fn on_session_event(&mut self, token: Token, readable: bool, writable: bool) {
    let (key, side) = session::token_session(token);
    // stale events for sessions destroyed earlier in this round resolve to
    // nothing here
    let Some(sess) = self.sessions.get_mut(&key) else { return };

    let mut ctx = IoCtx { registry: self.poll.registry(), timers: &mut self.timers };
    if sess.handle_io(side, readable, writable, &mut ctx) == Flow::Destroy {
      self.destroy(key);
    }
  }

  fn fire_timers(&mut self) {
    let now = Instant::now();
    while let Some((key, kind)) = self.timers.pop_due(now) {
      let Some(sess) = self.sessions.get_mut(&key) else { continue };

      let mut ctx = IoCtx { registry: self.poll.registry(), timers: &mut self.timers };
      if sess.on_wait_timer(kind, &mut ctx) == Flow::Destroy {
        self.destroy(key);
      }
    }
  }

  /// The one and only teardown path for a session.
  fn destroy(&mut self, key: usize) {
    if let Some(mut sess) = self.sessions.remove(&key) {
      sess.teardown(self.poll.registry());
      debug_log!("tlstun: worker {}: session {} destroyed", self.index, key);
    }
  }

  fn drain(&mut self) {
    info_log!("tlstun: worker {}: shutting down {} sessions", self.index, self.sessions.len());
    let keys: Vec<usize> = self.sessions.keys().copied().collect();
    for key in keys {
      self.destroy(key);
    }
  }
}
