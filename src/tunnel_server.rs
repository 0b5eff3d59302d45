//! Server: owns the configuration and the shared TLS context, spawns the
//! worker pool and runs the accept loop.
//!
//! The accept loop runs on the thread that calls
//! [`Server::serve_forever`]; each accepted socket is queued for exactly
//! one worker, chosen round-robin, and that worker is woken. Shutdown is a
//! flag plus a wakeup, requested through a [`ShutdownHandle`] from any
//! thread; the listener broadcasts it to every worker and
//! `serve_forever` joins them all before returning, so the server state
//! outlives every thread that uses it.

use crate::tls_engine::build_tls_config;
use crate::tunnel_config::TunnelConfig;
use crate::tunnel_error::{ConfigError, TunnelResult};
use crate::worker::WorkerHandle;
use crate::{error_log, info_log};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

const SHUTDOWN_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);

/// Immutable state shared with the worker pool.
#[derive(Debug)]
pub(crate) struct SharedState {
  pub(crate) tls_config: Arc<rustls::ServerConfig>,
  pub(crate) config: TunnelConfig,
}

/// Requests a graceful shutdown of a running server. Cloneable and usable
/// from any thread; the first call wins, later calls are no-ops.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
  flag: Arc<AtomicBool>,
  waker: Arc<Waker>,
}

impl ShutdownHandle {
  /// Marks the server for shutdown and wakes the accept loop.
  pub fn shutdown(&self) {
    if self.flag.swap(true, SeqCst) {
      return;
    }
    if let Err(err) = self.waker.wake() {
      error_log!("tlstun: shutdown wakeup failed: {}", err);
    }
  }

  /// True once shutdown has been requested.
  pub fn is_shutdown(&self) -> bool {
    self.flag.load(SeqCst)
  }
}

/// A configured tunnel server. Construction loads the TLS material;
/// [`Server::serve_forever`] binds, spawns the workers and blocks until
/// shutdown.
#[derive(Debug)]
pub struct Server {
  config: TunnelConfig,
  tls_config: Arc<rustls::ServerConfig>,
  poll: Poll,
  waker: Arc<Waker>,
  shutdown: Arc<AtomicBool>,
}

impl Server {
  /// Builds the shared TLS context from the configured certificate and key
  /// and prepares the listener's event loop.
  pub fn new(config: TunnelConfig) -> TunnelResult<Server> {
    let tls_config = build_tls_config(&config)?;
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), SHUTDOWN_TOKEN)?);

    Ok(Server { config, tls_config, poll, waker, shutdown: Arc::new(AtomicBool::new(false)) })
  }

  /// A handle that can stop this server from another thread, including a
  /// signal-forwarding thread. Valid before and during `serve_forever`; a
  /// request issued before the loop starts is observed immediately.
  pub fn shutdown_handle(&self) -> ShutdownHandle {
    ShutdownHandle { flag: Arc::clone(&self.shutdown), waker: Arc::clone(&self.waker) }
  }

  /// Binds the listen socket, spawns the worker pool and serves until
  /// shutdown is requested. Joins every worker before returning.
  pub fn serve_forever(mut self) -> TunnelResult<()> {
    let bind_ip = if self.config.ssl_server_name == "*" {
      Ipv4Addr::UNSPECIFIED
    } else {
      self.config.ssl_server_name.parse::<Ipv4Addr>().map_err(|_| {
        ConfigError::InvalidValue("ssl_server_name", self.config.ssl_server_name.clone())
      })?
    };
    let bind_addr = SocketAddr::new(bind_ip.into(), self.config.ssl_server_port);

    let mut listener = TcpListener::bind(bind_addr)?;
    self.poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let shared = Arc::new(SharedState {
      tls_config: Arc::clone(&self.tls_config),
      config: self.config.clone(),
    });

    // the pool needs at least one worker to make progress
    let thread_count = self.config.thread_count.max(1);
    let mut workers: Vec<WorkerHandle> = Vec::with_capacity(thread_count);
    for index in 0..thread_count {
      match WorkerHandle::spawn(index, Arc::clone(&shared)) {
        Ok(handle) => workers.push(handle),
        Err(err) => {
          error_log!("tlstun: spawning worker {} failed: {}", index, err);
          for handle in &workers {
            handle.request_shutdown();
          }
          for handle in workers {
            handle.join();
          }
          return Err(err);
        }
      }
    }

    info_log!("tlstun: listening on {} with {} workers", bind_addr, workers.len());
    self.accept_loop(&mut listener, &workers);

    // Reached on shutdown or on a fatal listener error; either way the
    // workers are told to stop and are joined here.
    for handle in &workers {
      handle.request_shutdown();
    }
    for handle in workers {
      handle.join();
    }

    let _ = self.poll.registry().deregister(&mut listener);
    info_log!("tlstun: server stopped");
    Ok(())
  }

  fn accept_loop(&mut self, listener: &mut TcpListener, workers: &[WorkerHandle]) {
    let mut events = Events::with_capacity(64);
    let mut cursor = 0usize;

    loop {
      if let Err(err) = self.poll.poll(&mut events, None) {
        if err.kind() == ErrorKind::Interrupted {
          continue;
        }
        error_log!("tlstun: listener poll failed: {}", err);
        return;
      }

      if self.shutdown.load(SeqCst) {
        info_log!("tlstun: shutdown requested, stopping listener");
        return;
      }

      for event in events.iter() {
        if event.token() != LISTENER_TOKEN {
          continue;
        }

        loop {
          match listener.accept() {
            Ok((stream, peer)) => {
              let handle = &workers[cursor];
              cursor = (cursor + 1) % workers.len();

              info_log!("tlstun: accepted {}, dispatching to worker {}", peer, handle.index);
              if let Err(err) = handle.dispatch(stream) {
                error_log!("tlstun: dispatch to worker {} failed: {}", handle.index, err);
              }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
              // transient per-connection failure; keep listening
              error_log!("tlstun: accept failed: {}", err);
              break;
            }
          }
        }
      }
    }
  }
}
