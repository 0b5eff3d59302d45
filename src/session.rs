//! Per-connection shuttling state machine.
//!
//! A session owns the TLS-side socket, the plaintext destination socket,
//! the TLS engine and two ring buffers: `from_tls` stages decrypted bytes
//! on their way to the destination, `from_dst` stages destination bytes on
//! their way to the TLS peer. Readiness callbacks move bytes between the
//! sockets and the rings; when a ring fills, the producing side is paused
//! and revived by a short rearm timer instead of spinning.
//!
//! Half-close is honored in both directions: a dead socket never discards
//! what the opposite direction still owes its peer. Every terminal path
//! reports [`Flow::Destroy`] and the worker performs the one and only
//! teardown.

use crate::fifo::RingFifo;
use crate::timer::WaitKind;
use crate::tls_engine::{TlsAccept, TlsEngine, TlsRead, TlsWrite};
use crate::tunnel_error::{TunnelError, TunnelResult};
use crate::{debug_log, error_log, info_log, trace_log, warn_log};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{ErrorKind, Read, Write};
use std::net::ToSocketAddrs;
use std::time::Duration;

/// Delay before a paused direction checks its ring again.
pub(crate) const WAIT_DELAY: Duration = Duration::from_millis(1);

/// Tokens 0 and 1 are reserved for the waker and the listener.
pub(crate) const TOKEN_BASE: usize = 2;

pub(crate) fn tls_token(key: usize) -> Token {
  Token(TOKEN_BASE + key * 2)
}

pub(crate) fn dst_token(key: usize) -> Token {
  Token(TOKEN_BASE + key * 2 + 1)
}

pub(crate) fn token_session(token: Token) -> (usize, Side) {
  let index = token.0 - TOKEN_BASE;
  (index / 2, if index % 2 == 0 { Side::Tls } else { Side::Dst })
}

/// Which socket a readiness event belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Side {
  Tls,
  Dst,
}

/// Verdict of a callback. `Destroy` routes through the worker's single
/// teardown path; callbacks never free anything themselves.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Flow {
  Continue,
  Destroy,
}

/// Registry and timer access handed into each callback by the worker.
pub(crate) struct IoCtx<'a> {
  pub(crate) registry: &'a Registry,
  pub(crate) timers: &'a mut crate::timer::TimerQueue,
}

enum HandshakeStep {
  Established,
  Pending,
  Failed,
}

enum ReadStatus {
  /// The ring filled up while the source still had bytes.
  Full,
  WantRead,
  WantWrite,
  Idle,
  Eof,
  TlsFailed(TunnelError),
  IoFailed(std::io::Error),
}

enum WriteStatus {
  Drained,
  Stalled,
  TlsFailed(TunnelError),
  IoFailed(std::io::Error),
}

#[derive(Debug)]
pub(crate) struct Session {
  key: usize,
  tls_sock: Option<TcpStream>,
  dst_sock: Option<TcpStream>,
  engine: TlsEngine,
  from_tls: RingFifo,
  from_dst: RingFifo,
  want_read_tls: bool,
  want_write_tls: bool,
  want_read_dst: bool,
  want_write_dst: bool,
  applied_tls: Option<Interest>,
  applied_dst: Option<Interest>,
}

impl Session {
  /// Connects the destination side for a freshly accepted TLS socket and
  /// registers both sockets for reading. Errors leave nothing registered;
  /// dropping the half-built session closes both sockets.
  pub(crate) fn connect(
    key: usize,
    tls_sock: TcpStream,
    tls_config: std::sync::Arc<rustls::ServerConfig>,
    destination_name: &str,
    destination_port: &str,
    buffer_size: usize,
    registry: &Registry,
  ) -> TunnelResult<Session> {
    let destination = format!("{destination_name}:{destination_port}");
    let addresses = destination.to_socket_addrs()?;

    let mut connected = None;
    for address in addresses {
      match std::net::TcpStream::connect(address) {
        Ok(stream) => {
          connected = Some(stream);
          break;
        }
        Err(err) => {
          warn_log!("tlstun: session {}: connect to {} failed: {}", key, address, err);
        }
      }
    }

    let Some(dst_std) = connected else {
      return Err(TunnelError::new_io(
        ErrorKind::ConnectionRefused,
        format!("connect failed on all addresses for {destination}"),
      ));
    };

    dst_std.set_nonblocking(true)?;
    let dst_sock = TcpStream::from_std(dst_std);

    let engine = TlsEngine::new(tls_config)?;

    let mut session = Session {
      key,
      tls_sock: Some(tls_sock),
      dst_sock: Some(dst_sock),
      engine,
      from_tls: RingFifo::new(buffer_size),
      from_dst: RingFifo::new(buffer_size),
      want_read_tls: true,
      want_write_tls: false,
      want_read_dst: true,
      want_write_dst: false,
      applied_tls: None,
      applied_dst: None,
    };
    session.sync_interest(registry)?;

    Ok(session)
  }

  /// Entry point for socket readiness. A single poll event may carry both
  /// directions.
  pub(crate) fn handle_io(
    &mut self,
    side: Side,
    readable: bool,
    writable: bool,
    ctx: &mut IoCtx<'_>,
  ) -> Flow {
    match side {
      Side::Tls => {
        if readable && self.tls_sock.is_some() && self.on_read_tls(ctx) == Flow::Destroy {
          return Flow::Destroy;
        }
        if writable && self.tls_sock.is_some() && self.on_write_tls(ctx) == Flow::Destroy {
          return Flow::Destroy;
        }
      }
      Side::Dst => {
        if readable && self.dst_sock.is_some() && self.on_read_dst(ctx) == Flow::Destroy {
          return Flow::Destroy;
        }
        if writable && self.dst_sock.is_some() && self.on_write_dst(ctx) == Flow::Destroy {
          return Flow::Destroy;
        }
      }
    }
    Flow::Continue
  }

  /// Rearm callback for one of the four wait timers. Re-enables the paused
  /// registration once its condition holds again.
  pub(crate) fn on_wait_timer(&mut self, kind: WaitKind, ctx: &mut IoCtx<'_>) -> Flow {
    match kind {
      WaitKind::ReadTls => {
        if self.tls_sock.is_none() {
          return Flow::Continue;
        }
        if self.from_tls.bytes_free() > 0 {
          trace_log!("tlstun: session {}: restoring tls read event", self.key);
          self.want_read_tls = true;
          if self.sync_interest_or_destroy(ctx) == Flow::Destroy {
            return Flow::Destroy;
          }
          // plaintext may be sitting in the engine with nothing left on the
          // socket, in which case no readiness event will come; read now
          self.on_read_tls(ctx)
        } else {
          ctx.timers.arm(self.key, WaitKind::ReadTls, WAIT_DELAY);
          Flow::Continue
        }
      }
      WaitKind::ReadDst => {
        if self.dst_sock.is_none() {
          return Flow::Continue;
        }
        if self.from_dst.bytes_free() > 0 {
          trace_log!("tlstun: session {}: restoring destination read event", self.key);
          self.want_read_dst = true;
          if self.sync_interest_or_destroy(ctx) == Flow::Destroy {
            return Flow::Destroy;
          }
          self.on_read_dst(ctx)
        } else {
          ctx.timers.arm(self.key, WaitKind::ReadDst, WAIT_DELAY);
          Flow::Continue
        }
      }
      WaitKind::WriteTls => {
        if self.tls_sock.is_none() {
          return Flow::Continue;
        }
        if self.from_dst.bytes_used() > 0 {
          trace_log!("tlstun: session {}: restoring tls write event", self.key);
          self.want_write_tls = true;
          self.sync_interest_or_destroy(ctx)
        } else {
          Flow::Continue
        }
      }
      WaitKind::WriteDst => {
        if self.dst_sock.is_none() {
          return Flow::Continue;
        }
        if self.from_tls.bytes_used() > 0 {
          trace_log!("tlstun: session {}: restoring destination write event", self.key);
          self.want_write_dst = true;
          self.sync_interest_or_destroy(ctx)
        } else {
          Flow::Continue
        }
      }
    }
  }

  /// Closes whatever is still open. Called by the worker on destroy and on
  /// shutdown; safe to call more than once.
  pub(crate) fn teardown(&mut self, registry: &Registry) {
    self.close_dst(registry);
    self.close_tls(registry);
  }

  fn on_read_tls(&mut self, ctx: &mut IoCtx<'_>) -> Flow {
    trace_log!("tlstun: session {}: tls readable", self.key);

    let was_handshaking = self.engine.is_handshaking();
    match self.drive_handshake() {
      HandshakeStep::Pending => return self.sync_interest_or_destroy(ctx),
      HandshakeStep::Failed => return Flow::Destroy,
      HandshakeStep::Established => {}
    }
    if was_handshaking {
      self.after_establish();
    }

    if self.from_tls.bytes_free() == 0 {
      return self.pause_read_tls(ctx);
    }

    let status = loop {
      let Some(sock) = self.tls_sock.as_mut() else { return Flow::Continue };
      match self.engine.read(sock, self.from_tls.write_window()) {
        TlsRead::Data(count) => {
          self.from_tls.commit_write(count);
          if self.from_tls.bytes_free() == 0 {
            break ReadStatus::Full;
          }
        }
        TlsRead::WantRead => break ReadStatus::WantRead,
        TlsRead::WantWrite => break ReadStatus::WantWrite,
        TlsRead::Closed => break ReadStatus::Eof,
        TlsRead::Failed(err) => break ReadStatus::TlsFailed(err),
      }
    };

    if self.from_tls.bytes_used() > 0 && self.dst_sock.is_some() {
      self.want_write_dst = true;
    }

    match status {
      ReadStatus::WantRead | ReadStatus::Idle => self.sync_interest_or_destroy(ctx),
      ReadStatus::Full => self.pause_read_tls(ctx),
      ReadStatus::WantWrite => {
        self.want_write_tls = true;
        self.sync_interest_or_destroy(ctx)
      }
      ReadStatus::Eof | ReadStatus::TlsFailed(_) | ReadStatus::IoFailed(_) => {
        match &status {
          ReadStatus::TlsFailed(err) => {
            info_log!("tlstun: session {}: tls read failed: {}", self.key, err)
          }
          ReadStatus::IoFailed(err) => {
            info_log!("tlstun: session {}: tls read failed: {}", self.key, err)
          }
          _ => debug_log!("tlstun: session {}: tls peer closed the stream", self.key),
        }

        if self.from_dst.bytes_used() > 0 {
          // flush what we still owe the tls peer before closing its side
          self.want_write_tls = true;
          return self.sync_interest_or_destroy(ctx);
        }

        self.close_tls(ctx.registry);
        if self.from_tls.is_empty() {
          info_log!("tlstun: session {}: closing all connections", self.key);
          return Flow::Destroy;
        }
        // from_tls still holds bytes for the destination; let the
        // destination writer finish the drain
        self.sync_interest_or_destroy(ctx)
      }
    }
  }

  fn on_write_tls(&mut self, ctx: &mut IoCtx<'_>) -> Flow {
    trace_log!(
      "tlstun: session {}: tls writable, from_dst holds {} bytes",
      self.key,
      self.from_dst.bytes_used()
    );

    // write readiness is one-shot; every path below re-asserts it on demand
    self.want_write_tls = false;

    let was_handshaking = self.engine.is_handshaking();
    match self.drive_handshake() {
      HandshakeStep::Pending => return self.sync_interest_or_destroy(ctx),
      HandshakeStep::Failed => return Flow::Destroy,
      HandshakeStep::Established => {}
    }
    if was_handshaking {
      self.after_establish();
      // the handshake records may have carried the peer's first application
      // data; no further readiness event will repeat them
      if self.on_read_tls(ctx) == Flow::Destroy {
        return Flow::Destroy;
      }
      if self.tls_sock.is_none() {
        return Flow::Continue;
      }
    }

    let status = loop {
      if self.from_dst.is_empty() {
        break WriteStatus::Drained;
      }
      let Some(sock) = self.tls_sock.as_mut() else { return Flow::Continue };
      match self.engine.write(sock, self.from_dst.read_window()) {
        TlsWrite::Wrote(0) => break WriteStatus::Stalled,
        TlsWrite::Wrote(count) => self.from_dst.commit_read(count),
        TlsWrite::WantWrite => break WriteStatus::Stalled,
        TlsWrite::Failed(err) => break WriteStatus::TlsFailed(err),
      }
    };

    match status {
      WriteStatus::Drained => {
        // push out anything the engine still buffers before deciding fate
        let mut flush_pending = false;
        if let Some(sock) = self.tls_sock.as_mut() {
          match self.engine.write(sock, &[]) {
            TlsWrite::WantWrite => flush_pending = true,
            TlsWrite::Failed(err) => return self.fail_tls_write(err, ctx),
            TlsWrite::Wrote(_) => {}
          }
        }
        if flush_pending {
          self.want_write_tls = true;
          return self.sync_interest_or_destroy(ctx);
        }
        if self.dst_sock.is_none() {
          // the destination is gone and everything owed to the tls peer is
          // out; nothing can ever make progress again
          self.close_tls(ctx.registry);
          info_log!("tlstun: session {}: closing all connections", self.key);
          return Flow::Destroy;
        }
        self.sync_interest_or_destroy(ctx)
      }
      WriteStatus::Stalled => {
        // the peer is not draining; take a breather before retrying
        ctx.timers.arm(self.key, WaitKind::WriteTls, WAIT_DELAY);
        self.sync_interest_or_destroy(ctx)
      }
      WriteStatus::TlsFailed(err) => self.fail_tls_write(err, ctx),
      WriteStatus::IoFailed(err) => self.fail_tls_write(err.into(), ctx),
    }
  }

  fn on_read_dst(&mut self, ctx: &mut IoCtx<'_>) -> Flow {
    trace_log!("tlstun: session {}: destination readable", self.key);

    if self.from_dst.bytes_free() == 0 {
      return self.pause_read_dst(ctx);
    }

    let status = loop {
      let Some(sock) = self.dst_sock.as_mut() else { return Flow::Continue };
      match sock.read(self.from_dst.write_window()) {
        Ok(0) => break ReadStatus::Eof,
        Ok(count) => {
          self.from_dst.commit_write(count);
          if self.from_dst.bytes_free() == 0 {
            break ReadStatus::Full;
          }
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => break ReadStatus::Idle,
        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
        Err(err) => break ReadStatus::IoFailed(err),
      }
    };

    if self.from_dst.bytes_used() > 0 && self.tls_sock.is_some() {
      self.want_write_tls = true;
    }

    match status {
      ReadStatus::Idle => self.sync_interest_or_destroy(ctx),
      ReadStatus::Full => self.pause_read_dst(ctx),
      ReadStatus::Eof | ReadStatus::IoFailed(_) => {
        match &status {
          ReadStatus::IoFailed(err) => {
            info_log!("tlstun: session {}: destination read failed: {}", self.key, err)
          }
          _ => debug_log!("tlstun: session {}: destination closed the stream", self.key),
        }

        self.close_dst(ctx.registry);
        if self.from_dst.is_empty() {
          // nothing buffered in either deliverable direction survives the
          // destination going away
          info_log!("tlstun: session {}: closing all connections", self.key);
          return Flow::Destroy;
        }
        // drain the remaining destination bytes to the tls peer
        self.sync_interest_or_destroy(ctx)
      }
      // the plain socket read cannot report tls conditions
      ReadStatus::WantRead | ReadStatus::WantWrite | ReadStatus::TlsFailed(_) => Flow::Continue,
    }
  }

  fn on_write_dst(&mut self, ctx: &mut IoCtx<'_>) -> Flow {
    trace_log!("tlstun: session {}: destination writable", self.key);

    self.want_write_dst = false;

    let status = loop {
      if self.from_tls.is_empty() {
        break WriteStatus::Drained;
      }
      let Some(sock) = self.dst_sock.as_mut() else { return Flow::Continue };
      match sock.write(self.from_tls.read_window()) {
        // a zero-length write is not an error, just a peer that cannot
        // keep up right now
        Ok(0) => break WriteStatus::Stalled,
        Ok(count) => self.from_tls.commit_read(count),
        Err(err) if err.kind() == ErrorKind::WouldBlock => break WriteStatus::Stalled,
        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
        Err(err) => break WriteStatus::IoFailed(err),
      }
    };

    match status {
      WriteStatus::Drained => {
        if self.tls_sock.is_none() {
          // drain complete and the only byte source is closed
          self.close_dst(ctx.registry);
          info_log!("tlstun: session {}: closing all connections", self.key);
          return Flow::Destroy;
        }
        self.sync_interest_or_destroy(ctx)
      }
      WriteStatus::Stalled => {
        ctx.timers.arm(self.key, WaitKind::WriteDst, WAIT_DELAY);
        self.sync_interest_or_destroy(ctx)
      }
      WriteStatus::IoFailed(err) => {
        info_log!("tlstun: session {}: destination write failed: {}", self.key, err);
        if self.from_tls.bytes_used() > 0 {
          // retry when the socket signals writable again
          self.want_write_dst = true;
          return self.sync_interest_or_destroy(ctx);
        }
        self.close_dst(ctx.registry);
        if self.tls_sock.is_none() {
          info_log!("tlstun: session {}: closing all connections", self.key);
          return Flow::Destroy;
        }
        self.sync_interest_or_destroy(ctx)
      }
      WriteStatus::TlsFailed(_) => Flow::Continue,
    }
  }

  fn fail_tls_write(&mut self, err: TunnelError, ctx: &mut IoCtx<'_>) -> Flow {
    info_log!("tlstun: session {}: tls write failed: {}", self.key, err);
    self.close_tls(ctx.registry);

    if self.from_tls.is_empty() || self.dst_sock.is_none() {
      info_log!("tlstun: session {}: closing all connections", self.key);
      return Flow::Destroy;
    }
    // the destination writer still has bytes to deliver; it performs the
    // final teardown once the drain finishes
    self.want_write_dst = true;
    self.sync_interest_or_destroy(ctx)
  }

  fn drive_handshake(&mut self) -> HandshakeStep {
    if !self.engine.is_handshaking() {
      return HandshakeStep::Established;
    }

    let Some(sock) = self.tls_sock.as_mut() else { return HandshakeStep::Failed };
    match self.engine.accept(sock) {
      Ok(TlsAccept::Done) => {
        debug_log!("tlstun: session {}: tls handshake complete", self.key);
        HandshakeStep::Established
      }
      Ok(TlsAccept::WantRead) => HandshakeStep::Pending,
      Ok(TlsAccept::WantWrite) => {
        self.want_write_tls = true;
        HandshakeStep::Pending
      }
      Err(err) => {
        info_log!("tlstun: session {}: tls handshake failed: {}", self.key, err);
        HandshakeStep::Failed
      }
    }
  }

  /// Bytes that piled up in `from_dst` while the handshake ran have no
  /// readiness event of their own; schedule their delivery now.
  fn after_establish(&mut self) {
    if self.from_dst.bytes_used() > 0 {
      self.want_write_tls = true;
    }
  }

  fn pause_read_tls(&mut self, ctx: &mut IoCtx<'_>) -> Flow {
    trace_log!("tlstun: session {}: from_tls full, pausing tls reads", self.key);
    self.want_read_tls = false;
    let flow = self.sync_interest_or_destroy(ctx);
    ctx.timers.arm(self.key, WaitKind::ReadTls, WAIT_DELAY);
    flow
  }

  fn pause_read_dst(&mut self, ctx: &mut IoCtx<'_>) -> Flow {
    trace_log!("tlstun: session {}: from_dst full, pausing destination reads", self.key);
    self.want_read_dst = false;
    let flow = self.sync_interest_or_destroy(ctx);
    ctx.timers.arm(self.key, WaitKind::ReadDst, WAIT_DELAY);
    flow
  }

  fn close_tls(&mut self, registry: &Registry) {
    if let Some(mut sock) = self.tls_sock.take() {
      if !self.engine.is_handshaking() {
        self.engine.close(&mut sock);
      }
      let _ = registry.deregister(&mut sock);
      debug_log!("tlstun: session {}: tls side closed", self.key);
    }
    self.want_read_tls = false;
    self.want_write_tls = false;
    self.applied_tls = None;
  }

  fn close_dst(&mut self, registry: &Registry) {
    if let Some(mut sock) = self.dst_sock.take() {
      let _ = registry.deregister(&mut sock);
      debug_log!("tlstun: session {}: destination side closed", self.key);
    }
    self.want_read_dst = false;
    self.want_write_dst = false;
    self.applied_dst = None;
  }

  fn sync_interest_or_destroy(&mut self, ctx: &mut IoCtx<'_>) -> Flow {
    match self.sync_interest(ctx.registry) {
      Ok(()) => Flow::Continue,
      Err(err) => {
        error_log!("tlstun: session {}: event registration failed: {}", self.key, err);
        Flow::Destroy
      }
    }
  }

  /// Applies the desired readiness flags to the registry. An active
  /// interest set is re-applied even when unchanged: the reregister re-arms
  /// delivery for readiness edges that already fired.
  fn sync_interest(&mut self, registry: &Registry) -> std::io::Result<()> {
    if let Some(sock) = self.tls_sock.as_mut() {
      let desired = interest_set(self.want_read_tls, self.want_write_tls);
      match (desired, self.applied_tls) {
        (Some(interest), Some(_)) => registry.reregister(sock, tls_token(self.key), interest)?,
        (Some(interest), None) => registry.register(sock, tls_token(self.key), interest)?,
        (None, Some(_)) => registry.deregister(sock)?,
        (None, None) => {}
      }
      self.applied_tls = desired;
    }

    if let Some(sock) = self.dst_sock.as_mut() {
      let desired = interest_set(self.want_read_dst, self.want_write_dst);
      match (desired, self.applied_dst) {
        (Some(interest), Some(_)) => registry.reregister(sock, dst_token(self.key), interest)?,
        (Some(interest), None) => registry.register(sock, dst_token(self.key), interest)?,
        (None, Some(_)) => registry.deregister(sock)?,
        (None, None) => {}
      }
      self.applied_dst = desired;
    }

    Ok(())
  }
}

fn interest_set(read: bool, write: bool) -> Option<Interest> {
  match (read, write) {
    (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
    (true, false) => Some(Interest::READABLE),
    (false, true) => Some(Interest::WRITABLE),
    (false, false) => None,
  }
}
