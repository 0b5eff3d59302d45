//! Non-blocking TLS engine for one tunneled connection.
//!
//! Wraps a rustls [`ServerConnection`] and exposes the accept/read/write
//! operations the session state machine needs, each reporting either
//! progress or the readiness it is waiting for (want-read / want-write).
//! The engine never blocks; both sockets it is driven against are
//! non-blocking.

use crate::tunnel_config::TunnelConfig;
use crate::tunnel_error::{ConfigError, TunnelError, TunnelResult};
use mio::net::TcpStream;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::sync::Arc;

/// Outcome of driving the handshake.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum TlsAccept {
  /// Handshake complete, application data may flow.
  Done,
  /// More handshake bytes are needed from the peer.
  WantRead,
  /// Handshake bytes are queued but the socket is not writable.
  WantWrite,
}

/// Outcome of reading plaintext out of the engine.
#[derive(Debug)]
pub(crate) enum TlsRead {
  /// Plaintext bytes were produced.
  Data(usize),
  WantRead,
  WantWrite,
  /// The peer ended the stream, cleanly or not. No more plaintext will
  /// ever be produced.
  Closed,
  Failed(TunnelError),
}

/// Outcome of feeding plaintext into the engine.
#[derive(Debug)]
pub(crate) enum TlsWrite {
  /// Bytes were accepted (and flushed as far as the socket allowed).
  Wrote(usize),
  /// Encrypted records are queued but the socket is not writable. No new
  /// plaintext was consumed.
  WantWrite,
  Failed(TunnelError),
}

enum Flush {
  Done,
  WantWrite,
  Failed(TunnelError),
}

/// Builds the shared rustls server configuration from the certificate and
/// key paths in the tunnel configuration.
pub(crate) fn build_tls_config(config: &TunnelConfig) -> TunnelResult<Arc<ServerConfig>> {
  let mut cert_reader = BufReader::new(File::open(&config.certificate_file)?);
  let certs =
    rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
  if certs.is_empty() {
    return Err(TunnelError::new_io(
      ErrorKind::InvalidData,
      format!("no certificates found in {}", config.certificate_file),
    ));
  }

  let mut key_reader = BufReader::new(File::open(&config.private_key_file)?);
  let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
    TunnelError::new_io(
      ErrorKind::InvalidData,
      format!("no private key found in {}", config.private_key_file),
    )
  })?;

  let builder = ServerConfig::builder();
  let builder = if config.require_client_auth {
    let verify_locations =
      config.verify_locations.as_ref().ok_or(ConfigError::MissingKey("verify_locations"))?;
    let mut roots = RootCertStore::empty();
    let mut root_reader = BufReader::new(File::open(verify_locations)?);
    for cert in rustls_pemfile::certs(&mut root_reader) {
      roots.add(cert?)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
    builder.with_client_cert_verifier(verifier)
  } else {
    builder.with_no_client_auth()
  };

  Ok(Arc::new(builder.with_single_cert(certs, key)?))
}

/// Per-connection TLS state. Created in the handshaking state; the session
/// drives [`TlsEngine::accept`] until it reports [`TlsAccept::Done`].
pub(crate) struct TlsEngine {
  conn: ServerConnection,
}

impl std::fmt::Debug for TlsEngine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("TlsEngine")
  }
}

impl TlsEngine {
  pub(crate) fn new(config: Arc<ServerConfig>) -> TunnelResult<TlsEngine> {
    Ok(TlsEngine { conn: ServerConnection::new(config)? })
  }

  pub(crate) fn is_handshaking(&self) -> bool {
    self.conn.is_handshaking()
  }

  /// Drives the handshake as far as the socket allows.
  pub(crate) fn accept(&mut self, sock: &mut TcpStream) -> TunnelResult<TlsAccept> {
    loop {
      if self.conn.wants_write() {
        match self.conn.write_tls(sock) {
          Ok(0) => return Ok(TlsAccept::WantWrite),
          Ok(_) => continue,
          Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(TlsAccept::WantWrite),
          Err(err) if err.kind() == ErrorKind::Interrupted => continue,
          Err(err) => return Err(err.into()),
        }
      }

      if !self.conn.is_handshaking() {
        return Ok(TlsAccept::Done);
      }

      match self.conn.read_tls(sock) {
        Ok(0) => return Err(TunnelError::from_io_kind(ErrorKind::UnexpectedEof)),
        Ok(_) => {
          self.conn.process_new_packets().map_err(|err| {
            // flush a pending alert before reporting the failure
            let _ = self.conn.write_tls(sock);
            TunnelError::Tls(err)
          })?;
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(TlsAccept::WantRead),
        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
        Err(err) => return Err(err.into()),
      }
    }
  }

  /// Decrypts up to `buf.len()` plaintext bytes, pulling TLS records off
  /// the socket as needed.
  pub(crate) fn read(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> TlsRead {
    let mut seen_eof = false;
    loop {
      match self.conn.reader().read(buf) {
        Ok(0) => return TlsRead::Closed,
        Ok(count) => return TlsRead::Data(count),
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
          if seen_eof {
            return TlsRead::Closed;
          }
          match self.conn.read_tls(sock) {
            Ok(0) => {
              seen_eof = true;
              continue;
            }
            Ok(_) => match self.conn.process_new_packets() {
              Ok(_) => continue,
              Err(err) => {
                let _ = self.conn.write_tls(sock);
                return TlsRead::Failed(TunnelError::Tls(err));
              }
            },
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
              if self.conn.wants_write() {
                return TlsRead::WantWrite;
              }
              return TlsRead::WantRead;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return TlsRead::Failed(err.into()),
          }
        }
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return TlsRead::Closed,
        Err(err) => return TlsRead::Failed(err.into()),
      }
    }
  }

  /// Encrypts `buf` and pushes records onto the socket.
  ///
  /// Records queued by an earlier call are flushed before any new plaintext
  /// is consumed, so a [`TlsWrite::WantWrite`] guarantees that no byte
  /// handed in by the caller has been half-accepted.
  pub(crate) fn write(&mut self, sock: &mut TcpStream, buf: &[u8]) -> TlsWrite {
    match self.flush(sock) {
      Flush::Done => {}
      Flush::WantWrite => return TlsWrite::WantWrite,
      Flush::Failed(err) => return TlsWrite::Failed(err),
    }

    if buf.is_empty() {
      return TlsWrite::Wrote(0);
    }

    let written = match self.conn.writer().write(buf) {
      Ok(count) => count,
      Err(err) => return TlsWrite::Failed(err.into()),
    };

    match self.flush(sock) {
      Flush::Failed(err) => TlsWrite::Failed(err),
      // WantWrite here is fine: the bytes live in the engine's send buffer
      // and the next call flushes them first.
      _ => TlsWrite::Wrote(written),
    }
  }

  fn flush(&mut self, sock: &mut TcpStream) -> Flush {
    while self.conn.wants_write() {
      match self.conn.write_tls(sock) {
        Ok(0) => return Flush::WantWrite,
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::WouldBlock => return Flush::WantWrite,
        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
        Err(err) => return Flush::Failed(err.into()),
      }
    }
    Flush::Done
  }

  /// Queues close_notify and flushes it as far as the socket allows. Best
  /// effort; the socket is dropped right after.
  pub(crate) fn close(&mut self, sock: &mut TcpStream) {
    self.conn.send_close_notify();
    while self.conn.wants_write() {
      match self.conn.write_tls(sock) {
        Ok(0) => break,
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
        Err(_) => break,
      }
    }
  }
}
