//! Helpers shared by the integration tests.
#![allow(dead_code)] // each test binary uses a subset of these

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tlstun::{Server, ShutdownHandle, TunnelConfig, TunnelResult};

pub const CERT_PEM: &[u8] = include_bytes!("./ssl/cert.pem");

pub fn cert_path() -> String {
  concat!(env!("CARGO_MANIFEST_DIR"), "/tests/ssl/cert.pem").to_string()
}

pub fn key_path() -> String {
  concat!(env!("CARGO_MANIFEST_DIR"), "/tests/ssl/key.pem").to_string()
}

pub fn test_config(
  listen_port: u16,
  dest_port: u16,
  thread_count: usize,
  buffer_size: usize,
) -> TunnelConfig {
  TunnelConfig {
    ssl_server_name: "127.0.0.1".to_string(),
    ssl_server_port: listen_port,
    destination_name: "127.0.0.1".to_string(),
    destination_port: dest_port.to_string(),
    thread_count,
    buffer_size,
    verify_locations: None,
    certificate_file: cert_path(),
    private_key_file: key_path(),
    require_client_auth: false,
  }
}

/// A tunnel server running on its own thread.
pub struct RunningServer {
  pub handle: ShutdownHandle,
  thread: thread::JoinHandle<TunnelResult<()>>,
}

impl RunningServer {
  pub fn start(config: TunnelConfig) -> RunningServer {
    let server = Server::new(config).expect("server construction failed");
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.serve_forever());
    RunningServer { handle, thread }
  }

  /// Requests shutdown and waits for `serve_forever` to return.
  pub fn stop(self) {
    self.handle.shutdown();
    self.thread.join().expect("server thread panicked").expect("serve_forever failed");
  }
}

pub fn connect_with_retry(port: u16) -> TcpStream {
  let deadline = Instant::now() + Duration::from_secs(10);
  loop {
    match TcpStream::connect(("127.0.0.1", port)) {
      Ok(stream) => return stream,
      Err(err) => {
        assert!(Instant::now() < deadline, "cannot connect to 127.0.0.1:{port}: {err}");
        thread::sleep(Duration::from_millis(20));
      }
    }
  }
}

/// A blocking rustls client trusting the test certificate. The handshake
/// runs lazily on first read or write.
pub fn tls_client(port: u16) -> rustls::StreamOwned<rustls::ClientConnection, TcpStream> {
  let mut roots = rustls::RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut &CERT_PEM[..]) {
    roots.add(cert.expect("bad test certificate")).expect("test certificate rejected");
  }
  let config =
    rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();

  let stream = connect_with_retry(port);
  stream.set_read_timeout(Some(Duration::from_secs(30))).expect("set_read_timeout");
  stream.set_write_timeout(Some(Duration::from_secs(30))).expect("set_write_timeout");

  let server_name = rustls::pki_types::ServerName::try_from("localhost").expect("server name");
  let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
    .expect("client connection construction failed");
  rustls::StreamOwned::new(conn, stream)
}

/// TCP echo server used as the tunnel destination. Serves until the test
/// process exits.
pub fn start_echo_server(port: u16) {
  let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind echo server");
  thread::spawn(move || {
    for stream in listener.incoming() {
      let Ok(mut stream) = stream else { return };
      thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
          match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(count) => {
              if stream.write_all(&buf[..count]).is_err() {
                return;
              }
            }
          }
        }
      });
    }
  });
}

/// TCP sink that accepts one connection, reads it to EOF and sends the
/// collected bytes back over the returned channel.
pub fn start_sink_server(port: u16) -> mpsc::Receiver<Vec<u8>> {
  let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind sink server");
  let (sender, receiver) = mpsc::channel();
  thread::spawn(move || {
    let Ok((mut stream, _)) = listener.accept() else { return };
    let mut collected = Vec::new();
    if stream.read_to_end(&mut collected).is_ok() {
      let _ = sender.send(collected);
    }
  });
  receiver
}

/// Deterministic byte pattern for transfer tests.
pub fn pattern(len: usize) -> Vec<u8> {
  (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}
