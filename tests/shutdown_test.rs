mod test_util;

use std::io::{Read, Write};
use std::net::TcpListener;
use test_util::*;

#[test]
fn graceful_shutdown_closes_active_sessions_and_releases_the_port() {
  start_echo_server(28481);
  let server = RunningServer::start(test_config(28480, 28481, 3, 4096));

  // three live sessions across the worker pool
  let mut clients = Vec::new();
  for index in 0..3u8 {
    let mut client = tls_client(28480);
    let message = [b'a' + index; 8];
    client.write_all(&message).expect("write failed");
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).expect("read failed");
    assert_eq!(buf, message);
    clients.push(client);
  }

  // blocks until the listener and all three workers have exited
  server.stop();

  // every session was closed underneath its client
  for mut client in clients {
    let mut sink = Vec::new();
    let _ = client.read_to_end(&mut sink);
    assert!(sink.is_empty());
  }

  // the listen socket is gone
  let rebind = TcpListener::bind(("127.0.0.1", 28480)).expect("port still held after shutdown");
  drop(rebind);
}
