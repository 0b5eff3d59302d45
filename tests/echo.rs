mod test_util;

use std::io::{Read, Write};
use std::time::Duration;
use test_util::*;

#[test]
fn echo_roundtrip() {
  start_echo_server(28461);
  let server = RunningServer::start(test_config(28460, 28461, 2, 4096));

  let mut client = tls_client(28460);
  client.write_all(b"hello\n").expect("write failed");

  let mut buf = [0u8; 6];
  client.read_exact(&mut buf).expect("read failed");
  assert_eq!(&buf, b"hello\n");

  drop(client);
  server.stop();
}

#[test]
fn large_transfer_arrives_complete_and_in_order() {
  let receiver = start_sink_server(28463);
  let server = RunningServer::start(test_config(28462, 28463, 2, 4096));

  let payload = pattern(1024 * 1024);
  let mut client = tls_client(28462);
  client.write_all(&payload).expect("write failed");
  client.conn.send_close_notify();
  client.flush().expect("flush failed");
  drop(client);

  let delivered = receiver.recv_timeout(Duration::from_secs(60)).expect("transfer timed out");
  assert_eq!(delivered.len(), payload.len());
  assert_eq!(delivered, payload);

  server.stop();
}

#[test]
fn single_byte_buffer_still_delivers_everything() {
  let receiver = start_sink_server(28465);
  let server = RunningServer::start(test_config(28464, 28465, 1, 1));

  let payload = pattern(64);
  let mut client = tls_client(28464);
  client.write_all(&payload).expect("write failed");
  client.conn.send_close_notify();
  client.flush().expect("flush failed");
  drop(client);

  let delivered = receiver.recv_timeout(Duration::from_secs(60)).expect("transfer timed out");
  assert_eq!(delivered, payload);

  server.stop();
}
