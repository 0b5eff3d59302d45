mod test_util;

use std::io::{Read, Write};
use test_util::*;

#[test]
fn sequential_sessions_are_served_across_the_whole_pool() {
  start_echo_server(28485);
  // eight sequential accepts land two on each of the four workers
  let server = RunningServer::start(test_config(28484, 28485, 4, 4096));

  for round in 0..8u8 {
    let mut client = tls_client(28484);
    let message = [round; 32];
    client.write_all(&message).expect("write failed");

    let mut buf = [0u8; 32];
    client.read_exact(&mut buf).expect("read failed");
    assert_eq!(buf, message);
    drop(client);
  }

  server.stop();
}
