mod test_util;

use std::io::{Read, Write};
use test_util::*;

#[test]
fn unreachable_destination_tears_down_the_session_but_not_the_server() {
  // nothing listens on 28491 yet
  let server = RunningServer::start(test_config(28490, 28491, 2, 4096));

  // the session dies on the failed destination connect; the client just
  // sees its connection end
  let mut first = tls_client(28490);
  let mut sink = Vec::new();
  let _ = first.read_to_end(&mut sink);
  assert!(sink.is_empty());
  drop(first);

  // the listener kept running; once the destination exists, sessions work
  start_echo_server(28491);
  let mut second = tls_client(28490);
  second.write_all(b"recovered").expect("write failed");
  let mut buf = [0u8; 9];
  second.read_exact(&mut buf).expect("read failed");
  assert_eq!(&buf, b"recovered");

  drop(second);
  server.stop();
}
