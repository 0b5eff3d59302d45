mod test_util;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use test_util::*;

#[test]
fn destination_bytes_drain_after_destination_closes() {
  // destination sends 2 KiB and disconnects right away
  let payload = pattern(2048);
  let served = payload.clone();
  let listener = TcpListener::bind(("127.0.0.1", 28471)).expect("bind destination");
  thread::spawn(move || {
    if let Ok((mut stream, _)) = listener.accept() {
      let _ = stream.write_all(&served);
    }
  });

  // buffer smaller than the payload so the drain spans several rounds
  let server = RunningServer::start(test_config(28470, 28471, 1, 512));

  let mut client = tls_client(28470);
  let mut delivered = Vec::new();
  client.read_to_end(&mut delivered).expect("read failed");
  assert_eq!(delivered, payload);

  drop(client);
  server.stop();
}

#[test]
fn instant_destination_close_still_serves_the_next_client() {
  // first connection is dropped immediately, the second one is echoed
  let listener = TcpListener::bind(("127.0.0.1", 28473)).expect("bind destination");
  thread::spawn(move || {
    if let Ok((stream, _)) = listener.accept() {
      drop(stream);
    }
    if let Ok((mut stream, _)) = listener.accept() {
      let mut buf = [0u8; 64];
      while let Ok(count) = stream.read(&mut buf) {
        if count == 0 || stream.write_all(&buf[..count]).is_err() {
          break;
        }
      }
    }
  });

  let server = RunningServer::start(test_config(28472, 28473, 1, 4096));

  // session one dies with its destination; the read must not hang
  let mut first = tls_client(28472);
  let mut sink = Vec::new();
  let _ = first.read_to_end(&mut sink);
  assert!(sink.is_empty());
  drop(first);

  let mut second = tls_client(28472);
  second.write_all(b"still alive").expect("write failed");
  let mut buf = [0u8; 11];
  second.read_exact(&mut buf).expect("read failed");
  assert_eq!(&buf, b"still alive");

  drop(second);
  server.stop();
}
