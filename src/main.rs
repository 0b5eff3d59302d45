use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process::ExitCode;
use tlstun::{error_log, info_log};
use tlstun::{Server, TunnelConfig};

fn main() -> ExitCode {
  colog::default_builder().filter_level(log::LevelFilter::Info).init();

  let ini_path = std::env::args().nth(1).unwrap_or_else(|| "./tunnel.ini".to_string());

  let config = match TunnelConfig::load(&ini_path) {
    Ok(config) => config,
    Err(err) => {
      error_log!("tlstun: cannot load {}: {}", ini_path, err);
      return ExitCode::FAILURE;
    }
  };

  let server = match Server::new(config) {
    Ok(server) => server,
    Err(err) => {
      error_log!("tlstun: startup failed: {}", err);
      return ExitCode::FAILURE;
    }
  };

  let handle = server.shutdown_handle();
  let mut signals = match Signals::new([SIGINT, SIGTERM]) {
    Ok(signals) => signals,
    Err(err) => {
      error_log!("tlstun: cannot register signal handlers: {}", err);
      return ExitCode::FAILURE;
    }
  };

  let signal_thread = std::thread::Builder::new().name("tlstun-signals".to_string()).spawn(move || {
    if let Some(signal) = signals.forever().next() {
      info_log!("tlstun: received signal {}, shutting down", signal);
      handle.shutdown();
    }
  });
  if let Err(err) = signal_thread {
    error_log!("tlstun: cannot spawn signal thread: {}", err);
    return ExitCode::FAILURE;
  }

  match server.serve_forever() {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      error_log!("tlstun: server failed: {}", err);
      ExitCode::FAILURE
    }
  }
}
