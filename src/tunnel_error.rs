//! Error types for the tunnel.
#![allow(missing_docs)]

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::io::ErrorKind;

pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors produced while loading or validating the configuration file.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ConfigError {
  /// A line that is neither a section header, a key=value pair, a comment
  /// nor blank. Carries the line number and the offending text.
  Syntax(usize, String),
  /// A key=value pair before any section header.
  KeyOutsideSection(usize, String),
  UnknownSection(String),
  /// Section and key name.
  UnknownKey(String, String),
  MissingKey(&'static str),
  /// Key name and the value that failed to parse.
  InvalidValue(&'static str, String),
}

impl Display for ConfigError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ConfigError::Syntax(line, text) => write!(f, "line {line}: malformed line {text:?}"),
      ConfigError::KeyOutsideSection(line, key) => {
        write!(f, "line {line}: key {key:?} appears before any section header")
      }
      ConfigError::UnknownSection(section) => write!(f, "unknown section [{section}]"),
      ConfigError::UnknownKey(section, key) => write!(f, "unknown key {key:?} in section [{section}]"),
      ConfigError::MissingKey(key) => write!(f, "required key {key:?} is missing"),
      ConfigError::InvalidValue(key, value) => write!(f, "invalid value {value:?} for key {key:?}"),
    }
  }
}
impl Error for ConfigError {}

#[derive(Debug)]
#[non_exhaustive]
pub enum TunnelError {
  IO(io::Error),
  Tls(rustls::Error),
  Config(ConfigError),
  Other(Box<dyn Error + Send + Sync>),
}

impl TunnelError {
  pub fn new_io<E: Into<Box<dyn Error + Send + Sync>>>(kind: ErrorKind, message: E) -> TunnelError {
    io::Error::new(kind, message).into()
  }

  pub fn from_io_kind(kind: ErrorKind) -> TunnelError {
    io::Error::from(kind).into()
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      TunnelError::IO(io) => io.kind(),
      TunnelError::Config(_) => ErrorKind::InvalidData,
      _ => ErrorKind::Other,
    }
  }

  pub fn into_inner(self) -> Box<dyn Error + Send + Sync + 'static> {
    match self {
      TunnelError::IO(err) => Box::new(err) as Box<dyn Error + Send + Sync>,
      TunnelError::Tls(err) => Box::new(err) as Box<dyn Error + Send + Sync>,
      TunnelError::Config(err) => Box::new(err) as Box<dyn Error + Send + Sync>,
      TunnelError::Other(other) => other,
    }
  }
}

impl Display for TunnelError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      TunnelError::IO(err) => Display::fmt(err, f),
      TunnelError::Tls(err) => Display::fmt(err, f),
      TunnelError::Config(err) => Display::fmt(err, f),
      TunnelError::Other(err) => Display::fmt(err, f),
    }
  }
}

impl<T> From<T> for TunnelError
where
  T: Error + Send + Sync + 'static,
{
  fn from(value: T) -> Self {
    let mut dyn_box = Box::new(value) as Box<dyn Error + Send + Sync>;
    dyn_box = match dyn_box.downcast::<io::Error>() {
      Ok(err) => return TunnelError::IO(*err),
      Err(err) => err,
    };
    dyn_box = match dyn_box.downcast::<rustls::Error>() {
      Ok(err) => return TunnelError::Tls(*err),
      Err(err) => err,
    };
    dyn_box = match dyn_box.downcast::<ConfigError>() {
      Ok(err) => return TunnelError::Config(*err),
      Err(err) => err,
    };

    TunnelError::Other(dyn_box)
  }
}

impl From<TunnelError> for io::Error {
  fn from(value: TunnelError) -> Self {
    match value {
      TunnelError::IO(io) => io,
      err => io::Error::new(err.kind(), err.into_inner()),
    }
  }
}
