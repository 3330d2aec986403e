//! Exchange identifiers
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier pairing a logged request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(u64);

impl ExchangeId {
  /// Raw numeric value.
  pub fn as_u64(&self) -> u64 {
    self.0
  }
}

impl From<u64> for ExchangeId {
  fn from(value: u64) -> Self {
    ExchangeId(value)
  }
}

impl fmt::Display for ExchangeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Pseudo-random [`ExchangeId`] source shared by all connections.
#[derive(Debug)]
pub struct IdGenerator {
  rng: Mutex<StdRng>,
}

impl Default for IdGenerator {
  fn default() -> Self {
    Self::new()
  }
}

impl IdGenerator {
  /// Seed from the current time.
  pub fn new() -> Self {
    let seed = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos() as u64)
      .unwrap_or_default();
    Self::with_seed(seed)
  }

  /// Deterministic sequence, for tests.
  pub fn with_seed(seed: u64) -> Self {
    Self {
      rng: Mutex::new(StdRng::seed_from_u64(seed)),
    }
  }

  /// Next identifier. Safe to call from any number of tasks.
  pub fn next_id(&self) -> ExchangeId {
    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
    ExchangeId(rng.gen())
  }
}
