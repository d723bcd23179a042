//! Document identifiers and the wall-clock abstraction.
//!
//! Ids are 12 bytes: a 4-byte big-endian Unix-seconds prefix followed by 8
//! bytes of cryptographic randomness, hex-encoded to a 24-char lowercase
//! string. Same-second collisions are resolved by the randomness, not by
//! any ordering guarantee — callers must not rely on strict time order.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId([u8; 12]);

impl Serialize for DocumentId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.as_hex())
  }
}

impl<'de> Deserialize<'de> for DocumentId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    DocumentId::parse(&s).ok_or_else(|| D::Error::custom(format!("invalid document id: {s}")))
  }
}

impl DocumentId {
  pub fn generate(clock: &dyn Clock) -> Self {
    let secs = clock.now_unix_secs() as u32;
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&secs.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut bytes[4..12]);
    Self(bytes)
  }

  pub fn parse(s: &str) -> Option<Self> {
    if s.len() != 24 {
      return None;
    }
    let mut bytes = [0u8; 12];
    for i in 0..12 {
      bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(Self(bytes))
  }

  pub fn as_hex(&self) -> String {
    let mut s = String::with_capacity(24);
    for b in self.0 {
      s.push_str(&format!("{:02x}", b));
    }
    s
  }
}

impl fmt::Display for DocumentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_hex())
  }
}

/// Abstracts the wall clock so the pipeline and schema manager can be
/// driven by a fixed or manually-advanced clock in tests.
pub trait Clock: Send + Sync {
  fn now_unix_secs(&self) -> i64;
  fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_unix_secs(&self) -> i64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0)
  }

  fn now(&self) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
  }
}

/// A clock that starts at a fixed instant and only moves forward when
/// explicitly told to, for deterministic tests of `updatedAt` ordering.
pub struct FixedClock {
  secs: AtomicI64,
}

impl FixedClock {
  pub fn new(start_unix_secs: i64) -> Arc<Self> {
    Arc::new(Self {
      secs: AtomicI64::new(start_unix_secs),
    })
  }

  pub fn advance(&self, by_secs: i64) {
    self.secs.fetch_add(by_secs, Ordering::SeqCst);
  }
}

impl Clock for FixedClock {
  fn now_unix_secs(&self) -> i64 {
    self.secs.load(Ordering::SeqCst)
  }

  fn now(&self) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(self.now_unix_secs(), 0).unwrap_or_else(chrono::Utc::now)
  }
}
