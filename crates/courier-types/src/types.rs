//! Common scalar types

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Queue item identifier
pub type ItemId = u64;

// Timestamp //
//***********//
/// Unix timestamp in seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Timestamp {
		now()
	}

	/// Timestamp `seconds` from now (negative values point to the past)
	pub fn from_now(seconds: i64) -> Timestamp {
		Timestamp(now().0.saturating_add(seconds))
	}

	/// Timestamp `age` before now
	pub fn ago(age: Duration) -> Timestamp {
		let secs = i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
		Timestamp(now().0.saturating_sub(secs))
	}

	pub fn add_seconds(self, seconds: u64) -> Timestamp {
		Timestamp(self.0.saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX)))
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Serialize for Timestamp {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		Ok(Timestamp(i64::deserialize(deserializer)?))
	}
}

pub fn now() -> Timestamp {
	let res = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
	Timestamp(i64::try_from(res.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_relative_timestamps() {
		let base = now();
		assert!(Timestamp::from_now(60) >= base.add_seconds(60));
		assert!(Timestamp::ago(Duration::from_secs(60)).0 <= base.0 - 59);
		assert_eq!(Timestamp(10).add_seconds(5), Timestamp(15));
	}
}

// vim: ts=4
