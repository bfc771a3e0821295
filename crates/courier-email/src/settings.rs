//! Email and worker settings
//!
//! Settings are plain serde structs with per-field defaults. They are loaded from
//! an optional YAML file and then overridden from `COURIER_*` environment variables.

use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::prelude::*;

/// Transport timeout used when the configured timeout string does not parse
pub const DEFAULT_SMTP_TIMEOUT: Duration = Duration::from_secs(10);

/// SMTP and rendering settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
	/// SMTP server hostname. If not set, emails are silently skipped.
	pub host: Option<String>,
	pub port: u16,
	pub username: Option<String>,
	pub password: Option<String>,
	/// Implicit TLS (typically port 465). Takes precedence over `use_starttls`.
	pub use_tls: bool,
	/// STARTTLS upgrade (typically port 587)
	pub use_starttls: bool,
	/// Accept invalid certificates. Never enable in production.
	pub insecure_skip_verify: bool,
	/// Transport timeout as a duration string (e.g. "10s", "1m30s")
	pub timeout: String,
	pub from_address: Option<String>,
	pub from_name: Option<String>,
	pub subject_prefix: Option<String>,
	pub template_dir: PathBuf,
	pub locales_dir: PathBuf,
	pub default_locale: String,
	/// Retry budget given to newly queued emails
	pub max_retries: u32,
}

impl Default for EmailSettings {
	fn default() -> Self {
		Self {
			host: None,
			port: 587,
			username: None,
			password: None,
			use_tls: false,
			use_starttls: false,
			insecure_skip_verify: false,
			timeout: "10s".into(),
			from_address: None,
			from_name: None,
			subject_prefix: None,
			template_dir: PathBuf::from("./templates/email"),
			locales_dir: PathBuf::from("./templates/locales"),
			default_locale: "en".into(),
			max_retries: 3,
		}
	}
}

impl EmailSettings {
	/// Resolve the transport timeout, falling back to `DEFAULT_SMTP_TIMEOUT`
	pub fn smtp_timeout(&self) -> Duration {
		match parse_duration(&self.timeout) {
			Some(timeout) if !timeout.is_zero() => timeout,
			_ => {
				warn!(
					"Invalid SMTP timeout '{}', using {:?}",
					self.timeout, DEFAULT_SMTP_TIMEOUT
				);
				DEFAULT_SMTP_TIMEOUT
			}
		}
	}

	/// Email delivery is disabled when no host is configured
	pub fn is_enabled(&self) -> bool {
		self.host.as_deref().is_some_and(|h| !h.trim().is_empty())
	}
}

/// Queue worker settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
	pub batch_size: u32,
	#[serde(deserialize_with = "de_duration")]
	pub poll_interval: Duration,
	#[serde(deserialize_with = "de_duration")]
	pub cleanup_interval: Duration,
	/// Items older than this are deleted regardless of status
	#[serde(deserialize_with = "de_duration")]
	pub cleanup_age: Duration,
	pub max_concurrency: usize,
	/// Wall-clock budget of one dispatch cycle
	#[serde(deserialize_with = "de_duration")]
	pub batch_timeout: Duration,
	/// How long `stop` waits for the loops to finish
	#[serde(deserialize_with = "de_duration")]
	pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
	fn default() -> Self {
		Self {
			batch_size: 50,
			poll_interval: Duration::from_secs(10),
			cleanup_interval: Duration::from_secs(3600),
			cleanup_age: Duration::from_secs(30 * 24 * 3600),
			max_concurrency: 5,
			batch_timeout: Duration::from_secs(300),
			shutdown_timeout: Duration::from_secs(30),
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub email: EmailSettings,
	pub worker: WorkerSettings,
}

impl Settings {
	/// Load settings from a YAML file
	pub fn from_yaml_file(path: impl AsRef<Path>) -> ClResult<Self> {
		let content = std::fs::read_to_string(path.as_ref())?;
		Self::from_yaml_str(&content)
	}

	pub fn from_yaml_str(content: &str) -> ClResult<Self> {
		serde_yaml::from_str(content)
			.map_err(|e| Error::ConfigError(format!("invalid settings file: {}", e)))
	}

	/// Override settings from environment-style variables
	///
	/// `lookup` is usually `|key| std::env::var(key).ok()`.
	pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> ClResult<Self> {
		let email = &mut self.email;
		if let Some(v) = lookup("COURIER_SMTP_HOST") {
			email.host = Some(v);
		}
		if let Some(v) = lookup("COURIER_SMTP_PORT") {
			email.port = parse_env("COURIER_SMTP_PORT", &v)?;
		}
		if let Some(v) = lookup("COURIER_SMTP_USERNAME") {
			email.username = Some(v);
		}
		if let Some(v) = lookup("COURIER_SMTP_PASSWORD") {
			email.password = Some(v);
		}
		if let Some(v) = lookup("COURIER_SMTP_TLS") {
			email.use_tls = parse_bool("COURIER_SMTP_TLS", &v)?;
		}
		if let Some(v) = lookup("COURIER_SMTP_STARTTLS") {
			email.use_starttls = parse_bool("COURIER_SMTP_STARTTLS", &v)?;
		}
		if let Some(v) = lookup("COURIER_SMTP_INSECURE_SKIP_VERIFY") {
			email.insecure_skip_verify = parse_bool("COURIER_SMTP_INSECURE_SKIP_VERIFY", &v)?;
		}
		if let Some(v) = lookup("COURIER_SMTP_TIMEOUT") {
			email.timeout = v;
		}
		if let Some(v) = lookup("COURIER_FROM_ADDRESS") {
			email.from_address = Some(v);
		}
		if let Some(v) = lookup("COURIER_FROM_NAME") {
			email.from_name = Some(v);
		}
		if let Some(v) = lookup("COURIER_SUBJECT_PREFIX") {
			email.subject_prefix = Some(v);
		}
		if let Some(v) = lookup("COURIER_TEMPLATE_DIR") {
			email.template_dir = PathBuf::from(v);
		}
		if let Some(v) = lookup("COURIER_LOCALES_DIR") {
			email.locales_dir = PathBuf::from(v);
		}
		if let Some(v) = lookup("COURIER_DEFAULT_LOCALE") {
			email.default_locale = v;
		}
		if let Some(v) = lookup("COURIER_MAX_RETRIES") {
			email.max_retries = parse_env("COURIER_MAX_RETRIES", &v)?;
		}

		let worker = &mut self.worker;
		if let Some(v) = lookup("COURIER_BATCH_SIZE") {
			worker.batch_size = parse_env("COURIER_BATCH_SIZE", &v)?;
		}
		if let Some(v) = lookup("COURIER_MAX_CONCURRENCY") {
			worker.max_concurrency = parse_env("COURIER_MAX_CONCURRENCY", &v)?;
		}
		if let Some(v) = lookup("COURIER_POLL_INTERVAL") {
			worker.poll_interval = parse_env_duration("COURIER_POLL_INTERVAL", &v)?;
		}
		if let Some(v) = lookup("COURIER_CLEANUP_INTERVAL") {
			worker.cleanup_interval = parse_env_duration("COURIER_CLEANUP_INTERVAL", &v)?;
		}
		if let Some(v) = lookup("COURIER_CLEANUP_AGE") {
			worker.cleanup_age = parse_env_duration("COURIER_CLEANUP_AGE", &v)?;
		}

		Ok(self)
	}
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> ClResult<T> {
	value
		.trim()
		.parse()
		.map_err(|_| Error::ConfigError(format!("{} has an invalid value: {}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> ClResult<bool> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" | "" => Ok(false),
		_ => Err(Error::ConfigError(format!("{} must be a boolean, got: {}", key, value))),
	}
}

fn parse_env_duration(key: &str, value: &str) -> ClResult<Duration> {
	parse_duration(value)
		.ok_or_else(|| Error::ConfigError(format!("{} must be a duration, got: {}", key, value)))
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
	D: Deserializer<'de>,
{
	let s = String::deserialize(deserializer)?;
	parse_duration(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{}'", s)))
}

/// Parse a duration string such as "300ms", "10s", "1m30s" or "720h"
///
/// Supported units: ns, us (µs), ms, s, m, h. A bare "0" is zero.
pub fn parse_duration(input: &str) -> Option<Duration> {
	let s = input.trim();
	if s.is_empty() {
		return None;
	}
	if s == "0" {
		return Some(Duration::ZERO);
	}

	let mut total = Duration::ZERO;
	let mut rest = s;
	while !rest.is_empty() {
		let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
		if num_len == 0 {
			return None;
		}
		let value: f64 = rest[..num_len].parse().ok()?;
		rest = &rest[num_len..];

		let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
		let scale = match &rest[..unit_len] {
			"ns" => 1e-9,
			"us" | "µs" => 1e-6,
			"ms" => 1e-3,
			"s" => 1.0,
			"m" => 60.0,
			"h" => 3600.0,
			_ => return None,
		};
		rest = &rest[unit_len..];

		total += Duration::try_from_secs_f64(value * scale).ok()?;
	}
	Some(total)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[test]
	fn test_parse_duration_units() {
		assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
		assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
		assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
		assert_eq!(parse_duration("720h"), Some(Duration::from_secs(720 * 3600)));
		assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
		assert_eq!(parse_duration("0"), Some(Duration::ZERO));
	}

	#[test]
	fn test_parse_duration_rejects_garbage() {
		assert_eq!(parse_duration(""), None);
		assert_eq!(parse_duration("10"), None);
		assert_eq!(parse_duration("ten seconds"), None);
		assert_eq!(parse_duration("10x"), None);
		assert_eq!(parse_duration("s10"), None);
	}

	#[test]
	fn test_smtp_timeout_fallback() {
		let mut settings = EmailSettings { timeout: "30s".into(), ..Default::default() };
		assert_eq!(settings.smtp_timeout(), Duration::from_secs(30));

		settings.timeout = "forever".into();
		assert_eq!(settings.smtp_timeout(), DEFAULT_SMTP_TIMEOUT);

		settings.timeout = "0s".into();
		assert_eq!(settings.smtp_timeout(), DEFAULT_SMTP_TIMEOUT);
	}

	#[test]
	fn test_is_enabled() {
		let mut settings = EmailSettings::default();
		assert!(!settings.is_enabled());
		settings.host = Some("  ".into());
		assert!(!settings.is_enabled());
		settings.host = Some("smtp.example.com".into());
		assert!(settings.is_enabled());
	}

	#[test]
	fn test_yaml_with_defaults() {
		let yaml = r#"
email:
  host: smtp.example.com
  port: 465
  use_tls: true
  from_address: noreply@example.com
worker:
  batch_size: 10
  poll_interval: 2s
  cleanup_age: 168h
"#;
		let settings = Settings::from_yaml_str(yaml).unwrap();
		assert_eq!(settings.email.host.as_deref(), Some("smtp.example.com"));
		assert_eq!(settings.email.port, 465);
		assert!(settings.email.use_tls);
		assert_eq!(settings.email.default_locale, "en");
		assert_eq!(settings.worker.batch_size, 10);
		assert_eq!(settings.worker.poll_interval, Duration::from_secs(2));
		assert_eq!(settings.worker.cleanup_age, Duration::from_secs(168 * 3600));
		assert_eq!(settings.worker.max_concurrency, 5);
	}

	#[test]
	fn test_yaml_invalid_duration() {
		let yaml = "worker:\n  poll_interval: soon\n";
		assert!(matches!(Settings::from_yaml_str(yaml), Err(Error::ConfigError(_))));
	}

	#[test]
	fn test_env_overrides() {
		let vars: HashMap<&str, &str> = [
			("COURIER_SMTP_HOST", "mail.internal"),
			("COURIER_SMTP_PORT", "2525"),
			("COURIER_SMTP_STARTTLS", "true"),
			("COURIER_FROM_ADDRESS", "bot@example.com"),
			("COURIER_MAX_CONCURRENCY", "8"),
			("COURIER_POLL_INTERVAL", "250ms"),
		]
		.into_iter()
		.collect();

		let settings = Settings::default()
			.apply_env(|key| vars.get(key).map(|v| (*v).to_string()))
			.unwrap();
		assert_eq!(settings.email.host.as_deref(), Some("mail.internal"));
		assert_eq!(settings.email.port, 2525);
		assert!(settings.email.use_starttls);
		assert_eq!(settings.email.from_address.as_deref(), Some("bot@example.com"));
		assert_eq!(settings.worker.max_concurrency, 8);
		assert_eq!(settings.worker.poll_interval, Duration::from_millis(250));
	}

	#[test]
	fn test_env_override_invalid_port() {
		let res = Settings::default()
			.apply_env(|key| (key == "COURIER_SMTP_PORT").then(|| "smtp".to_string()));
		assert!(matches!(res, Err(Error::ConfigError(_))));
	}
}

// vim: ts=4
