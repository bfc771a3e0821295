//! Error type shared by the renderer, the senders, the worker and the queue adapters

use std::fmt;

pub type ClResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	NotFound,
	DbError,
	/// Invalid or missing configuration (e.g. no from address)
	ConfigError(String),
	/// Message failed validation (e.g. no recipients, malformed address)
	ValidationError(String),
	TemplateNotFound(String),
	/// Template parse or execution failure
	RenderError(String),
	/// Dial, TLS, authentication or SMTP protocol failure
	TransportError(String),
	/// Queued payload could not be decoded
	DataCorruption(String),
	/// Operation not allowed in the current state (e.g. starting a running worker)
	Conflict(String),
	Timeout,
	Internal(String),

	// externals
	Io(std::io::Error),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::NotFound => write!(f, "not found"),
			Error::DbError => write!(f, "database error"),
			Error::ConfigError(msg) => write!(f, "configuration error: {}", msg),
			Error::ValidationError(msg) => write!(f, "validation error: {}", msg),
			Error::TemplateNotFound(msg) => write!(f, "template not found: {}", msg),
			Error::RenderError(msg) => write!(f, "template render error: {}", msg),
			Error::TransportError(msg) => write!(f, "transport error: {}", msg),
			Error::DataCorruption(msg) => write!(f, "data corruption: {}", msg),
			Error::Conflict(msg) => write!(f, "conflict: {}", msg),
			Error::Timeout => write!(f, "operation timed out"),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
			Error::Io(err) => write!(f, "io error: {}", err),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(err) => Some(err),
			_ => None,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Internal(format!("json: {}", err))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_display_carries_kind() {
		assert_eq!(
			Error::TemplateNotFound("welcome.html.hbs".into()).to_string(),
			"template not found: welcome.html.hbs"
		);
		assert_eq!(
			Error::ValidationError("no recipients".into()).to_string(),
			"validation error: no recipients"
		);
		assert!(Error::RenderError("bad".into()).to_string().contains("template"));
		assert!(Error::Timeout.to_string().contains("timed out"));
	}

	#[test]
	fn test_io_error_source() {
		let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
		assert!(std::error::Error::source(&err).is_some());
		assert!(err.to_string().starts_with("io error"));
	}
}

// vim: ts=4
