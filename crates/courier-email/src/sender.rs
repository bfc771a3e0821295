//! SMTP email sender
//!
//! Renders a message and transmits it right away. Used directly where the caller
//! needs the delivery outcome (authentication emails), and by the worker for
//! queued emails. It never retries on its own.

use async_trait::async_trait;
use lettre::message::header::{HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;

use courier_types::email::EmailMessage;

use crate::prelude::*;
use crate::settings::EmailSettings;
use crate::template::TemplateEngine;
use crate::EmailSender;

/// Connection security for the SMTP session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportSecurity {
	/// Plaintext session
	None,
	/// Upgrade the connection with STARTTLS
	StartTls,
	/// TLS from the first byte (implicit TLS)
	Tls,
}

impl TransportSecurity {
	/// Implicit TLS takes precedence when both flags are set
	pub fn select(settings: &EmailSettings) -> Self {
		if settings.use_tls {
			TransportSecurity::Tls
		} else if settings.use_starttls {
			TransportSecurity::StartTls
		} else {
			TransportSecurity::None
		}
	}
}

/// Final hop of a delivery: hands a built message to a mail server
#[async_trait]
pub trait MailTransport: Send + Sync {
	async fn deliver(
		&self,
		settings: &EmailSettings,
		timeout: Duration,
		message: Message,
	) -> ClResult<()>;
}

/// Real SMTP transport, one connection per delivery
#[derive(Debug, Default)]
pub struct SmtpRelay;

impl SmtpRelay {
	fn build_transport(
		host: &str,
		settings: &EmailSettings,
		timeout: Duration,
	) -> ClResult<AsyncSmtpTransport<Tokio1Executor>> {
		let security = TransportSecurity::select(settings);

		let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
			.port(settings.port)
			.timeout(Some(timeout));

		if security != TransportSecurity::None {
			let mut tls_builder = TlsParameters::builder(host.to_string());
			if settings.insecure_skip_verify {
				warn!("SMTP certificate verification disabled for {}", host);
				tls_builder = tls_builder.dangerous_accept_invalid_certs(true);
			}
			let tls_params = tls_builder
				.build()
				.map_err(|e| Error::ConfigError(format!("TLS configuration error: {}", e)))?;

			builder = match security {
				TransportSecurity::Tls => builder.tls(Tls::Wrapper(tls_params)),
				_ => builder.tls(Tls::Required(tls_params)),
			};
		}

		if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
			builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
		}

		Ok(builder.build())
	}
}

#[async_trait]
impl MailTransport for SmtpRelay {
	async fn deliver(
		&self,
		settings: &EmailSettings,
		timeout: Duration,
		message: Message,
	) -> ClResult<()> {
		let Some(host) = settings.host.as_deref() else {
			return Err(Error::ConfigError("SMTP host not configured".into()));
		};

		let transport = Self::build_transport(host, settings, timeout)?;
		transport.send(message).await.map_err(|e| {
			warn!("SMTP delivery via {}:{} failed: {}", host, settings.port, e);
			Error::TransportError(e.to_string())
		})?;
		Ok(())
	}
}

/// Direct SMTP sender
pub struct SmtpSender {
	settings: EmailSettings,
	templates: Arc<TemplateEngine>,
	transport: Arc<dyn MailTransport>,
}

impl std::fmt::Debug for SmtpSender {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SmtpSender")
			.field("host", &self.settings.host)
			.field("port", &self.settings.port)
			.finish_non_exhaustive()
	}
}

impl SmtpSender {
	pub fn new(settings: EmailSettings, templates: Arc<TemplateEngine>) -> Self {
		Self::with_transport(settings, templates, Arc::new(SmtpRelay))
	}

	/// Create a sender with a custom transport (tests, alternative relays)
	pub fn with_transport(
		settings: EmailSettings,
		templates: Arc<TemplateEngine>,
		transport: Arc<dyn MailTransport>,
	) -> Self {
		Self { settings, templates, transport }
	}

	pub fn settings(&self) -> &EmailSettings {
		&self.settings
	}

	fn parse_mailbox(address: &str) -> ClResult<Mailbox> {
		address
			.trim()
			.parse()
			.map_err(|e| Error::ValidationError(format!("invalid address '{}': {}", address, e)))
	}

	fn from_mailbox(&self) -> ClResult<Mailbox> {
		let from_address = self
			.settings
			.from_address
			.as_deref()
			.filter(|a| !a.trim().is_empty())
			.ok_or_else(|| Error::ConfigError("email from address not configured".into()))?;

		let address = Self::parse_mailbox(from_address)?.email;
		let name = self.settings.from_name.clone().filter(|n| !n.trim().is_empty());
		Ok(Mailbox::new(name, address))
	}

	fn full_subject(&self, subject: &str) -> String {
		match self.settings.subject_prefix.as_deref() {
			Some(prefix) if !prefix.is_empty() => format!("{} {}", prefix, subject),
			_ => subject.to_string(),
		}
	}

	/// Build the wire message: text primary part, HTML alternative
	fn build_message(
		&self,
		message: &EmailMessage,
		subject: &str,
		text_body: String,
		html_body: String,
	) -> ClResult<Message> {
		let mut builder =
			Message::builder().from(self.from_mailbox()?).subject(self.full_subject(subject));

		for address in &message.to {
			builder = builder.to(Self::parse_mailbox(address)?);
		}
		for address in &message.cc {
			builder = builder.cc(Self::parse_mailbox(address)?);
		}
		for address in &message.bcc {
			builder = builder.bcc(Self::parse_mailbox(address)?);
		}

		for (name, value) in &message.headers {
			match HeaderName::new_from_ascii(name.clone()) {
				Ok(header_name) => {
					builder = builder.raw_header(HeaderValue::new(header_name, value.clone()));
				}
				Err(_) => warn!("Skipping invalid email header name '{}'", name),
			}
		}

		builder
			.multipart(MultiPart::alternative_plain_html(text_body, html_body))
			.map_err(|e| Error::ValidationError(format!("failed to build email: {}", e)))
	}
}

#[async_trait]
impl EmailSender for SmtpSender {
	async fn send(&self, message: &EmailMessage) -> ClResult<()> {
		if !self.settings.is_enabled() {
			debug!("SMTP host not configured, skipping email '{}'", message.template);
			return Ok(());
		}

		let rendered = self.templates.render(&message.template, &message.locale, &message.data)?;

		// Fail on configuration before looking at the message
		self.from_mailbox()?;

		if message.recipient_count() == 0 {
			return Err(Error::ValidationError("email has no recipients".into()));
		}

		let subject = if message.subject.trim().is_empty() {
			rendered.subject.ok_or_else(|| {
				Error::ValidationError(format!(
					"no subject given and template '{}' has no subject in frontmatter",
					message.template
				))
			})?
		} else {
			message.subject.clone()
		};

		let email = self.build_message(message, &subject, rendered.text_body, rendered.html_body)?;
		let timeout = self.settings.smtp_timeout();

		self.transport.deliver(&self.settings, timeout, email).await?;

		info!(
			"Email '{}' sent to {} recipient(s)",
			message.template,
			message.recipient_count()
		);
		Ok(())
	}
}


// vim: ts=4
