//! Courier server - drains the persisted email queue
//!
//! Environment:
//! - `COURIER_CONFIG`: optional YAML settings file
//! - `COURIER_DB`: SQLite queue database (default `./data/queue.db`)
//! - `COURIER_*`: individual settings overrides (see `Settings::apply_env`)
//! - `RUST_LOG`: log filter

use std::{env, path::PathBuf, sync::Arc};
use tokio::signal;

use courier_email::{EmailModule, Settings};
use courier_queue_adapter_sqlite::QueueAdapterSqlite;
use courier_types::prelude::*;

pub struct Config {
	pub config_file: Option<PathBuf>,
	pub db_path: PathBuf,
}

impl Config {
	fn from_env() -> Self {
		Config {
			config_file: env::var("COURIER_CONFIG").ok().map(PathBuf::from),
			db_path: PathBuf::from(
				env::var("COURIER_DB").unwrap_or_else(|_| "./data/queue.db".to_string()),
			),
		}
	}
}

fn load_settings(config: &Config) -> ClResult<Settings> {
	let settings = match &config.config_file {
		Some(path) => {
			info!("Loading settings from {}", path.display());
			Settings::from_yaml_file(path)?
		}
		None => Settings::default(),
	};
	settings.apply_env(|key| env::var(key).ok())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to install Ctrl+C handler: {}", err);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(err) => {
				error!("Failed to install SIGTERM handler: {}", err);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}

#[tokio::main]
async fn main() -> ClResult<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_target(false)
		.init();

	let config = Config::from_env();
	let settings = load_settings(&config)
		.inspect_err(|err| error!("Failed to load settings: {}", err))?;

	if !settings.email.is_enabled() {
		warn!("No SMTP host configured, queued emails will be marked sent without delivery");
	}

	let adapter = Arc::new(QueueAdapterSqlite::new(&config.db_path).await?);
	let module = EmailModule::new(settings, adapter, None);

	module.worker.start()?;
	info!("Courier started");

	shutdown_signal().await;
	info!("Shutting down");

	module.worker.stop().await?;
	info!("Courier stopped");
	Ok(())
}

// vim: ts=4
