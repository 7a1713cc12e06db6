use clap::Parser;
use dc_link::{
	report_failure, ConnectionManager, ConnectionStatus, LinkConfig, LinkError, TaskRegistry,
	TracingNotifier,
};
use serde::Deserialize;
use std::{
	env,
	fs::{self, OpenOptions},
	io::{self, Write},
	path::{Path, PathBuf},
	sync::{Arc, Mutex as StdMutex},
	time::Duration,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug, Default)]
#[command(name = "dc-monitor")]
struct Args {
	#[arg(long, default_value = "")]
	endpoint: String,
	#[arg(long, default_value = "")]
	client_id: String,
	#[arg(long, default_value = "")]
	config: String,
	/// Seconds between keep-alive frames; 0 keeps the configured value.
	#[arg(long, default_value_t = 0)]
	heartbeat_interval: u64,
	#[arg(long, default_value = "")]
	log_dir: String,
	#[arg(long)]
	debug: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
	link: LinkConfig,
	log_dir: Option<String>,
	log_stdout: Option<bool>,
}

#[derive(Debug)]
struct RuntimeConfig {
	link: LinkConfig,
	log_dir: String,
	log_stdout: bool,
	debug: bool,
}

struct LogGuard {
	file: Option<Arc<StdMutex<fs::File>>>,
}

struct MultiWriter {
	stdout_enabled: bool,
	file: Option<Arc<StdMutex<fs::File>>>,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	let config = load_config(&args, |key| env::var(key).ok());
	let _log_guard = init_logging(&config);

	let manager = match ConnectionManager::new(config.link.clone()) {
		Ok(manager) => manager,
		Err(err) => {
			error!(event = "config_invalid", error = %err);
			std::process::exit(2);
		}
	};
	let registry = TaskRegistry::new();
	registry.init(manager.dispatcher());
	subscribe_logging(&registry);
	info!(event = "monitor_start", url = %manager.url());

	manager.start_auto_reconnect();
	let retries = manager.config().ensure_retries;
	if !manager.ensure_connected(retries).await {
		report_failure(&TracingNotifier, &LinkError::NotConnected);
	}
	let watcher = tokio::spawn(watch_connection(manager.clone()));

	if let Err(err) = tokio::signal::ctrl_c().await {
		error!(event = "signal_error", error = %err);
	}
	watcher.abort();
	registry.cleanup();
	manager.disconnect().await;
	info!(event = "monitor_stop");
}

/// Logs transport changes. A new epoch means events may have been missed
/// and task lists need a full reload from the backend.
async fn watch_connection(manager: ConnectionManager) {
	let mut status = manager.watch_status();
	let mut seen_epoch = manager.epoch();
	while status.changed().await.is_ok() {
		let current = *status.borrow_and_update();
		match current {
			ConnectionStatus::Connected => {
				let epoch = manager.epoch();
				if epoch > 1 && epoch != seen_epoch {
					warn!(event = "transport_replaced", epoch, "task state needs a full refresh");
				}
				seen_epoch = epoch;
			}
			ConnectionStatus::Disconnected if manager.connection_lost() => {
				let state = manager.reconnect_state();
				info!(
					event = "connection_lost",
					attempts = state.attempts,
					next_delay_ms = state.last_delay.map(|delay| delay.as_millis() as u64)
				);
			}
			other => debug!(event = "connection_status", status = %other),
		}
	}
}

fn subscribe_logging(registry: &TaskRegistry) {
	registry.on_progress(|progress| {
		debug!(
			event = "task_progress",
			task_id = %progress.id,
			stage = progress.stage.as_ref().map(|stage| stage.as_str()),
			percentage = progress.percentage
		);
	});
	registry.on_refresh(|signal| {
		info!(event = "refresh_requested", task_id = %signal.id);
	});
	registry.on_stage(|stage| {
		debug!(
			event = "task_stage",
			task_id = %stage.id,
			kind = %stage.kind,
			action = %stage.action
		);
	});
	registry.on_installing(|progress| {
		info!(
			event = "dependency_installing",
			id = %progress.id,
			stage = progress.stage.as_ref().map(|stage| stage.as_str())
		);
	});
	registry.on_cookie_sync(|sync| {
		info!(
			event = "cookie_sync",
			status = ?sync.status,
			browsers = sync.browsers.len(),
			done = sync.done
		);
	});
	registry.on_analysis(|analysis| {
		debug!(
			event = "task_analysis",
			task_id = %analysis.id,
			step = %analysis.step,
			action = %analysis.action
		);
	});
	registry.on_subtitle_progress(|progress| {
		debug!(
			event = "subtitle_progress",
			task_id = %progress.id,
			status = progress.status.as_deref(),
			progress = progress.progress
		);
	});
}

fn load_config<F>(args: &Args, lookup: F) -> RuntimeConfig
where
	F: Fn(&str) -> Option<String>,
{
	let file = match resolve_config_path(&args.config, &lookup) {
		Some(path) => match read_config_file(&path) {
			Ok(file) => file,
			Err(err) => {
				eprintln!("config_error: {}: {err}", path.display());
				FileConfig::default()
			}
		},
		None => FileConfig::default(),
	};
	let mut link = file.link;
	link.endpoint = resolve_value(&args.endpoint, "DC_ENDPOINT", &lookup, link.endpoint);
	link.client_id = resolve_value(&args.client_id, "DC_CLIENT_ID", &lookup, link.client_id);
	if let Some(secs) = resolve_heartbeat_secs(args.heartbeat_interval, &lookup) {
		link.heartbeat_interval = Duration::from_secs(secs);
	}
	let log_dir = resolve_value(
		&args.log_dir,
		"DC_LOG_DIR",
		&lookup,
		file.log_dir.unwrap_or_else(|| ".dreamcreator/logs".to_string()),
	);
	let log_stdout = resolve_bool("DC_LOG_STDOUT", &lookup).or(file.log_stdout).unwrap_or(true);
	RuntimeConfig {
		link,
		log_dir,
		log_stdout,
		debug: args.debug,
	}
}

fn resolve_config_path<F>(flag: &str, lookup: &F) -> Option<PathBuf>
where
	F: Fn(&str) -> Option<String>,
{
	if !flag.trim().is_empty() {
		return Some(PathBuf::from(flag));
	}
	lookup("DC_CONFIG_PATH")
		.filter(|value| !value.trim().is_empty())
		.map(PathBuf::from)
}

fn read_config_file(path: &Path) -> io::Result<FileConfig> {
	if !path.exists() {
		return Ok(FileConfig::default());
	}
	let contents = fs::read_to_string(path)?;
	toml::from_str(&contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn resolve_value<F>(flag: &str, key: &str, lookup: &F, fallback: String) -> String
where
	F: Fn(&str) -> Option<String>,
{
	if !flag.trim().is_empty() {
		return flag.to_string();
	}
	match lookup(key) {
		Some(value) if !value.trim().is_empty() => value,
		_ => fallback,
	}
}

fn resolve_heartbeat_secs<F>(flag: u64, lookup: &F) -> Option<u64>
where
	F: Fn(&str) -> Option<String>,
{
	if flag > 0 {
		return Some(flag);
	}
	lookup("DC_HEARTBEAT_SECS")
		.and_then(|value| value.trim().parse::<u64>().ok())
		.filter(|secs| *secs > 0)
}

fn resolve_bool<F>(key: &str, lookup: &F) -> Option<bool>
where
	F: Fn(&str) -> Option<String>,
{
	match lookup(key)?.trim() {
		"1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
		"0" | "false" | "FALSE" | "no" | "NO" => Some(false),
		_ => None,
	}
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
	let level = if config.debug {
		"debug".to_string()
	} else if let Ok(level) = env::var("DC_LOG_LEVEL") {
		level
	} else {
		"info".to_string()
	};
	let filter = if config.debug {
		EnvFilter::new(level)
	} else {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
	};
	let writer = match open_log_file(&config.log_dir, &config.link.client_id) {
		Ok(log_guard) => log_guard,
		Err(err) => {
			eprintln!("log_file_error: {err}");
			LogGuard { file: None }
		}
	};
	let file = writer.file.clone();
	let stdout_enabled = config.log_stdout;
	let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
	let subscriber = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(make_writer)
		.finish();
	if tracing::subscriber::set_global_default(subscriber).is_err() {
		return None;
	}
	Some(writer)
}

impl MultiWriter {
	fn new(file: Option<Arc<StdMutex<fs::File>>>, stdout_enabled: bool) -> Self {
		Self {
			stdout_enabled,
			file,
		}
	}
}

impl Write for MultiWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.stdout_enabled {
			let _ = io::stdout().write_all(buf);
		}
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.write_all(buf);
			}
		}
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		if self.stdout_enabled {
			let _ = io::stdout().flush();
		}
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.flush();
			}
		}
		Ok(())
	}
}

fn open_log_file(log_dir: &str, client_id: &str) -> io::Result<LogGuard> {
	if log_dir.trim().is_empty() {
		return Ok(LogGuard { file: None });
	}
	let dir = PathBuf::from(log_dir);
	fs::create_dir_all(&dir)?;
	let path = dir.join(format!("dc-monitor-{}.log", sanitize_component(client_id)));
	let file = OpenOptions::new().create(true).append(true).open(path)?;
	Ok(LogGuard {
		file: Some(Arc::new(StdMutex::new(file))),
	})
}

fn sanitize_component(input: &str) -> String {
	input
		.chars()
		.map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
		.collect()
}
