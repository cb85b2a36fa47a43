pub mod models {
    pub mod device;
    pub mod telemetry;
}

pub mod config;
pub mod db {
    pub mod models;
}
pub mod device;
pub mod gate;
pub mod notify;
pub mod providers;
pub mod schema;
pub mod store;
pub mod utils;
pub mod services {
    pub mod aggregate;
    pub mod alerts;
    pub mod errors;
    pub mod interactive;
    pub mod poller;
    pub mod registry;
    pub mod samples;
    pub mod timesync;
}
#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::device::serial::SerialDevice;
use crate::gate::{DeviceGate, LinkLock};
use crate::notify::mail::MailScript;
use crate::notify::mqtt::MqttPublisher;
use crate::notify::{Dispatcher, LogBroadcaster};
use crate::providers::ScriptSensor;
use crate::services::alerts::AlertEngine;
use crate::services::interactive::{self, RequestError};
use crate::services::poller::{PollSettings, Poller};
use crate::services::registry::Registry;
use crate::store::Store;
use crate::store::pg::PgStore;
use chrono::Local;
use diesel::PgConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

/// What the process does after startup; everything but `Daemon` is a one-shot request.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Daemon,
    ReadParameter(i32),
    WriteParameter(i32, String),
    RefreshMenu,
    AlertTest(i64),
}

impl Command {
    /// Only the daemon forwards readings to the MQTT broker.
    fn publishes(&self) -> bool {
        matches!(self, Command::Daemon)
    }
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn run(command: Command) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (tty={}, interval={}s, state_check_interval={}s, aggregate_history_days={}, tsync_enabled={}, mail_enabled={}, mqtt={})",
        cfg.tty_device,
        cfg.interval.as_secs(),
        cfg.state_check_interval.as_secs(),
        cfg.aggregate_history_days,
        cfg.tsync_enabled,
        cfg.mail.enabled,
        if cfg.mqtt.url.is_empty() { "-" } else { cfg.mqtt.url.as_str() }
    );

    // 2) Connect DB
    let mut store = PgStore::new(&cfg.database_url);
    store.connect().map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(store.connection().map_err(|e| e.to_string())?)?;

    // 4) Open the serial link; the poll loop keeps retrying if this fails
    // Other processes on the same tty take turns through the lock file
    let link_lock = LinkLock::for_device(&cfg.lock_dir, &cfg.tty_device);
    info!("Serial link lock {}", link_lock.path().display());
    let gate = Arc::new(DeviceGate::with_link_lock(
        SerialDevice::new(cfg.tty_device.as_str(), cfg.tty_baud_rate, cfg.tty_timeout),
        link_lock,
    ));
    if let Err(e) = gate.reopen() {
        warn!("Opening {} failed: {}", cfg.tty_device, e);
    }

    // 5) Notification paths
    let mqtt = if command.publishes() { MqttPublisher::connect(&cfg.mqtt)? } else { None };
    let mut dispatcher = Dispatcher::new(MailScript::from_config(&cfg.mail), mqtt);
    dispatcher.add_broadcaster(Box::new(LogBroadcaster));
    if cfg.mail.enabled && !cfg.mail.state_mail_to.is_empty() {
        info!("Mail at states {:?} to '{}'", cfg.mail.state_mail_states, cfg.mail.state_mail_to);
    }
    if cfg.mail.enabled && !cfg.mail.error_mail_to.is_empty() {
        info!("Mail at errors to '{}'", cfg.mail.error_mail_to);
    }

    let request_failed = |e: RequestError| format!("request failed: {}", e);
    match command {
        Command::ReadParameter(address) => {
            let p = interactive::refresh_menu_value(&*gate, &mut store, address).map_err(request_failed)?;
            println!(
                "0x{:x} = {}{} (min {}, max {}, default {})",
                p.address,
                p.value,
                p.unit,
                p.min.as_deref().unwrap_or("-"),
                p.max.as_deref().unwrap_or("-"),
                p.default.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Command::WriteParameter(address, value) => {
            let p = interactive::write_parameter(&*gate, &mut store, address, &value).map_err(request_failed)?;
            println!("0x{:x} = {}{}", p.address, p.value, p.unit);
            Ok(())
        }
        Command::RefreshMenu => {
            let mut registry = Registry::load(&mut store).map_err(|e| e.to_string())?;
            interactive::init_menu::<_, _, RequestError>(&*gate, &mut store, &mut registry).map_err(request_failed)?;
            interactive::update_time_ranges::<_, _, RequestError>(&*gate, &mut store).map_err(request_failed)?;
            Ok(())
        }
        Command::AlertTest(rule_id) => {
            let registry = Registry::load(&mut store).map_err(|e| e.to_string())?;
            let engine = AlertEngine::new(cfg.web_url.as_str(), cfg.interval);
            let evaluation = interactive::alert_test(&mut store, &registry, &mut dispatcher, &engine, rule_id)
                .map_err(request_failed)?;
            println!(
                "rule {}: verdict={}, mailed={}, {} check(s) fired",
                rule_id,
                evaluation.verdict,
                evaluation.notify,
                evaluation.hits.len()
            );
            Ok(())
        }
        Command::Daemon => {
            // 6) Cooperative shutdown on SIGINT/SIGTERM
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
                .map_err(|e| format!("installing signal handler failed: {}", e))?;

            // 7) Poll loop
            let mut poller = Poller::new(store, gate, dispatcher, PollSettings::from_config(&cfg), &Local::now());
            if let Some(script) = cfg.sensor_script.as_deref() {
                info!("Using sensor script {}", script);
                poller.add_provider(Box::new(ScriptSensor::new(script)));
            }
            poller.run_loop(&shutdown);
            Ok(())
        }
    }
}

fn parse_address(raw: &str) -> Result<i32, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => i32::from_str_radix(hex, 16),
        None => raw.parse::<i32>(),
    };
    parsed.map_err(|_| format!("invalid address: {}", raw))
}

fn parse_command(words: &[String]) -> Result<Command, String> {
    let arg = |n: usize| {
        words
            .get(n)
            .map(String::as_str)
            .ok_or_else(|| format!("`{}` is missing an argument", words[0]))
    };
    let command = match words.first().map(String::as_str) {
        None => Command::Daemon,
        Some("read-parameter") => Command::ReadParameter(parse_address(arg(1)?)?),
        Some("write-parameter") => Command::WriteParameter(parse_address(arg(1)?)?, arg(2)?.to_string()),
        Some("refresh-menu") => Command::RefreshMenu,
        Some("alert-test") => {
            let id = arg(1)?;
            Command::AlertTest(id.parse().map_err(|_| format!("invalid rule id: {}", id))?)
        }
        Some(other) => return Err(format!("unrecognised command: {}", other)),
    };
    Ok(command)
}

fn configure_env_from_cli() -> Result<(Option<LoadedEnvFile>, Command), String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    let mut words: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                env_file = Some(PathBuf::from(path_str));
            }
            Some("--") => break,
            Some(s) if s.starts_with("--") => return Err(format!("unrecognised argument: {}", s)),
            Some(word) => words.push(word.to_string()),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }
    let command = parse_command(&words)?;

    let loaded = if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Some(LoadedEnvFile { path, explicit: true })
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Some(LoadedEnvFile {
                path: default_path,
                explicit: false,
            })
        } else {
            None
        }
    };
    Ok((loaded, command))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // Preserve any value that was already supplied via the process environment.
                if std::env::var_os(&key).is_none() {
                    // Updating process-level environment variables is unsafe on some targets.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(format!("{}:{}: {}", path.display(), index + 1, e));
            }
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let without_export = trimmed
        .strip_prefix("export ")
        .map(|s| s.trim_start())
        .unwrap_or(trimmed);

    let mut parts = without_export.splitn(2, '=');
    let key = parts
        .next()
        .map(str::trim)
        .ok_or_else(|| "missing environment variable name".to_string())?;
    let value_part = parts.next().ok_or_else(|| "missing '=' in assignment".to_string())?;

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let value = parse_env_value(value_part)?;
    Ok(Some((key.to_string(), value)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_double_quoted(rest)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_single_quoted(rest)
    } else {
        let value = trimmed.splitn(2, '#').next().unwrap_or_default().trim_end();
        Ok(value.to_string())
    }
}

fn parse_double_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            let value = match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                '\\' => '\\',
                '"' => '"',
                other => other,
            };
            result.push(value);
            escape = false;
            continue;
        }

        match ch {
            '\\' => escape = true,
            '"' => {
                let remainder = chars.as_str().trim();
                if remainder.is_empty() || remainder.starts_with('#') {
                    return Ok(result);
                } else {
                    return Err("unexpected characters after closing double quote".to_string());
                }
            }
            other => result.push(other),
        }
    }

    if escape {
        Err("unterminated escape sequence in double-quoted value".to_string())
    } else {
        Err("unterminated double-quoted value".to_string())
    }
}

fn parse_single_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch == '\'' {
            let remainder = chars.as_str().trim();
            if remainder.is_empty() || remainder.starts_with('#') {
                return Ok(result);
            } else {
                return Err("unexpected characters after closing single quote".to_string());
            }
        } else {
            result.push(ch);
        }
    }

    Err("unterminated single-quoted value".to_string())
}

fn main() {
    let (loaded_env, command) = match configure_env_from_cli() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "pellet-telemetry {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
