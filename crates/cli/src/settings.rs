//! Settings loading for the relay binary.
//!
//! Sources, later ones winning:
//!
//! 1. a JSON settings file: the path in `EVENT_RELAY_SETTINGS`, or
//!    `appsettings.json` in the working directory when it exists;
//! 2. environment variables named `Section__Key`, e.g.
//!    `ServiceSettings__CacheTimeout=30`.
//!
//! File keys use the PascalCase names below; environment variable names are
//! matched case-insensitively.
//!
//! ```json
//! {
//!   "ServiceSettings": {
//!     "CacheTimeout": 30,
//!     "EventStoreServerId": "8f5a0a52-3c0e-4cf4-9d0f-5d3c1c8f2b11",
//!     "CatchupPollInterval": 60
//!   },
//!   "EventStoreSettings": {
//!     "ConnectionString": "memory://",
//!     "ConnectionName": "event-relay",
//!     "HttpPort": 2113
//!   },
//!   "ConfigurationFile": "relay-configuration.json"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use relay::{EventStoreServerId, EventStoreSettings, ServiceSettings, DEFAULT_CATCHUP_POLL_INTERVAL};
use serde::Deserialize;
use uuid::Uuid;

pub const SETTINGS_FILE_ENV: &str = "EVENT_RELAY_SETTINGS";
pub const DEFAULT_SETTINGS_FILE: &str = "appsettings.json";

const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECTION_NAME: &str = "event-relay";
const DEFAULT_HTTP_PORT: u16 = 2113;

const CACHE_TIMEOUT: &str = "ServiceSettings:CacheTimeout";
const EVENT_STORE_SERVER_ID: &str = "ServiceSettings:EventStoreServerId";
const SUBSCRIPTION_SERVICE_ID: &str = "ServiceSettings:SubscriptionServiceId";
const CATCHUP_POLL_INTERVAL: &str = "ServiceSettings:CatchupPollInterval";
const CONNECTION_STRING: &str = "EventStoreSettings:ConnectionString";
const HTTP_PORT: &str = "EventStoreSettings:HttpPort";

/// Everything the binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub service: ServiceSettings,
    pub event_store: EventStoreSettings,
    /// JSON file holding subscription configuration; in-memory when absent.
    pub configuration_file: Option<PathBuf>,
}

/// The settings file as written, before defaults and validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SettingsFile {
    service_settings: ServiceSection,
    event_store_settings: EventStoreSection,
    configuration_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ServiceSection {
    cache_timeout: Option<u64>,
    event_store_server_id: Option<String>,
    subscription_service_id: Option<String>,
    catchup_poll_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct EventStoreSection {
    connection_string: Option<String>,
    connection_name: Option<String>,
    http_port: Option<u16>,
}

impl SettingsFile {
    /// Applies one `Section__Key` environment variable. Unknown names are
    /// ignored.
    fn apply_override(&mut self, name: &str, value: String) -> anyhow::Result<()> {
        let name = name.to_ascii_lowercase();
        let Some((section, key)) = name.split_once("__") else {
            return Ok(());
        };
        let service = &mut self.service_settings;
        let store = &mut self.event_store_settings;
        match (section, key) {
            ("servicesettings", "cachetimeout") => {
                service.cache_timeout = Some(parse_number(CACHE_TIMEOUT, &value)?);
            }
            ("servicesettings", "eventstoreserverid") => service.event_store_server_id = Some(value),
            ("servicesettings", "subscriptionserviceid") => service.subscription_service_id = Some(value),
            ("servicesettings", "catchuppollinterval") => {
                service.catchup_poll_interval = Some(parse_number(CATCHUP_POLL_INTERVAL, &value)?);
            }
            ("eventstoresettings", "connectionstring") => store.connection_string = Some(value),
            ("eventstoresettings", "connectionname") => store.connection_name = Some(value),
            ("eventstoresettings", "httpport") => {
                let port = value
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("{HTTP_PORT} must be a port number, got [{value}]"))?;
                store.http_port = Some(port);
            }
            _ => {}
        }
        Ok(())
    }
}

impl RelaySettings {
    /// Loads from the settings file and the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var_os(SETTINGS_FILE_ENV).map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));

        let json = match std::fs::read_to_string(&path) {
            Ok(json) => Some(json),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("reading settings file {}", path.display()))
            }
        };

        Self::from_sources(json.as_deref(), std::env::vars())
            .with_context(|| format!("loading settings ({})", path.display()))
    }

    /// Builds settings from optional settings-file JSON and environment
    /// variables.
    pub fn from_sources<I>(json: Option<&str>, vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut file = match json {
            Some(json) => serde_json::from_str::<SettingsFile>(json).context("settings file is not valid")?,
            None => SettingsFile::default(),
        };
        for (name, value) in vars {
            file.apply_override(&name, value)?;
        }
        Self::validate(file)
    }

    fn validate(file: SettingsFile) -> anyhow::Result<Self> {
        let SettingsFile {
            service_settings: service,
            event_store_settings: store,
            configuration_file,
        } = file;

        let cache_timeout = match service.cache_timeout {
            Some(seconds) => positive_seconds(CACHE_TIMEOUT, seconds)?,
            None => Duration::from_secs(DEFAULT_CACHE_TIMEOUT_SECS),
        };
        let catchup_poll_interval = match service.catchup_poll_interval {
            Some(seconds) => positive_seconds(CATCHUP_POLL_INTERVAL, seconds)?,
            None => DEFAULT_CATCHUP_POLL_INTERVAL,
        };

        let (key, raw_id) = match (
            non_blank(service.event_store_server_id.as_deref()),
            non_blank(service.subscription_service_id.as_deref()),
        ) {
            (Some(raw), _) => (EVENT_STORE_SERVER_ID, raw),
            (None, Some(raw)) => (SUBSCRIPTION_SERVICE_ID, raw),
            (None, None) => bail!("{EVENT_STORE_SERVER_ID} (or {SUBSCRIPTION_SERVICE_ID}) is required"),
        };
        let server_id = Uuid::parse_str(raw_id).with_context(|| format!("{key} must be a UUID, got [{raw_id}]"))?;
        if server_id.is_nil() {
            bail!("{key} must not be the empty UUID");
        }

        let Some(connection_string) = non_blank(store.connection_string.as_deref()) else {
            bail!("{CONNECTION_STRING} is required");
        };
        let connection_name = non_blank(store.connection_name.as_deref()).unwrap_or(DEFAULT_CONNECTION_NAME);

        Ok(Self {
            service: ServiceSettings::new(cache_timeout, EventStoreServerId::from_uuid(server_id))
                .with_catchup_poll_interval(catchup_poll_interval),
            event_store: EventStoreSettings {
                connection_string: connection_string.to_string(),
                connection_name: connection_name.to_string(),
                http_port: store.http_port.unwrap_or(DEFAULT_HTTP_PORT),
            },
            configuration_file: configuration_file.filter(|p| !p.as_os_str().is_empty()),
        })
    }

    pub fn configuration_file(&self) -> Option<&Path> {
        self.configuration_file.as_deref()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_number(key: &str, raw: &str) -> anyhow::Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got [{raw}]"))
}

fn positive_seconds(key: &str, seconds: u64) -> anyhow::Result<Duration> {
    if seconds == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_secs(seconds))
}
