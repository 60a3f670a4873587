//! Broker settings parsed from environment variables

use crate::amqp_transport::AmqpConnector;
use crate::inmemory_broker::InMemoryBroker;
use crate::transport::Connector;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which transport the process talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    InMemory,
    Amqp,
}

impl FromStr for BusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inmemory" => Ok(BusType::InMemory),
            "amqp" | "rabbitmq" => Ok(BusType::Amqp),
            other => Err(format!("must be 'inmemory' or 'amqp', got '{}'", other)),
        }
    }
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub bus_type: BusType,
    /// Full URI; takes precedence over the individual parts below
    pub amqp_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    pub connection_timeout: Duration,
    /// Default for [`RpcClient::call`](crate::RpcClient::call) when no timeout is given
    pub rpc_timeout: Duration,
    pub prefetch_count: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bus_type: BusType::InMemory,
            amqp_url: None,
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat_secs: 600,
            connection_timeout: Duration::from_secs(300),
            rpc_timeout: Duration::from_secs(30),
            prefetch_count: 1,
        }
    }
}

fn parse<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
        value,
    })
}

impl BrokerConfig {
    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bus_type = match lookup("BUS_TYPE") {
            Some(value) => parse("BUS_TYPE", value)?,
            None => defaults.bus_type,
        };
        let port = match lookup("RABBITMQ_PORT") {
            Some(value) => parse("RABBITMQ_PORT", value)?,
            None => defaults.port,
        };
        let heartbeat_secs = match lookup("RABBITMQ_HEARTBEAT_SECS") {
            Some(value) => parse("RABBITMQ_HEARTBEAT_SECS", value)?,
            None => defaults.heartbeat_secs,
        };
        let connection_timeout = match lookup("RABBITMQ_CONNECTION_TIMEOUT_SECS") {
            Some(value) => Duration::from_secs(parse("RABBITMQ_CONNECTION_TIMEOUT_SECS", value)?),
            None => defaults.connection_timeout,
        };
        let rpc_timeout = match lookup("RPC_TIMEOUT_SECS") {
            Some(value) => Duration::from_secs(parse("RPC_TIMEOUT_SECS", value)?),
            None => defaults.rpc_timeout,
        };
        let prefetch_count = match lookup("PREFETCH_COUNT") {
            Some(value) => parse("PREFETCH_COUNT", value)?,
            None => defaults.prefetch_count,
        };

        Ok(Self {
            bus_type,
            amqp_url: lookup("AMQP_URL").filter(|url| !url.is_empty()),
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port,
            username: lookup("RABBITMQ_USERNAME").unwrap_or(defaults.username),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            heartbeat_secs,
            connection_timeout,
            rpc_timeout,
            prefetch_count,
        })
    }

    /// Connection URI, with credentials and vhost percent-encoded
    pub fn amqp_uri(&self) -> String {
        if let Some(url) = &self.amqp_url {
            return url.clone();
        }
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs
        )
    }

    /// Transport selected by `bus_type`
    ///
    /// Each call to the in-memory variant creates a fresh, empty server.
    pub fn connector(&self) -> Arc<dyn Connector> {
        match self.bus_type {
            BusType::InMemory => Arc::new(InMemoryBroker::new()),
            BusType::Amqp => Arc::new(
                AmqpConnector::new(self.amqp_uri()).with_connect_timeout(self.connection_timeout),
            ),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("bus_type", &self.bus_type)
            .field("amqp_url", &self.amqp_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("connection_timeout", &self.connection_timeout)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("prefetch_count", &self.prefetch_count)
            .finish()
    }
}
