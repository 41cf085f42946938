use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// The kind of buffer a pool hands out.
///
/// Both kinds allocate from the heap here; the knob exists so deployment
/// configuration written for runtimes that pin "direct" buffers keeps
/// deserializing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferType {
    #[default]
    Direct,
    Heap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Candidate listen addresses, tried in order until one binds.
    pub listen_addresses: Vec<String>,
    pub listen_backlog: u32,
    /// Maximum decoded length of an incoming message; 0 means unlimited.
    pub max_incoming_message_size: usize,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub linger_secs: Option<u64>,
    /// Remote addresses allowed to connect; empty means all hosts.
    pub authorized_hosts: Vec<IpAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listen_addresses: vec!["127.0.0.1:9099".to_string()],
            listen_backlog: 128,
            max_incoming_message_size: 0,
            keep_alive: true,
            no_delay: true,
            linger_secs: None,
            authorized_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// The size (in bytes) of each pooled buffer.
    pub buffer_size: usize,
    pub buffer_type: BufferType,
    /// Steady-state ceiling on pooled buffers; 0 means unbounded.
    pub capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_size: 2048,
            buffer_type: BufferType::Direct,
            capacity: 0,
        }
    }
}

/// Thresholds for the runaway-connection ("suspect") protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspectConfig {
    pub enabled: bool,
    /// Backlog at which a connection becomes a suspect candidate.
    pub suspect_bytes: u64,
    pub suspect_messages: u64,
    /// Backlog a suspect must fall below to be cleared.
    pub nominal_bytes: u64,
    pub nominal_messages: u64,
    /// Backlog at which a suspect is killed outright.
    pub limit_bytes: u64,
    pub limit_messages: u64,
}

impl Default for SuspectConfig {
    fn default() -> Self {
        SuspectConfig {
            enabled: true,
            suspect_bytes: 10_000_000,
            suspect_messages: 10_000,
            nominal_bytes: 2_000_000,
            nominal_messages: 2_000,
            limit_bytes: 100_000_000,
            limit_messages: 60_000,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    pub network: NetworkConfig,
    pub incoming_pool: BufferPoolConfig,
    pub outgoing_pool: BufferPoolConfig,
    pub suspect: SuspectConfig,
}

impl AcceptorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<AcceptorConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let acceptor_config: AcceptorConfig = config.try_deserialize()?;
        acceptor_config.validate()?;
        Ok(acceptor_config)
    }

    /// Validate settings that cannot be checked by deserialization alone.
    pub fn validate(&self) -> AppResult<()> {
        if self.network.listen_addresses.is_empty() {
            return Err(AppError::InvalidValue(
                "network.listen_addresses must name at least one address".into(),
            ));
        }
        for (name, pool) in [
            ("incoming_pool", &self.incoming_pool),
            ("outgoing_pool", &self.outgoing_pool),
        ] {
            if pool.buffer_size == 0 {
                return Err(AppError::InvalidValue(format!(
                    "{}.buffer_size must be greater than zero",
                    name
                )));
            }
        }
        if self.suspect.enabled {
            if self.suspect.nominal_bytes > self.suspect.suspect_bytes
                || self.suspect.suspect_bytes > self.suspect.limit_bytes
            {
                return Err(AppError::InvalidValue(
                    "suspect byte thresholds must satisfy nominal <= suspect <= limit".into(),
                ));
            }
            if self.suspect.nominal_messages > self.suspect.suspect_messages
                || self.suspect.suspect_messages > self.suspect.limit_messages
            {
                return Err(AppError::InvalidValue(
                    "suspect message thresholds must satisfy nominal <= suspect <= limit".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AcceptorConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let mut config = AcceptorConfig::default();
        config.incoming_pool.buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn inverted_suspect_thresholds_are_rejected() {
        let mut config = AcceptorConfig::default();
        config.suspect.nominal_bytes = config.suspect.limit_bytes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_listen_addresses_are_rejected() {
        let mut config = AcceptorConfig::default();
        config.network.listen_addresses.clear();
        assert!(config.validate().is_err());
    }
}
