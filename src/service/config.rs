// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// pending connections the OS may queue before `accept`
    pub backlog: u32,
    pub max_connection: usize,
    /// size of the scratch buffer each socket read lands in
    pub conn_read_buffer_size: usize,
    pub max_frame_size: usize,
    pub admission_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9527,
            backlog: 1024,
            max_connection: 1024,
            conn_read_buffer_size: 4 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            admission_timeout_ms: 2000,
            connect_timeout_ms: 5000,
            reply_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> AppResult<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|e| AppError::InvalidValue(format!("listen address: {}", e)))
    }
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestHandlerPool {
    pub channel_capacity: usize,
    pub num_channels: usize,
    /// handlers allowed to run at the same time across all sessions
    pub max_concurrent_handlers: usize,
    pub monitor_interval: u64,
    pub worker_check_timeout: u64,
}

impl Default for RequestHandlerPool {
    fn default() -> Self {
        RequestHandlerPool {
            channel_capacity: 1024,
            num_channels: num_cpus::get(),
            max_concurrent_handlers: 256,
            monitor_interval: 5,
            worker_check_timeout: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolLimits {
    pub min: usize,
    pub max: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        PoolLimits { min: 16, max: 1024 }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub session: PoolLimits,
    pub receive_buffer: PoolLimits,
    pub io_context: PoolLimits,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    /// no keypair, handshakes are answered with failure
    #[default]
    Disabled,
    /// handshakes are answered, clients negotiate on request
    Offered,
    /// clients negotiate on connect, servers refuse plaintext data
    Required,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub mode: EncryptionMode,
    pub rsa_key_bits: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            mode: EncryptionMode::Disabled,
            rsa_key_bits: 2048,
        }
    }
}

/// Every knob is read once when the transport is built and never changes afterwards.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub network: NetworkConfig,
    pub request_handler_pool: RequestHandlerPool,
    pub pools: PoolsConfig,
    pub encryption: EncryptionConfig,
}

impl TransportConfig {
    /// Loads the file at `path`, then applies `STONEWIRE__SECTION__KEY` environment overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("STONEWIRE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let transport_config: TransportConfig = config.try_deserialize()?;
        transport_config.validate()?;
        Ok(transport_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be positive".into(),
            ));
        }
        if self.network.conn_read_buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "network.conn_read_buffer_size must be positive".into(),
            ));
        }
        if self.request_handler_pool.num_channels == 0
            || self.request_handler_pool.max_concurrent_handlers == 0
        {
            return Err(AppError::InvalidValue(
                "request_handler_pool needs at least one worker and one handler slot".into(),
            ));
        }
        for (name, limits) in [
            ("session", self.pools.session),
            ("receive_buffer", self.pools.receive_buffer),
            ("io_context", self.pools.io_context),
        ] {
            if limits.min > limits.max {
                return Err(AppError::InvalidValue(format!(
                    "pools.{}: min {} exceeds max {}",
                    name, limits.min, limits.max
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.encryption.mode, EncryptionMode::Disabled);
        assert_eq!(config.network.admission_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn load_partial_toml_keeps_defaults() -> AppResult<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
[network]
port = 7001
max_connection = 3

[encryption]
mode = "required"
rsa_key_bits = 1024
"#
        )?;
        let config = TransportConfig::set_up_config(file.path())?;
        assert_eq!(config.network.port, 7001);
        assert_eq!(config.network.max_connection, 3);
        assert_eq!(config.network.backlog, NetworkConfig::default().backlog);
        assert_eq!(config.encryption.mode, EncryptionMode::Required);
        assert_eq!(config.encryption.rsa_key_bits, 1024);
        Ok(())
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut config = TransportConfig::default();
        config.pools.session = PoolLimits { min: 10, max: 2 };
        assert!(matches!(config.validate(), Err(AppError::InvalidValue(_))));
    }
}
