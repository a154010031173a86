extern crate config as _;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{Role, SessionPolicy, SessionSettings};
use crate::utils::WorkerPoolConfig;

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// which side of the protocol this node plays
    pub role: Role,
    /// peers a client node opens sessions to at startup, as `ip:port`
    pub peers: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            role: Role::Server,
            peers: Vec::new(),
        }
    }
}

impl GeneralConfig {
    pub fn peer_addresses(&self) -> AppResult<Vec<SocketAddr>> {
        self.peers
            .iter()
            .map(|peer| {
                peer.parse::<SocketAddr>()
                    .map_err(|e| AppError::InvalidValue(format!("peer address {}: {}", peer, e)))
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub max_package_size: usize,
    pub read_buffer_size: usize,
    /// consecutive readable wake-ups without data before a connection is dropped
    pub max_empty_reads: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 4189,
            max_connection: 1024,
            max_package_size: u16::MAX as usize,
            read_buffer_size: 2000,
            max_empty_reads: 2,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Timer durations are in seconds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout: u64,
    pub open_wait: u64,
    pub keep_wait: u64,
    pub max_connect_retries: u32,

    /// the keepalive interval this node proposes in its OPEN
    pub keepalive: u8,
    /// the dead timer this node proposes in its OPEN
    pub dead_timer: u8,

    pub min_keepalive: u8,
    pub max_keepalive: u8,
    pub min_dead_timer: u8,
    pub max_dead_timer: u8,
    pub allow_negotiation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout: 60,
            open_wait: 60,
            keep_wait: 60,
            max_connect_retries: 5,
            keepalive: 30,
            dead_timer: 120,
            min_keepalive: 1,
            max_keepalive: 255,
            min_dead_timer: 4,
            max_dead_timer: 255,
            allow_negotiation: true,
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            open_wait: Duration::from_secs(self.open_wait),
            keep_wait: Duration::from_secs(self.keep_wait),
            max_connect_retries: self.max_connect_retries,
            keepalive: self.keepalive,
            dead_timer: self.dead_timer,
            policy: SessionPolicy {
                keepalive: self.min_keepalive..=self.max_keepalive,
                dead_timer: self.min_dead_timer..=self.max_dead_timer,
                allow_negotiation: self.allow_negotiation,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionWorkerPool {
    pub channel_capacity: usize,
    /// 0 means one channel per cpu
    pub num_channels: usize,
    /// milliseconds
    pub monitor_interval: u64,
    /// milliseconds
    pub worker_check_timeout: u64,
}

impl Default for SessionWorkerPool {
    fn default() -> Self {
        SessionWorkerPool {
            channel_capacity: 1024,
            num_channels: 0,
            monitor_interval: 5000,
            worker_check_timeout: 200,
        }
    }
}

impl SessionWorkerPool {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        let num_channels = if self.num_channels == 0 {
            num_cpus::get()
        } else {
            self.num_channels
        };
        WorkerPoolConfig {
            channel_capacity: self.channel_capacity,
            num_channels,
            monitor_interval: Duration::from_millis(self.monitor_interval),
            worker_check_timeout: Duration::from_millis(self.worker_check_timeout),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PceeConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub session_worker_pool: SessionWorkerPool,
}

impl PceeConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<PceeConfig> {
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

        let pcee_config: PceeConfig = config.try_deserialize()?;
        pcee_config.validate()?;

        Ok(pcee_config)
    }

    fn validate(&self) -> AppResult<()> {
        let session = &self.session;
        if session.min_keepalive > session.max_keepalive {
            return Err(AppError::InvalidValue(format!(
                "min_keepalive {} is greater than max_keepalive {}",
                session.min_keepalive, session.max_keepalive
            )));
        }
        if session.min_dead_timer > session.max_dead_timer {
            return Err(AppError::InvalidValue(format!(
                "min_dead_timer {} is greater than max_dead_timer {}",
                session.min_dead_timer, session.max_dead_timer
            )));
        }
        if self.network.max_package_size > u16::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "max_package_size {} can not be represented in a message header",
                self.network.max_package_size
            )));
        }
        if self.network.read_buffer_size == 0 {
            return Err(AppError::InvalidValue("read_buffer_size must be positive".into()));
        }
        if self.network.max_empty_reads == 0 {
            return Err(AppError::InvalidValue("max_empty_reads must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_config_file_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[general]
role = "client"
peers = ["127.0.0.1:4189"]

[network]
port = 14189

[session]
keepalive = 20
dead_timer = 80
"#
        )
        .unwrap();

        let config = PceeConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.general.role, Role::Client);
        assert_eq!(
            config.general.peer_addresses().unwrap(),
            vec!["127.0.0.1:4189".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(config.network.port, 14189);
        assert_eq!(config.network.read_buffer_size, 2000);
        assert_eq!(config.session.keepalive, 20);
        assert_eq!(config.session.max_connect_retries, 5);

        let settings = config.session.settings();
        assert_eq!(settings.open_wait, Duration::from_secs(60));
        assert!(settings.policy.keepalive.contains(&20));
    }

    #[test]
    fn reject_inverted_policy_bounds() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[session]
min_keepalive = 40
max_keepalive = 10
"#
        )
        .unwrap();

        assert!(matches!(
            PceeConfig::set_up_config(file.path()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn reject_zero_empty_reads() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[network]
max_empty_reads = 0
"#
        )
        .unwrap();

        assert!(matches!(
            PceeConfig::set_up_config(file.path()),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn reject_bad_peer_address() {
        let general = GeneralConfig {
            role: Role::Client,
            peers: vec!["not-an-address".to_string()],
        };
        assert!(general.peer_addresses().is_err());
    }

    #[test]
    fn zero_channels_means_cpu_count() {
        let pool = SessionWorkerPool::default().pool_config();
        assert_eq!(pool.num_channels, num_cpus::get());
    }
}
