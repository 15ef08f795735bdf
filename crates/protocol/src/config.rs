use serde::{Deserialize, Serialize};

/// Top-level controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token signing secret (env `KEY` wins; auto-generated if absent)
    pub key: Option<String>,
    /// Pepper mixed into PIN digests (env `PIN_PEPPER` wins)
    pub pin_pepper: Option<String>,
    /// Session lifetime; sessions renew implicitly on use
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Share-token subscribers re-check link authorization at most this often
    #[serde(default = "default_share_revalidate")]
    pub share_revalidate_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-connection send queue depth; overflow drops the connection
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
    /// Per-frame read deadline on agent/subscriber connections
    #[serde(default = "default_read_deadline")]
    pub read_deadline_secs: u64,
    /// Idle interval after which a heartbeat ping is sent
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Sample timestamps outside this skew are replaced with receive time
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,
    /// Maximum pending speedtest requests per agent
    #[serde(default = "default_speedtest_pending_max")]
    pub speedtest_pending_max: usize,
    /// Speedtest request TTL
    #[serde(default = "default_speedtest_ttl")]
    pub speedtest_ttl_secs: u64,
    /// Background sweep cadence (queue expiry, session expiry)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres DSN (env `DATABASE_URL` wins). Absent = in-memory stores.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a resolved NETINFO public IP may be served from cache
    #[serde(default = "default_netinfo_cache")]
    pub netinfo_cache_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key: None,
            pin_pepper: None,
            session_ttl_secs: default_session_ttl(),
            share_revalidate_secs: default_share_revalidate(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            send_queue_depth: default_send_queue_depth(),
            read_deadline_secs: default_read_deadline(),
            heartbeat_secs: default_heartbeat(),
            clock_skew_secs: default_clock_skew(),
            speedtest_pending_max: default_speedtest_pending_max(),
            speedtest_ttl_secs: default_speedtest_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            netinfo_cache_secs: default_netinfo_cache(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the controller should not
    /// start) or "WARNING:" (advisory).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be non-zero".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            issues.push(
                "ERROR: server.tls_cert and server.tls_key must be set together".to_string(),
            );
        }
        if self.limits.send_queue_depth == 0 {
            issues.push("ERROR: limits.send_queue_depth must be at least 1".to_string());
        }
        if self.limits.read_deadline_secs == 0 {
            issues.push("ERROR: limits.read_deadline_secs must be non-zero".to_string());
        }
        if self.limits.heartbeat_secs >= self.limits.read_deadline_secs {
            issues.push(format!(
                "WARNING: limits.heartbeat_secs ({}) should be well below \
                 limits.read_deadline_secs ({}) or idle agents will be dropped",
                self.limits.heartbeat_secs, self.limits.read_deadline_secs
            ));
        }
        if self.auth.session_ttl_secs < 60 {
            issues.push("WARNING: auth.session_ttl_secs below 60 will churn sessions".to_string());
        }
        if self.limits.speedtest_pending_max == 0 {
            issues.push("ERROR: limits.speedtest_pending_max must be at least 1".to_string());
        }
        if let Some(url) = &self.database.url
            && !url.starts_with("postgres://")
            && !url.starts_with("postgresql://")
        {
            issues.push(format!(
                "ERROR: database.url {url:?} is not a postgres:// DSN"
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_session_ttl() -> u64 {
    86_400
}

fn default_share_revalidate() -> u64 {
    60
}

fn default_send_queue_depth() -> usize {
    64
}

fn default_read_deadline() -> u64 {
    90
}

fn default_heartbeat() -> u64 {
    30
}

fn default_clock_skew() -> i64 {
    600
}

fn default_speedtest_pending_max() -> usize {
    3
}

fn default_speedtest_ttl() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    5
}

fn default_netinfo_cache() -> u64 {
    60
}
