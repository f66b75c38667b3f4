//! Flattened routing configuration, loadable from a `.toml` file or built
//! programmatically, mirroring the option table in spec.md §6 exactly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub total_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub non_retriable_status: Vec<u16>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            total_timeout_ms: 30_000,
            max_retry_attempts: 2,
            non_retriable_status: vec![401, 403],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub rolling_window_ms: u64,
    pub open_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window_ms: 60_000,
            open_timeout_ms: 30_000,
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub max_wait_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { max_wait_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub queue_timeout_ms: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 50,
            queue_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub connection_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 5_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub rolling_window_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { rolling_window_ms: 300_000 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub rpc: RpcConfig,
    pub breaker: BreakerConfig,
    pub bucket: BucketConfig,
    pub bulkhead: BulkheadConfig,
    pub ws: WsConfig,
    pub metrics: MetricsConfig,
    pub health: HealthConfig,
}

impl RoutingConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Reject a config no component could run with — zero/absurd durations
    /// or an empty non-retriable-status list the caller clearly didn't
    /// intend. Grounded on edgelord's `validate_config` pattern of failing
    /// fast at construction rather than letting a misconfigured duration
    /// surface as a confusing runtime hang.
    pub fn validate(&self) -> Result<(), String> {
        if self.rpc.total_timeout_ms == 0 {
            return Err("rpc.total_timeout_ms must be nonzero".to_string());
        }
        if self.breaker.rolling_window_ms == 0 {
            return Err("breaker.rolling_window_ms must be nonzero".to_string());
        }
        if self.breaker.open_timeout_ms == 0 {
            return Err("breaker.open_timeout_ms must be nonzero".to_string());
        }
        if self.breaker.success_threshold == 0 {
            return Err("breaker.success_threshold must be at least 1".to_string());
        }
        if self.bulkhead.max_concurrent == 0 {
            return Err("bulkhead.max_concurrent must be at least 1".to_string());
        }
        if self.ws.max_reconnect_attempts == 0 {
            return Err("ws.max_reconnect_attempts must be at least 1".to_string());
        }
        if self.metrics.rolling_window_ms == 0 {
            return Err("metrics.rolling_window_ms must be nonzero".to_string());
        }
        if self.health.interval_ms == 0 {
            return Err("health.interval_ms must be nonzero".to_string());
        }
        Ok(())
    }

    pub fn to_rpc_fallback_config(&self) -> rpc_fallback::RpcFallbackConfig {
        rpc_fallback::RpcFallbackConfig {
            total_timeout: ms(self.rpc.total_timeout_ms),
            max_retry_attempts: self.rpc.max_retry_attempts,
            non_retriable_status: self.rpc.non_retriable_status.clone(),
            breaker: self.to_breaker_config(),
            bucket_max_wait: self.bucket_max_wait(),
        }
    }

    pub fn to_breaker_config(&self) -> circuit_breaker::BreakerConfig {
        circuit_breaker::BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            volume_threshold: self.breaker.failure_threshold,
            rolling_window: ms(self.breaker.rolling_window_ms),
            open_timeout: ms(self.breaker.open_timeout_ms),
            success_threshold: self.breaker.success_threshold,
        }
    }

    pub fn to_bulkhead_config(&self) -> bulkhead::BulkheadConfig {
        bulkhead::BulkheadConfig {
            max_concurrent: self.bulkhead.max_concurrent,
            max_queue: self.bulkhead.max_queue,
            queue_timeout: ms(self.bulkhead.queue_timeout_ms),
        }
    }

    pub fn to_ws_pool_config(&self) -> ws_pool::WsPoolConfig {
        ws_pool::WsPoolConfig {
            connection_timeout: ms(self.ws.connection_timeout_ms),
            heartbeat_interval: ms(self.ws.heartbeat_interval_ms),
            pong_timeout: ms(self.ws.pong_timeout_ms),
            reconnect_base_delay: ms(self.ws.reconnect_base_delay_ms),
            reconnect_max_delay: ms(self.ws.reconnect_max_delay_ms),
            max_reconnect_attempts: self.ws.max_reconnect_attempts,
        }
    }

    pub fn to_health_monitor_config(&self) -> health_monitor::HealthMonitorConfig {
        health_monitor::HealthMonitorConfig {
            check_interval: ms(self.health.interval_ms),
        }
    }

    pub fn metrics_window(&self) -> Duration {
        ms(self.metrics.rolling_window_ms)
    }

    pub fn bucket_max_wait(&self) -> Duration {
        ms(self.bucket.max_wait_ms)
    }
}
