/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Process-wide configuration, loaded once and shared via a `OnceLock`.
//!
//! Mirrors the teacher's `common::setting` module: a YAML/TOML/JSON file is
//! read through the `config` crate, falling back to hardcoded defaults when
//! the file is absent or malformed, so a bare `cargo run` works out of the
//! box on a developer machine.

use serde::Deserialize;
use std::sync::OnceLock;

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Tunables for the instance lifecycle core. Field names match the
/// timeout/limit constants named throughout `spec.md` §5/§7.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cluster_id: String,
    pub node_id: String,
    pub grpc_listen_addr: String,
    pub meta_store_addr: String,
    pub abnormal_poll_interval_ms: u64,

    pub runtime_heartbeat_timeout_ms: u64,
    pub runtime_max_heartbeat_timeout_times: u32,
    pub runtime_init_call_timeout_ms: u64,
    pub runtime_shutdown_timeout_seconds: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub wait_status_code_update_ms: u64,

    pub max_instance_redeploy_times: u32,
    pub min_deploy_interval_ms: u64,
    pub max_deploy_interval_ms: u64,
    pub max_instance_reconnect_times: u32,
    pub max_schedule_times: u32,

    /// Default `RecoverRetryTimeoutMs` when a create request's
    /// `create_options` doesn't override it (`spec.md` §9 Open Question,
    /// Decision D2 in DESIGN.md).
    pub recover_retry_timeout_default_ms: u64,

    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: u32,

    pub forward_kill_max_attempts: u32,
    pub notify_retry_max_attempts: u32,

    pub min_cpu_millicores: u32,
    pub max_cpu_millicores: u32,
    pub min_memory_mb: u32,
    pub max_memory_mb: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_id: "default-cluster".to_string(),
            node_id: "node-0".to_string(),
            grpc_listen_addr: "0.0.0.0:47120".to_string(),
            meta_store_addr: "127.0.0.1:2379".to_string(),
            abnormal_poll_interval_ms: 2_000,

            runtime_heartbeat_timeout_ms: 3_000,
            runtime_max_heartbeat_timeout_times: 3,
            runtime_init_call_timeout_ms: 10_000,
            runtime_shutdown_timeout_seconds: 30,
            connect_timeout_ms: 5_000,
            reconnect_timeout_ms: 10_000,
            reconnect_interval_ms: 1_000,
            wait_status_code_update_ms: 2_000,

            max_instance_redeploy_times: 2,
            min_deploy_interval_ms: 200,
            max_deploy_interval_ms: 5_000,
            max_instance_reconnect_times: 2,
            max_schedule_times: 3,

            recover_retry_timeout_default_ms: 30_000,

            rate_limit_capacity: 10,
            rate_limit_refill_per_sec: 1,

            forward_kill_max_attempts: 3,
            notify_retry_max_attempts: 4,

            min_cpu_millicores: 100,
            max_cpu_millicores: 64_000,
            min_memory_mb: 64,
            max_memory_mb: 262_144,
        }
    }
}

fn load_settings() -> Settings {
    let result = config::Config::builder()
        .add_source(config::Environment::with_prefix("FNPROXY"))
        .add_source(config::File::with_name("/etc/fnproxy/settings").required(false))
        .build();

    match result {
        Ok(built) => built.try_deserialize::<Settings>().unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

/// Returns the process-wide settings, loading them on first call.
pub fn get_config() -> &'static Settings {
    SETTINGS.get_or_init(load_settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let s = Settings::default();
        assert!(s.min_deploy_interval_ms <= s.max_deploy_interval_ms);
        assert!(s.max_instance_redeploy_times >= 1);
    }

    #[test]
    fn get_config_is_stable_across_calls() {
        let a = get_config() as *const Settings;
        let b = get_config() as *const Settings;
        assert_eq!(a, b);
    }
}
