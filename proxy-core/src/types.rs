/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Data model for one instance: the unit of work scheduled, deployed and
//! monitored by this core (`spec.md` §3).

use common::{InstanceId, RequestId};
use std::collections::HashMap;

/// System-tenant prefix; system functions skip rate limiting and tenant
/// affinity injection (`spec.md` §4.3.1 steps 4-5).
pub const SYSTEM_TENANT: &str = "0";

#[derive(Debug, Clone)]
pub struct DeviceResource {
    pub device_type: String,
    pub count: u32,
    pub memory_mb: u32,
    pub latency_ms: f64,
    pub stream_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub cpu_millicores: u32,
    pub memory_mb: u32,
    pub devices: Vec<DeviceResource>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOption {
    pub policy_name: String,
    pub affinities: Vec<String>,
    pub anti_affinities: Vec<String>,
    pub resource_selectors: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

impl ScheduleOption {
    /// Drop any user-supplied tenant-key affinity/anti-affinity expression
    /// so the tenant-affinity injection step (`spec.md` §4.3.1 step 5) owns
    /// that key exclusively.
    pub fn strip_tenant_affinity_expressions(&mut self) {
        self.affinities.retain(|e| !e.starts_with("tenant="));
        self.anti_affinities.retain(|e| !e.starts_with("tenant!="));
    }

    /// Mirrors the schedule policy's exclusivity onto the worker kill
    /// path (`spec.md` §8 scenario 4 "worker Kill issued with monopoly
    /// flag mirroring schedule policy").
    pub fn is_monopoly(&self) -> bool {
        self.policy_name == "monopoly"
    }
}

/// Untyped string map from the wire, with typed accessors for the keys the
/// schedule/reschedule pipeline actually reads. Keeping the map untyped at
/// rest (rather than a fixed struct) matches the source's free-form option
/// bag while giving call sites validated, typed access.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions(pub HashMap<String, String>);

impl CreateOptions {
    pub const RECOVER_RETRY_TIMES_KEY: &'static str = "RecoverRetryTimes";
    pub const RECOVER_RETRY_TIMEOUT_KEY: &'static str = "RecoverRetryTimeoutMs";
    pub const RELIABILITY_TIER_KEY: &'static str = "ReliabilityTier";

    pub fn recover_retry_times(&self) -> u32 {
        self.0
            .get(Self::RECOVER_RETRY_TIMES_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Per the Open Question in `spec.md` §9 (Decision D2 in DESIGN.md): a
    /// present-but-non-numeric override is a param error, not a silent
    /// fallback to the default.
    pub fn recover_retry_timeout_ms(&self, default_ms: u64) -> Result<u64, ()> {
        match self.0.get(Self::RECOVER_RETRY_TIMEOUT_KEY) {
            None => Ok(default_ms),
            Some(raw) => raw.parse::<u64>().map_err(|_| ()),
        }
    }

    pub fn is_low_reliability(&self) -> bool {
        self.0
            .get(Self::RELIABILITY_TIER_KEY)
            .map(|v| v == "low")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceHealth {
    #[default]
    Healthy,
    SubHealth,
}

#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub err_code: api::proto::functionproxy::ErrorCode,
    pub exit_code: i32,
    pub msg: String,
    pub r#type: String,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self {
            err_code: api::proto::functionproxy::ErrorCode::Success,
            exit_code: 0,
            msg: String::new(),
            r#type: String::new(),
        }
    }
}

/// Immutable identity plus mutable lifecycle fields for one instance.
/// `version` increments on every persisted transition (`spec.md` §3
/// invariants); `state` is driven exclusively by `InstanceStateMachine`.
#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: InstanceId,
    pub request_id: RequestId,
    pub function: String,
    pub tenant_id: String,
    pub parent_id: Option<InstanceId>,
    pub parent_proxy_address: Option<String>,
    pub owner_proxy_id: String,
    pub resources: Resources,
    pub schedule_option: ScheduleOption,
    pub create_options: CreateOptions,
    pub state: crate::state::InstanceState,
    pub status: InstanceStatus,
    pub version: u64,
    pub runtime_id: Option<String>,
    pub runtime_address: Option<String>,
    pub function_agent_id: Option<String>,
    pub schedule_round: u32,
    pub schedule_times: u32,
    pub deploy_times: u32,
    pub is_low_reliability: bool,
}

impl Instance {
    pub fn is_system(&self) -> bool {
        self.tenant_id == SYSTEM_TENANT
    }
}
