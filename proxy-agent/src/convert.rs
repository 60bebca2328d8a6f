/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Wire (`api::proto::functionproxy`) <-> domain (`proxy_core::types`)
//! conversions for the gRPC receiver. `instance_id`/`state`/`version`
//! on an inbound `Schedule` request are the pipeline's to assign, not
//! the caller's, so they're dropped on the way in.

use api::proto::functionproxy as wire;
use common::InstanceId;
use proxy_core::types::{CreateOptions, DeviceResource, Resources, ScheduleOption};
use std::collections::HashMap;
use std::str::FromStr;
use tonic::Status;

pub fn resources_from_wire(w: Option<wire::Resources>) -> Resources {
    let w = w.unwrap_or_default();
    Resources {
        cpu_millicores: w.cpu_millicores,
        memory_mb: w.memory_mb,
        devices: w
            .devices
            .into_iter()
            .map(|d| DeviceResource {
                device_type: d.device_type,
                count: d.count,
                memory_mb: d.memory_mb,
                latency_ms: d.latency_ms,
                stream_count: d.stream_count,
            })
            .collect(),
    }
}

pub fn schedule_option_from_wire(w: Option<wire::ScheduleOption>) -> ScheduleOption {
    let w = w.unwrap_or_default();
    ScheduleOption {
        policy_name: w.policy_name,
        affinities: w.affinities,
        anti_affinities: w.anti_affinities,
        resource_selectors: w.resource_selectors,
        labels: w.labels,
    }
}

pub fn create_options_from_wire(w: HashMap<String, String>) -> CreateOptions {
    CreateOptions(w)
}

/// Parses the optional `parent_id`, treating an empty string the same as
/// an absent field (the wire type has no native `Option<String>`).
pub fn optional_instance_id(raw: &str) -> Result<Option<InstanceId>, Status> {
    if raw.is_empty() {
        return Ok(None);
    }
    InstanceId::from_str(raw)
        .map(Some)
        .map_err(|e| Status::invalid_argument(format!("invalid instance id {raw:?}: {e}")))
}

pub fn optional_string(raw: &str) -> Option<String> {
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
