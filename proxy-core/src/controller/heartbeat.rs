/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Heartbeat & health pipeline (`spec.md` §4.3.2): one timer per instance,
//! modeled as a spawned task that owns its own consecutive-failure and
//! previous-health counters, matching the actor-per-instance concurrency
//! model of `spec.md` §5 (no shared mutable health state between
//! instances).

use super::{InstanceController, RescheduleTrigger};
use crate::collaborators::{HeartbeatOutcome, StatusHint};
use crate::state::InstanceState;
use crate::state_machine::TransitionCtx;
use crate::types::InstanceHealth;
use common::{get_config, InstanceId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

impl InstanceController {
    /// Starts the per-instance heartbeat loop as a detached task. Exits on
    /// its own once the instance reaches a terminal state or its worker
    /// channel is gone (`spec.md` §4.3.1 step 11 "Start heartbeat").
    pub fn start_heartbeat(self: &Arc<Self>, instance_id: InstanceId) {
        let controller = self.clone();
        tokio::spawn(async move {
            controller.run_heartbeat_loop(instance_id).await;
        });
    }

    async fn run_heartbeat_loop(self: Arc<Self>, instance_id: InstanceId) {
        let cfg = get_config();
        let mut health = InstanceHealth::Healthy;
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::time::sleep(Duration::from_millis(cfg.runtime_heartbeat_timeout_ms)).await;

            let Some(sm) = self.control_view.get_instance(instance_id).await else {
                return;
            };
            if sm.get_instance_state().await.is_terminal() {
                return;
            }
            let Some(client) = self.worker_clients.get(instance_id).await else {
                return;
            };

            let outcome = client.heartbeat(cfg.runtime_heartbeat_timeout_ms).await;
            match outcome {
                Ok(HeartbeatOutcome::Ok) => {
                    consecutive_failures = 0;
                    if health == InstanceHealth::SubHealth {
                        if sm.get_instance_state().await == InstanceState::SubHealth {
                            let _ = sm.transition_to(TransitionCtx::to(InstanceState::Running)).await;
                        }
                        health = InstanceHealth::Healthy;
                    }
                }
                Ok(HeartbeatOutcome::SubHealth) => {
                    consecutive_failures = 0;
                    if health == InstanceHealth::Healthy {
                        if sm.get_instance_state().await == InstanceState::Running {
                            let _ = sm.transition_to(TransitionCtx::to(InstanceState::SubHealth)).await;
                        }
                        health = InstanceHealth::SubHealth;
                    }
                }
                Ok(HeartbeatOutcome::CheckError) | Err(_) => {
                    consecutive_failures += 1;
                    if consecutive_failures < cfg.runtime_max_heartbeat_timeout_times {
                        continue;
                    }
                    if self.handle_heartbeat_loss(&sm, instance_id).await {
                        return;
                    }
                    consecutive_failures = 0;
                }
            }
        }
    }

    /// Past the consecutive-failure threshold, the instance is treated as
    /// lost (`spec.md` §4.3.2). Returns `true` if the loop should stop
    /// (instance reached a terminal state or a reschedule was handed off).
    async fn handle_heartbeat_loss(
        &self,
        sm: &Arc<crate::state_machine::InstanceStateMachine>,
        instance_id: InstanceId,
    ) -> bool {
        warn!(%instance_id, "heartbeat lost, querying function agent for a status hint");
        let instance = sm.get_instance_info().await;
        let Some(agent_id) = instance.function_agent_id.clone() else {
            let _ = sm
                .transition_to(TransitionCtx::to(InstanceState::Fatal).with_msg("heartbeat lost with no agent on record"))
                .await;
            return true;
        };
        let runtime_id = instance.runtime_id.clone().unwrap_or_default();

        let hint = self
            .agent_mgr
            .query_instance_status_info(&agent_id, instance_id, &runtime_id)
            .await;

        match hint {
            Ok(StatusHint::ExceptionInfo { message }) => {
                let _ = sm
                    .transition_to(
                        TransitionCtx::to(InstanceState::Fatal)
                            .with_error(api::proto::functionproxy::ErrorCode::ErrUserFunctionException, message),
                    )
                    .await;
                true
            }
            _ => {
                let attempts_used = instance.schedule_times;
                let recoverable = instance.create_options.recover_retry_times() > attempts_used;
                if !recoverable {
                    let _ = sm
                        .transition_to(TransitionCtx::to(InstanceState::Fatal).with_msg("heartbeat lost, not recoverable"))
                        .await;
                    return true;
                }
                let _ = sm.transition_to(TransitionCtx::to(InstanceState::Failed)).await;
                match self
                    .reschedule_from_decision(instance_id, RescheduleTrigger::PipelineFailure)
                    .await
                {
                    Ok(()) => {
                        info!(%instance_id, "rescheduled after heartbeat loss");
                        // The reschedule pipeline drives CREATING -> RUNNING again
                        // through the normal deploy path, which restarts this
                        // instance's own heartbeat loop; this one exits.
                        true
                    }
                    Err(e) => {
                        warn!(%instance_id, error = %e, "reschedule after heartbeat loss failed");
                        true
                    }
                }
            }
        }
    }
}
