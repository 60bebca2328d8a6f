/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Node-startup sync reconciliation (`spec.md` §4.3.4): for every
//! non-terminal instance this node already knows about, reconcile its
//! state against whether the deploying function-agent is still alive,
//! redeploying or finalizing as appropriate. The actual load of persisted
//! instances into `InstanceControlView` on process start is a
//! `proxy-agent` binary-level bootstrap concern (the wire encoding of a
//! persisted instance record is deliberately left to the `MetaStore`
//! adapter, `state_machine.rs`'s `decode_instance_minimal`); this pipeline
//! only owns the reconciliation decision once those instances are
//! registered.

use super::{InstanceController, RescheduleTrigger};
use crate::collaborators::FunctionAgentMgr;
use crate::state::InstanceState;
use crate::state_machine::TransitionCtx;
use common::{get_config, InstanceId};
use std::sync::Arc;
use tracing::{info, warn};

impl InstanceController {
    /// Runs reconciliation over every instance this node currently has
    /// registered (`spec.md` §4.3.4 "Node-startup sync").
    pub async fn sync_on_startup(self: &Arc<Self>) {
        let ids = self.control_view.all_instance_ids().await;
        info!(count = ids.len(), "running node-startup instance reconciliation");
        for instance_id in ids {
            self.reconcile_one_on_startup(instance_id).await;
        }
    }

    async fn reconcile_one_on_startup(self: &Arc<Self>, instance_id: InstanceId) {
        let Some(sm) = self.control_view.get_instance(instance_id).await else {
            return;
        };
        let state = sm.get_instance_state().await;
        if state.is_terminal() {
            return;
        }

        let instance = sm.get_instance_info().await;
        let agent_alive = match &instance.function_agent_id {
            Some(agent_id) => self
                .agent_mgr
                .query_instance_status_info(agent_id, instance_id, instance.runtime_id.as_deref().unwrap_or(""))
                .await
                .is_ok(),
            None => false,
        };

        if !agent_alive {
            match state {
                InstanceState::Evicting => {
                    let _ = sm
                        .transition_to(TransitionCtx::to(InstanceState::Evicted).with_msg("finalized on startup sync, no agent record"))
                        .await;
                }
                InstanceState::Exiting => {
                    let _ = sm
                        .transition_to(TransitionCtx::to(InstanceState::Exited).with_msg("finalized on startup sync, no agent record"))
                        .await;
                }
                _ => {
                    let recoverable = instance.create_options.recover_retry_times() > instance.schedule_times;
                    if recoverable {
                        info!(%instance_id, "agent missing on startup sync, rescheduling");
                        if state != InstanceState::Failed {
                            let _ = sm.transition_to(TransitionCtx::to(InstanceState::Failed)).await;
                        }
                        if let Err(e) = self.reschedule_from_decision(instance_id, RescheduleTrigger::StartupSync).await {
                            warn!(%instance_id, error = %e, "startup-sync reschedule failed");
                        }
                    } else {
                        let _ = sm
                            .transition_to(TransitionCtx::to(InstanceState::Fatal).with_msg("agent missing on startup sync, not recoverable"))
                            .await;
                    }
                }
            }
            return;
        }

        if matches!(state, InstanceState::Scheduling | InstanceState::Creating) {
            let cfg = get_config();
            if instance.deploy_times < cfg.max_instance_redeploy_times {
                info!(%instance_id, "agent alive but deploy never completed, redeploying on startup sync");
                let _ = sm.transition_to(TransitionCtx::to(InstanceState::Failed)).await;
                if let Err(e) = self.reschedule_from_decision(instance_id, RescheduleTrigger::StartupSync).await {
                    warn!(%instance_id, error = %e, "startup-sync redeploy failed");
                }
            } else {
                let _ = sm
                    .transition_to(TransitionCtx::to(InstanceState::Fatal).with_msg("redeploy attempts exhausted on startup sync"))
                    .await;
            }
        }
    }
}
