/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Eviction pipeline (`spec.md` §4.3.5): an operator-initiated graceful
//! vacate of one or more instances, distinct from fault-triggered exit.
//! `RUNNING`/`SUB_HEALTH` targets get a `Shutdown` RPC bounded by the
//! caller's deadline; `CREATING` targets wait out their deploy first;
//! `EXITING` targets are left to finish their own exit.

use super::InstanceController;
use crate::errors::{CoreError, CoreResult};
use crate::state::InstanceState;
use crate::state_machine::{InstanceStateMachine, TransitionCtx};
use common::InstanceId;
use std::sync::Arc;
use tokio::sync::oneshot;

impl InstanceController {
    /// Evicts every listed target independently; one target's failure
    /// doesn't block the rest (`spec.md` §4.3.5 "An evict-agent request
    /// lists instances to vacate").
    pub async fn evict(self: &Arc<Self>, targets: Vec<InstanceId>, deadline_ms: u64) -> Vec<(InstanceId, CoreResult<()>)> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            outcomes.push((target, self.evict_one(target, deadline_ms).await));
        }
        outcomes
    }

    async fn evict_one(&self, target: InstanceId, deadline_ms: u64) -> CoreResult<()> {
        let Some(sm) = self.control_view.get_instance(target).await else {
            return Ok(());
        };

        loop {
            let state = sm.get_instance_state().await;
            match state {
                InstanceState::Creating => {
                    self.wait_for_any_state(
                        &sm,
                        target,
                        "evict",
                        &[
                            InstanceState::Running,
                            InstanceState::SubHealth,
                            InstanceState::Failed,
                            InstanceState::Fatal,
                            InstanceState::Exiting,
                        ],
                    )
                    .await;
                }
                InstanceState::Exiting => {
                    self.wait_for_any_state(&sm, target, "evict", &[InstanceState::Exited, InstanceState::Fatal])
                        .await;
                    return Ok(());
                }
                InstanceState::Running | InstanceState::SubHealth => {
                    return self.shutdown_to_evicted(&sm, target, deadline_ms).await;
                }
                s if s.is_terminal() => return Ok(()),
                // NEW/SCHEDULING/SCHEDULE_FAILED/FAILED: nothing deployed yet
                // to vacate; the next schedule attempt (if any) proceeds on
                // its own merits (spec.md §4.3.5 doesn't cover pre-deploy
                // targets, so there's nothing for eviction to do here).
                _ => return Ok(()),
            }
        }
    }

    async fn shutdown_to_evicted(&self, sm: &Arc<InstanceStateMachine>, target: InstanceId, deadline_ms: u64) -> CoreResult<()> {
        sm.transition_to(TransitionCtx::to(InstanceState::Evicting)).await?;

        let shutdown_result = match self.worker_clients.get(target).await {
            Some(client) => client.shutdown(deadline_ms).await,
            None => Err(CoreError::InstanceNotFound(target.to_string())),
        };

        let ctx = match &shutdown_result {
            Ok(()) => TransitionCtx::to(InstanceState::Evicted),
            Err(e) => TransitionCtx::to(InstanceState::Fatal).with_error(e.code(), e.to_string()),
        };
        sm.transition_to(ctx).await?;
        self.resource_view.release(target).await;
        self.worker_clients.remove(target).await;
        shutdown_result
    }

    /// One-shot wait for `sm` to enter any of `states`, via the same
    /// state-change callback mechanism the subscription manager uses
    /// (`subscription.rs::subscribe_termination`).
    async fn wait_for_any_state(
        &self,
        sm: &Arc<InstanceStateMachine>,
        instance_id: InstanceId,
        purpose: &str,
        states: &[InstanceState],
    ) {
        let key = format!("{purpose}_wait_{instance_id}");
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        sm.add_state_change_callback(
            states.to_vec(),
            key,
            Arc::new(move |_snap| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Box::pin(async {})
            }),
        )
        .await;

        // The instance may already have reached one of `states` between our
        // caller's read and the callback registration above; re-check to
        // avoid waiting forever on a transition that already happened.
        if states.contains(&sm.get_instance_state().await) {
            return;
        }
        let _ = rx.await;
    }
}
