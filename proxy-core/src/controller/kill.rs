/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Kill / signal routing (`spec.md` §4.3.3): one entry point that fans a
//! `KillRequest` out over the signal taxonomy, forwarding to the owning
//! peer when the target isn't local to this node.

use super::InstanceController;
use crate::errors::{CoreError, CoreResult};
use crate::state::InstanceState;
use crate::state_machine::{InstanceSnapshot, InstanceStateMachine};
use api::proto::functionproxy::ErrorCode;
use common::{get_config, InstanceId};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Signal taxonomy (`spec.md` §4.3.3 "Signal values").
pub mod signal {
    pub const SHUT_DOWN: i32 = 1;
    pub const SHUT_DOWN_ALL: i32 = 2;
    pub const SHUT_DOWN_SYNC: i32 = 3;
    pub const SHUT_DOWN_GROUP: i32 = 4;
    pub const GROUP_EXIT: i32 = 5;
    pub const APP_STOP: i32 = 7;
    pub const REMOVE_RESOURCE_GROUP: i32 = 8;
    pub const SUBSCRIBE: i32 = 9;
    pub const NOTIFY: i32 = 10;
    pub const UNSUBSCRIBE: i32 = 11;
    pub const USER_DEFINED_MIN: i32 = 64;
    pub const USER_DEFINED_MAX: i32 = 1024;
}

/// A fatal exit caused by the function's own code is still a "successful"
/// shutdown from the caller's point of view; everything else reports
/// `ERR_INSTANCE_NOT_FOUND` on an already-terminal target.
fn is_user_visible_exit(err_code: ErrorCode) -> bool {
    matches!(err_code, ErrorCode::ErrUserFunctionException | ErrorCode::ErrGroupExitTogether)
}

impl InstanceController {
    /// Dedups concurrent `ForwardKill`/`Kill` retries sharing one
    /// `request_id` the same way `schedule`'s fan-out does
    /// (`spec.md` §4.3.3 "Forward-idempotence").
    pub async fn kill(
        self: &Arc<Self>,
        src_instance: InstanceId,
        request_id: String,
        target: InstanceId,
        signal: i32,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        if request_id.is_empty() {
            return self.dispatch_kill(src_instance, target, signal, payload).await;
        }

        let existing = {
            let inflight = self.kill_inflight.lock().await;
            inflight.get(&request_id).cloned()
        };
        if let Some(tx) = existing {
            let mut rx = tx.subscribe();
            return rx
                .recv()
                .await
                .map_err(|_| CoreError::InnerCommunication("kill dedup channel closed".into()))?;
        }

        let tx = {
            let mut inflight = self.kill_inflight.lock().await;
            match inflight.get(&request_id) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, _rx) = broadcast::channel(4);
                    inflight.insert(request_id.clone(), tx.clone());
                    tx
                }
            }
        };

        let result = self.dispatch_kill(src_instance, target, signal, payload).await;
        self.kill_inflight.lock().await.remove(&request_id);
        let _ = tx.send(result.clone());
        result
    }

    async fn dispatch_kill(
        &self,
        src_instance: InstanceId,
        target: InstanceId,
        sig: i32,
        payload: Vec<u8>,
    ) -> CoreResult<()> {
        use signal::*;
        match sig {
            SHUT_DOWN => self.shutdown_target(src_instance, target, false).await,
            SHUT_DOWN_SYNC => self.shutdown_target(src_instance, target, true).await,
            APP_STOP => self.shutdown_target(src_instance, target, false).await,
            SHUT_DOWN_ALL | SHUT_DOWN_GROUP => self.local_sched.kill_group(&target.to_string(), sig).await,
            GROUP_EXIT => self.group_exit(src_instance, target).await,
            REMOVE_RESOURCE_GROUP => {
                // Resource-group membership is owned by a collaborator this
                // core doesn't model (spec.md §1 non-goals); best-effort
                // delegate through the same peer group-kill path so at
                // least the local instance set clears.
                self.local_sched.kill_group(&target.to_string(), sig).await
            }
            NOTIFY => self.deliver_user_signal(src_instance, target, sig, payload).await,
            s if (USER_DEFINED_MIN..=USER_DEFINED_MAX).contains(&s) => {
                self.deliver_user_signal(src_instance, target, s, payload).await
            }
            SUBSCRIBE | UNSUBSCRIBE => Err(CoreError::ParamInvalid(
                "subscribe/unsubscribe are served over their own RPCs, not Kill".into(),
            )),
            _ => Err(CoreError::ParamInvalid(format!("unsupported signal {sig}"))),
        }
    }

    async fn shutdown_target(&self, src: InstanceId, target: InstanceId, wait: bool) -> CoreResult<()> {
        let Some(sm) = self.control_view.get_instance(target).await else {
            return Err(CoreError::InstanceNotFound(target.to_string()));
        };
        if sm.get_owner().await != self.node_id {
            let sig = if wait { signal::SHUT_DOWN_SYNC } else { signal::SHUT_DOWN };
            return self.forward_with_retries(src, target, sig, Vec::new()).await;
        }

        let state = sm.get_instance_state().await;
        if state.is_terminal() {
            if state == InstanceState::Fatal {
                let status = sm.get_instance_context_copy().await.status;
                if is_user_visible_exit(status.err_code) {
                    return Ok(());
                }
            }
            return Err(CoreError::InstanceNotFound(target.to_string()));
        }
        if !matches!(
            state,
            InstanceState::Running | InstanceState::Creating | InstanceState::SubHealth | InstanceState::Scheduling
                | InstanceState::Exiting
        ) {
            return Err(CoreError::InstanceNotFound(target.to_string()));
        }

        let cfg = get_config();
        let deadline_ms = cfg.runtime_shutdown_timeout_seconds * 1000;
        let worker_clients = self.worker_clients.clone();
        let run_shutdown = move |_snap: InstanceSnapshot| {
            let worker_clients = worker_clients.clone();
            async move {
                if let Some(client) = worker_clients.get(target).await {
                    client.shutdown(deadline_ms).await?;
                }
                Ok(())
            }
        };

        if wait {
            let result = sm.try_exit_instance(run_shutdown).await;
            self.resource_view.release(target).await;
            self.worker_clients.remove(target).await;
            result
        } else {
            let sm = sm.clone();
            let resource_view = self.resource_view.clone();
            let worker_clients2 = self.worker_clients.clone();
            tokio::spawn(async move {
                let _ = sm.try_exit_instance(run_shutdown).await;
                resource_view.release(target).await;
                worker_clients2.remove(target).await;
            });
            Ok(())
        }
    }

    /// A sibling in the same function group failed; mark this instance
    /// `FATAL` without waiting on its own shutdown sequence
    /// (`spec.md` §4.3.3 `GROUP_EXIT`).
    async fn group_exit(&self, src: InstanceId, target: InstanceId) -> CoreResult<()> {
        let Some(sm) = self.control_view.get_instance(target).await else {
            return Err(CoreError::InstanceNotFound(target.to_string()));
        };
        if sm.get_owner().await != self.node_id {
            return self.forward_with_retries(src, target, signal::GROUP_EXIT, Vec::new()).await;
        }
        if sm.get_instance_state().await.is_terminal() {
            return Ok(());
        }
        sm.transition_to(
            crate::state_machine::TransitionCtx::to(InstanceState::Fatal)
                .with_error(ErrorCode::ErrGroupExitTogether, "sibling instance failed, group exit"),
        )
        .await?;
        self.resource_view.release(target).await;
        self.worker_clients.remove(target).await;
        Ok(())
    }

    /// `NOTIFY` and user-defined signals forward verbatim to the target's
    /// control channel, retrying `NOTIFY` up to `notify_retry_max_attempts`
    /// while the owning function-agent is marked recovering
    /// (`spec.md` §4.3.3 "Values in [64,1024]").
    async fn deliver_user_signal(&self, src: InstanceId, target: InstanceId, sig: i32, payload: Vec<u8>) -> CoreResult<()> {
        let Some(sm) = self.control_view.get_instance(target).await else {
            return Err(CoreError::InstanceNotFound(target.to_string()));
        };
        if sm.get_owner().await != self.node_id {
            return self.forward_with_retries(src, target, sig, payload).await;
        }
        let Some(client) = self.worker_clients.get(target).await else {
            return Err(CoreError::InstanceNotFound(target.to_string()));
        };

        if sig != signal::NOTIFY {
            return client.signal(sig, payload).await;
        }

        let cfg = get_config();
        let agent_id = sm.get_instance_info().await.function_agent_id;
        let mut attempt = 0u32;
        loop {
            match client.signal(sig, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(CoreError::RequestBetweenRuntimeBus(msg)) => {
                    attempt += 1;
                    let recovering = match &agent_id {
                        Some(a) => self.agent_mgr.is_func_agent_recovering(a).await,
                        None => false,
                    };
                    if attempt >= cfg.notify_retry_max_attempts || !recovering {
                        return Err(CoreError::RequestBetweenRuntimeBus(msg));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Forwards a signal to the peer that owns `target`, retrying up to
    /// `forward_kill_max_attempts` times (`spec.md` §4.3.3 "Local vs
    /// remote").
    async fn forward_with_retries(&self, src: InstanceId, target: InstanceId, sig: i32, payload: Vec<u8>) -> CoreResult<()> {
        let Some(sm) = self.control_view.get_instance(target).await else {
            return Err(CoreError::InstanceNotFound(target.to_string()));
        };
        let owner = sm.get_owner().await;
        let cfg = get_config();
        let mut attempt = 0u32;
        loop {
            match self
                .local_sched
                .forward_kill_to_instance_manager(&owner, "", src, target, sig, payload.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= cfg.forward_kill_max_attempts {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// `spec.md` §4.4 `Subscribe`, `InstanceTermination` kind: forwards to
    /// the owning peer first if `target` isn't local.
    pub async fn subscribe_termination(self: &Arc<Self>, src: InstanceId, target: InstanceId) -> CoreResult<()> {
        if let Some(target_sm) = self.control_view.get_instance(target).await {
            if target_sm.get_owner().await != self.node_id {
                return self.forward_with_retries(src, target, signal::SUBSCRIBE, Vec::new()).await;
            }
        }
        self.subscriptions.subscribe_termination(src, target).await
    }

    pub async fn unsubscribe_termination(&self, src: InstanceId, target: InstanceId) -> CoreResult<()> {
        self.subscriptions.unsubscribe_termination(src, target).await
    }

    pub async fn subscribe_master(&self, src: InstanceId) -> CoreResult<()> {
        self.subscriptions.subscribe_master(src).await
    }

    pub async fn unsubscribe_master(&self, src: InstanceId) -> CoreResult<()> {
        self.subscriptions.unsubscribe_master(src).await
    }
}
