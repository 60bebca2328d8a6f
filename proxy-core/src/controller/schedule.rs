/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Schedule pipeline (`spec.md` §4.3.1): parent check, function-meta
//! fetch, resource validation, rate limiting, tenant-affinity injection,
//! identity registration, scheduling decision, deploy, runtime connect
//! and the readiness/init-call handshake that resolves `RUNNING`.

use super::{InstanceController, RescheduleTrigger};
use crate::collaborators::DecisionStatus;
use crate::control_view::ScheduleFanOut;
use crate::errors::{CoreError, CoreResult};
use crate::state::InstanceState;
use crate::state_machine::TransitionCtx;
use crate::types::{CreateOptions, Instance, InstanceStatus, Resources, ScheduleOption, SYSTEM_TENANT};
use common::{get_config, InstanceId, RequestId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything the caller supplies for a fresh schedule request;
/// `instance_id`/`state`/`version` are the pipeline's to assign.
#[derive(Debug, Clone)]
pub struct ScheduleDraft {
    pub request_id: RequestId,
    pub trace_id: String,
    pub function: String,
    pub tenant_id: String,
    pub parent_id: Option<InstanceId>,
    pub parent_proxy_address: Option<String>,
    pub resources: Resources,
    pub schedule_option: ScheduleOption,
    pub create_options: CreateOptions,
}

fn validate_resources(resources: &Resources, low_reliability: bool, create_options: &CreateOptions) -> CoreResult<()> {
    let cfg = get_config();
    if resources.cpu_millicores < cfg.min_cpu_millicores || resources.cpu_millicores > cfg.max_cpu_millicores {
        return Err(CoreError::ParamInvalid(format!(
            "cpu_millicores {} out of range [{}, {}]",
            resources.cpu_millicores, cfg.min_cpu_millicores, cfg.max_cpu_millicores
        )));
    }
    if resources.memory_mb < cfg.min_memory_mb || resources.memory_mb > cfg.max_memory_mb {
        return Err(CoreError::ParamInvalid(format!(
            "memory_mb {} out of range [{}, {}]",
            resources.memory_mb, cfg.min_memory_mb, cfg.max_memory_mb
        )));
    }
    for device in &resources.devices {
        if device.count < 1 {
            return Err(CoreError::ParamInvalid("device count must be >= 1".into()));
        }
        if device.memory_mb == 0 || device.latency_ms <= 0.0 || device.stream_count == 0 {
            return Err(CoreError::ParamInvalid(
                "device memory/latency/stream_count must be > 0".into(),
            ));
        }
        if regex::Regex::new(&device.device_type).is_err() {
            return Err(CoreError::ParamInvalid(format!(
                "device_type {:?} is not a valid card-type expression",
                device.device_type
            )));
        }
    }
    if low_reliability && create_options.recover_retry_times() > 0 {
        return Err(CoreError::ParamInvalid(
            "low-reliability instances must not request recover".into(),
        ));
    }
    // Decision D2 (DESIGN.md): a present-but-non-numeric
    // `RecoverRetryTimeoutMs` override is rejected here rather than
    // silently falling back to the default.
    if create_options
        .recover_retry_timeout_ms(cfg.recover_retry_timeout_default_ms)
        .is_err()
    {
        return Err(CoreError::ParamInvalid(
            "RecoverRetryTimeoutMs must be numeric".into(),
        ));
    }
    Ok(())
}

impl InstanceController {
    /// Entry point: de-duplicates concurrent callers on `request_id`
    /// before running the pipeline once per fresh request
    /// (`spec.md` §4.2 "Duplicate requests").
    ///
    /// # Errors
    ///
    /// Returns the boundary error of whichever pipeline step rejected the
    /// request; see `spec.md` §4.3.1 for the per-step error mapping.
    pub async fn schedule(self: &Arc<Self>, draft: ScheduleDraft) -> CoreResult<InstanceId> {
        if self.is_abnormal() {
            return Err(CoreError::InnerSystemError("node is self-fenced".into()));
        }
        if let Some(existing) = self.control_view.try_get_instance_id_by_request(&draft.request_id).await {
            return Ok(existing);
        }
        if let Some(mut rx) = self.control_view.subscribe_in_flight(&draft.request_id).await {
            return match rx.recv().await {
                Ok(ScheduleFanOut(outcome)) => outcome,
                Err(_) => Err(CoreError::InnerCommunication("schedule fan-out closed".into())),
            };
        }
        let Some(_rx) = self.control_view.begin_in_flight_request(draft.request_id.clone()).await else {
            // Lost the race between the duplicate-check above and here;
            // the winner is now in flight, so subscribe to it instead.
            return Box::pin(self.schedule(draft)).await;
        };

        let result = self.run_schedule_pipeline(draft.clone()).await;
        self.control_view
            .resolve_in_flight_request(draft.request_id, ScheduleFanOut(result.clone()))
            .await;
        if let Ok(instance_id) = result {
            self.start_heartbeat(instance_id);
        }
        result
    }

    async fn run_schedule_pipeline(&self, draft: ScheduleDraft) -> CoreResult<InstanceId> {
        // Step 1: parent check.
        if let Some(parent_id) = draft.parent_id {
            if let Some(parent_sm) = self.control_view.get_instance(parent_id).await {
                let parent_state = parent_sm.get_instance_state().await;
                if parent_state == InstanceState::Exiting || parent_state.is_terminal() {
                    return Err(CoreError::InstanceExited);
                }
            }
        }

        // Step 2: function-meta fetch.
        let meta = self
            .observer
            .lookup_function_meta(&draft.function)
            .await?
            .ok_or_else(|| CoreError::FunctionMetaNotFound(draft.function.clone()))?;

        // Step 3: validate resources.
        let low_reliability = draft.create_options.is_low_reliability();
        validate_resources(&draft.resources, low_reliability, &draft.create_options)?;

        // Step 4: rate limit. Rescheduled requests and the system tenant
        // bypass the bucket (spec.md §4.3.1 step 4, §4.3.4).
        let is_rescheduled = self.control_view.is_rescheduled_request(&draft.request_id).await;
        if draft.tenant_id != SYSTEM_TENANT && !is_rescheduled && !self.rate_limiter.try_admit(&draft.tenant_id).await
        {
            return Err(CoreError::CreateRateLimit);
        }

        // Step 5: tenant-affinity injection.
        let mut schedule_option = draft.schedule_option.clone();
        if draft.tenant_id != SYSTEM_TENANT {
            schedule_option.strip_tenant_affinity_expressions();
            schedule_option
                .anti_affinities
                .push(format!("tenant!={}", draft.tenant_id));
            schedule_option
                .affinities
                .push(format!("tenant={}:weight=100", draft.tenant_id));
        }

        // Step 6: identity.
        let instance = Instance {
            instance_id: InstanceId::new(),
            request_id: draft.request_id.clone(),
            function: draft.function.clone(),
            tenant_id: draft.tenant_id.clone(),
            parent_id: draft.parent_id,
            parent_proxy_address: draft.parent_proxy_address.clone(),
            owner_proxy_id: self.node_id.clone(),
            resources: draft.resources.clone(),
            schedule_option,
            create_options: draft.create_options.clone(),
            state: InstanceState::New,
            status: InstanceStatus::default(),
            version: 0,
            runtime_id: None,
            runtime_address: None,
            function_agent_id: None,
            schedule_round: 0,
            schedule_times: 0,
            deploy_times: 0,
            is_low_reliability: low_reliability,
        };
        let instance_id = instance.instance_id;
        let sm = self.control_view.new_instance(instance).await?;
        sm.transition_to(TransitionCtx::to(InstanceState::Scheduling)).await?;

        if sm.is_cancel_requested() {
            return self.cancel_schedule(&sm, instance_id, None).await;
        }

        // Step 7: decision.
        let decision = {
            let snapshot = sm.get_instance_info().await;
            self.scheduler.decide(&snapshot).await?
        };
        let agent_id = match decision.status {
            DecisionStatus::Success => decision.agent_id.ok_or_else(|| {
                CoreError::InnerSystemError("scheduler reported SUCCESS with no agent_id".into())
            })?,
            DecisionStatus::ResourceNotEnough => {
                let snapshot = sm.get_instance_info().await;
                match self.local_sched.forward_schedule(&snapshot).await {
                    Ok(forwarded) if forwarded.status == DecisionStatus::Success => {
                        // `spec.md` §8 scenario 3: the peer took ownership of
                        // the decision/deploy/init sequence, so the local SM
                        // stays in SCHEDULING and this call returns without
                        // deploying locally; the caller's eventual terminal
                        // outcome is resolved from the peer, not here.
                        info!(%instance_id, "forwarded schedule succeeded on peer, leaving local SM in SCHEDULING");
                        return Ok(instance_id);
                    }
                    _ => {
                        sm.transition_to(
                            TransitionCtx::to(InstanceState::ScheduleFailed)
                                .with_error(api::proto::functionproxy::ErrorCode::ErrResourceNotEnough, decision.message),
                        )
                        .await?;
                        return Err(CoreError::ResourceNotEnough(draft.function));
                    }
                }
            }
        };

        // Step 8: deploy, with bounded exponential backoff on failure.
        sm.transition_to(TransitionCtx::to(InstanceState::Creating)).await?;
        self.resource_view.add(instance_id, draft.resources.clone()).await;

        let deploy_outcome = self.deploy_with_retries(&sm, &agent_id, &meta).await?;

        if sm.is_cancel_requested() {
            return self.cancel_schedule(&sm, instance_id, Some(&agent_id)).await;
        }

        // Step 9: runtime connect, retried up to `max_instance_reconnect_times`
        // within `reconnect_timeout_ms` before giving up (spec.md §4.3.1 step 9).
        sm.record_runtime_identity(
            deploy_outcome.runtime_id.clone(),
            deploy_outcome.runtime_address.clone(),
            agent_id.clone(),
        )
        .await;
        let snapshot_instance = sm.get_instance_info().await;
        let worker_client = match self.connect_with_retries(&snapshot_instance).await {
            Ok(client) => client,
            Err(e) => {
                warn!(%instance_id, error = %e, "runtime connect failed after exhausting reconnect attempts");
                sm.transition_to(TransitionCtx::to(InstanceState::Fatal).with_error(e.code(), e.to_string()))
                    .await?;
                self.resource_view.release(instance_id).await;
                return Err(CoreError::InnerCommunication("runtime connect failed".into()));
            }
        };

        if sm.is_cancel_requested() {
            self.worker_clients.remove(instance_id).await;
            return self.cancel_schedule(&sm, instance_id, Some(&agent_id)).await;
        }

        // Step 10: readiness + init-call. `ERR_REQUEST_BETWEEN_RUNTIME_BUS`
        // is redeployed up to `max_instance_redeploy_times` before giving
        // up (`spec.md` §7 "init-call ERR_REQUEST_BETWEEN_RUNTIME_BUS
        // (redeploy up to limit)", §8 scenario 4).
        let cfg = get_config();
        let mut client = worker_client;
        let mut current_agent_id = agent_id;
        let mut redeploy_attempt: u32 = 0;
        loop {
            if sm.is_cancel_requested() {
                self.worker_clients.remove(instance_id).await;
                return self.cancel_schedule(&sm, instance_id, Some(&current_agent_id)).await;
            }
            client.readiness().await?;
            let init_payload = encode_init_call(&meta);
            let init_result = client.init_call(init_payload, cfg.runtime_init_call_timeout_ms).await;

            match init_result {
                Ok(()) => {
                    // Step 11: running.
                    sm.transition_to(TransitionCtx::to(InstanceState::Running)).await?;
                    info!(%instance_id, runtime_id = %deploy_outcome.runtime_id, "instance running");
                    return Ok(instance_id);
                }
                Err(CoreError::RequestBetweenRuntimeBus(msg)) if redeploy_attempt < cfg.max_instance_redeploy_times => {
                    redeploy_attempt += 1;
                    warn!(%instance_id, attempt = redeploy_attempt, %msg, "init-call failed, redeploying");
                    self.worker_clients.remove(instance_id).await;
                    let backoff =
                        (cfg.min_deploy_interval_ms * 2u64.pow(redeploy_attempt - 1)).min(cfg.max_deploy_interval_ms);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;

                    let instance_snapshot = sm.get_instance_info().await;
                    let redeploy_outcome = match self.agent_mgr.deploy_instance(&instance_snapshot, &current_agent_id).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            sm.transition_to(TransitionCtx::to(InstanceState::Fatal).with_error(e.code(), e.to_string()))
                                .await?;
                            self.resource_view.release(instance_id).await;
                            return Err(e);
                        }
                    };
                    sm.record_runtime_identity(
                        redeploy_outcome.runtime_id.clone(),
                        redeploy_outcome.runtime_address.clone(),
                        current_agent_id.clone(),
                    )
                    .await;
                    let reconnect_snapshot = sm.get_instance_info().await;
                    client = match self.connect_with_retries(&reconnect_snapshot).await {
                        Ok(c) => c,
                        Err(e) => {
                            sm.transition_to(TransitionCtx::to(InstanceState::Fatal).with_error(e.code(), e.to_string()))
                                .await?;
                            self.resource_view.release(instance_id).await;
                            return Err(CoreError::InnerCommunication("runtime connect failed".into()));
                        }
                    };
                    continue;
                }
                Err(e) => {
                    sm.transition_to(TransitionCtx::to(InstanceState::Fatal).with_error(e.code(), e.to_string()))
                        .await?;
                    let is_monopoly = sm.get_instance_info().await.schedule_option.is_monopoly();
                    let _ = self.agent_mgr.kill_instance(instance_id, &current_agent_id, is_monopoly).await;
                    self.resource_view.release(instance_id).await;
                    return Err(e);
                }
            }
        }
    }

    /// Up to `max_instance_reconnect_times` attempts, spaced
    /// `reconnect_interval_ms` apart, bounded overall by
    /// `reconnect_timeout_ms` (`spec.md` §4.3.1 step 9).
    async fn connect_with_retries(
        &self,
        instance: &Instance,
    ) -> CoreResult<Arc<dyn crate::collaborators::WorkerClient>> {
        let cfg = get_config();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(cfg.reconnect_timeout_ms);
        let mut attempt: u32 = 0;
        loop {
            match self.worker_clients.connect(instance).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    attempt += 1;
                    if attempt > cfg.max_instance_reconnect_times || tokio::time::Instant::now() >= deadline {
                        return Err(e);
                    }
                    warn!(instance_id = %instance.instance_id, attempt, error = %e, "runtime connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(cfg.reconnect_interval_ms)).await;
                }
            }
        }
    }

    /// Short-circuits the schedule pipeline on a mid-flight cancel request
    /// (`spec.md` §4.3.7): releases the resource allocation, best-effort
    /// kills any already-deployed worker, and drives the instance to
    /// `EXITED` with `ERR_SCHEDULE_CANCELED`.
    async fn cancel_schedule(
        &self,
        sm: &Arc<crate::state_machine::InstanceStateMachine>,
        instance_id: InstanceId,
        deployed_agent_id: Option<&str>,
    ) -> CoreResult<InstanceId> {
        self.resource_view.release(instance_id).await;
        if let Some(agent_id) = deployed_agent_id {
            let _ = self.agent_mgr.kill_instance(instance_id, agent_id, false).await;
        }
        let state = sm.get_instance_state().await;
        if matches!(state, InstanceState::Scheduling | InstanceState::Creating) {
            let _ = sm.transition_to(TransitionCtx::to(InstanceState::Exiting)).await;
        }
        let _ = sm
            .transition_to(
                TransitionCtx::to(InstanceState::Exited)
                    .with_error(api::proto::functionproxy::ErrorCode::ErrScheduleCanceled, "schedule canceled"),
            )
            .await;
        Err(CoreError::ScheduleCanceled)
    }

    async fn deploy_with_retries(
        &self,
        sm: &std::sync::Arc<crate::state_machine::InstanceStateMachine>,
        agent_id: &str,
        meta: &crate::collaborators::FunctionMeta,
    ) -> CoreResult<crate::collaborators::DeployOutcome> {
        let cfg = get_config();
        let mut attempt: u32 = 0;
        loop {
            let instance = sm.get_instance_info().await;
            let _ = meta;
            match self.agent_mgr.deploy_instance(&instance, agent_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    attempt += 1;
                    if attempt > cfg.max_instance_redeploy_times {
                        sm.transition_to(
                            TransitionCtx::to(InstanceState::Fatal).with_error(e.code(), e.to_string()),
                        )
                        .await?;
                        self.resource_view.release(instance.instance_id).await;
                        return Err(e);
                    }
                    let backoff = (cfg.min_deploy_interval_ms * 2u64.pow(attempt - 1)).min(cfg.max_deploy_interval_ms);
                    warn!(instance_id = %instance.instance_id, attempt, backoff_ms = backoff, error = %e, "deploy failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    /// Entry point for `spec.md` §4.3.4's failure-driven reschedule,
    /// shared with the reschedule pipeline so both paths funnel through
    /// the same decision/deploy/connect sequence.
    pub(crate) async fn reschedule_from_decision(
        &self,
        instance_id: InstanceId,
        trigger: RescheduleTrigger,
    ) -> CoreResult<()> {
        let Some(sm) = self.control_view.get_instance(instance_id).await else {
            return Err(CoreError::InstanceNotFound(instance_id.to_string()));
        };

        self.resource_view.release(instance_id).await;
        if let Some(runtime_id) = sm.get_runtime_id().await {
            let instance = sm.get_instance_info().await;
            if let Some(agent_id) = instance.function_agent_id.clone() {
                let _ = self.agent_mgr.kill_instance(instance_id, &agent_id, false).await;
            }
            let _ = runtime_id;
        }

        let cfg = get_config();
        // Decision D1 (DESIGN.md): only an explicit pipeline failure advances
        // the reschedule round; node-startup sync reconciliation re-confirms
        // placement without counting against it.
        if trigger == RescheduleTrigger::PipelineFailure {
            sm.increment_schedule_round().await;
        }
        let schedule_times = if trigger == RescheduleTrigger::PipelineFailure {
            sm.increment_schedule_times().await
        } else {
            sm.get_instance_info().await.schedule_times
        };
        if schedule_times > cfg.max_schedule_times {
            sm.transition_to(TransitionCtx::to(InstanceState::Fatal).with_msg("max_schedule_times exceeded"))
                .await?;
            return Err(CoreError::StateMachineError);
        }

        sm.transition_to(TransitionCtx::to(InstanceState::Scheduling)).await?;
        let decision = {
            let snapshot = sm.get_instance_info().await;
            self.scheduler.decide(&snapshot).await?
        };
        match decision.status {
            DecisionStatus::Success => {
                sm.transition_to(TransitionCtx::to(InstanceState::Creating)).await?;
                Ok(())
            }
            DecisionStatus::ResourceNotEnough => {
                sm.transition_to(
                    TransitionCtx::to(InstanceState::ScheduleFailed)
                        .with_error(api::proto::functionproxy::ErrorCode::ErrResourceNotEnough, decision.message),
                )
                .await?;
                Err(CoreError::ResourceNotEnough("reschedule decision".into()))
            }
        }
    }
}

fn encode_init_call(meta: &crate::collaborators::FunctionMeta) -> Vec<u8> {
    // The init-call wire payload (code layers, env, mount/hook config) is
    // an implementation detail of the worker protocol, not modeled as a
    // proto message in this core; a minimal textual encoding is enough
    // for the in-memory fakes and for tests to assert on.
    let env = meta
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}|{}|{}", meta.function, meta.code_layers.join(","), env).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{HeartbeatOutcome, WorkerClient};
    use crate::control_view::InstanceControlView;
    use crate::fakes::{
        AlwaysScheduleFake, InMemoryFunctionAgentMgr, InMemoryLocalSchedService, InMemoryMetaStore, InMemoryObserver,
        ResourceExhaustedFake,
    };
    use crate::ratelimit::CreateRateLimiter;
    use crate::subscription::SubscriptionManager;
    use std::sync::Arc;

    struct NoopWorkerClient;

    #[async_trait::async_trait]
    impl WorkerClient for NoopWorkerClient {
        async fn readiness(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn init_call(&self, _payload: Vec<u8>, _timeout_ms: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn heartbeat(&self, _timeout_ms: u64) -> CoreResult<HeartbeatOutcome> {
            Ok(HeartbeatOutcome::Ok)
        }
        async fn shutdown(&self, _deadline_ms: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn signal(&self, _signal: i32, _payload: Vec<u8>) -> CoreResult<()> {
            Ok(())
        }
        async fn notify_result(&self, _payload: Vec<u8>) -> CoreResult<()> {
            Ok(())
        }
    }

    struct AlwaysConnectFactory;

    #[async_trait::async_trait]
    impl crate::collaborators::WorkerClientFactory for AlwaysConnectFactory {
        async fn connect(&self, _instance: &Instance) -> CoreResult<Arc<dyn WorkerClient>> {
            Ok(Arc::new(NoopWorkerClient))
        }
        async fn get(&self, _instance_id: InstanceId) -> Option<Arc<dyn WorkerClient>> {
            Some(Arc::new(NoopWorkerClient))
        }
        async fn remove(&self, _instance_id: InstanceId) {}
    }

    fn draft() -> ScheduleDraft {
        ScheduleDraft {
            request_id: RequestId::new("r1"),
            trace_id: "t1".into(),
            function: "tenant-a/fn".into(),
            tenant_id: "tenant-a".into(),
            parent_id: None,
            parent_proxy_address: None,
            resources: Resources {
                cpu_millicores: 500,
                memory_mb: 512,
                devices: vec![],
            },
            schedule_option: ScheduleOption::default(),
            create_options: CreateOptions::default(),
        }
    }

    async fn controller_with(scheduler: Arc<dyn crate::collaborators::Scheduler>) -> Arc<InstanceController> {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store.clone());
        let observer = Arc::new(InMemoryObserver::default());
        observer.functions.lock().unwrap().insert(
            "tenant-a/fn".into(),
            crate::collaborators::FunctionMeta {
                function: "tenant-a/fn".into(),
                code_layers: vec!["layer1".into()],
                env: vec![],
            },
        );
        let worker_clients = Arc::new(AlwaysConnectFactory);
        let rate_limiter = Arc::new(CreateRateLimiter::new(10, 1));
        let subscriptions = SubscriptionManager::new(view.clone(), worker_clients.clone());

        InstanceController::new(
            "node-0",
            view,
            store,
            scheduler,
            Arc::new(InMemoryFunctionAgentMgr::default()),
            observer,
            Arc::new(InMemoryLocalSchedService::default()),
            worker_clients,
            rate_limiter,
            subscriptions,
        )
    }

    #[tokio::test]
    async fn happy_path_reaches_running() {
        let scheduler = Arc::new(AlwaysScheduleFake { agent_id: "agent-1".into() });
        let controller = controller_with(scheduler).await;

        let instance_id = controller.schedule(draft()).await.unwrap();
        let sm = controller.control_view.get_instance(instance_id).await.unwrap();
        assert_eq!(sm.get_instance_state().await, InstanceState::Running);
    }

    #[tokio::test]
    async fn missing_function_meta_is_rejected() {
        let scheduler = Arc::new(AlwaysScheduleFake { agent_id: "agent-1".into() });
        let controller = controller_with(scheduler).await;
        let mut d = draft();
        d.function = "tenant-a/does-not-exist".into();

        let err = controller.schedule(d).await.unwrap_err();
        assert!(matches!(err, CoreError::FunctionMetaNotFound(_)));
    }

    #[tokio::test]
    async fn resource_exhausted_with_no_peer_transitions_schedule_failed() {
        let scheduler = Arc::new(ResourceExhaustedFake);
        let controller = controller_with(scheduler).await;

        let err = controller.schedule(draft()).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceNotEnough(_)));
    }

    #[tokio::test]
    async fn duplicate_request_returns_same_instance_id() {
        let scheduler = Arc::new(AlwaysScheduleFake { agent_id: "agent-1".into() });
        let controller = controller_with(scheduler).await;
        let d = draft();

        let first = controller.schedule(d.clone()).await.unwrap();
        let second = controller.schedule(d).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rate_limited_tenant_is_rejected_after_bucket_exhausted() {
        let scheduler = Arc::new(AlwaysScheduleFake { agent_id: "agent-1".into() });
        let controller = controller_with(scheduler).await;
        // Drain the bucket directly (capacity 10) then confirm the next schedule is refused.
        for _ in 0..10 {
            assert!(controller.rate_limiter.try_admit("tenant-a").await);
        }
        let mut d = draft();
        d.request_id = RequestId::new("r-rate-limited");
        let err = controller.schedule(d).await.unwrap_err();
        assert_eq!(err, CoreError::CreateRateLimit);
    }

    #[tokio::test]
    async fn system_tenant_bypasses_rate_limiter() {
        let scheduler = Arc::new(AlwaysScheduleFake { agent_id: "agent-1".into() });
        let controller = controller_with(scheduler).await;
        for i in 0..20 {
            assert!(controller.rate_limiter.try_admit(SYSTEM_TENANT).await, "iteration {i}");
        }
    }

    #[tokio::test]
    async fn non_numeric_recover_retry_timeout_is_param_invalid() {
        let scheduler = Arc::new(AlwaysScheduleFake { agent_id: "agent-1".into() });
        let controller = controller_with(scheduler).await;
        let mut d = draft();
        d.create_options
            .0
            .insert(CreateOptions::RECOVER_RETRY_TIMEOUT_KEY.into(), "not-a-number".into());

        let err = controller.schedule(d).await.unwrap_err();
        assert!(matches!(err, CoreError::ParamInvalid(_)));
    }

    /// `spec.md` §8 scenario 3: when the first-scheduler node forwards a
    /// `RESOURCE_NOT_ENOUGH` decision and the peer reports success, the
    /// local SM stays in `SCHEDULING` instead of deploying locally.
    #[tokio::test]
    async fn forwarded_schedule_success_leaves_local_sm_in_scheduling() {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store.clone());
        let observer = Arc::new(InMemoryObserver::default());
        observer.functions.lock().unwrap().insert(
            "tenant-a/fn".into(),
            crate::collaborators::FunctionMeta {
                function: "tenant-a/fn".into(),
                code_layers: vec!["layer1".into()],
                env: vec![],
            },
        );
        let worker_clients = Arc::new(AlwaysConnectFactory);
        let rate_limiter = Arc::new(CreateRateLimiter::new(10, 1));
        let subscriptions = SubscriptionManager::new(view.clone(), worker_clients.clone());
        let local_sched = Arc::new(InMemoryLocalSchedService::default());
        *local_sched.forward_schedule_decision.lock().unwrap() = Some(crate::collaborators::Decision {
            status: crate::collaborators::DecisionStatus::Success,
            agent_id: Some("peer-agent".into()),
            message: String::new(),
        });

        let controller = InstanceController::new(
            "node-0",
            view,
            store,
            Arc::new(ResourceExhaustedFake),
            Arc::new(InMemoryFunctionAgentMgr::default()),
            observer,
            local_sched,
            worker_clients,
            rate_limiter,
            subscriptions,
        );

        let instance_id = controller.schedule(draft()).await.unwrap();
        let sm = controller.control_view.get_instance(instance_id).await.unwrap();
        assert_eq!(sm.get_instance_state().await, InstanceState::Scheduling);
    }

    struct FailingInitWorkerClient;

    #[async_trait::async_trait]
    impl WorkerClient for FailingInitWorkerClient {
        async fn readiness(&self) -> CoreResult<()> {
            Ok(())
        }
        async fn init_call(&self, _payload: Vec<u8>, _timeout_ms: u64) -> CoreResult<()> {
            Err(CoreError::RequestBetweenRuntimeBus("runtime bus unreachable".into()))
        }
        async fn heartbeat(&self, _timeout_ms: u64) -> CoreResult<HeartbeatOutcome> {
            Ok(HeartbeatOutcome::Ok)
        }
        async fn shutdown(&self, _deadline_ms: u64) -> CoreResult<()> {
            Ok(())
        }
        async fn signal(&self, _signal: i32, _payload: Vec<u8>) -> CoreResult<()> {
            Ok(())
        }
        async fn notify_result(&self, _payload: Vec<u8>) -> CoreResult<()> {
            Ok(())
        }
    }

    struct AlwaysConnectFailingInitFactory;

    #[async_trait::async_trait]
    impl crate::collaborators::WorkerClientFactory for AlwaysConnectFailingInitFactory {
        async fn connect(&self, _instance: &Instance) -> CoreResult<Arc<dyn WorkerClient>> {
            Ok(Arc::new(FailingInitWorkerClient))
        }
        async fn get(&self, _instance_id: InstanceId) -> Option<Arc<dyn WorkerClient>> {
            Some(Arc::new(FailingInitWorkerClient))
        }
        async fn remove(&self, _instance_id: InstanceId) {}
    }

    /// `spec.md` §8 scenario 4: init-call failing with
    /// `ERR_REQUEST_BETWEEN_RUNTIME_BUS` on every redeploy attempt
    /// exhausts `max_instance_redeploy_times` and lands on `FATAL`, with
    /// the worker killed using the monopoly flag mirrored from the
    /// schedule policy.
    #[tokio::test]
    async fn init_call_failure_exhausts_retries_and_kills_with_monopoly_flag() {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store.clone());
        let observer = Arc::new(InMemoryObserver::default());
        observer.functions.lock().unwrap().insert(
            "tenant-a/fn".into(),
            crate::collaborators::FunctionMeta {
                function: "tenant-a/fn".into(),
                code_layers: vec!["layer1".into()],
                env: vec![],
            },
        );
        let worker_clients = Arc::new(AlwaysConnectFailingInitFactory);
        let rate_limiter = Arc::new(CreateRateLimiter::new(10, 1));
        let subscriptions = SubscriptionManager::new(view.clone(), worker_clients.clone());
        let agent_mgr = Arc::new(InMemoryFunctionAgentMgr::default());

        let controller = InstanceController::new(
            "node-0",
            view,
            store,
            Arc::new(AlwaysScheduleFake { agent_id: "agent-1".into() }),
            agent_mgr.clone(),
            observer,
            Arc::new(InMemoryLocalSchedService::default()),
            worker_clients,
            rate_limiter,
            subscriptions,
        );

        let mut d = draft();
        d.schedule_option.policy_name = "monopoly".into();

        let err = controller.schedule(d).await.unwrap_err();
        assert!(matches!(err, CoreError::RequestBetweenRuntimeBus(_)));

        let killed = agent_mgr.killed.lock().unwrap();
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0].1, "agent-1");
        assert!(killed[0].2, "kill must mirror the monopoly schedule policy");
    }
}
