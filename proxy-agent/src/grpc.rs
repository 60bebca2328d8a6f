/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! `FunctionProxy` gRPC service implementation: translates wire
//! requests/responses to and from `InstanceController`/`SubscriptionManager`
//! calls. Structurally grounded on
//! `player/statemanager/src/grpc/receiver.rs`'s "one struct, one
//! `#[tonic::async_trait] impl` of the generated service trait" shape,
//! generalized from "forward to an engine over an mpsc channel" to
//! "call directly into the owned `InstanceController`", since this core
//! has no separate engine task to hand work off to.

use crate::convert::{create_options_from_wire, optional_instance_id, optional_string, resources_from_wire, schedule_option_from_wire};
use api::proto::functionproxy::function_proxy_server::FunctionProxy;
use api::proto::functionproxy::{
    ForwardCallResultRequest, ForwardCallResultResponse, ForwardKillRequest, ForwardKillResponse, KillRequest,
    KillResponse, ScheduleRequest, ScheduleResponse, SubscribeRequest, UnsubscribeRequest,
};
use api::proto::functionproxy::{subscription_payload, unsubscription_payload};
use common::{InstanceId, RequestId};
use proxy_core::controller::schedule::ScheduleDraft;
use proxy_core::errors::CoreError;
use proxy_core::InstanceController;
use std::str::FromStr;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

pub struct ProxyService {
    controller: Arc<InstanceController>,
}

impl ProxyService {
    pub fn new(controller: Arc<InstanceController>) -> Self {
        Self { controller }
    }
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, Status> {
    InstanceId::from_str(raw).map_err(|e| Status::invalid_argument(format!("invalid instance id {raw:?}: {e}")))
}

#[tonic::async_trait]
impl FunctionProxy for ProxyService {
    async fn schedule(&self, request: Request<ScheduleRequest>) -> Result<Response<ScheduleResponse>, Status> {
        let req = request.into_inner();
        let instance = req.instance.unwrap_or_default();

        let draft = ScheduleDraft {
            request_id: RequestId::new(req.request_id.clone()),
            trace_id: req.trace_id,
            function: instance.function,
            tenant_id: instance.tenant_id,
            parent_id: optional_instance_id(&instance.parent_id)?,
            parent_proxy_address: optional_string(&instance.parent_proxy_address),
            resources: resources_from_wire(instance.resources),
            schedule_option: schedule_option_from_wire(instance.schedule_option),
            create_options: create_options_from_wire(instance.create_options),
        };

        match self.controller.schedule(draft).await {
            Ok(instance_id) => {
                info!(request_id = %req.request_id, %instance_id, "scheduled");
                Ok(Response::new(ScheduleResponse {
                    request_id: req.request_id,
                    code: api::proto::functionproxy::ErrorCode::Success as i32,
                    message: String::new(),
                    instance_id: instance_id.to_string(),
                }))
            }
            Err(e) => {
                warn!(request_id = %req.request_id, error = %e, "schedule failed");
                Ok(Response::new(ScheduleResponse {
                    request_id: req.request_id,
                    code: e.code() as i32,
                    message: e.to_string(),
                    instance_id: String::new(),
                }))
            }
        }
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<KillResponse>, Status> {
        let req = request.into_inner();
        let target = parse_instance_id(&req.instance_id)?;

        // A direct `Kill` call carries no caller identity or dedup key on
        // the wire; the target is its own source and the empty request id
        // skips the in-flight dedup map (`InstanceController::kill`).
        let result = self.controller.kill(target, String::new(), target, req.signal, req.payload).await;
        Ok(Response::new(core_result_to_kill_response(result)))
    }

    async fn forward_kill(&self, request: Request<ForwardKillRequest>) -> Result<Response<ForwardKillResponse>, Status> {
        let req = request.into_inner();
        let src_instance = parse_instance_id(&req.src_instance)?;
        let inner = req.req.ok_or_else(|| Status::invalid_argument("forward kill missing inner request"))?;
        let target = parse_instance_id(&inner.instance_id)?;

        let result = self
            .controller
            .kill(src_instance, req.instance_request_id, target, inner.signal, inner.payload)
            .await;
        Ok(Response::new(ForwardKillResponse {
            code: result_code(&result) as i32,
            message: result_message(&result),
        }))
    }

    async fn forward_call_result(
        &self,
        request: Request<ForwardCallResultRequest>,
    ) -> Result<Response<ForwardCallResultResponse>, Status> {
        let req = request.into_inner();
        let instance_id = parse_instance_id(&req.instance_id)?;
        let payload = req.req.map(|r| r.payload).unwrap_or_default();

        let result = self
            .controller
            .forward_call_result(String::new(), instance_id, req.ready_instance, payload)
            .await;
        Ok(Response::new(ForwardCallResultResponse {
            code: result_code(&result) as i32,
        }))
    }

    async fn subscribe(&self, request: Request<SubscribeRequest>) -> Result<Response<KillResponse>, Status> {
        let req = request.into_inner();
        let src = parse_instance_id(&req.src_instance_id)?;

        let result = match req.payload.and_then(|p| p.kind) {
            Some(subscription_payload::Kind::InstanceTermination(t)) => {
                let target = parse_instance_id(&t.instance_id)?;
                self.controller.subscribe_termination(src, target).await
            }
            Some(subscription_payload::Kind::FunctionMaster(_)) => self.controller.subscribe_master(src).await,
            None => Err(CoreError::ParamInvalid("subscribe request missing payload".into())),
        };
        Ok(Response::new(core_result_to_kill_response(result)))
    }

    async fn unsubscribe(&self, request: Request<UnsubscribeRequest>) -> Result<Response<KillResponse>, Status> {
        let req = request.into_inner();
        let src = parse_instance_id(&req.src_instance_id)?;

        let result = match req.payload.and_then(|p| p.kind) {
            Some(unsubscription_payload::Kind::InstanceTermination(t)) => {
                let target = parse_instance_id(&t.instance_id)?;
                self.controller.unsubscribe_termination(src, target).await
            }
            Some(unsubscription_payload::Kind::FunctionMaster(_)) => self.controller.unsubscribe_master(src).await,
            None => Err(CoreError::ParamInvalid("unsubscribe request missing payload".into())),
        };
        Ok(Response::new(core_result_to_kill_response(result)))
    }
}

fn result_code(result: &proxy_core::errors::CoreResult<()>) -> api::proto::functionproxy::ErrorCode {
    match result {
        Ok(()) => api::proto::functionproxy::ErrorCode::Success,
        Err(e) => e.code(),
    }
}

fn result_message(result: &proxy_core::errors::CoreResult<()>) -> String {
    match result {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

fn core_result_to_kill_response(result: proxy_core::errors::CoreResult<()>) -> KillResponse {
    KillResponse {
        code: result_code(&result) as i32,
        message: result_message(&result),
    }
}
