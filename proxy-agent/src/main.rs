/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Function Proxy node entry point.
//!
//! Sets up the asynchronous runtime, wires the instance-lifecycle core's
//! collaborators to their real or boundary-stub implementations,
//! reconciles node-startup state, and launches the abnormal-processor
//! poll loop and the gRPC server concurrently. Grounded on
//! `player/statemanager/src/main.rs`'s `launch_manager`/
//! `initialize_grpc_server`-plus-`tokio::join!` shape, with
//! `tracing::{info,warn,error}!` in place of the source's `println!`/
//! `eprintln!` (`common::logging`'s documented rationale).

mod boundary;
mod convert;
mod grpc;
mod meta_store;
mod peer_client;

use api::proto::functionproxy::function_proxy_server::FunctionProxyServer;
use boundary::{UnconfiguredFunctionAgentMgr, UnconfiguredObserver, UnconfiguredScheduler, UnconfiguredWorkerClientFactory};
use meta_store::EtcdMetaStore;
use peer_client::GrpcLocalSchedService;
use proxy_core::abnormal::{AbnormalProcessor, SelfKillRaiser};
use proxy_core::control_view::InstanceControlView;
use proxy_core::controller::InstanceController;
use proxy_core::ratelimit::CreateRateLimiter;
use proxy_core::subscription::SubscriptionManager;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use tracing::{error, info, warn};

/// Runs the abnormal-processor poll loop forever: every tick, checks the
/// abnormal key. `AbnormalProcessor::check_and_fence` itself marks the
/// controller abnormal the moment fencing starts (before draining), so
/// this loop only needs to know when the whole sequence has finished
/// (`spec.md` §4.5; `AbnormalProcessor::check_and_fence`'s own doc
/// comment names this crate's poll loop as the intended caller).
async fn run_abnormal_poll_loop(processor: Arc<AbnormalProcessor>, interval: Duration) {
    loop {
        match processor.check_and_fence().await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "abnormal-processor poll failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn serve_grpc(controller: Arc<InstanceController>, addr: std::net::SocketAddr) {
    let service = grpc::ProxyService::new(controller);
    info!(%addr, "function proxy gRPC server starting");
    if let Err(e) = Server::builder().add_service(FunctionProxyServer::new(service)).serve(addr).await {
        error!(error = %e, "function proxy gRPC server stopped with error");
    }
}

#[tokio::main]
async fn main() {
    common::logging::init();
    let cfg = common::get_config();
    info!(node_id = %cfg.node_id, cluster_id = %cfg.cluster_id, "function proxy node starting");

    let meta_store: Arc<dyn proxy_core::collaborators::MetaStore> = Arc::new(EtcdMetaStore::new(cfg.meta_store_addr.clone()));
    let control_view = InstanceControlView::new(meta_store.clone());

    // Register this node's gRPC address so peers can resolve it for
    // `ForwardKill`/`ForwardCallResult` (`peer_client.rs::resolve_addr`).
    let self_addr_key = format!("/{}/nodes/{}/addr", cfg.cluster_id, cfg.node_id);
    if let Err(e) = meta_store
        .commit(proxy_core::collaborators::TxnRequest {
            compare_mod_revision: None,
            puts: vec![proxy_core::collaborators::PutOp {
                key: self_addr_key,
                value: cfg.grpc_listen_addr.clone().into_bytes(),
            }],
        })
        .await
    {
        warn!(error = %e, "failed to register node address in meta store");
    }

    let local_sched = Arc::new(GrpcLocalSchedService::new(cfg.cluster_id.clone(), meta_store.clone()));
    let rate_limiter = Arc::new(CreateRateLimiter::new(cfg.rate_limit_capacity, cfg.rate_limit_refill_per_sec));
    let worker_clients = Arc::new(UnconfiguredWorkerClientFactory);
    let subscriptions = SubscriptionManager::new(control_view.clone(), worker_clients.clone());

    let controller = InstanceController::new(
        cfg.node_id.clone(),
        control_view.clone(),
        meta_store.clone(),
        Arc::new(UnconfiguredScheduler),
        Arc::new(UnconfiguredFunctionAgentMgr),
        Arc::new(UnconfiguredObserver),
        local_sched,
        worker_clients,
        rate_limiter,
        subscriptions,
    );

    controller.sync_on_startup().await;

    let abnormal = Arc::new(AbnormalProcessor::new(
        cfg.cluster_id.clone(),
        cfg.node_id.clone(),
        meta_store,
        control_view,
        Arc::new(UnconfiguredFunctionAgentMgr),
        controller.clone(),
        Arc::new(SelfKillRaiser),
    ));
    let poll_interval = Duration::from_millis(cfg.abnormal_poll_interval_ms);

    let addr = match cfg.grpc_listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %cfg.grpc_listen_addr, error = %e, "invalid grpc_listen_addr, cannot start");
            return;
        }
    };

    tokio::join!(
        run_abnormal_poll_loop(abnormal, poll_interval),
        serve_grpc(controller, addr)
    );

    info!("function proxy node stopped");
}
