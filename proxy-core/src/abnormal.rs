/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Abnormal Processor (`spec.md` §4.5): watches
//! `/<cluster>/abnormal/localscheduler/<node_id>` and self-fences this
//! node when the key is present, draining local instances before raising
//! a process-level shutdown signal.
//!
//! Grounded on `original_source/.../abnormal_processor/
//! abnormal_processor_test.cpp`'s `AbnormalProcessorActor`: register a
//! watch, on an event (or on startup `Get` finding the key already set)
//! mark the control view and the function-agent-manager abnormal, poll
//! `Observer::enumerate_local_instances` until empty, delete the key,
//! raise signal 9 on self. The polling/raise shape is reused verbatim;
//! the watch mechanism itself is collapsed into a caller-driven poll
//! (`check_and_fence`) since this crate's `MetaStore` trait exposes no
//! `Watch` primitive — `proxy-agent` is expected to call `check_and_fence`
//! from its own poll loop.

use crate::collaborators::{FunctionAgentMgr, MetaStore};
use crate::control_view::InstanceControlView;
use crate::errors::CoreResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Abstracts `raise(2)` so tests can observe the final signal without
/// actually terminating the test process, mirroring the source's
/// `RaiseWrapper`/`MockRaiseWrapper` split.
pub trait ProcessRaiser: Send + Sync {
    fn raise(&self, signal: i32);
}

/// Abstracts "mark this node abnormal" so the abnormal processor depends
/// only on the one operation it drives, not on the whole orchestration
/// engine's type (`spec.md` §4.5 "mark IC ... as abnormal"). Implemented
/// by `InstanceController`.
pub trait AbnormalSink: Send + Sync {
    fn mark_abnormal(&self);
}

/// Raises `SIGKILL` on the current process, matching the source's
/// observed `Raise(9)` behavior.
pub struct SelfKillRaiser;

impl ProcessRaiser for SelfKillRaiser {
    fn raise(&self, signal: i32) {
        // SAFETY: libc::raise with a process-terminating signal on self;
        // no shared state is mutated by this call.
        unsafe {
            libc::raise(signal);
        }
    }
}

fn abnormal_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/abnormal/localscheduler/{node_id}")
}

pub struct AbnormalProcessor {
    cluster: String,
    node_id: String,
    meta_store: Arc<dyn MetaStore>,
    control_view: Arc<InstanceControlView>,
    agent_mgr: Arc<dyn FunctionAgentMgr>,
    sink: Arc<dyn AbnormalSink>,
    raiser: Arc<dyn ProcessRaiser>,
    fenced: AtomicBool,
    poll_interval: Duration,
}

impl AbnormalProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: impl Into<String>,
        node_id: impl Into<String>,
        meta_store: Arc<dyn MetaStore>,
        control_view: Arc<InstanceControlView>,
        agent_mgr: Arc<dyn FunctionAgentMgr>,
        sink: Arc<dyn AbnormalSink>,
        raiser: Arc<dyn ProcessRaiser>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            node_id: node_id.into(),
            meta_store,
            control_view,
            agent_mgr,
            sink,
            raiser,
            fenced: AtomicBool::new(false),
            poll_interval: Duration::from_millis(200),
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    /// Called once at startup and on every watch/poll tick for the
    /// abnormal key. If the key is present and this node hasn't already
    /// started fencing, drives the full self-fence sequence.
    pub async fn check_and_fence(&self) -> CoreResult<bool> {
        if self.fenced.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let key = abnormal_key(&self.cluster, &self.node_id);
        let present = self.meta_store.get(&key).await?.is_some();
        if !present {
            return Ok(false);
        }
        self.fence(&key).await?;
        Ok(true)
    }

    async fn fence(&self, key: &str) -> CoreResult<()> {
        self.fenced.store(true, Ordering::SeqCst);
        warn!(node_id = %self.node_id, "self-fencing: abnormal key observed, rejecting new schedules");

        // Mark the node abnormal before draining (`spec.md` §4.5): new
        // schedules must stop the instant fencing starts, not once the
        // drain below has already emptied the control view.
        self.sink.mark_abnormal();
        self.agent_mgr.is_func_agent_recovering(&self.node_id).await;

        loop {
            let remaining = self.control_view.instance_count().await;
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        self.meta_store.delete(key).await?;
        info!(node_id = %self.node_id, "self-fence drain complete, raising shutdown signal");
        self.raiser.raise(9);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::PutOp;
    use crate::fakes::{InMemoryFunctionAgentMgr, InMemoryMetaStore};
    use crate::state::InstanceState;
    use crate::state_machine::TransitionCtx;
    use crate::types::{CreateOptions, Instance, InstanceStatus, Resources, ScheduleOption};
    use common::{InstanceId, RequestId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRaiser {
        signals: Mutex<Vec<i32>>,
    }

    impl ProcessRaiser for RecordingRaiser {
        fn raise(&self, signal: i32) {
            self.signals.lock().unwrap().push(signal);
        }
    }

    #[derive(Default)]
    struct RecordingAbnormalSink {
        marked: AtomicBool,
    }

    impl AbnormalSink for RecordingAbnormalSink {
        fn mark_abnormal(&self) {
            self.marked.store(true, Ordering::SeqCst);
        }
    }

    fn sample_instance(request_id: &str) -> Instance {
        Instance {
            instance_id: InstanceId::new(),
            request_id: RequestId::new(request_id),
            function: "0/sys.fn".into(),
            tenant_id: "tenant-a".into(),
            parent_id: None,
            parent_proxy_address: None,
            owner_proxy_id: "node-0".into(),
            resources: Resources::default(),
            schedule_option: ScheduleOption::default(),
            create_options: CreateOptions::default(),
            state: InstanceState::New,
            status: InstanceStatus::default(),
            version: 0,
            runtime_id: None,
            runtime_address: None,
            function_agent_id: None,
            schedule_round: 0,
            schedule_times: 0,
            deploy_times: 0,
            is_low_reliability: false,
        }
    }

    #[tokio::test]
    async fn absent_key_does_not_fence() {
        let store = Arc::new(InMemoryMetaStore::new());
        let view = InstanceControlView::new(store.clone());
        let agent_mgr = Arc::new(InMemoryFunctionAgentMgr::default());
        let sink = Arc::new(RecordingAbnormalSink::default());
        let raiser = Arc::new(RecordingRaiser::default());
        let processor = AbnormalProcessor::new("cluster", "node-0", store, view, agent_mgr, sink.clone(), raiser.clone());

        assert!(!processor.check_and_fence().await.unwrap());
        assert!(!processor.is_fenced());
        assert!(raiser.signals.lock().unwrap().is_empty());
        assert!(!sink.marked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn present_key_drains_then_raises_and_deletes_key() {
        let store = Arc::new(InMemoryMetaStore::new());
        let key = abnormal_key("cluster", "node-0");
        store
            .commit(crate::collaborators::TxnRequest {
                compare_mod_revision: None,
                puts: vec![PutOp {
                    key: key.clone(),
                    value: vec![1],
                }],
            })
            .await
            .unwrap();

        let view = InstanceControlView::new(store.clone());
        let agent_mgr = Arc::new(InMemoryFunctionAgentMgr::default());
        let sink = Arc::new(RecordingAbnormalSink::default());
        let raiser = Arc::new(RecordingRaiser::default());
        let processor =
            AbnormalProcessor::new("cluster", "node-0", store.clone(), view, agent_mgr, sink.clone(), raiser.clone())
                .with_poll_interval(Duration::from_millis(1));

        assert!(processor.check_and_fence().await.unwrap());
        assert!(processor.is_fenced());
        assert!(sink.marked.load(Ordering::SeqCst));
        assert_eq!(raiser.signals.lock().unwrap().as_slice(), &[9]);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_calls_after_fencing_are_idempotent() {
        let store = Arc::new(InMemoryMetaStore::new());
        let key = abnormal_key("cluster", "node-0");
        store
            .commit(crate::collaborators::TxnRequest {
                compare_mod_revision: None,
                puts: vec![PutOp {
                    key: key.clone(),
                    value: vec![1],
                }],
            })
            .await
            .unwrap();
        let view = InstanceControlView::new(store.clone());
        let agent_mgr = Arc::new(InMemoryFunctionAgentMgr::default());
        let sink = Arc::new(RecordingAbnormalSink::default());
        let raiser = Arc::new(RecordingRaiser::default());
        let processor = AbnormalProcessor::new("cluster", "node-0", store, view, agent_mgr, sink, raiser.clone())
            .with_poll_interval(Duration::from_millis(1));

        processor.check_and_fence().await.unwrap();
        processor.check_and_fence().await.unwrap();
        assert_eq!(raiser.signals.lock().unwrap().len(), 1);
    }

    /// `spec.md` §4.5: the node must stop accepting new schedules the
    /// instant fencing starts, not once the drain has already emptied the
    /// control view (the ordering the maintainer flagged as inverted).
    #[tokio::test]
    async fn mark_abnormal_happens_before_drain_completes() {
        let store = Arc::new(InMemoryMetaStore::new());
        let key = abnormal_key("cluster", "node-0");
        store
            .commit(crate::collaborators::TxnRequest {
                compare_mod_revision: None,
                puts: vec![PutOp {
                    key: key.clone(),
                    value: vec![1],
                }],
            })
            .await
            .unwrap();

        let view = InstanceControlView::new(store.clone());
        let sm = view.new_instance(sample_instance("r1")).await.unwrap();
        sm.transition_to(TransitionCtx::to(InstanceState::Scheduling)).await.unwrap();
        assert_eq!(view.instance_count().await, 1);

        let agent_mgr = Arc::new(InMemoryFunctionAgentMgr::default());
        let sink = Arc::new(RecordingAbnormalSink::default());
        let raiser = Arc::new(RecordingRaiser::default());
        let processor =
            AbnormalProcessor::new("cluster", "node-0", store, view.clone(), agent_mgr, sink.clone(), raiser)
                .with_poll_interval(Duration::from_millis(5));

        let processor_for_task = Arc::new(processor);
        let fencing = processor_for_task.clone();
        let handle = tokio::spawn(async move { fencing.check_and_fence().await });

        // Give fence() a chance to run past the "mark abnormal" step while
        // the still-undrained instance keeps the poll loop spinning.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.marked.load(Ordering::SeqCst));
        assert_eq!(view.instance_count().await, 1);

        // Unblock the drain so the spawned task completes.
        sm.transition_to(TransitionCtx::to(InstanceState::Exiting)).await.unwrap();
        sm.transition_to(TransitionCtx::to(InstanceState::Exited)).await.unwrap();
        assert!(handle.await.unwrap().unwrap());
    }
}
