/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! `MetaStore` over a real etcd cluster.
//!
//! Connects fresh on every call rather than holding a persistent client,
//! same as `common::etcd`'s `get`/`put`/`delete` helpers in the source:
//! cheap enough at this node's request volume and avoids juggling a
//! `&mut` client handle behind the `Send + Sync` trait object the core
//! expects.

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, TxnOp};
use proxy_core::collaborators::{MetaStore, PutOp, TxnRequest, TxnResult};
use proxy_core::{CoreError, CoreResult};

pub struct EtcdMetaStore {
    endpoint: String,
}

impl EtcdMetaStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }

    async fn connect(&self) -> CoreResult<Client> {
        Client::connect([self.endpoint.as_str()], None)
            .await
            .map_err(|e| CoreError::MetaStoreOperation(format!("etcd connect failed: {e}")))
    }
}

#[async_trait]
impl MetaStore for EtcdMetaStore {
    async fn commit(&self, txn: TxnRequest) -> CoreResult<TxnResult> {
        let mut client = self.connect().await?;

        let compares = match &txn.compare_mod_revision {
            // `None` means "must not yet exist"; etcd reports mod_revision 0
            // for an absent key.
            None => vec![],
            Some((key, rev)) => vec![Compare::mod_revision(key.as_str(), CompareOp::Equal, *rev as i64)],
        };
        let puts: Vec<TxnOp> = txn
            .puts
            .iter()
            .map(|PutOp { key, value }| TxnOp::put(key.as_str(), value.clone(), None))
            .collect();

        let etcd_txn = etcd_client::Txn::new().when(compares).and_then(puts);
        let resp = client
            .txn(etcd_txn)
            .await
            .map_err(|e| CoreError::MetaStoreOperation(format!("etcd txn failed: {e}")))?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        Ok(TxnResult {
            success: resp.succeeded(),
            new_mod_revision: revision.max(0) as u64,
        })
    }

    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let mut client = self.connect().await?;
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| CoreError::MetaStoreOperation(format!("etcd get failed: {e}")))?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut client = self.connect().await?;
        client
            .delete(key, None)
            .await
            .map_err(|e| CoreError::MetaStoreOperation(format!("etcd delete failed: {e}")))?;
        Ok(())
    }
}
