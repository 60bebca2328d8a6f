/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Per-tenant token bucket guarding instance creation (`spec.md` §4.5
//! "Create rate limiting"). System-tenant (`spec.md` §3 `SYSTEM_TENANT`)
//! requests bypass the bucket entirely.
//!
//! Shaped after `ediblackk-mylm`'s `rate_limiter.rs` token-accounting
//! style (per-key state behind a lock, refill computed from elapsed wall
//! time rather than a background ticker), simplified to the single
//! capacity/refill-rate pair `spec.md` calls for instead of that file's
//! multi-tier RPM/TPM config.

use crate::types::SYSTEM_TENANT;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One bucket per tenant, shared capacity/refill-rate for all tenants.
pub struct CreateRateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl CreateRateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to consume one token for `tenant_id`'s create request.
    /// Returns `true` if admitted. System-tenant requests always pass.
    pub async fn try_admit(&self, tenant_id: &str) -> bool {
        if tenant_id == SYSTEM_TENANT {
            return true;
        }
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(tenant_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
