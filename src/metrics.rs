// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process metrics, threaded through every component via `Arc` the way the
//! teacher threads its own metrics struct through `Core`/`CommitObserver`.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry,
};

pub struct StoreMetrics {
    pub appends_total: IntCounter,
    pub append_conflicts_total: IntCounter,
    pub commit_latency_seconds: Histogram,
    pub active_live_subscriptions: IntGauge,
    pub active_catchup_subscriptions: IntGauge,
    pub subscription_drops_total: IntCounterVec,
    pub persistent_inflight: IntGaugeVec,
    pub persistent_parked_total: IntCounterVec,
    pub ptable_merge_duration_seconds: Histogram,
    pub ptable_count: IntGauge,
    pub reader_cache_hits_total: IntCounter,
    pub reader_cache_misses_total: IntCounter,
}

impl StoreMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            appends_total: register_int_counter_with_registry!(
                "chronicle_appends_total",
                "Total append batches accepted",
                registry
            )
            .unwrap(),
            append_conflicts_total: register_int_counter_with_registry!(
                "chronicle_append_conflicts_total",
                "Total append batches rejected for expected-version conflicts",
                registry
            )
            .unwrap(),
            commit_latency_seconds: register_histogram_with_registry!(
                "chronicle_commit_latency_seconds",
                "Latency from append() call to commit bus publish",
                registry
            )
            .unwrap(),
            active_live_subscriptions: register_int_gauge_with_registry!(
                "chronicle_active_live_subscriptions",
                "Currently connected live subscriptions",
                registry
            )
            .unwrap(),
            active_catchup_subscriptions: register_int_gauge_with_registry!(
                "chronicle_active_catchup_subscriptions",
                "Currently connected catch-up subscriptions",
                registry
            )
            .unwrap(),
            subscription_drops_total: register_int_counter_vec_with_registry!(
                "chronicle_subscription_drops_total",
                "Subscription drops by reason",
                &["reason"],
                registry
            )
            .unwrap(),
            persistent_inflight: register_int_gauge_vec_with_registry!(
                "chronicle_persistent_inflight",
                "In-flight events per persistent subscription group",
                &["stream", "group"],
                registry
            )
            .unwrap(),
            persistent_parked_total: register_int_counter_vec_with_registry!(
                "chronicle_persistent_parked_total",
                "Events moved to the park buffer per group",
                &["stream", "group"],
                registry
            )
            .unwrap(),
            ptable_merge_duration_seconds: register_histogram_with_registry!(
                "chronicle_ptable_merge_duration_seconds",
                "Duration of background PTable merges",
                registry
            )
            .unwrap(),
            ptable_count: register_int_gauge_with_registry!(
                "chronicle_ptable_count",
                "Number of live PTables in the manifest",
                registry
            )
            .unwrap(),
            reader_cache_hits_total: register_int_counter_with_registry!(
                "chronicle_reader_cache_hits_total",
                "Decoded-record cache hits in the Reader",
                registry
            )
            .unwrap(),
            reader_cache_misses_total: register_int_counter_with_registry!(
                "chronicle_reader_cache_misses_total",
                "Decoded-record cache misses in the Reader",
                registry
            )
            .unwrap(),
        }
    }

    pub fn new_for_test() -> Self {
        Self::new(&Registry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_against_fresh_registry() {
        let metrics = StoreMetrics::new_for_test();
        metrics.appends_total.inc();
        assert_eq!(metrics.appends_total.get(), 1);
    }
}
