//! 存储模块集成测试
//!
//! 多个 Governor 实例共享同一个存储时，计数和全局聚合在实例间一致

use crate::common::*;
use antiflood::prelude::*;
use std::sync::Arc;

fn instance(harness: &Harness, config: AntifloodConfig) -> Governor {
    GovernorBuilder::new(config)
        .clock(Arc::new(harness.clock.clone()))
        .store(harness.storage.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_instances_share_counters() {
    let harness = Harness::new(local_config(4));
    let second = instance(&harness, local_config(4));
    let ctx = request("192.0.2.10");

    harness.governor.evaluate(&ctx).await;
    second.evaluate(&ctx).await;
    harness.governor.evaluate(&ctx).await;

    let admission = second.evaluate(&ctx).await;
    assert_eq!(admission.outcome, Outcome::LimitJustReached);
    assert_eq!(admission.count, Some(4));

    assert_eq!(harness.governor.evaluate(&ctx).await.outcome, Outcome::Blocked);
}

#[tokio::test]
async fn test_instances_share_global_aggregate() {
    let harness = Harness::new(global_config(1, 2));
    let second = instance(&harness, global_config(1, 2));

    // tries = 1 时第一次请求即达到上限
    assert_eq!(
        harness.governor.evaluate(&request("10.0.0.1")).await.outcome,
        Outcome::LimitJustReached
    );
    assert_eq!(
        second.evaluate(&request("10.0.0.2")).await.outcome,
        Outcome::LimitJustReached
    );

    let admission = harness.governor.evaluate(&request("10.0.0.3")).await;
    assert_eq!(admission.source, DecisionSource::Global);
}

#[tokio::test]
async fn test_different_prefixes_are_isolated() {
    let harness = Harness::new(local_config(1));
    let other = instance(
        &harness,
        AntifloodConfig {
            tries: 1,
            prefix: "signup".to_string(),
            ..Default::default()
        },
    );
    let ctx = request("192.0.2.10");

    harness.governor.evaluate(&ctx).await;
    assert_eq!(harness.governor.evaluate(&ctx).await.outcome, Outcome::Blocked);
    assert_eq!(other.evaluate(&ctx).await.outcome, Outcome::LimitJustReached);
    assert_eq!(harness.storage.counter_entries(), 2);
}
