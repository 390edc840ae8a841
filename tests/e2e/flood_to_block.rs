//! 端到端测试：单个调用方从放行到封禁再到恢复
//!
//! 测试场景：
//! 1. 窗口内前 9 次请求放行，第 10 次达到上限但仍放行
//! 2. 之后的请求被拒绝，续体不被调用，响应为 429
//! 3. 封禁窗口结束后计数从 1 重新开始
//! 4. 未达到上限时窗口过期同样重置计数

use crate::common::*;
use antiflood::prelude::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn epoch_plus_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::milliseconds(ms)
}

#[tokio::test]
async fn test_tenth_request_admitted_then_rejected() {
    let harness = Harness::new(local_config(10));
    let ctx = request("127.0.0.1");
    let continued = AtomicUsize::new(0);

    for i in 1..=10u64 {
        let mut response = Response::new();
        let handled = harness
            .governor
            .handle(&ctx, &mut response, || async {
                continued.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let expected = if i == 10 {
            Outcome::LimitJustReached
        } else {
            Outcome::Allowed
        };
        assert_eq!(handled.admission.outcome, expected, "request {}", i);
        assert_eq!(handled.admission.count, Some(i));
        assert!(!response.is_written());
    }
    assert_eq!(continued.load(Ordering::SeqCst), 10);

    for _ in 0..2 {
        let mut response = Response::new();
        let handled = harness
            .governor
            .handle(&ctx, &mut response, || async {
                continued.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(handled.admission.outcome, Outcome::Blocked);
        assert_eq!(handled.admission.source, DecisionSource::Local);
        assert!(handled.output.is_none());
        assert_eq!(response.status(), Some(429));

        let body = response.body().unwrap();
        assert_eq!(body["error"]["text"], "Too many requests.");
        assert_eq!(body["error"]["nextValidRequestDate"], "1970-01-01T00:05:00Z");
    }
    assert_eq!(continued.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_counter_resets_after_time_limit() {
    let harness = Harness::new(local_config(10));
    let ctx = request("127.0.0.1");

    for _ in 0..9 {
        assert_eq!(harness.governor.evaluate(&ctx).await.outcome, Outcome::Allowed);
    }

    harness.advance_ms(60_000);

    for expected_count in 1..=3u64 {
        let admission = harness.governor.evaluate(&ctx).await;
        assert_eq!(admission.outcome, Outcome::Allowed);
        assert_eq!(admission.count, Some(expected_count));
    }
}

#[tokio::test]
async fn test_blocked_until_time_blocked_elapses() {
    let harness = Harness::new(local_config(10));
    let ctx = request("127.0.0.1");

    for _ in 0..10 {
        harness.governor.evaluate(&ctx).await;
    }

    harness.advance_ms(300_000 - 1);
    let blocked = harness.governor.evaluate(&ctx).await;
    assert_eq!(blocked.outcome, Outcome::Blocked);
    assert_eq!(blocked.next_valid_request_date, Some(epoch_plus_ms(300_000)));
    // 被拒绝的请求不消耗计数
    assert_eq!(blocked.count, Some(10));

    harness.advance_ms(1);
    let fresh = harness.governor.evaluate(&ctx).await;
    assert_eq!(fresh.outcome, Outcome::Allowed);
    assert_eq!(fresh.count, Some(1));
}

#[tokio::test]
async fn test_exactly_one_event_per_evaluation() {
    let harness = Harness::new(local_config(10));
    let ctx = request("127.0.0.1");

    for _ in 0..12 {
        harness.governor.evaluate(&ctx).await;
    }

    let events = harness.recorder.events();
    assert_eq!(events.len(), 12);

    let kinds: Vec<Outcome> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == Outcome::Allowed).count(),
        9
    );
    assert_eq!(kinds[9], Outcome::LimitJustReached);
    assert_eq!(&kinds[10..], &[Outcome::Blocked, Outcome::Blocked]);

    let ids: HashSet<_> = events.iter().map(|e| e.id).collect();
    assert_eq!(ids.len(), 12);

    // 事件中只有摘要键，没有原始身份
    assert!(events.iter().all(|e| !e.key.contains("127.0.0.1")));
}

#[tokio::test]
async fn test_callers_are_independent() {
    let harness = Harness::new(local_config(2));
    let a = request("10.0.0.1");
    let b = request("10.0.0.2");

    harness.governor.evaluate(&a).await;
    harness.governor.evaluate(&a).await;
    assert_eq!(harness.governor.evaluate(&a).await.outcome, Outcome::Blocked);

    assert_eq!(harness.governor.evaluate(&b).await.outcome, Outcome::Allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_burst_is_not_undercounted() {
    let Harness {
        governor, recorder, ..
    } = Harness::new(local_config(10));
    let governor = Arc::new(governor);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let governor = governor.clone();
            tokio::spawn(async move { governor.evaluate(&request("198.51.100.7")).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().outcome);
    }

    let count = |kind: Outcome| outcomes.iter().filter(|o| **o == kind).count();
    assert_eq!(count(Outcome::Allowed), 9);
    assert_eq!(count(Outcome::LimitJustReached), 1);
    assert_eq!(count(Outcome::Blocked), 40);

    // 同一个键的事件按评估顺序到达
    let counts: Vec<u64> = recorder
        .events()
        .iter()
        .filter(|e| e.kind != Outcome::Blocked)
        .filter_map(|e| e.count)
        .collect();
    assert_eq!(counts, (1..=10).collect::<Vec<u64>>());
    assert_eq!(governor.active_locks(), 0);
}
