//! 端到端测试：同一网段的多个调用方触发全局封禁
//!
//! 测试场景：
//! 1. 同一 /24 网段的 10 个地址各自达到本地上限
//! 2. 第 11 个地址首次请求即被全局拒绝，本地计数照常累加
//! 3. 其他网段不受影响
//! 4. 全局窗口结束后恢复

use crate::common::*;
use antiflood::key::store_key;
use antiflood::prelude::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

const HOUR_MS: i64 = 3_600_000;

/// 让网段内的 `n` 个地址各自达到本地上限
async fn saturate(harness: &Harness, n: u8, tries: u64) {
    for host in 1..=n {
        let ctx = request(&format!("10.0.0.{}", host));
        for _ in 0..tries {
            let admission = harness.governor.evaluate(&ctx).await;
            assert_eq!(admission.source, DecisionSource::Local);
            assert!(admission.is_admitted());
        }
    }
}

fn global_key() -> String {
    store_key(&GlobalConfig::default().prefix, "10.0.0.0/24")
}

#[tokio::test]
async fn test_eleventh_caller_rejected_by_global_tier() {
    let rejections = Arc::new(AtomicUsize::new(0));
    let counter = rejections.clone();
    let builder = GovernorBuilder::new(global_config(10, 10)).global_rejection_handler(
        move |_ctx: &RequestContext,
              response: &mut Response,
              _retry_at: chrono::DateTime<chrono::Utc>| {
            counter.fetch_add(1, Ordering::SeqCst);
            response.set_status(503);
        },
    );
    let harness = Harness::with_builder(builder);

    saturate(&harness, 10, 10).await;
    assert_eq!(
        harness.storage.count_elements_global(&global_key()).await.unwrap(),
        10
    );

    let newcomer = request("10.0.0.11");
    let mut response = Response::new();
    let continued = AtomicUsize::new(0);
    let handled = harness
        .governor
        .handle(&newcomer, &mut response, || async {
            continued.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert_eq!(handled.admission.outcome, Outcome::Blocked);
    assert_eq!(handled.admission.source, DecisionSource::Global);
    assert_eq!(handled.admission.count, Some(1));
    assert_eq!(continued.load(Ordering::SeqCst), 0);
    assert_eq!(rejections.load(Ordering::SeqCst), 1);
    assert_eq!(response.status(), Some(503));

    // 提示时间为刚写入的本地记录的过期时间
    let expected = harness.clock.now() + chrono::Duration::milliseconds(60_000);
    assert_eq!(handled.admission.next_valid_request_date, Some(expected));

    // 全局拒绝不影响本地计数
    let local_key = harness.governor.derive_key(&newcomer).await;
    let record = harness.storage.get(&local_key).await.unwrap().unwrap();
    assert_eq!(record.count, 1);

    let last = harness.recorder.events().pop().unwrap();
    assert_eq!(last.kind, Outcome::Blocked);
    assert_eq!(last.source, DecisionSource::Global);
}

#[tokio::test]
async fn test_other_scope_unaffected() {
    let harness = Harness::new(global_config(10, 10));
    saturate(&harness, 10, 10).await;

    let admission = harness.governor.evaluate(&request("10.0.1.5")).await;
    assert_eq!(admission.outcome, Outcome::Allowed);
    assert_eq!(admission.source, DecisionSource::Local);
}

#[tokio::test]
async fn test_below_blocks_limit_is_local_only() {
    let harness = Harness::new(global_config(10, 10));
    saturate(&harness, 9, 10).await;

    let admission = harness.governor.evaluate(&request("10.0.0.200")).await;
    assert_eq!(admission.outcome, Outcome::Allowed);
    assert_eq!(admission.count, Some(1));
}

#[tokio::test]
async fn test_global_block_lifts_after_window() {
    let harness = Harness::new(global_config(10, 10));
    saturate(&harness, 10, 10).await;

    let newcomer = request("10.0.0.11");
    harness.advance_ms(HOUR_MS as u64 - 1);
    assert_eq!(
        harness.governor.evaluate(&newcomer).await.source,
        DecisionSource::Global
    );

    harness.advance_ms(1);
    let admission = harness.governor.evaluate(&newcomer).await;
    assert_eq!(admission.outcome, Outcome::Allowed);
    assert_eq!(admission.source, DecisionSource::Local);
}

#[tokio::test]
async fn test_blocked_member_keeps_local_hint_under_global_block() {
    let harness = Harness::new(global_config(10, 10));
    saturate(&harness, 10, 10).await;

    // 10.0.0.1 的本地封禁在 300 秒时结束
    let admission = harness.governor.evaluate(&request("10.0.0.1")).await;
    assert_eq!(admission.source, DecisionSource::Global);
    assert_eq!(admission.count, Some(10));
    assert_eq!(
        admission.next_valid_request_date,
        Some(harness.clock.now() + chrono::Duration::milliseconds(300_000))
    );
}

async fn reregister_and_count(reset_time_on_retry: bool) -> u64 {
    let mut config = global_config(2, 5);
    if let Some(global) = config.global.as_mut() {
        global.reset_time_on_retry = reset_time_on_retry;
    }
    let harness = Harness::new(config);
    let ctx = request("10.0.0.1");

    // 首次登记：全局窗口 30 分钟
    saturate(&harness, 1, 2).await;

    // 本地封禁结束后再次达到上限
    harness.advance_ms(300_000);
    for _ in 0..2 {
        harness.governor.evaluate(&ctx).await;
    }

    harness.advance_ms(1_600_000);
    harness
        .storage
        .count_elements_global(&global_key())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reregistration_extends_window_only_when_configured() {
    assert_eq!(reregister_and_count(false).await, 0);
    assert_eq!(reregister_and_count(true).await, 1);
}

#[tokio::test]
async fn test_local_counting_continues_under_global_block() {
    let harness = Harness::new(global_config(3, 1));
    saturate(&harness, 1, 3).await;

    let neighbour = request("10.0.0.2");
    let local_key = harness.governor.derive_key(&neighbour).await;
    let mut counts = Vec::new();
    for _ in 0..5 {
        let admission = harness.governor.evaluate(&neighbour).await;
        assert_eq!(admission.outcome, Outcome::Blocked);
        assert_eq!(admission.source, DecisionSource::Global);
        counts.push(admission.count);
        let stored = harness.storage.get(&local_key).await.unwrap();
        assert_eq!(stored.map(|record| record.count), admission.count);
    }
    assert_eq!(counts, vec![Some(1), Some(2), Some(3), Some(3), Some(3)]);

    // 达到本地上限时照常登记为成员
    assert_eq!(
        harness.storage.count_elements_global(&global_key()).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_reset_reregistration_keeps_limit_window() {
    let mut config = global_config(1, 2);
    if let Some(global) = config.global.as_mut() {
        global.reset_time_on_retry = true;
    }
    let harness = Harness::new(config);
    let ctx = request("10.0.0.1");

    assert_eq!(
        harness.governor.evaluate(&ctx).await.outcome,
        Outcome::LimitJustReached
    );

    // 本地封禁在 5 分钟时结束，再次登记的仍是唯一的成员
    harness.advance_ms(300_000);
    assert_eq!(
        harness.governor.evaluate(&ctx).await.outcome,
        Outcome::LimitJustReached
    );

    // 窗口从第二次登记起算 30 分钟
    harness.advance_ms(1_800_000 - 1);
    assert_eq!(
        harness.storage.count_elements_global(&global_key()).await.unwrap(),
        1
    );
    harness.advance_ms(60_001);
    assert_eq!(
        harness.storage.count_elements_global(&global_key()).await.unwrap(),
        0
    );
}

/// 前两次读取成员数时等待对方，使两个评估读到相同的成员数
struct RendezvousOnCount {
    inner: Arc<MemoryStorage>,
    barrier: Barrier,
    reads: AtomicUsize,
}

#[async_trait]
impl GlobalStore for RendezvousOnCount {
    async fn add_to_global(
        &self,
        global_key: &str,
        local_key: &str,
        policy: RegistrationPolicy,
    ) -> Result<u64, StorageError> {
        self.inner.add_to_global(global_key, local_key, policy).await
    }

    async fn count_elements_global(&self, global_key: &str) -> Result<u64, StorageError> {
        let members = self.inner.count_elements_global(global_key).await?;
        if self.reads.fetch_add(1, Ordering::SeqCst) < 2 {
            self.barrier.wait().await;
        }
        Ok(members)
    }
}

#[tokio::test]
async fn test_concurrent_registrations_select_blocked_window() {
    let clock = MockClock::at_epoch();
    let storage = Arc::new(MemoryStorage::with_clock(Arc::new(clock.clone())));
    let global = Arc::new(RendezvousOnCount {
        inner: storage.clone(),
        barrier: Barrier::new(2),
        reads: AtomicUsize::new(0),
    });
    let governor = GovernorBuilder::new(global_config(1, 2))
        .clock(Arc::new(clock.clone()))
        .counter_store(storage.clone())
        .global_store(global)
        .build()
        .unwrap();

    let first = request("10.0.0.1");
    let second = request("10.0.0.2");
    let (a, b) = tokio::join!(governor.evaluate(&first), governor.evaluate(&second));
    assert_eq!(a.outcome, Outcome::LimitJustReached);
    assert_eq!(b.outcome, Outcome::LimitJustReached);
    assert_eq!(
        storage.count_elements_global(&global_key()).await.unwrap(),
        2
    );

    // 第二个成员使网段达到上限，窗口是 60 分钟而不是 30 分钟
    clock.advance(Duration::from_millis(1_800_001));
    assert_eq!(
        storage.count_elements_global(&global_key()).await.unwrap(),
        2
    );
    clock.advance(Duration::from_millis(HOUR_MS as u64 - 1_800_001));
    assert_eq!(
        storage.count_elements_global(&global_key()).await.unwrap(),
        0
    );
}
