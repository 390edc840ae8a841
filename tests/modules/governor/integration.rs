//! 控制器模块集成测试
//!
//! 续体调用、拒绝处理器选择和自定义身份提取

use crate::common::*;
use antiflood::extractors::{CompositeKeyExtractor, FnKeyExtractor};
use antiflood::key::store_key;
use antiflood::prelude::*;
use chrono::{DateTime, Utc};

fn tagging_handler(tag: &'static str) -> impl RejectionHandler + 'static {
    move |_ctx: &RequestContext, response: &mut Response, retry_at: DateTime<Utc>| {
        response
            .set_status(429)
            .set_header("x-rejected-by", tag)
            .set_header("retry-at", &retry_at.to_rfc3339());
    }
}

#[tokio::test]
async fn test_handle_returns_continuation_output() {
    let harness = Harness::new(local_config(3));
    let ctx = request("203.0.113.1");

    let mut response = Response::new();
    let handled = harness
        .governor
        .handle(&ctx, &mut response, || async { 42 })
        .await;

    assert_eq!(handled.output, Some(42));
    assert!(handled.admission.is_admitted());
    assert!(!response.is_written());
}

#[tokio::test]
async fn test_local_rejection_uses_local_handler() {
    let builder = GovernorBuilder::new(global_config(1, 5))
        .rejection_handler(tagging_handler("local"))
        .global_rejection_handler(tagging_handler("global"));
    let harness = Harness::with_builder(builder);
    let ctx = request("203.0.113.1");

    harness.governor.evaluate(&ctx).await;

    let mut response = Response::new();
    let handled = harness
        .governor
        .handle(&ctx, &mut response, || async {})
        .await;

    assert_eq!(handled.admission.source, DecisionSource::Local);
    assert_eq!(response.header("x-rejected-by"), Some("local"));
    assert_eq!(response.header("retry-at"), Some("1970-01-01T00:05:00+00:00"));
}

#[tokio::test]
async fn test_global_rejection_uses_global_handler() {
    let builder = GovernorBuilder::new(global_config(1, 1))
        .rejection_handler(tagging_handler("local"))
        .global_rejection_handler(tagging_handler("global"));
    let harness = Harness::with_builder(builder);

    harness.governor.evaluate(&request("203.0.113.1")).await;

    let mut response = Response::new();
    let handled = harness
        .governor
        .handle(&request("203.0.113.2"), &mut response, || async {})
        .await;

    assert_eq!(handled.admission.source, DecisionSource::Global);
    assert_eq!(response.header("x-rejected-by"), Some("global"));
}

#[tokio::test]
async fn test_header_identity() {
    let builder =
        GovernorBuilder::new(local_config(1)).key_extractor(HeaderKeyExtractor::new("X-User-Id"));
    let harness = Harness::with_builder(builder);

    let alice = request("198.51.100.1").with_header("X-User-Id", "alice");
    let alice_elsewhere = request("198.51.100.2").with_header("X-User-Id", "alice");
    let bob = request("198.51.100.1").with_header("X-User-Id", "bob");

    harness.governor.evaluate(&alice).await;
    assert_eq!(
        harness.governor.evaluate(&alice_elsewhere).await.outcome,
        Outcome::Blocked
    );
    assert_eq!(
        harness.governor.evaluate(&bob).await.outcome,
        Outcome::LimitJustReached
    );
    assert_eq!(
        harness.governor.derive_key(&alice).await,
        store_key("", "alice")
    );
}

#[tokio::test]
async fn test_forwarded_identity() {
    let builder = GovernorBuilder::new(local_config(2))
        .key_extractor(IpKeyExtractor::from_headers(["X-Forwarded-For"]));
    let harness = Harness::with_builder(builder);

    let proxied = request("10.0.0.254").with_header("X-Forwarded-For", "192.0.2.77, 10.0.0.254");
    let direct = request("192.0.2.77");

    assert_eq!(
        harness.governor.derive_key(&proxied).await,
        harness.governor.derive_key(&direct).await
    );
}

#[tokio::test]
async fn test_composite_identity_falls_back() {
    let extractor = CompositeKeyExtractor::default()
        .add_extractor(Box::new(HeaderKeyExtractor::new("X-Api-Key")))
        .add_extractor(Box::new(IpKeyExtractor::new()));
    let builder = GovernorBuilder::new(local_config(5)).key_extractor(extractor);
    let harness = Harness::with_builder(builder);

    let keyed = request("192.0.2.1").with_header("X-Api-Key", "k-123");
    let anonymous = request("192.0.2.1");

    assert_eq!(
        harness.governor.derive_key(&keyed).await,
        store_key("", "k-123")
    );
    assert_eq!(
        harness.governor.derive_key(&anonymous).await,
        store_key("", "192.0.2.1")
    );
}

#[tokio::test]
async fn test_custom_scope_extractor() {
    let scope = FnKeyExtractor::new("tenant", |ctx: &RequestContext| {
        ctx.get_header("X-Tenant").cloned()
    });
    let builder = GovernorBuilder::new(global_config(1, 2)).scope_extractor(scope);
    let harness = Harness::with_builder(builder);

    // 不同网段但同一租户
    let a = request("192.0.2.1").with_header("X-Tenant", "acme");
    let b = request("198.51.100.1").with_header("X-Tenant", "acme");
    let c = request("203.0.113.1").with_header("X-Tenant", "acme");
    let other = request("203.0.113.2").with_header("X-Tenant", "globex");

    harness.governor.evaluate(&a).await;
    harness.governor.evaluate(&b).await;

    assert_eq!(
        harness.governor.evaluate(&c).await.source,
        DecisionSource::Global
    );
    assert_eq!(
        harness.governor.evaluate(&other).await.source,
        DecisionSource::Local
    );
}

#[tokio::test]
async fn test_reset_allows_immediately() {
    let harness = Harness::new(local_config(1));
    let ctx = request("203.0.113.9");

    harness.governor.evaluate(&ctx).await;
    assert_eq!(harness.governor.evaluate(&ctx).await.outcome, Outcome::Blocked);

    harness.governor.reset(&ctx).await.unwrap();
    assert_eq!(
        harness.governor.evaluate(&ctx).await.outcome,
        Outcome::LimitJustReached
    );
}

#[tokio::test]
async fn test_default_governor_uses_system_clock() {
    let governor = Governor::new(local_config(2)).unwrap();
    let ctx = request("203.0.113.10");

    let first = governor.evaluate(&ctx).await;
    assert_eq!(first.outcome, Outcome::Allowed);
    assert_eq!(first.next_valid_request_date, None);

    governor.evaluate(&ctx).await;
    let blocked = governor.evaluate(&ctx).await;
    let retry_at = blocked.next_valid_request_date.unwrap();
    assert!(retry_at > Utc::now());
}
