//! Fan-out behaviour observed through a full flow

use flowline_core::{
    FlowError, Flow, FnNode, NodeRef, ParallelFlow, SharedContext, DEFAULT_ACTION, ERROR_ACTION,
};
use flowline_runtime::{BalancingStrategy, LoadBalancer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fetch(name: &'static str, key: &'static str, delay_ms: u64, fail: bool) -> NodeRef {
    FnNode::new(name)
        .with_exec(move |_| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(json!(format!("{} done", key)))
        })
        .with_post(move |ctx, _, exec| {
            if fail {
                return Err(FlowError::task_execution(key, "upstream returned 503"));
            }
            ctx.insert(key, exec.unwrap_or_default());
            Ok(DEFAULT_ACTION.to_string())
        })
        .into_ref()
}

#[tokio::test]
async fn test_failing_middle_branch_keeps_siblings_results() {
    let flow = ParallelFlow::new(
        "fetch_all",
        vec![
            fetch("fetch_users", "users", 20, false),
            fetch("fetch_orders", "orders", 5, true),
            fetch("fetch_items", "items", 1, false),
        ],
    );

    let mut ctx = SharedContext::new();
    let run = flow.run_branches(&mut ctx).await.unwrap();

    assert_eq!(run.action, ERROR_ACTION);
    assert_eq!(ctx.get_raw("users"), Some(&json!("users done")));
    assert_eq!(ctx.get_raw("items"), Some(&json!("items done")));
    assert!(!ctx.contains_key("orders"));

    let aggregate = run.error.unwrap();
    assert_eq!(aggregate.positions(), vec![2]);
    let message = ctx.error().unwrap();
    assert!(message.starts_with("1 of 3 branches failed; branch 2 ('fetch_orders')"), "{}", message);
    assert!(message.contains("upstream returned 503"));
}

#[tokio::test]
async fn test_error_transition_is_routable() {
    let fan: NodeRef = Arc::new(ParallelFlow::new(
        "fan",
        vec![fetch("ok", "ok", 1, false), fetch("bad", "bad", 1, true)],
    ));
    let recover = FnNode::new("recover")
        .with_post(|ctx, _, _| {
            let cause = ctx.error().unwrap_or_default();
            ctx.insert("recovered_from", cause);
            ctx.clear_error();
            Ok("recovered".to_string())
        })
        .into_ref();

    let mut flow = Flow::new("pipeline", Arc::clone(&fan));
    flow.add_edge(&fan, ERROR_ACTION, recover);

    let mut ctx = SharedContext::new();
    assert_eq!(flow.run(&mut ctx).await.unwrap(), "recovered");
    assert!(!ctx.has_error());
    assert!(ctx
        .get_raw("recovered_from")
        .and_then(|v| v.as_str())
        .is_some_and(|m| m.contains("branch 2 ('bad')")));
    assert_eq!(ctx.get_raw("ok"), Some(&json!("ok done")));
}

#[tokio::test]
async fn test_all_branches_succeed_with_default_action() {
    let flow = ParallelFlow::new(
        "fan",
        vec![fetch("a", "a", 3, false), fetch("b", "b", 1, false)],
    )
    .with_post(|_, action| Ok(format!("fanned:{}", action)));

    let mut ctx = SharedContext::new();
    assert_eq!(flow.run(&mut ctx).await.unwrap(), "fanned:default");
    assert!(!ctx.has_error());
}

#[tokio::test]
async fn test_nested_fan_outs_share_one_balancer() {
    let balancer = Arc::new(LoadBalancer::new(2, BalancingStrategy::LeastLoaded));
    let inner = |name: &'static str, key: &'static str| -> NodeRef {
        let leaf = ParallelFlow::new(
            format!("{}_leaves", name),
            vec![fetch(name, key, 2, false), fetch("extra", "extra", 1, false)],
        )
        .with_load_balancer(Arc::clone(&balancer));
        Arc::new(leaf)
    };
    let outer = ParallelFlow::new("outer", vec![inner("left", "left"), inner("right", "right")])
        .with_load_balancer(Arc::clone(&balancer));

    let mut ctx = SharedContext::new();
    let action = tokio::time::timeout(Duration::from_secs(3), outer.run(&mut ctx))
        .await
        .expect("nested fan-out waited on its own worker slots")
        .unwrap();

    assert_eq!(action, DEFAULT_ACTION);
    assert_eq!(ctx.get_raw("left"), Some(&json!("left done")));
    assert_eq!(ctx.get_raw("right"), Some(&json!("right done")));
    assert_eq!(balancer.report().total_completed, 2);
}
