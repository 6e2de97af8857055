//! 自动重绑定集成测试 - 租约、失败移除、cookie 不一致、名称服务器重启

mod common;

use common::{Services, endpoint};
use orb_client::{AutoRebinder, Cookie, RebinderConfig, RemovalReason};
use std::time::Duration;

fn rebinder(services: &Services) -> AutoRebinder {
    AutoRebinder::new(services.resolver(), RebinderConfig::default())
}

#[tokio::test]
async fn test_register_bind_unbind_round_trip() {
    let services = Services::new();
    let rb = rebinder(&services);

    let ep = endpoint(4000);
    rb.register(ep.clone(), "/Test/Echo", "echo").await.unwrap();
    assert!(!services.ns.is_bound("/Test/Echo"));

    rb.tick().await;
    let bound = services.ns.binding("/Test/Echo").unwrap();
    assert_eq!(bound.endpoint, ep);
    assert_eq!(bound.description, "echo");
    assert!(rb.binding("/Test/Echo").await.unwrap().is_bound());
    assert_eq!(rb.last_cookie().await, services.ns.cookie());

    rb.unbind_objects(&["/Test/Echo"]).await.unwrap();
    assert!(!services.ns.is_bound("/Test/Echo"));
    assert!(rb.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_ticks_within_threshold_do_not_renew() {
    let services = Services::new();
    let rb = rebinder(&services);
    rb.register(endpoint(4000), "/Test/A", "a").await.unwrap();
    rb.register(endpoint(4001), "/Test/B", "b").await.unwrap();

    rb.tick().await;
    assert_eq!(services.ns.rebind_calls().len(), 1);

    // 租约未到期，多次 tick 不发送任何续期
    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(10)).await;
        rb.tick().await;
    }
    assert!(services.ns.renew_calls().is_empty());
    assert_eq!(services.ns.rebind_calls().len(), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    rb.tick().await;
    let renewals = services.ns.renew_calls();
    assert_eq!(renewals.len(), 1);
    assert_eq!(renewals[0].len(), 2);
    assert_eq!(rb.stats().renewals_ok, 2);

    // 刚续期完，再 tick 不会重复续期
    rb.tick().await;
    assert_eq!(services.ns.renew_calls().len(), 1);
}

#[tokio::test]
async fn test_entry_removed_after_too_many_failures() {
    let services = Services::new();
    let rb = rebinder(&services);
    services.ns.fail_binding("/Test/Bad");
    rb.register(endpoint(4000), "/Test/Bad", "bad").await.unwrap();
    rb.register(endpoint(4001), "/Test/Good", "good").await.unwrap();

    for _ in 0..10 {
        rb.tick().await;
    }
    // 10 次失败仍保留
    let bad = rb.binding("/Test/Bad").await.unwrap();
    assert_eq!(bad.error_count, 10);
    assert!(!bad.is_bound());
    assert_eq!(rb.len().await, 2);

    // 第 11 次失败后移除
    rb.tick().await;
    assert!(rb.binding("/Test/Bad").await.is_none());
    assert!(rb.binding("/Test/Good").await.unwrap().is_bound());

    let removals = rb.removal_log();
    assert_eq!(removals.len(), 1);
    assert_eq!(removals[0].path, "/Test/Bad");
    assert_eq!(removals[0].reason, RemovalReason::TooManyFailures(11));
    assert_eq!(rb.stats().removals, 1);
}

#[tokio::test]
async fn test_success_resets_error_count() {
    let services = Services::new();
    let rb = rebinder(&services);
    services.ns.fail_binding("/Test/Flaky");
    rb.register(endpoint(4000), "/Test/Flaky", "flaky").await.unwrap();

    for _ in 0..3 {
        rb.tick().await;
    }
    assert_eq!(rb.binding("/Test/Flaky").await.unwrap().error_count, 3);

    services.ns.clear_failing_bindings();
    rb.tick().await;
    let flaky = rb.binding("/Test/Flaky").await.unwrap();
    assert!(flaky.is_bound());
    assert_eq!(flaky.error_count, 0);
}

#[tokio::test]
async fn test_scope_path_removed_immediately() {
    let services = Services::new();
    let rb = rebinder(&services);
    services.ns.add_scope("/Test/Group");
    rb.register(endpoint(4000), "/Test/Group", "not a terminal").await.unwrap();

    rb.tick().await;
    assert!(rb.is_empty().await);
    assert_eq!(rb.removal_log()[0].reason, RemovalReason::NotATerminal);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_mismatch_forces_full_rebind() {
    let services = Services::new();
    let rb = rebinder(&services);
    let paths = ["/Test/A", "/Test/B", "/Test/C", "/Test/D", "/Test/E"];
    for (i, path) in paths.iter().enumerate() {
        rb.register(endpoint(4000 + i as u16), path, "svc").await.unwrap();
    }
    rb.tick().await;
    assert_eq!(rb.stats().full_rebinds, 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    services.ns.force_mismatch(1);
    rb.tick().await;

    // 续期被拒绝: 全部标记为未绑定，cookie 置为未知
    assert_eq!(services.ns.renew_calls().last().unwrap().len(), 5);
    assert!(rb.bindings().await.iter().all(|b| !b.is_bound()));
    assert_eq!(rb.last_cookie().await, Cookie::UNKNOWN);

    rb.tick().await;
    let rebinds = services.ns.rebind_calls();
    assert_eq!(rebinds.len(), 2);
    assert_eq!(rebinds[1].len(), 5);
    assert!(rb.bindings().await.iter().all(|b| b.is_bound()));
    assert_eq!(rb.stats().full_rebinds, 2);
}

#[tokio::test(start_paused = true)]
async fn test_name_server_restart_rebinds_everything() {
    let services = Services::new();
    let rb = rebinder(&services);
    rb.register(endpoint(4000), "/Test/A", "a").await.unwrap();
    rb.register(endpoint(4001), "/Test/B", "b").await.unwrap();
    rb.tick().await;
    let first_cookie = rb.last_cookie().await;

    services.ns.restart();
    assert_eq!(services.ns.binding_count(), 0);

    // 超过 ping 间隔后下一次 tick 发现新 cookie
    tokio::time::advance(Duration::from_secs(16)).await;
    rb.tick().await;

    assert!(services.ns.is_bound("/Test/A"));
    assert!(services.ns.is_bound("/Test/B"));
    assert_ne!(rb.last_cookie().await, first_cookie);
    assert_eq!(rb.last_cookie().await, services.ns.cookie());
    assert_eq!(rb.stats().full_rebinds, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_name_server_does_not_count_failures() {
    let services = Services::new();
    let rb = rebinder(&services);
    rb.register(endpoint(4000), "/Test/A", "a").await.unwrap();

    services.ns.set_available(false);
    rb.tick().await;
    rb.tick().await;
    let entry = rb.binding("/Test/A").await.unwrap();
    assert!(!entry.is_bound());
    assert_eq!(entry.error_count, 0);
    assert_eq!(rb.last_cookie().await, Cookie::UNKNOWN);

    services.ns.set_available(true);
    rb.tick().await;
    assert!(services.ns.is_bound("/Test/A"));
}

#[tokio::test(start_paused = true)]
async fn test_restart_seen_by_rebinder_flushes_resolver_cache() {
    let services = Services::new();
    let resolver = services.resolver();
    let rb = AutoRebinder::new(resolver.clone(), RebinderConfig::default());
    rb.register(endpoint(4000), "/Test/A", "a").await.unwrap();
    rb.tick().await;

    let found = resolver
        .lookup("/Test/A", Duration::ZERO, true)
        .await
        .unwrap();
    assert!(found.is_some());
    assert!(resolver.cache().lookup("/Test/A").is_some());

    services.ns.restart();
    tokio::time::advance(Duration::from_secs(16)).await;
    rb.tick().await;

    // 重绑定器的 ping 带回新 cookie，整个共享缓存被清空
    assert!(resolver.cache().lookup("/Test/A").is_none());
    assert_eq!(resolver.cache().last_cookie(), services.ns.cookie());
}

#[tokio::test]
async fn test_background_task_binds_registered_objects() {
    let services = Services::new();
    let rb = AutoRebinder::new(
        services.resolver(),
        RebinderConfig::default().with_tick_interval(Duration::from_millis(50)),
    );
    rb.start();
    rb.register(endpoint(4000), "/Test/Live", "live").await.unwrap();

    common::wait_until(Duration::from_secs(5), "background bind", || {
        services.ns.is_bound("/Test/Live")
    })
    .await;

    rb.stop().await;
    assert!(!rb.is_running());
    assert!(rb.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_deregistered_path_left_out_of_later_passes() {
    let services = Services::new();
    let rb = rebinder(&services);
    rb.register(endpoint(4000), "/Test/Keep", "keep").await.unwrap();
    rb.register(endpoint(4001), "/Test/Drop", "drop").await.unwrap();
    rb.tick().await;

    let keep = rb.binding("/Test/Keep").await.unwrap();
    assert!(keep.is_bound());
    assert_eq!(keep.error_count, 0);

    assert!(rb.deregister("/test/drop", true).await.unwrap());
    services.ns.restart();
    tokio::time::advance(Duration::from_secs(16)).await;
    rb.tick().await;

    let rebinds = services.ns.rebind_calls();
    assert_eq!(rebinds.last().unwrap(), &vec!["/Test/Keep".to_string()]);
    assert!(!services.ns.is_bound("/Test/Drop"));
}
