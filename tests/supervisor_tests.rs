//! Process supervisor tests
//!
//! Lifecycle, the verification gate and direct calls into the plugin.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use plugin_handler::config::SupervisorConfig;
use plugin_handler::plugin::ipc::protocol::{Completion, PluginOp, SupervisorOp};
use plugin_handler::plugin::ipc::TransportKind;
use plugin_handler::plugin::{PluginError, PluginState};

#[tokio::test]
async fn test_verified_plugin_runs() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("greeter");
    let supervisor = harness.supervisor(plugin.path());
    assert_eq!(supervisor.state(), PluginState::Created);

    let (_runtime, probe) = harness.start_verified(&supervisor).await;

    assert_eq!(supervisor.state(), PluginState::Running);
    assert_eq!(supervisor.manifest().unwrap().plugin_namespace, "greeter");
    assert!(!probe.killed());

    // start() on a running plugin is a no-op
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.state(), PluginState::Running);
}

#[tokio::test]
async fn test_installation_is_requested_for_plugin_dir() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("greeter");
    let supervisor = harness.supervisor(plugin.path());

    harness.start_verified(&supervisor).await;

    let installs = harness.kernel.calls_to("core", "pnpm_install");
    assert_eq!(installs.len(), 1);
    assert_eq!(installs[0]["path"], json!(plugin.path().to_string_lossy()));
    // No support package source configured
    assert!(harness.kernel.calls_to("core", "pnpm_install_specific").is_empty());
}

#[tokio::test]
async fn test_launch_plan_matches_subclass() {
    let mut harness = Harness::new();

    let direct = PluginDir::with_subclass("direct", 0);
    let supervisor = harness.supervisor(direct.path());
    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let child = harness.next_child().await;
    assert_eq!(child.plan.transport(), TransportKind::Native);
    assert_eq!(child.plan.entry_point, direct.path().join("index.mjs"));
    let (runtime, _) = child.into_runtime();
    runtime.verify(true).unwrap();
    starting.await.unwrap().unwrap();

    let source = PluginDir::with_subclass("source", 1);
    let supervisor = harness.supervisor(source.path());
    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let child = harness.next_child().await;
    assert_eq!(child.plan.transport(), TransportKind::Framed);
    let (runtime, _) = child.into_runtime();
    runtime.verify(true).unwrap();
    starting.await.unwrap().unwrap();
    assert!(supervisor.state().is_running());
}

#[tokio::test]
async fn test_denied_verification_kills_plugin() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("pirate");
    let supervisor = harness.supervisor(plugin.path());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let (runtime, probe) = harness.next_child().await.into_runtime();
    runtime.verify(false).unwrap();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(PluginError::DrmRejected)));
    assert!(matches!(supervisor.state(), PluginState::Failed(_)));
    assert!(probe.killed());
}

#[tokio::test]
async fn test_closed_channel_before_verification_is_process_error() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("crasher");
    let supervisor = harness.supervisor(plugin.path());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let child = harness.next_child().await;
    let probe = child.probe.clone();
    drop(child);

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(PluginError::ProcessError(_))));
    assert!(matches!(supervisor.state(), PluginState::Failed(_)));
    assert!(probe.killed());
}

#[tokio::test(start_paused = true)]
async fn test_verification_gate_times_out_after_thirty_seconds() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("sleepy");
    let config = SupervisorConfig {
        install_poll_interval_ms: 1,
        ..SupervisorConfig::default()
    };
    let supervisor = harness.supervisor_with(plugin.path(), config);

    let begin = tokio::time::Instant::now();
    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    // Keep the plugin's end open without ever verifying
    let child = harness.next_child().await;

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(PluginError::Timeout(_))));
    assert!(begin.elapsed() >= Duration::from_secs(30));
    assert!(matches!(supervisor.state(), PluginState::Failed(_)));
    assert!(child.probe.killed());
}

#[tokio::test]
async fn test_invalid_manifest_fails_before_launch() {
    let mut harness = Harness::new();
    let plugin = PluginDir::with_manifest(json!({
        "formatVersion": 3,
        "pluginName": "bad",
        "pluginNamespace": "bad",
        "pluginVersion": "1.0.0",
        "entryPoint": "index.cjs",
        "author": "tester",
        "subclass": 0
    }));
    let supervisor = harness.supervisor(plugin.path());

    match supervisor.start().await {
        Err(PluginError::InvalidManifest(reason)) => {
            assert!(reason.contains("Invalid format version"));
            assert!(reason.contains("CommonJS is not supported"));
        }
        other => panic!("expected invalid manifest, got {:?}", other),
    }
    assert!(matches!(supervisor.state(), PluginState::Failed(_)));
    assert!(harness.children.try_recv().is_err());
}

#[tokio::test]
async fn test_default_config_launches_without_support_package() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("bare");
    std::fs::remove_dir_all(plugin.path().join("node_modules")).unwrap();
    harness.kernel.reply("core", "pnpm_install", json!({}));
    let supervisor = harness.supervisor_with(plugin.path(), SupervisorConfig::default());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let (runtime, _probe) = harness.next_child().await.into_runtime();
    runtime.verify(true).unwrap();
    starting.await.unwrap().unwrap();

    assert_eq!(supervisor.state(), PluginState::Running);
    assert_eq!(harness.kernel.calls_to("core", "pnpm_install").len(), 1);
    assert!(harness.kernel.calls_to("core", "pnpm_install_specific").is_empty());
}

#[tokio::test]
async fn test_configured_support_package_is_installed_and_awaited() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("supported");
    let config = SupervisorConfig {
        support_package_dir: Some("/opt/support".into()),
        ..fast_config()
    };
    let supervisor = harness.supervisor_with(plugin.path(), config);

    harness.start_verified(&supervisor).await;

    let specific = harness.kernel.calls_to("core", "pnpm_install_specific");
    assert_eq!(specific.len(), 1);
    assert_eq!(specific[0]["dep"], json!("/opt/support"));
}

#[tokio::test]
async fn test_install_deadline_aborts_start() {
    let harness = Harness::new();
    let plugin = PluginDir::new("slow");
    std::fs::remove_dir_all(
        plugin
            .path()
            .join(SupervisorConfig::default().support_package_probe),
    )
    .unwrap();

    let config = SupervisorConfig {
        install_poll_interval_ms: 1,
        install_retry_budget: 3,
        install_deadline_ms: Some(200),
        support_package_dir: Some("/opt/support".into()),
        ..SupervisorConfig::default()
    };
    let supervisor = harness.supervisor_with(plugin.path(), config);

    let result = supervisor.start().await;
    assert!(matches!(result, Err(PluginError::Install(_))));
    // Installation was re-requested once the retry budget ran out
    assert!(harness.kernel.calls_to("core", "pnpm_install").len() > 1);
}

#[tokio::test]
async fn test_call_round_trip() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("math");
    let supervisor = harness.supervisor(plugin.path());

    let (runtime, _) = harness.start_verified(&supervisor).await;
    runtime
        .register_function("add", |args: Vec<serde_json::Value>| async move {
            let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
            Ok::<_, anyhow::Error>(json!(sum))
        })
        .unwrap();

    let value = supervisor.call("add", vec![json!(2), json!(40)]).await.unwrap();
    assert_eq!(value, json!(42));
    assert_eq!(supervisor.pending_count(), 0);
}

#[tokio::test]
async fn test_call_error_is_remote() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("math");
    let supervisor = harness.supervisor(plugin.path());

    let (_runtime, _) = harness.start_verified(&supervisor).await;

    match supervisor.call("divide", vec![]).await {
        Err(PluginError::Remote(error)) => assert_eq!(error, json!("Function divide not found")),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_call_requires_running() {
    let harness = Harness::new();
    let plugin = PluginDir::new("idle");
    let supervisor = harness.supervisor(plugin.path());

    assert!(matches!(
        supervisor.call("anything", vec![]).await,
        Err(PluginError::NotRunning)
    ));
}

#[tokio::test]
async fn test_concurrent_calls_resolve_out_of_order() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("raw");
    let supervisor = harness.supervisor(plugin.path());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let (mut raw, _) = harness.next_child().await.into_raw();
    raw.send(PluginOp::Verify { allow: true });
    starting.await.unwrap().unwrap();

    let first = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.call("first", vec![]).await }
    });
    let first_nonce = match raw.next().await {
        SupervisorOp::Invoke { func_name, nonce, .. } => {
            assert_eq!(func_name, "first");
            nonce
        }
        other => panic!("unexpected op {:?}", other),
    };
    let second = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.call("second", vec![]).await }
    });
    let second_nonce = match raw.next().await {
        SupervisorOp::Invoke { nonce, .. } => nonce,
        other => panic!("unexpected op {:?}", other),
    };
    assert_eq!(first_nonce.len(), 32);
    assert_ne!(first_nonce, second_nonce);

    raw.send(PluginOp::Completion(Completion::ok(second_nonce.clone(), json!("two"))));
    raw.send(PluginOp::Completion(Completion::ok(first_nonce, json!("one"))));
    // A duplicate completion is ignored
    raw.send(PluginOp::Completion(Completion::ok(second_nonce, json!("again"))));

    assert_eq!(second.await.unwrap().unwrap(), json!("two"));
    assert_eq!(first.await.unwrap().unwrap(), json!("one"));
    assert_eq!(supervisor.pending_count(), 0);
}

#[tokio::test]
async fn test_force_stop_leaves_calls_pending() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("raw");
    let supervisor = harness.supervisor(plugin.path());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let (mut raw, probe) = harness.next_child().await.into_raw();
    raw.send(PluginOp::Verify { allow: true });
    starting.await.unwrap().unwrap();

    let call = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.call("hang", vec![]).await }
    });
    assert!(matches!(raw.next().await, SupervisorOp::Invoke { .. }));

    supervisor.force_stop().await;
    assert_eq!(supervisor.state(), PluginState::Stopped);
    assert!(probe.killed());
    assert_eq!(supervisor.pending_count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());
    call.abort();

    // Idempotent
    supervisor.force_stop().await;
    assert_eq!(supervisor.state(), PluginState::Stopped);
}

#[tokio::test]
async fn test_concurrent_start_launches_once() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("single");
    let supervisor = harness.supervisor(plugin.path());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let child = harness.next_child().await;

    // The first launch is still waiting for its verdict
    assert!(matches!(
        supervisor.start().await,
        Err(PluginError::ProcessError(_))
    ));

    let (runtime, _probe) = child.into_runtime();
    runtime.verify(true).unwrap();
    starting.await.unwrap().unwrap();

    assert_eq!(supervisor.state(), PluginState::Running);
    assert!(harness.children.try_recv().is_err());
}

#[tokio::test]
async fn test_force_stop_during_start_stays_stopped() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("aborted");
    let supervisor = harness.supervisor(plugin.path());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let child = harness.next_child().await;

    supervisor.force_stop().await;
    let result = tokio::time::timeout(Duration::from_secs(1), starting)
        .await
        .expect("start() did not notice the stop")
        .unwrap();

    assert!(matches!(result, Err(PluginError::ProcessError(_))));
    assert_eq!(supervisor.state(), PluginState::Stopped);
    assert!(child.probe.killed());
}

#[tokio::test]
async fn test_stop_terminates_running_plugin() {
    let mut harness = Harness::new();
    let plugin = PluginDir::new("graceful");
    let supervisor = harness.supervisor(plugin.path());

    let (_runtime, probe) = harness.start_verified(&supervisor).await;
    supervisor.stop().await.unwrap();

    assert!(probe.terminated());
    assert!(!probe.killed());
    assert_eq!(supervisor.state(), PluginState::Stopping);

    // Not running any more, so a second stop does nothing
    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), PluginState::Stopping);
}

#[tokio::test]
async fn test_stray_output_on_native_stream_disconnects() {
    use tokio::io::AsyncWriteExt;

    let mut harness = Harness::new();
    let plugin = PluginDir::with_subclass("chatty", 0);
    let supervisor = harness.supervisor(plugin.path());

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let mut child = harness.next_child().await;
    assert_eq!(child.plan.transport(), TransportKind::Native);

    let verify = serde_json::to_vec(&PluginOp::Verify { allow: true }).unwrap();
    child.stream.write_u32(verify.len() as u32).await.unwrap();
    child.stream.write_all(&verify).await.unwrap();
    starting.await.unwrap().unwrap();
    assert_eq!(supervisor.state(), PluginState::Running);

    // Read as an oversized length prefix
    child.stream.write_all(b"hello from println\n").await.unwrap();
    for _ in 0..100 {
        if supervisor.state() == PluginState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(supervisor.state(), PluginState::Stopped);
    assert!(matches!(
        supervisor.call("anything", vec![]).await,
        Err(PluginError::NotRunning)
    ));
}

#[tokio::test]
async fn test_plugin_exit_marks_stopped() {
    let mut harness = Harness::new();
    harness.kernel.reply("core", "unregister_plugin", json!({}));
    let plugin = PluginDir::new("leaver");
    let supervisor = harness.supervisor(plugin.path());

    let (runtime, _) = harness.start_verified(&supervisor).await;
    runtime.exit(0, Some("done".to_string())).await;

    let request = harness.kernel.wait_for_call("core", "unregister_plugin").await;
    assert_eq!(request["namespace"], json!("leaver"));

    drop(runtime);
    for _ in 0..100 {
        if supervisor.state() == PluginState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(supervisor.state(), PluginState::Stopped);
}
