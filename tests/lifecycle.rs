use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use proxyns::config::ConfigStore;
use proxyns::netns::{
    CleanupError, HostOp, MemoryHost, NamespaceOrchestrator, NamespaceSpec, NetworkHost,
    OrchestratorOptions, Phase, ReadyError, RelayOptions, SetupError, SetupStep, StateStore,
};

fn spec() -> NamespaceSpec {
    let mut config = ConfigStore::defaults();
    config.set("ip", "203.0.113.5").unwrap();
    config.set("port", "1080").unwrap();
    config.set("socks_url", "socks5://203.0.113.5:1080").unwrap();
    config.set("dns", "1.1.1.1").unwrap();
    config.namespace_spec().expect("default config should be valid")
}

fn options() -> OrchestratorOptions {
    OrchestratorOptions {
        relay: RelayOptions::default(),
        grace_period: Duration::from_millis(50),
        settle_delay: Duration::ZERO,
    }
}

fn orchestrator() -> (Arc<MemoryHost>, NamespaceOrchestrator) {
    let host = Arc::new(MemoryHost::new());
    let orch = NamespaceOrchestrator::new(host.clone(), options());
    (host, orch)
}

#[test]
fn test_setup_then_cleanup_round_trip() {
    let (host, orch) = orchestrator();
    let spec = spec();

    let handle = orch.setup(spec.clone()).expect("setup failed");
    assert_eq!(handle.namespace, "proxied");
    assert_eq!(orch.phase(), Phase::Ready);
    assert!(host.namespace_exists("proxied"));
    assert!(host.link_exists(None, "veth_host"));
    assert!(host.link_exists(Some("proxied"), "veth_ns"));
    assert!(host.link_exists(Some("proxied"), "tun0"));
    assert!(host.masquerade_exists(&spec.veth_subnet()));
    assert!(host.resolv_conf_exists("proxied"));
    assert!(host.process_alive(handle.pid));
    assert_eq!(host.relay_namespace(handle.pid).as_deref(), Some("proxied"));

    let relay = host.relay_command(handle.pid).unwrap();
    assert!(relay.contains("-device tun://tun0"));
    assert!(relay.contains("-proxy socks5://203.0.113.5:1080"));

    orch.cleanup("proxied", Some(&handle)).expect("cleanup failed");
    assert_eq!(orch.phase(), Phase::Absent);
    assert!(!host.process_alive(handle.pid));
    assert!(host.is_pristine());
}

#[test]
fn test_failure_at_every_step_leaves_host_pristine() {
    let tun = spec().tun_interface;
    let injections: Vec<(SetupStep, Box<dyn Fn(&MemoryHost)>)> = vec![
        (
            SetupStep::CreateNamespace,
            Box::new(|h: &MemoryHost| h.fail_when(|op| matches!(op, HostOp::AddNamespace { .. }))),
        ),
        (
            SetupStep::CreateVethPair,
            Box::new(|h: &MemoryHost| h.fail_when(|op| matches!(op, HostOp::MoveLink { .. }))),
        ),
        (
            SetupStep::ConfigureVeth,
            Box::new(|h: &MemoryHost| h.fail_when(|op| matches!(op, HostOp::AddMasquerade { .. }))),
        ),
        (
            SetupStep::CreateTun,
            Box::new(|h: &MemoryHost| h.fail_when(|op| matches!(op, HostOp::AddTun { .. }))),
        ),
        (
            SetupStep::RouteThroughTun,
            Box::new(move |h: &MemoryHost| {
                let tun = tun.clone();
                h.fail_when(move |op| match op {
                    HostOp::AddRoute { route, .. } => route.dev.as_deref() == Some(tun.as_str()),
                    _ => false,
                })
            }),
        ),
        (SetupStep::StartRelay, Box::new(|h: &MemoryHost| h.fail_relay_spawn())),
    ];

    for (step, inject) in injections {
        let (host, orch) = orchestrator();
        inject(&host);

        let err = orch.setup(spec()).unwrap_err();
        assert_eq!(err.step(), Some(step), "wrong step for {:?}: {}", step, err);
        assert!(
            matches!(err, SetupError::StepFailed { .. }),
            "rollback after {:?} was incomplete: {}",
            step,
            err
        );
        assert_eq!(orch.phase(), Phase::Failed);
        assert!(orch.state().residual.is_empty());
        assert!(host.is_pristine(), "host not pristine after failing {:?}", step);

        // FAILED blocks setup until cleanup succeeds
        host.clear_failures();
        assert!(matches!(
            orch.setup(spec()),
            Err(SetupError::InvalidPhase { .. })
        ));
        orch.cleanup("proxied", None).unwrap();
        assert_eq!(orch.phase(), Phase::Absent);
    }
}

#[test]
fn test_incomplete_rollback_is_finished_by_cleanup() {
    let (host, orch) = orchestrator();
    host.fail_when(|op| matches!(op, HostOp::AddTun { .. }));
    host.fail_when(|op| matches!(op, HostOp::DeleteMasquerade { .. }));

    let err = orch.setup(spec()).unwrap_err();
    let SetupError::RollbackIncomplete { residual, .. } = err else {
        panic!("expected RollbackIncomplete, got {:?}", err);
    };
    assert_eq!(residual.len(), 1);
    assert!(!host.is_pristine());

    // Still failing: cleanup reports the same leftover and stays FAILED
    match orch.cleanup("proxied", None) {
        Err(CleanupError::Incomplete { phase, failures }) => {
            assert_eq!(phase, Phase::Failed);
            assert_eq!(failures.len(), 1);
        }
        other => panic!("expected Incomplete, got {:?}", other),
    }

    host.clear_failures();
    orch.cleanup("proxied", None).unwrap();
    assert!(host.is_pristine());
}

#[test]
fn test_concurrent_setups_serialize() {
    let (host, orch) = orchestrator();
    let spec = spec();

    let handles: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| s.spawn(|| orch.setup(spec.clone())))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap().expect("setup failed"))
            .collect()
    });

    // One namespace, one relay, every caller got the same handle
    assert!(handles.iter().all(|h| *h == handles[0]));
    assert_eq!(host.snapshot().live_relays, vec![handles[0].pid]);
    let creates = host
        .commands()
        .iter()
        .filter(|c| c.starts_with("ip netns add"))
        .count();
    assert_eq!(creates, 1);
}

#[test]
fn test_state_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryHost::new());

    let handle = {
        let orch = NamespaceOrchestrator::with_store(
            host.clone(),
            options(),
            StateStore::in_dir(dir.path()),
        )
        .unwrap();
        orch.setup(spec()).unwrap()
    };

    // A later invocation sees READY and can tear down
    let orch =
        NamespaceOrchestrator::with_store(host.clone(), options(), StateStore::in_dir(dir.path()))
            .unwrap();
    assert_eq!(orch.phase(), Phase::Ready);
    assert_eq!(orch.relay_handle(), Some(handle.clone()));
    orch.cleanup("proxied", Some(&handle)).unwrap();

    assert!(host.is_pristine());
    assert!(!StateStore::in_dir(dir.path()).path().exists());
}

#[test]
fn test_cleanup_from_another_process_waits_for_running_command() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryHost::new());
    let open = || {
        NamespaceOrchestrator::with_store(host.clone(), options(), StateStore::in_dir(dir.path()))
            .unwrap()
    };
    // Each orchestrator stands in for a separate proxyns invocation
    let (creator, runner, cleaner) = (open(), open(), open());
    creator.setup(spec()).unwrap();

    let guard = runner.read_ready("proxied").unwrap();
    let cleaned = AtomicBool::new(false);
    std::thread::scope(|s| {
        let worker = s.spawn(|| {
            cleaner.cleanup("proxied", None).unwrap();
            cleaned.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(150));
        assert!(!cleaned.load(Ordering::SeqCst), "cleanup ran during a command");
        assert!(host.namespace_exists("proxied"));

        drop(guard);
        worker.join().unwrap();
    });

    assert!(cleaned.load(Ordering::SeqCst));
    assert!(host.is_pristine());
    assert!(matches!(
        runner.read_ready("proxied"),
        Err(ReadyError::NotReady { phase: Phase::Absent })
    ));
}

#[test]
fn test_setups_from_separate_processes_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryHost::new());
    let orchestrators: Vec<_> = (0..3)
        .map(|_| {
            NamespaceOrchestrator::with_store(
                host.clone(),
                options(),
                StateStore::in_dir(dir.path()),
            )
            .unwrap()
        })
        .collect();

    let handles: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = orchestrators
            .iter()
            .map(|orch| s.spawn(|| orch.setup(spec())))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap().expect("setup failed"))
            .collect()
    });

    assert!(handles.iter().all(|h| *h == handles[0]));
    assert_eq!(host.snapshot().live_relays, vec![handles[0].pid]);
    assert_eq!(
        StateStore::in_dir(dir.path()).load().unwrap().relay_pid,
        Some(handles[0].pid)
    );
}

#[test]
fn test_recover_removes_leftovers_of_a_crashed_run() {
    let dir = tempfile::tempdir().unwrap();
    // Forwarding is left alone by recovery; start with it on
    let host = Arc::new(MemoryHost::with_forwarding());

    // Crash: resources exist but no state file was kept
    {
        let orch = NamespaceOrchestrator::new(host.clone(), options());
        let handle = orch.setup(spec()).unwrap();
        host.crash_relay(handle.pid);
    }
    assert!(!host.is_pristine());

    let orch =
        NamespaceOrchestrator::with_store(host.clone(), options(), StateStore::in_dir(dir.path()))
            .unwrap();
    assert_eq!(orch.phase(), Phase::Absent);
    let found = orch.recover(spec(), None).unwrap();
    assert!(!found.is_empty());
    assert_eq!(orch.phase(), Phase::Failed);

    orch.cleanup("proxied", None).unwrap();
    assert!(host.is_pristine());
}

#[test]
#[ignore = "requires CAP_NET_ADMIN, tun2socks and a reachable SOCKS proxy"]
fn test_end_to_end_on_real_host() {
    use proxyns::netns::IpCommandHost;
    use proxyns::session::{EnvironmentReconstructor, SessionBridge};

    // PROXYNS_E2E_SOCKS=socks5://host:port selects the proxy
    let url = std::env::var("PROXYNS_E2E_SOCKS").expect("PROXYNS_E2E_SOCKS not set");
    let endpoint = url.rsplit("://").next().unwrap();
    let (ip, port) = endpoint.rsplit_once(':').unwrap();

    let mut config = ConfigStore::defaults();
    config.set("namespace", "proxyns-e2e").unwrap();
    config.set("veth_host", "pxe2e_h").unwrap();
    config.set("veth_ns", "pxe2e_n").unwrap();
    config.set("veth_host_ip", "10.231.7.1/30").unwrap();
    config.set("veth_ns_ip", "10.231.7.2/30").unwrap();
    config.set("ip", ip).unwrap();
    config.set("port", port).unwrap();
    config.set("socks_url", &url).unwrap();
    let spec = config.namespace_spec().unwrap();

    let host = Arc::new(IpCommandHost::new());
    let orch = NamespaceOrchestrator::new(host.clone(), OrchestratorOptions::default());
    let handle = orch.setup(spec).expect("setup failed");
    assert!(host.namespace_exists("proxyns-e2e"));
    assert!(host.process_alive(handle.pid));

    let status = std::process::Command::new("ip")
        .args(["netns", "exec", "proxyns-e2e", "curl", "-s", "-o", "/dev/null"])
        .args(["--max-time", "10", "https://example.com"])
        .status()
        .unwrap();
    assert!(status.success());

    let env = EnvironmentReconstructor::from_process()
        .reconstruct()
        .expect("environment reconstruction failed");
    let code = SessionBridge::new()
        .run(&orch, &env, "proxyns-e2e", Some("echo hi"))
        .expect("bridge run failed");
    assert_eq!(code, 0);

    orch.cleanup("proxyns-e2e", Some(&handle)).expect("cleanup failed");
    assert!(!host.namespace_exists("proxyns-e2e"));
    assert!(!host.link_exists(None, "pxe2e_h"));
}
