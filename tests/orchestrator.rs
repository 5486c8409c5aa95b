mod common;

use common::{
    count_entries, fake_proot, free_port, init_logging, layer_archive, manifest_json, marker_files,
    not_an_archive, write_file, Reply, TestServer,
};
use sandstrap::{
    errors::{BootstrapError, ErrorKind, ProcessError},
    BootstrapState, GatewayConfig, Orchestrator, Provider, Role, ServiceSpec,
};
use std::{os::unix::process::ExitStatusExt, time::Duration};
use tempfile::TempDir;
use tokio::runtime::Runtime;

const APP_LAYER: &str = "/layers/app-2.0.tar.gz";
const READY_PRIMARY: &str = "echo \"listening on ws://127.0.0.1:{port}\"; exec sleep 60";
const READY_SECONDARY: &str = "echo \"serving web UI on {port}\"; exec sleep 60";

/// A manifest with a bundled base layer carrying the marker files, plus a
/// remote application layer
struct Fixture {
    server: TestServer,
    home: TempDir,
    assets: TempDir,
}

impl Fixture {
    async fn new() -> Fixture {
        Fixture::with_layers(
            &marker_files(),
            &[("usr/local/lib/gateway/webui.mjs", "export {}\n")],
        )
        .await
    }

    /// Bundled `base` and remote `app` layers with the given contents
    async fn with_layers(base_files: &[(&str, &str)], app_files: &[(&str, &str)]) -> Fixture {
        let server = TestServer::start().await;
        let base = layer_archive(base_files);
        let app = layer_archive(app_files);
        server.route(
            "/manifest.json",
            Reply::ok(manifest_json(&[
                ("base", "base-1.0.tar.gz", "1.0", base.len() as u64),
                ("app", "app-2.0.tar.gz", "2.0", app.len() as u64),
            ])),
        );
        server.route(APP_LAYER, Reply::ok(app));
        let assets = tempfile::tempdir().unwrap();
        write_file(assets.path(), "base-1.0.tar.gz", &base);
        Fixture {
            server,
            home: tempfile::tempdir().unwrap(),
            assets,
        }
    }

    fn orchestrator(&self, primary: &str, secondary: ServiceSpec) -> Orchestrator {
        Orchestrator::builder()
            .data_dir(self.home.path())
            .assets_dir(self.assets.path())
            .manifest_url(&self.server.url("/manifest.json"))
            .layer_base_url(&self.server.url("/layers/"))
            .proot(&fake_proot())
            .primary(ServiceSpec::new(primary, 0, Duration::from_secs(10)))
            .secondary(secondary)
            .stop_grace(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    fn default_orchestrator(&self) -> Orchestrator {
        self.orchestrator(READY_PRIMARY, secondary(READY_SECONDARY))
    }
}

fn secondary(command: &str) -> ServiceSpec {
    ServiceSpec::new(command, free_port(), Duration::from_secs(10))
}

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::new(Provider::Anthropic, "sk-ant-test");
    config.port = free_port();
    config
}

#[test]
fn bootstrap_then_stop() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.default_orchestrator();
        assert!(!orchestrator.is_provisioned());

        let config = config();
        orchestrator.bootstrap(config.clone()).unwrap();
        orchestrator.wait().await.unwrap();

        let status = orchestrator.status();
        assert_eq!(status.state, BootstrapState::Running);
        assert_eq!(status.progress, 1.0);
        assert!(orchestrator.is_provisioned());
        assert_eq!(fixture.server.hits_for(APP_LAYER), 1);
        assert_eq!(fixture.server.hits_for("/layers/base-1.0.tar.gz"), 0);

        let ledger = orchestrator.ledger();
        assert_eq!(ledger.get("base").unwrap().version, "1.0");
        assert_eq!(ledger.get("app").unwrap().version, "2.0");
        assert!(orchestrator
            .paths()
            .rootfs
            .join("usr/local/lib/gateway/webui.mjs")
            .is_file());

        let effective = orchestrator.config().unwrap();
        assert_eq!(effective.port, config.port);
        assert_eq!(effective.auth_token.len(), 32);
        let written = std::fs::read_to_string(
            orchestrator.paths().rootfs.join("root/.gateway/config.json"),
        )
        .unwrap();
        assert!(written.contains(&effective.auth_token));

        let lines = orchestrator.log_lines();
        for expected in &[
            "Manifest: base@1.0, app@2.0",
            "State: preparing",
            "State: extracting",
            "State: downloading",
            "State: starting",
            "State: waiting for secondary process",
            "State: running",
            "The primary process is ready",
            "The secondary process is ready",
        ] {
            assert!(lines.iter().any(|l| l == expected), "{} in {:#?}", expected, lines);
        }
        assert!(lines.iter().any(|l| l.starts_with("Installed app@2.0")));
        assert!(lines
            .iter()
            .any(|l| l == &format!("[primary] listening on ws://127.0.0.1:{}", config.port)));

        let primary = orchestrator.process(Role::Primary).await.unwrap();
        let secondary = orchestrator.process(Role::Secondary).await.unwrap();
        assert!(primary.is_alive() && secondary.is_alive());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Idle);
        assert_eq!(orchestrator.status().progress, 0.0);
        assert!(!primary.is_alive() && !secondary.is_alive());
        assert!(orchestrator.process(Role::Primary).await.is_none());
        assert_eq!(orchestrator.log_lines().last().unwrap(), "Stopped");
        assert!(orchestrator.is_provisioned());
    })
}

#[test]
fn progress_never_goes_backwards() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.default_orchestrator();

        let mut status = orchestrator.subscribe_status();
        let sampler = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let current = status.borrow_and_update().clone();
                seen.push(current.progress);
                if current.progress >= 1.0 || current.error().is_some() {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
            seen
        });

        orchestrator.bootstrap(config()).unwrap();
        orchestrator.wait().await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(5), sampler)
            .await
            .unwrap()
            .unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
        assert_eq!(*seen.last().unwrap(), 1.0);

        orchestrator.stop().await.unwrap();
    })
}

#[test]
fn quick_start_skips_installed_layers() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.default_orchestrator();
        orchestrator.bootstrap(config()).unwrap();
        orchestrator.wait().await.unwrap();
        orchestrator.stop().await.unwrap();
        let downloads = fixture.server.hits_for(APP_LAYER);

        // a fresh orchestrator sees only what is on disk
        let orchestrator = fixture.default_orchestrator();
        assert!(orchestrator.is_provisioned());
        orchestrator.quick_start(config()).unwrap();
        orchestrator.wait().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Running);
        assert_eq!(fixture.server.hits_for(APP_LAYER), downloads);
        assert!(!orchestrator.log_lines().iter().any(|l| l == "State: preparing"));

        // asking again while running is harmless
        orchestrator.quick_start(config()).unwrap();
        orchestrator.wait().await.unwrap();
        assert_eq!(orchestrator.log_lines().last().unwrap(), "Already running");
        assert_eq!(orchestrator.status().state, BootstrapState::Running);

        orchestrator.stop().await.unwrap();
    })
}

#[test]
fn quick_start_needs_a_provisioned_root() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.default_orchestrator();
        orchestrator.quick_start(config()).unwrap();
        let err = orchestrator.wait().await.unwrap_err();
        assert!(matches!(err, BootstrapError::NotProvisioned { .. }), "{:?}", err);
        assert_eq!(err.kind(), ErrorKind::Layer);
        assert!(orchestrator.status().error().is_some());
        assert_eq!(fixture.server.hits_for(APP_LAYER), 0);
        assert!(orchestrator.process(Role::Primary).await.is_none());
    })
}

#[test]
fn failed_layer_then_retry() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let good = layer_archive(&[("usr/local/lib/gateway/webui.mjs", "export {}\n")]);
        fixture.server.route(APP_LAYER, Reply::ok(not_an_archive()));
        let orchestrator = fixture.default_orchestrator();
        assert!(matches!(orchestrator.retry(), Err(BootstrapError::NothingToRetry)));

        let mut config = config();
        config.auth_token = "fixed-token".to_string();
        orchestrator.bootstrap(config.clone()).unwrap();
        let err = orchestrator.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Layer);
        match &err {
            BootstrapError::Layer { layer, .. } => assert_eq!(layer, "app"),
            other => panic!("unexpected {:?}", other),
        }
        let message = orchestrator.status().error().unwrap().to_string();
        assert!(message.contains("app"), "{}", message);
        let ledger = orchestrator.ledger();
        assert!(ledger.get("base").is_some());
        assert!(ledger.get("app").is_none());
        assert!(orchestrator.process(Role::Primary).await.is_none());

        fixture.server.route(APP_LAYER, Reply::ok(good));
        orchestrator.retry().unwrap();
        orchestrator.wait().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Running);
        assert_eq!(orchestrator.ledger().get("app").unwrap().version, "2.0");
        assert_eq!(orchestrator.config().unwrap(), config);
        assert_eq!(fixture.server.hits_for(APP_LAYER), 2);

        orchestrator.stop().await.unwrap();
    })
}

#[test]
fn one_run_at_a_time() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.default_orchestrator();
        orchestrator.bootstrap(config()).unwrap();
        assert!(matches!(orchestrator.bootstrap(config()), Err(BootstrapError::Busy)));
        assert!(matches!(orchestrator.quick_start(config()), Err(BootstrapError::Busy)));
        orchestrator.wait().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Running);
        orchestrator.stop().await.unwrap();
    })
}

#[test]
fn stop_abandons_a_run() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        // primary never becomes ready on its own
        let orchestrator = fixture.orchestrator("exec sleep 60", secondary(READY_SECONDARY));
        orchestrator.bootstrap(config()).unwrap();

        let mut status = orchestrator.subscribe_status();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.state == BootstrapState::Starting),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Idle);
        assert!(orchestrator.process(Role::Primary).await.is_none());
        orchestrator.wait().await.unwrap();
    })
}

#[test]
fn primary_exits_early() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(
            "echo starting gateway; echo \"Error: listen EADDRINUSE: address already in use :::{port}\" >&2; exit 1",
            secondary(READY_SECONDARY),
        );
        let config = config();
        orchestrator.bootstrap(config.clone()).unwrap();
        let err = orchestrator.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessStartup);
        match &err {
            BootstrapError::Process(ProcessError::ExitedEarly { role, status, output }) => {
                assert_eq!(*role, Role::Primary);
                assert_eq!(status.code(), Some(1));
                assert_eq!(
                    output,
                    &format!("Error: listen EADDRINUSE: address already in use :::{}", config.port)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(orchestrator.status().error().unwrap().contains("EADDRINUSE"));
        assert!(orchestrator.process(Role::Primary).await.is_none());
        assert!(orchestrator.process(Role::Secondary).await.is_none());
    })
}

#[test]
fn secondary_ready_by_polling() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        // the test server stands in for whatever the quiet process would serve
        let quiet = ServiceSpec::new("exec sleep 60", fixture.server.port(), Duration::from_secs(10));
        let orchestrator = fixture.orchestrator(READY_PRIMARY, quiet);
        orchestrator.bootstrap(config()).unwrap();
        orchestrator.wait().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Running);
        assert!(fixture.server.hits_for("/") >= 1);
        orchestrator.stop().await.unwrap();
    })
}

#[test]
fn crash_after_running_is_an_error() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.orchestrator(
            READY_PRIMARY,
            secondary("echo serving; sleep 1; echo 'fatal: out of memory' >&2; exit 2"),
        );
        orchestrator.bootstrap(config()).unwrap();
        orchestrator.wait().await.unwrap();

        let mut status = orchestrator.subscribe_status();
        let failed = tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.error().is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        let message = failed.error().unwrap();
        assert!(message.contains("secondary process exited unexpectedly"), "{}", message);
        assert!(message.contains("fatal: out of memory"), "{}", message);

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Idle);
    })
}

#[test]
fn shutdown_kills_everything() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.default_orchestrator();
        orchestrator.bootstrap(config()).unwrap();
        orchestrator.wait().await.unwrap();
        let primary = orchestrator.process(Role::Primary).await.unwrap();
        let secondary = orchestrator.process(Role::Secondary).await.unwrap();

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.status().state, BootstrapState::Idle);
        for handle in &[primary, secondary] {
            let status = handle.wait_exit(Duration::from_secs(5)).await.unwrap();
            assert_eq!(status.signal(), Some(libc::SIGKILL));
        }
        assert!(orchestrator.process(Role::Primary).await.is_none());
    })
}

#[test]
fn quick_start_reinstalls_stale_layers_that_carry_markers() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let app_files = [
            ("usr/local/lib/gateway/gateway.mjs", "export {}\n"),
            ("usr/local/lib/gateway/webui.mjs", "export {}\n"),
        ];
        let fixture = Fixture::with_layers(&[("usr/bin/node", "#!/bin/sh\n")], &app_files).await;
        fixture.server.route(APP_LAYER, Reply::ok(not_an_archive()));
        let orchestrator = fixture.default_orchestrator();
        orchestrator.bootstrap(config()).unwrap();
        assert!(orchestrator.wait().await.is_err());
        assert!(orchestrator.ledger().get("base").is_some());
        assert!(orchestrator.ledger().get("app").is_none());
        assert!(!orchestrator.missing_markers().is_empty());

        fixture.server.route(APP_LAYER, Reply::ok(layer_archive(&app_files)));
        let orchestrator = fixture.default_orchestrator();
        orchestrator.quick_start(config()).unwrap();
        orchestrator.wait().await.unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Running);
        assert_eq!(orchestrator.ledger().get("app").unwrap().version, "2.0");
        assert!(orchestrator.is_provisioned());
        assert!(orchestrator.log_lines().iter().any(|l| l == "State: preparing"));

        orchestrator.stop().await.unwrap();
    })
}

#[test]
fn stop_while_extracting_leaves_the_root_alone() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let names: Vec<String> = (0..20000).map(|i| format!("usr/share/filler/{:05}", i)).collect();
        let mut base: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "x")).collect();
        base.extend(marker_files());
        let fixture =
            Fixture::with_layers(&base, &[("usr/local/lib/gateway/webui.mjs", "export {}\n")]).await;
        let orchestrator = fixture.default_orchestrator();
        orchestrator.bootstrap(config()).unwrap();

        let mut status = orchestrator.subscribe_status();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| s.state == BootstrapState::Extracting),
        )
        .await
        .unwrap()
        .unwrap();

        orchestrator.stop().await.unwrap();
        let rootfs = &orchestrator.paths().rootfs;
        let written = count_entries(rootfs);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count_entries(rootfs), written);

        assert_eq!(orchestrator.status().state, BootstrapState::Idle);
        assert!(orchestrator.ledger().get("base").is_none());
        assert!(!orchestrator.is_provisioned());
        assert!(!orchestrator.log_lines().iter().any(|l| l.starts_with("Installed base")));
        orchestrator.wait().await.unwrap();
    })
}

#[test]
fn stop_while_downloading_leaves_no_partial_archive() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let blob = "z".repeat(256 * 1024);
        fixture.server.route(
            APP_LAYER,
            Reply::stalled(layer_archive(&[("usr/local/lib/gateway/webui.mjs", blob.as_str())])),
        );
        let orchestrator = fixture.default_orchestrator();
        let downloads = orchestrator.paths().downloads.clone();
        orchestrator.bootstrap(config()).unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while count_entries(&downloads) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(orchestrator.status().state, BootstrapState::Downloading);

        orchestrator.stop().await.unwrap();
        assert_eq!(count_entries(&downloads), 0);
        assert!(orchestrator.ledger().get("base").is_some());
        assert!(orchestrator.ledger().get("app").is_none());
    })
}

#[test]
fn leftover_downloads_are_cleared_by_the_next_run() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let fixture = Fixture::new().await;
        let orchestrator = fixture.default_orchestrator();
        let stale = write_file(&orchestrator.paths().downloads, "1.2.app-2.0.tar.gz", b"partial");

        orchestrator.bootstrap(config()).unwrap();
        orchestrator.wait().await.unwrap();
        assert!(!stale.exists());
        assert_eq!(count_entries(&orchestrator.paths().downloads), 0);
        orchestrator.stop().await.unwrap();
    })
}
