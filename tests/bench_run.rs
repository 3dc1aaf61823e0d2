//! End-to-end runs: scheduler, test sets and a virtual device

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

use devbench_core::core::device::{CallOptions, CapabilityRegistry, Device, DeviceGroup, Operation};
use devbench_core::core::logger::{self, TrafficLog};
use devbench_core::core::protocol::{FrameCodec, ProtocolConfig};
use devbench_core::core::scheduler::{Scheduler, SchedulerError, SchedulerSettings};
use devbench_core::core::simulator::{self, ResponseRule, SimulatorHandle, VirtualDevice};
use devbench_core::core::testing::{CaseContext, CaseResult, CaseSpec, MemorySink, TestRegistry, TestSet, TestSetDef, Verdict};

fn settings(dir: &Path) -> SchedulerSettings {
    SchedulerSettings {
        log_dir: dir.join("logs"),
        report_dir: Some(dir.join("reports")),
        circle: 2,
        ..SchedulerSettings::default()
    }
}

fn verdicts(rows: &[CaseResult]) -> Vec<(&str, Verdict)> {
    rows.iter().map(|r| (r.no.as_str(), r.result)).collect()
}

async fn simulated_device(traffic: TrafficLog) -> (Device, SimulatorHandle) {
    let config = Arc::new(ProtocolConfig::default());
    let mut sim = VirtualDevice::new("bench", config.clone()).with_device_info(b"SIM-1");
    sim.add_rule(ResponseRule::status("led", 0x02, 0x10, 0x0000)).unwrap();
    sim.add_rule(ResponseRule::status("fan", 0x02, 0x11, 0x0103)).unwrap();
    sim.add_rule(ResponseRule::status("reset", 0x00, 0x01, 0x0000)).unwrap();
    let (transport, handle) = simulator::connect(sim, FrameCodec::new(config.clone()), traffic);

    let mut registry = CapabilityRegistry::new(config);
    registry.register(Operation::new("led_set", &[0x02], &[0x10])).unwrap();
    registry.register(Operation::new("fan_set", &[0x02], &[0x11])).unwrap();
    registry.register(Operation::new("reset", &[0x00], &[0x01])).unwrap();
    let device = Device::connect(transport, registry, Duration::from_secs(1)).await.unwrap();
    (device, handle)
}

struct Peripherals {
    devices: DeviceGroup,
}

#[async_trait]
impl TestSet for Peripherals {
    async fn run(&mut self, case_no: &str, ctx: &mut CaseContext) -> anyhow::Result<()> {
        let device = self.devices.get(0).cloned().expect("device attached");
        match case_no {
            "TC_LED_001" => {
                let reply = device.call("led_set", &json!({}), CallOptions::default()).await?;
                ctx.check_status(reply.into_single().as_ref(), "led_set", None);
            }
            "TC_FAN_001" => {
                let reply = device.call("fan_set", &json!({}), CallOptions::default()).await?;
                ctx.check_status(reply.into_single().as_ref(), "fan_set", None);
            }
            "TC_PANIC_001" => panic!("sensor unplugged"),
            "TC_LOOP_001" => {
                let circle = ctx.circle().unwrap_or(1);
                for i in 1..=circle {
                    ctx.log(&format!("loop {}/{}", i, circle));
                    device.call("led_set", &json!({}), CallOptions::default()).await?;
                }
            }
            other => anyhow::bail!("unknown case {}", other),
        }
        Ok(())
    }
}

fn peripherals() -> TestSetDef {
    TestSetDef::new("Peripherals", |devices| {
        Box::new(Peripherals {
            devices: devices.clone(),
        })
    })
    .case(CaseSpec::new("TC_LED_001").name("LED on"))
    .case(CaseSpec::new("TC_FAN_001").name("Fan on"))
    .case(CaseSpec::new("TC_PANIC_001").name("Sensor read"))
    .case(CaseSpec::new("TC_LOOP_001").name("LED loop").repeatable())
}

#[tokio::test]
async fn test_run_against_virtual_device() {
    let dir = tempfile::tempdir().unwrap();
    let traffic = logger::shared();
    let (device, handle) = simulated_device(traffic.clone()).await;

    let mut settings = settings(dir.path());
    settings.reset_operation = Some("reset".into());
    let scheduler = Scheduler::new(settings, traffic);
    scheduler.attach_device(device);
    let mut tests = TestRegistry::new();
    tests.add(peripherals()).unwrap();
    scheduler.load_tests(tests);

    let sink = MemorySink::new();
    scheduler.attach_sink(Box::new(sink.clone()));
    let summary = assert_ok!(scheduler.run().await);

    assert_eq!(summary.invocations, 4);
    assert_eq!(summary.blocked, 1);
    let rows = sink.rows();
    assert_eq!(
        verdicts(&rows),
        vec![
            ("TC_LED_001", Verdict::Pass),
            ("TC_FAN_001", Verdict::Fail),
            ("TC_PANIC_001", Verdict::Block),
            ("TC_LOOP_001", Verdict::Pass),
        ]
    );
    assert_eq!(rows[1].msg.as_deref(), Some("fan_set,errcode:0301"));
    assert_eq!(rows[2].msg.as_deref(), Some("sensor unplugged"));

    let log = std::fs::read_to_string(summary.log_dir.join("Peripherals.log")).unwrap();
    assert!(log.contains("==========TC_LED_001=========="));
    assert!(log.contains("loop 2/2"));
    assert!(log.contains("aa021000"));

    let report = std::fs::read_to_string(dir.path().join("reports").join(format!("{}.jsonl", summary.run_id))).unwrap();
    assert_eq!(report.lines().count(), 4);

    scheduler.close_devices().await;
    handle.shutdown().await;
}

/// Signals when the slow case has started, then waits forever
struct Slow {
    started: Arc<Notify>,
}

#[async_trait]
impl TestSet for Slow {
    async fn run(&mut self, case_no: &str, _ctx: &mut CaseContext) -> anyhow::Result<()> {
        if case_no == "TC_SLOW" {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

fn slow_scheduler(dir: &Path, started: Arc<Notify>) -> Scheduler {
    let scheduler = Scheduler::new(settings(dir), logger::shared());
    let mut tests = TestRegistry::new();
    tests
        .add(
            TestSetDef::new("Slow", move |_| {
                Box::new(Slow {
                    started: started.clone(),
                })
            })
            .case(CaseSpec::new("TC_SLOW"))
            .case(CaseSpec::new("TC_FAST")),
        )
        .unwrap();
    scheduler.load_tests(tests);
    scheduler
}

#[tokio::test]
async fn test_second_run_rejected_then_stop() {
    let dir = tempfile::tempdir().unwrap();
    let started = Arc::new(Notify::new());
    let scheduler = slow_scheduler(dir.path(), started.clone());
    let sink = MemorySink::new();
    scheduler.attach_sink(Box::new(sink.clone()));

    let (first, second) = tokio::join!(scheduler.run(), async {
        started.notified().await;
        let second = scheduler.run().await;
        scheduler.stop();
        second
    });

    assert!(matches!(assert_err!(second), SchedulerError::RunAlreadyActive));
    let summary = assert_ok!(first);
    assert!(summary.stopped);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.invocations, 0);
    assert!(sink.rows().is_empty());
    assert!(sink.is_closed());
    assert!(!scheduler.is_running());

    scheduler.with_catalog(|catalog| catalog.set_selection([("Slow", "TC_FAST")]));
    let summary = assert_ok!(scheduler.run().await);
    assert_eq!(summary.invocations, 1);
}

#[tokio::test]
async fn test_cancel_current_moves_on() {
    let dir = tempfile::tempdir().unwrap();
    let started = Arc::new(Notify::new());
    let scheduler = slow_scheduler(dir.path(), started.clone());
    let sink = MemorySink::new();
    scheduler.attach_sink(Box::new(sink.clone()));

    let (summary, ()) = tokio::join!(scheduler.run(), async {
        started.notified().await;
        scheduler.cancel_current();
    });

    let summary = assert_ok!(summary);
    assert!(!summary.stopped);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.invocations, 1);
    assert_eq!(verdicts(&sink.rows()), vec![("TC_FAST", Verdict::Pass)]);
}

#[tokio::test]
async fn test_reload_keeps_selection() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = slow_scheduler(dir.path(), Arc::new(Notify::new()));
    scheduler.with_catalog(|catalog| catalog.deselect("Slow", "TC_SLOW"));

    let mut tests = TestRegistry::new();
    tests
        .add(
            TestSetDef::new("Slow", |_| {
                Box::new(Slow {
                    started: Arc::new(Notify::new()),
                })
            })
            .case(CaseSpec::new("TC_SLOW"))
            .case(CaseSpec::new("TC_FAST"))
            .case(CaseSpec::new("TC_NEW")),
        )
        .unwrap();
    tests.add(peripherals()).unwrap();
    scheduler.load_tests(tests);

    let catalog = scheduler.catalog();
    assert!(!catalog.is_first_load());
    assert!(catalog.is_selected("Slow", "TC_FAST"));
    assert!(!catalog.is_selected("Slow", "TC_SLOW"));
    assert!(!catalog.is_selected("Slow", "TC_NEW"));
    assert!(!catalog.is_selected("Peripherals", "TC_LED_001"));
    assert_eq!(catalog.cases("Slow").map(<[_]>::len), Some(3));

    let summary = assert_ok!(scheduler.run().await);
    assert_eq!(summary.invocations, 1);
}
