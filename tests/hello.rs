//! Serial hello run and phases resumed across invocations.

mod common;

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ips_runtime::{Component, ComponentCatalog, ComponentError, Requested, ServicesProxy};
use serde_json::{Value, json};

struct CountingWorker {
    steps: Arc<AtomicUsize>,
}

#[async_trait]
impl Component for CountingWorker {
    async fn step(&mut self, _services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serial_hello_runs_all_phases() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "s1_hello",
        &[("DRIVER", "HelloDriver"), ("WORKER", "HelloWorker")],
        "",
    );
    let sim = common::load(&conf);

    common::builder(ComponentCatalog::with_builtins(), 1, 4)
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(common::checklist(&sim), [true, true, true]);
    let log = std::fs::read_to_string(&sim.log_file).unwrap();
    assert_eq!(log.matches("HelloWorker step t=0").count(), 1);

    assert!(sim.sim_root.join("work").is_dir());
    assert!(sim.sim_root.join("s1_hello.conf").is_file());
    assert!(sim.sim_root.join("s1_hello_debug.zip").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resumed_phases_step_once() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "s6_resume",
        &[("DRIVER", "HelloDriver"), ("WORKER", "CountingWorker")],
        "",
    );
    let sim = common::load(&conf);
    let steps = Arc::new(AtomicUsize::new(0));
    let catalog = || {
        let mut c = ComponentCatalog::with_builtins();
        let steps = Arc::clone(&steps);
        c.register("CountingWorker", move |_| {
            Box::new(CountingWorker {
                steps: Arc::clone(&steps),
            })
        });
        c
    };

    common::builder(catalog(), 1, 4)
        .phases(Requested {
            create_runspace: true,
            ..Requested::default()
        })
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(common::checklist(&sim), [true, false, false]);
    assert_eq!(steps.load(Ordering::SeqCst), 0);

    common::builder(catalog(), 1, 4)
        .phases(Requested {
            run_setup: true,
            run: true,
            ..Requested::default()
        })
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(common::checklist(&sim), [true, true, true]);
    assert_eq!(steps.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_without_setup_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "gate",
        &[("DRIVER", "HelloDriver"), ("WORKER", "HelloWorker")],
        "",
    );
    let sim = common::load(&conf);

    let err = common::builder(ComponentCatalog::with_builtins(), 1, 4)
        .phases(Requested {
            run: true,
            ..Requested::default()
        })
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "phase_prerequisite_missing");
    assert_eq!(common::checklist(&sim), [false, false, false]);
}

/// Publishes the step time on its registry entry.
struct Tagger;

#[async_trait]
impl Component for Tagger {
    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        services.set_component_field("last_step", json!(t)).await?;
        Ok(Value::Null)
    }
}

/// Steps `WORKER`, then reads its fields back.
struct Inspector {
    seen: Arc<Mutex<Vec<Option<Value>>>>,
}

#[async_trait]
impl Component for Inspector {
    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        let worker = services.get_port("WORKER").await?;
        let before = services.get_component_field(&worker, "last_step").await?;
        services.call(&worker, "step", vec![Value::from(t)]).await?;
        let mut seen = vec![before];
        for field in ["last_step", "port", "name", "nope"] {
            seen.push(services.get_component_field(&worker, field).await?);
        }
        *self.seen.lock().unwrap() = seen;
        Ok(Value::Null)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_component_fields_are_shared_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "fields",
        &[("DRIVER", "Inspector"), ("WORKER", "Tagger")],
        "",
    );
    let sim = common::load(&conf);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut catalog = ComponentCatalog::new();
    let shared = Arc::clone(&seen);
    catalog
        .register("Inspector", move |_| {
            Box::new(Inspector {
                seen: Arc::clone(&shared),
            })
        })
        .register("Tagger", |_| Box::new(Tagger));

    common::builder(catalog, 1, 4)
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            None,
            Some(json!(0.0)),
            Some(json!("WORKER")),
            Some(json!("Tagger")),
            None,
        ]
    );
}
