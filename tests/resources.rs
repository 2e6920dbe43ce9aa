//! Allocation failures as seen by components and by the run.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ips_runtime::error::PhaseError;
use ips_runtime::resources::NodeStatus;
use ips_runtime::tasks::EXIT_NODE_FAILURE;
use ips_runtime::{
    Component, ComponentCatalog, ComponentError, RuntimeError, ServicesProxy, TaskRequest,
};
use serde_json::Value;

type Seen = Arc<Mutex<Vec<String>>>;

/// Asks for more cores than the inventory holds.
struct Greedy {
    seen: Seen,
}

#[async_trait]
impl Component for Greedy {
    async fn step(&mut self, services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        match services.get_allocation(20, None, false, None).await {
            Ok(a) => Ok(Value::from(a.total_cores)),
            Err(e) => {
                self.seen.lock().unwrap().push(e.as_label().to_string());
                Err(e.into())
            }
        }
    }
}

/// Forwards `step` to `WORKER` and records how the call failed.
struct Watcher {
    seen: Seen,
}

#[async_trait]
impl Component for Watcher {
    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        let worker = services.get_port("WORKER").await?;
        match services.call(&worker, "step", vec![Value::from(t)]).await {
            Ok(v) => Ok(v),
            Err(e) => {
                let origin = e.origin().unwrap_or_default().to_string();
                self.seen
                    .lock()
                    .unwrap()
                    .push(format!("{} from {origin}", e.as_label()));
                Err(e.into())
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_allocation_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "s4_bad_alloc",
        &[("DRIVER", "Watcher"), ("WORKER", "Greedy")],
        "",
    );
    let sim = common::load(&conf);
    let seen: Seen = Arc::default();
    let mut catalog = ComponentCatalog::new();
    let (a, b) = (Arc::clone(&seen), Arc::clone(&seen));
    catalog
        .register("Watcher", move |_| {
            Box::new(Watcher {
                seen: Arc::clone(&a),
            })
        })
        .register("Greedy", move |_| {
            Box::new(Greedy {
                seen: Arc::clone(&b),
            })
        });

    let err = common::builder(catalog, 1, 10)
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap_err();

    match err {
        RuntimeError::Phase(PhaseError::Failed {
            phase, component, ..
        }) => {
            assert_eq!(phase, "RUN");
            assert!(component.contains("@Greedy@"), "{component}");
        }
        other => panic!("unexpected {other:?}"),
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], "resource_bad_request");
    assert!(
        seen[1].starts_with("invocation_remote_failure from s4_bad_alloc@Greedy@"),
        "{seen:?}"
    );
    assert_eq!(common::checklist(&sim), [true, true, false]);
}

/// Runs one long sleep and reports its exit code.
struct Sleeper {
    codes: Arc<Mutex<Vec<i32>>>,
}

#[async_trait]
impl Component for Sleeper {
    async fn step(&mut self, services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        let id = services
            .launch_task(TaskRequest::new("/bin/sleep", 2).arg("30"))
            .await?;
        let code = services.wait_task(id).await?;
        self.codes.lock().unwrap().push(code);
        Ok(Value::from(code))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_failure_kills_holding_task() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "s5_node_down",
        &[("DRIVER", "HelloDriver"), ("WORKER", "Sleeper")],
        "",
    );
    let sim = common::load(&conf);
    let codes = Arc::new(Mutex::new(Vec::new()));
    let mut catalog = ComponentCatalog::with_builtins();
    let shared = Arc::clone(&codes);
    catalog.register("Sleeper", move |_| {
        Box::new(Sleeper {
            codes: Arc::clone(&shared),
        })
    });

    let framework = common::builder(catalog, 2, 4)
        .simulation(sim.clone())
        .build()
        .unwrap();
    let handle = framework.handle();
    let run = tokio::spawn(framework.run());

    let held = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let snap = handle.snapshot().await.unwrap();
            if snap.allocations == 1 {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("task never got its allocation");
    let node = held
        .nodes
        .iter()
        .find(|n| n.allocated_cores > 0)
        .unwrap()
        .name
        .clone();

    handle.mark_node_down(&node).await.unwrap();
    let released = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snap = handle.snapshot().await.unwrap();
            if snap.allocations == 0 {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("allocation was not released");
    let view = released.nodes.iter().find(|n| n.name == node).unwrap();
    assert_eq!(view.status, NodeStatus::Down);
    assert_eq!(view.allocated_cores, 0);
    handle.mark_node_down(&node).await.unwrap();

    tokio::time::timeout(Duration::from_secs(20), run)
        .await
        .expect("run did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(*codes.lock().unwrap(), vec![EXIT_NODE_FAILURE]);
    assert_eq!(common::checklist(&sim), [true, true, true]);
}
