//! Task pools: one hundred one-second sleeps on four cores, and a pool removed
//! while its tasks run.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ips_runtime::error::{PoolError, ServiceError};
use ips_runtime::{
    Component, ComponentCatalog, ComponentError, ServicesProxy, TaskId, TaskRequest,
};
use serde_json::{Value, json};

const POOL: &str = "sleeps";
const TASKS: usize = 100;

#[derive(Default)]
struct Outcome {
    codes: BTreeMap<TaskId, i32>,
    duplicates: usize,
    polls: usize,
    elapsed: Option<Duration>,
}

struct PoolWorker {
    outcome: Arc<Mutex<Outcome>>,
}

#[async_trait]
impl Component for PoolWorker {
    async fn step(&mut self, services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        services.create_task_pool(POOL).await?;
        for i in 0..TASKS {
            let req = TaskRequest::new("/bin/sleep", 1).arg("1");
            services.add_task(POOL, &format!("sleep_{i}"), req).await?;
        }

        let started = Instant::now();
        services.submit_tasks_nonblocking(POOL).await?;
        loop {
            match services.get_finished_tasks(POOL, false).await {
                Ok(batch) => {
                    let idle = {
                        let mut out = self.outcome.lock().unwrap();
                        out.polls += 1;
                        let idle = batch.is_empty();
                        for (id, code) in batch {
                            if out.codes.insert(id, code).is_some() {
                                out.duplicates += 1;
                            }
                        }
                        idle
                    };
                    if idle {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                Err(ServiceError::Pool(PoolError::Empty { .. })) => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.outcome.lock().unwrap().elapsed = Some(started.elapsed());
        services.remove_task_pool(POOL).await?;
        Ok(Value::Null)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_sleeps_on_four_cores() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "s2_pool",
        &[("DRIVER", "HelloDriver"), ("WORKER", "PoolWorker")],
        "",
    );
    let sim = common::load(&conf);
    let outcome = Arc::new(Mutex::new(Outcome::default()));
    let mut catalog = ComponentCatalog::with_builtins();
    let shared = Arc::clone(&outcome);
    catalog.register("PoolWorker", move |_| {
        Box::new(PoolWorker {
            outcome: Arc::clone(&shared),
        })
    });

    common::builder(catalog, 1, 4)
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let out = outcome.lock().unwrap();
    assert_eq!(out.codes.len(), TASKS);
    assert!(out.codes.values().all(|c| *c == 0), "{:?}", out.codes);
    assert_eq!(out.duplicates, 0);
    assert!(out.polls > 1);
    let elapsed = out.elapsed.unwrap();
    assert!(
        elapsed >= Duration::from_secs(25) && elapsed <= Duration::from_secs(35),
        "elapsed {elapsed:?}"
    );
    assert_eq!(common::checklist(&sim), [true, true, true]);
}

/// Starts long sleeps through a pool, removes it mid-flight, then asks for the
/// whole node back.
struct Abandoner {
    report: Arc<Mutex<Option<Value>>>,
}

#[async_trait]
impl Component for Abandoner {
    async fn step(&mut self, services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        services.create_task_pool(POOL).await?;
        for i in 0..3 {
            let req = TaskRequest::new("/bin/sleep", 1).arg("30");
            services.add_task(POOL, &format!("long_{i}"), req).await?;
        }
        let launched = services.submit_tasks_nonblocking(POOL).await?;
        services.remove_task_pool(POOL).await?;
        let gone = matches!(
            services.get_finished_tasks(POOL, false).await,
            Err(ServiceError::Pool(PoolError::UnknownPool { .. }))
        );

        let started = Instant::now();
        let alloc = services
            .get_allocation(2, None, true, Some(Duration::from_secs(10)))
            .await?;
        let regained = started.elapsed();
        services.release_allocation(alloc.task_id).await?;
        *self.report.lock().unwrap() = Some(json!({
            "launched": launched,
            "gone": gone,
            "regained_ms": regained.as_millis() as u64,
        }));
        Ok(Value::Null)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removing_pool_kills_running_tasks_and_frees_cores() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "pool_remove",
        &[("DRIVER", "HelloDriver"), ("WORKER", "Abandoner")],
        "",
    );
    let sim = common::load(&conf);
    let report = Arc::new(Mutex::new(None));
    let mut catalog = ComponentCatalog::with_builtins();
    let shared = Arc::clone(&report);
    catalog.register("Abandoner", move |_| {
        Box::new(Abandoner {
            report: Arc::clone(&shared),
        })
    });

    let started = Instant::now();
    common::builder(catalog, 1, 2)
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));

    let report = report.lock().unwrap().clone().unwrap();
    assert_eq!(report["launched"], 2);
    assert_eq!(report["gone"], true);
    assert!(report["regained_ms"].as_u64().unwrap() < 10_000);
    assert_eq!(common::checklist(&sim), [true, true, true]);
}
