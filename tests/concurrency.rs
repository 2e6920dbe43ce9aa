//! Blocking and non-blocking calls from one driver to three workers.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ips_runtime::{Component, ComponentCatalog, ComponentError, ServicesProxy};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
enum Edge {
    Start,
    End,
}

type Trace = Arc<Mutex<Vec<(String, Edge, f64)>>>;

struct StepDriver;

#[async_trait]
impl Component for StepDriver {
    async fn step(&mut self, services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        let w1 = services.get_port("W1").await?;
        let w2 = services.get_port("W2").await?;
        let w3 = services.get_port("W3").await?;
        for t in services.get_time_loop().await? {
            services.call(&w1, "step", vec![Value::from(t)]).await?;
            let c2 = services
                .call_nonblocking(&w2, "step", vec![Value::from(t)])
                .await?;
            let c3 = services
                .call_nonblocking(&w3, "step", vec![Value::from(t)])
                .await?;
            services.wait_call_list(vec![c2, c3], None).await?;
        }
        Ok(Value::Null)
    }
}

struct Recorder {
    trace: Trace,
}

#[async_trait]
impl Component for Recorder {
    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        let port = services.config().port.clone();
        self.trace.lock().unwrap().push((port.clone(), Edge::Start, t));
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.trace.lock().unwrap().push((port, Edge::End, t));
        Ok(Value::from(t))
    }
}

fn position(trace: &[(String, Edge, f64)], port: &str, edge: Edge, t: f64) -> usize {
    trace
        .iter()
        .position(|(p, e, ts)| p == port && *e == edge && *ts == t)
        .unwrap_or_else(|| panic!("{port} {edge:?} t={t} missing from {trace:?}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_next_step_waits_for_both_workers() {
    let dir = tempfile::tempdir().unwrap();
    let conf = common::write_sim(
        dir.path(),
        "s3_concurrent",
        &[
            ("DRIVER", "StepDriver"),
            ("W1", "Recorder"),
            ("W2", "Recorder"),
            ("W3", "Recorder"),
        ],
        "[TIME_LOOP]\n    MODE = EXPLICIT\n    VALUES = 1 2 3\n",
    );
    let sim = common::load(&conf);
    let trace: Trace = Arc::default();
    let mut catalog = ComponentCatalog::new();
    catalog.register("StepDriver", |_| Box::new(StepDriver));
    let shared = Arc::clone(&trace);
    catalog.register("Recorder", move |_| {
        Box::new(Recorder {
            trace: Arc::clone(&shared),
        })
    });

    common::builder(catalog, 1, 4)
        .simulation(sim.clone())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let trace = trace.lock().unwrap();
    assert_eq!(trace.len(), 18);

    let mut overlapped = false;
    for t in [1.0, 2.0, 3.0] {
        let w1_end = position(&trace, "W1", Edge::End, t);
        for w in ["W2", "W3"] {
            assert!(w1_end < position(&trace, w, Edge::Start, t));
        }
        let w2 = (
            position(&trace, "W2", Edge::Start, t),
            position(&trace, "W2", Edge::End, t),
        );
        let w3 = (
            position(&trace, "W3", Edge::Start, t),
            position(&trace, "W3", Edge::End, t),
        );
        if w2.0 < w3.1 && w3.0 < w2.1 {
            overlapped = true;
        }
        if t < 3.0 {
            let next = t + 1.0;
            let last_end = w2.1.max(w3.1);
            for w in ["W1", "W2", "W3"] {
                assert!(last_end < position(&trace, w, Edge::Start, next));
            }
        }
    }
    assert!(overlapped, "W2 and W3 never ran together: {trace:?}");
    assert_eq!(common::checklist(&sim), [true, true, true]);
}
