//! Tests for the DAG executor
//!
//! These tests verify:
//! - Every node runs after all of its dependencies, on random graphs
//! - Failures mark dependents failed without evaluating them
//! - Skips propagate to dependents and withdraw their objects
//! - Independent branches proceed past a failure
//! - The per-pass concurrency bound holds

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use kube::api::{ApiResource, DynamicObject};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use super::super::executor::*;
    use super::super::memory_store::MemoryStore;
    use super::super::store::{ObjectKey, ObjectStore, WatchEvent};
    use super::super::test_support::*;
    use super::super::workflow::{DeletionPolicy, Workflow};
    use crate::crd::ReviewCluster;
    use crate::error::StoreError;

    async fn run_pass(
        store: Arc<dyn ObjectStore>,
        workflow: &Workflow<ReviewCluster>,
        rc: &ReviewCluster,
        max_concurrency: usize,
    ) -> PassReport {
        let applier = applier(Arc::clone(&store));
        let gc = garbage_collector(store);
        let owner = parent_ref(rc);
        DagExecutor::new(workflow, &applier, &gc, max_concurrency)
            .run(rc, &owner)
            .await
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_random_graphs_respect_dependencies() {
        for rng_seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(rng_seed);
            let n = rng.gen_range(1..12);
            let names: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();

            // Edges only point at lower indices, so the graph is acyclic.
            let mut deps: HashMap<String, BTreeSet<String>> = HashMap::new();
            for i in 0..n {
                let set = deps.entry(names[i].clone()).or_default();
                for j in 0..i {
                    if rng.gen_bool(0.3) {
                        set.insert(names[j].clone());
                    }
                }
            }

            let log = new_log();
            let mut registration: Vec<usize> = (0..n).collect();
            registration.shuffle(&mut rng);
            let mut builder = Workflow::builder("random");
            for &i in &registration {
                let (node, _) = fake(&names[i], &log);
                builder = builder.add(node.depends_on(deps[&names[i]].iter().cloned()));
            }
            let workflow = builder.build().unwrap();

            let store = Arc::new(MemoryStore::new());
            let rc = seed(&store, &review_cluster("rc")).await;
            let report = run_pass(store, &workflow, &rc, rng.gen_range(1..5)).await;

            let order = report.order();
            assert_eq!(order.len(), n, "seed {}", rng_seed);
            for (pos, node) in order.iter().enumerate() {
                for dep in &deps[*node] {
                    let dep_pos = order.iter().position(|o| o == dep).unwrap();
                    assert!(dep_pos < pos, "seed {}: {} finished before {}", rng_seed, node, dep);
                }
                assert_eq!(report.outcome(node), Some(&Outcome::Created));
            }

            // Each builder saw exactly its direct dependencies as siblings.
            for (node, seen) in log.lock().unwrap().iter() {
                let seen: BTreeSet<String> = seen.iter().cloned().collect();
                assert_eq!(&seen, &deps[node], "seed {}", rng_seed);
            }
        }
    }

    #[tokio::test]
    async fn test_second_pass_is_unchanged() {
        let log = new_log();
        let (a, _) = fake("a", &log);
        let (b, _) = fake("b", &log);
        let workflow = Workflow::builder("w")
            .add(a)
            .add(b.depends_on(["a"]))
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;

        let first = run_pass(store.clone(), &workflow, &rc, 4).await;
        assert_eq!(first.worst(), Outcome::Created);

        let second = run_pass(store.clone(), &workflow, &rc, 4).await;
        assert!(second.results.iter().all(|r| r.outcome == Outcome::Unchanged));
        assert_eq!(second.worst(), Outcome::Unchanged);
    }

    #[tokio::test]
    async fn test_empty_workflow_reports_unchanged() {
        let workflow: Workflow<ReviewCluster> = Workflow::builder("empty").build().unwrap();
        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;
        let report = run_pass(store, &workflow, &rc, 1).await;
        assert!(report.results.is_empty());
        assert_eq!(report.worst(), Outcome::Unchanged);
    }

    // -----------------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_failure_propagates_and_independent_branch_proceeds() {
        let log = new_log();
        let (a, _) = fake("a", &log);
        let (b, b_switch) = fake("b", &log);
        let (c, c_switch) = fake("c", &log);
        let (d, _) = fake("d", &log);
        let workflow = Workflow::builder("w")
            .add(a)
            .add(b.depends_on(["a"]))
            .add(c.depends_on(["b"]))
            .add(d)
            .build()
            .unwrap();
        b_switch.fail(true);

        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;
        let report = run_pass(store.clone(), &workflow, &rc, 2).await;

        assert_eq!(report.outcome("a"), Some(&Outcome::Created));
        assert_eq!(report.outcome("d"), Some(&Outcome::Created));
        assert!(matches!(
            report.outcome("b"),
            Some(Outcome::Error { cause, .. }) if cause == "b"
        ));
        assert!(matches!(
            report.outcome("c"),
            Some(Outcome::Error { cause, .. }) if cause == "b"
        ));
        assert_eq!(c_switch.builds(), 0, "dependent of a failed node must not be built");
        assert_eq!(stored_value(&store, "rc", "c"), None);
        assert_eq!(report.errors().count(), 2);
        assert!(report.worst().is_error());
    }

    #[tokio::test]
    async fn test_skip_propagates_and_withdraws_objects() {
        let log = new_log();
        let (a, _) = fake("a", &log);
        let (b, b_switch) = fake("b", &log);
        let (c, c_switch) = fake("c", &log);
        let workflow = Workflow::builder("w")
            .add(a)
            .add(b.depends_on(["a"]))
            .add(c.depends_on(["b"]))
            .build()
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;
        run_pass(store.clone(), &workflow, &rc, 4).await;
        assert!(stored_value(&store, "rc", "c").is_some());

        b_switch.disable(true);
        let builds_before = c_switch.builds();
        let report = run_pass(store.clone(), &workflow, &rc, 4).await;

        assert_eq!(report.outcome("a"), Some(&Outcome::Unchanged));
        assert_eq!(report.outcome("b"), Some(&Outcome::Skipped { cause: "b".into() }));
        assert_eq!(report.outcome("c"), Some(&Outcome::Skipped { cause: "b".into() }));
        assert_eq!(c_switch.builds(), builds_before);
        assert!(stored_value(&store, "rc", "a").is_some());
        assert_eq!(stored_value(&store, "rc", "b"), None);
        assert_eq!(stored_value(&store, "rc", "c"), None);

        // Still absent on the next pass.
        let again = run_pass(store.clone(), &workflow, &rc, 4).await;
        assert!(again.outcome("b").unwrap().is_skipped());
        assert_eq!(stored_value(&store, "rc", "b"), None);
    }

    #[tokio::test]
    async fn test_retain_policy_keeps_object_of_skipped_dependent() {
        let log = new_log();
        let (a, a_switch) = fake("a", &log);
        let (b, _) = fake("b", &log);
        let workflow = Workflow::builder("w")
            .add(a)
            .add(b.depends_on(["a"]).deletion_policy(DeletionPolicy::Retain))
            .build()
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;
        run_pass(store.clone(), &workflow, &rc, 4).await;

        a_switch.disable(true);
        let report = run_pass(store.clone(), &workflow, &rc, 4).await;
        assert_eq!(report.outcome("b"), Some(&Outcome::Skipped { cause: "a".into() }));
        assert_eq!(stored_value(&store, "rc", "a"), None);
        assert!(stored_value(&store, "rc", "b").is_some());
    }

    #[tokio::test]
    async fn test_error_wins_over_skip_for_mixed_dependencies() {
        let log = new_log();
        let (a, a_switch) = fake("a", &log);
        let (b, b_switch) = fake("b", &log);
        let (c, _) = fake("c", &log);
        let workflow = Workflow::builder("w")
            .add(a)
            .add(b)
            .add(c.depends_on(["a", "b"]))
            .build()
            .unwrap();
        a_switch.fail(true);
        b_switch.disable(true);

        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;
        let report = run_pass(store, &workflow, &rc, 4).await;
        assert!(matches!(
            report.outcome("c"),
            Some(Outcome::Error { cause, .. }) if cause == "a"
        ));
    }

    #[tokio::test]
    async fn test_store_failure_becomes_node_error() {
        let log = new_log();
        let (a, _) = fake("a", &log);
        let workflow = Workflow::builder("w").add(a).build().unwrap();
        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;
        store.fail_next(
            super::super::memory_store::StoreOp::Get,
            StoreError::Other("forbidden".into()),
        );

        let report = run_pass(store, &workflow, &rc, 4).await;
        match report.outcome("a") {
            Some(Outcome::Error { cause, message }) => {
                assert_eq!(cause, "a");
                assert!(message.contains("forbidden"), "{}", message);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    /// Delays creates and records how many overlap
    struct SlowStore {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for SlowStore {
        async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
            self.inner.get(ar, key).await
        }

        async fn list(
            &self,
            ar: &ApiResource,
            namespace: Option<&str>,
            label_selector: Option<&str>,
        ) -> Result<Vec<DynamicObject>, StoreError> {
            self.inner.list(ar, namespace, label_selector).await
        }

        async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.create(ar, obj).await
        }

        async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
            self.inner.replace(ar, obj).await
        }

        async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), StoreError> {
            self.inner.delete(ar, key).await
        }

        async fn patch_status(
            &self,
            ar: &ApiResource,
            key: &ObjectKey,
            status: &serde_json::Value,
        ) -> Result<DynamicObject, StoreError> {
            self.inner.patch_status(ar, key, status).await
        }

        fn watch(
            &self,
            ar: &ApiResource,
            namespace: Option<&str>,
            label_selector: Option<&str>,
        ) -> BoxStream<'static, Result<WatchEvent, StoreError>> {
            self.inner.watch(ar, namespace, label_selector)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let log = new_log();
        let mut builder = Workflow::builder("wide");
        for i in 0..6 {
            builder = builder.add(fake(&format!("n{}", i), &log).0);
        }
        let workflow = builder.build().unwrap();

        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let rc = seed(&store.inner, &review_cluster("rc")).await;

        let report = run_pass(store.clone(), &workflow, &rc, 2).await;
        assert_eq!(report.results.len(), 6);
        assert_eq!(store.peak.load(Ordering::SeqCst), 2);

        store.peak.store(0, Ordering::SeqCst);
        let rc2 = seed(&store.inner, &review_cluster("rc2")).await;
        run_pass(store.clone(), &workflow, &rc2, 1).await;
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
    }
}
