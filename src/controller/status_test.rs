//! Tests for status aggregation
//!
//! These tests verify:
//! - Ready and condition-group computation from node outcomes
//! - Optional dependents switched off do not make the parent unready
//! - Status writes are elided when nothing changed for the generation

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::conditions::*;
    use super::super::executor::{NodeResult, Outcome, PassReport};
    use super::super::memory_store::{MemoryStore, StoreOp};
    use super::super::status::*;
    use super::super::store::ObjectKey;
    use super::super::test_support::*;
    use super::super::workflow::Workflow;
    use crate::crd::ReviewCluster;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// storage <- server <- web (optional), plus cron (optional)
    fn workflow() -> Workflow<ReviewCluster> {
        let log = new_log();
        Workflow::builder("w")
            .add(fake("storage", &log).0.condition("StorageReady"))
            .add(
                fake("server", &log)
                    .0
                    .depends_on(["storage"])
                    .condition("ServerReady"),
            )
            .add(
                fake("web", &log)
                    .0
                    .depends_on(["server"])
                    .optional()
                    .condition("ServerReady"),
            )
            .add(fake("cron", &log).0.optional().condition("MaintenanceReady"))
            .build()
            .unwrap()
    }

    fn report(outcomes: &[(&str, Outcome)]) -> PassReport {
        PassReport {
            results: outcomes
                .iter()
                .map(|(node, outcome)| NodeResult {
                    node: node.to_string(),
                    outcome: outcome.clone(),
                })
                .collect(),
        }
    }

    fn skipped(cause: &str) -> Outcome {
        Outcome::Skipped {
            cause: cause.to_string(),
        }
    }

    fn error(cause: &str, message: &str) -> Outcome {
        Outcome::Error {
            cause: cause.to_string(),
            message: message.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Condition computation
    // -----------------------------------------------------------------------

    #[test]
    fn test_all_reconciled_is_ready() {
        let report = report(&[
            ("storage", Outcome::Created),
            ("server", Outcome::Unchanged),
            ("web", Outcome::Updated),
            ("cron", Outcome::Created),
        ]);
        let conditions = compute_conditions(&workflow(), &report, &[], Some(3));

        let types: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Ready", "StorageReady", "MaintenanceReady", "ServerReady"]);
        assert!(conditions.iter().all(|c| c.status == CONDITION_STATUS_TRUE));
        assert!(conditions.iter().all(|c| c.observed_generation == Some(3)));
        assert_eq!(conditions[0].reason, REASON_RECONCILED);
    }

    #[test]
    fn test_disabled_optional_dependents_stay_ready() {
        let report = report(&[
            ("storage", Outcome::Unchanged),
            ("server", Outcome::Unchanged),
            ("web", skipped("web")),
            ("cron", skipped("cron")),
        ]);
        let conditions = compute_conditions(&workflow(), &report, &[], Some(1));

        assert!(is_condition_true(&conditions, CONDITION_TYPE_READY));
        let server = find_condition(&conditions, "ServerReady").unwrap();
        assert_eq!(server.status, CONDITION_STATUS_TRUE);
        assert_eq!(server.reason, REASON_RECONCILED);
        let maintenance = find_condition(&conditions, "MaintenanceReady").unwrap();
        assert_eq!(maintenance.status, CONDITION_STATUS_TRUE);
        assert_eq!(maintenance.reason, REASON_DISABLED);
    }

    #[test]
    fn test_required_skip_withholds_ready() {
        let report = report(&[
            ("storage", Outcome::Unchanged),
            ("server", skipped("server")),
            ("web", skipped("server")),
            ("cron", Outcome::Unchanged),
        ]);
        let conditions = compute_conditions(&workflow(), &report, &[], Some(2));

        let ready = find_condition(&conditions, CONDITION_TYPE_READY).unwrap();
        assert_eq!(ready.status, CONDITION_STATUS_FALSE);
        assert_eq!(ready.reason, REASON_PRECONDITION_NOT_MET);
        assert_eq!(
            ready.message,
            "precondition of dependent server not met; skipped: server, web"
        );

        let server = find_condition(&conditions, "ServerReady").unwrap();
        assert_eq!(server.status, CONDITION_STATUS_FALSE);
        assert_eq!(server.reason, REASON_PRECONDITION_NOT_MET);
        assert!(is_condition_true(&conditions, "StorageReady"));
    }

    #[test]
    fn test_error_names_failed_dependent() {
        let report = report(&[
            ("storage", error("storage", "quota exceeded")),
            ("server", error("storage", "not evaluated: dependency storage failed")),
            ("web", error("storage", "not evaluated: dependency server failed")),
            ("cron", Outcome::Created),
        ]);
        let conditions = compute_conditions(&workflow(), &report, &[], Some(1));

        let ready = find_condition(&conditions, CONDITION_TYPE_READY).unwrap();
        assert_eq!(ready.status, CONDITION_STATUS_FALSE);
        assert_eq!(ready.reason, REASON_RECONCILE_ERROR);
        assert_eq!(
            ready.message,
            "dependent storage failed (storage: quota exceeded)"
        );

        let storage = find_condition(&conditions, "StorageReady").unwrap();
        assert_eq!(storage.reason, REASON_DEPENDENT_FAILED);
        assert_eq!(storage.message, "storage: quota exceeded");
        let server = find_condition(&conditions, "ServerReady").unwrap();
        assert_eq!(server.reason, REASON_DEPENDENT_FAILED);
        assert!(server.message.contains("dependency storage failed"));
        assert!(is_condition_true(&conditions, "MaintenanceReady"));
    }

    #[test]
    fn test_transition_time_kept_while_status_holds() {
        let report = report(&[
            ("storage", Outcome::Created),
            ("server", Outcome::Created),
            ("web", Outcome::Created),
            ("cron", Outcome::Created),
        ]);
        let mut previous = compute_conditions(&workflow(), &report, &[], Some(1));
        for c in &mut previous {
            c.last_transition_time = "2024-01-01T00:00:00+00:00".to_string();
        }

        let next = compute_conditions(&workflow(), &report, &previous, Some(2));
        assert!(next
            .iter()
            .all(|c| c.last_transition_time == "2024-01-01T00:00:00+00:00"));
    }

    #[test]
    fn test_invalid_spec_conditions() {
        let conditions = invalid_spec_conditions(&[], Some(4), "spec.image: must not be empty");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, CONDITION_STATUS_FALSE);
        assert_eq!(conditions[0].reason, REASON_INVALID_SPEC);
        assert_eq!(conditions[0].observed_generation, Some(4));
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_write_is_elided_when_nothing_changed() {
        let store = Arc::new(MemoryStore::new());
        let rc = seed(&store, &review_cluster("rc")).await;
        let key = ObjectKey::namespaced(NAMESPACE, "rc");
        let aggregator = StatusAggregator::new(store.clone());
        let report = report(&[("storage", Outcome::Created)]);
        let conditions = compute_conditions(&workflow(), &report, &[], rc.metadata.generation);

        let empty = ObservedStatus::default();
        let first = aggregator
            .write(&parent_ar(), &key, &empty, rc.metadata.generation, conditions.clone())
            .await
            .unwrap();
        assert_eq!(first, StatusWrite::Written);

        let stored = store.peek(&parent_ar(), &key).unwrap();
        let observed = ObservedStatus::of(&stored);
        assert_eq!(observed.observed_generation, rc.metadata.generation);
        assert_eq!(observed.conditions.len(), conditions.len());

        let recomputed = compute_conditions(&workflow(), &report, &observed.conditions, rc.metadata.generation);
        let second = aggregator
            .write(&parent_ar(), &key, &observed, rc.metadata.generation, recomputed)
            .await
            .unwrap();
        assert_eq!(second, StatusWrite::Elided);
        assert_eq!(store.calls(StoreOp::PatchStatus), 1);
    }

    #[tokio::test]
    async fn test_new_generation_is_written_even_with_same_conditions() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &review_cluster("rc")).await;
        let key = ObjectKey::namespaced(NAMESPACE, "rc");
        let aggregator = StatusAggregator::new(store.clone());
        let previous = ObservedStatus {
            observed_generation: Some(1),
            conditions: Vec::new(),
        };

        let write = aggregator
            .write(&parent_ar(), &key, &previous, Some(2), Vec::new())
            .await
            .unwrap();
        assert_eq!(write, StatusWrite::Written);
        let stored = store.peek(&parent_ar(), &key).unwrap();
        assert_eq!(stored.data["status"]["observedGeneration"], 2);
    }
}
