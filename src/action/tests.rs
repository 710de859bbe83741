#[cfg(test)]
mod tests {
    use crate::action::*;
    use crate::portal::{
        AccountFixture, Client, PortalFixture, Record, Session, SimulatedPortal, TaxTypeId,
    };
    use crate::task::{SharedTaskTree, TaskHandle, TaskOptions, TaskState};
    use std::collections::{BTreeMap, BTreeSet};

    fn record(label: &str) -> Record {
        Record::from([("ref".to_string(), label.to_string())])
    }

    fn pages(prefix: &str, count: u32) -> Vec<Vec<Record>> {
        (1..=count)
            .map(|p| vec![record(&format!("{}-{}", prefix, p))])
            .collect()
    }

    fn client() -> Client {
        Client {
            id: "c1".to_string(),
            name: "Client One".to_string(),
            username: "c1-user".to_string(),
            password: String::new(),
        }
    }

    fn portal(failures: &[(&str, u32)]) -> SimulatedPortal {
        let account = AccountFixture {
            tax_types: vec![TaxTypeId::new("VAT"), TaxTypeId::new("PAYE")],
            ledger: pages("ledger", 5),
            returns: BTreeMap::from([
                (TaxTypeId::new("VAT"), pages("vat", 2)),
                (TaxTypeId::new("PAYE"), pages("paye", 1)),
            ]),
            receipts: BTreeMap::from([
                ("R1".to_string(), record("receipt-1")),
                ("R2".to_string(), record("receipt-2")),
            ]),
            failures: failures
                .iter()
                .map(|(key, count)| (key.to_string(), *count))
                .collect(),
        };
        SimulatedPortal::new(PortalFixture {
            clients: vec![client()],
            accounts: BTreeMap::from([("c1".to_string(), account)]),
            fetch_delay_ms: 0,
        })
    }

    fn dates() -> ActionInput {
        ActionInput {
            from_date: Some("01/01/2024".to_string()),
            to_date: Some("31/12/2024".to_string()),
            ..ActionInput::default()
        }
    }

    async fn run_instance(
        portal: &SimulatedPortal,
        action_id: &str,
        input: ActionInput,
        tax_types: Option<&[TaxTypeId]>,
    ) -> (ActionInstance, TaskHandle) {
        let registry = ActionRegistry::default();
        let root = SharedTaskTree::new()
            .create_root("Run #1", TaskOptions::default())
            .await
            .unwrap();
        let session = Session::new("c1");
        let ctx = RunContext {
            parent_task: &root,
            session: Some(&session),
            fetcher: portal,
            tax_types,
        };

        let mut instance = ActionInstance::new(registry.get(action_id).unwrap(), input);
        instance.init(client(), ActionConfig::default());
        let _ = instance.run(ctx).await;
        (instance, root)
    }

    fn page_units(output: &ActionOutput) -> Vec<u32> {
        output
            .units
            .iter()
            .filter_map(|u| match u.unit {
                WorkUnit::Page { page } => Some(page),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_date_validation() {
        let registry = ActionRegistry::default();
        let ledger = registry.get("ledger_records").unwrap();

        assert!(ledger.validate_input(&dates()).is_ok());
        assert_eq!(
            ledger.validate_input(&ActionInput::default()),
            Err(ValidationError::MissingField("from_date"))
        );

        let malformed = ActionInput {
            from_date: Some("2024-01-01".to_string()),
            ..dates()
        };
        assert!(matches!(
            ledger.validate_input(&malformed),
            Err(ValidationError::MalformedDate { field: "from_date", .. })
        ));

        let reversed = ActionInput {
            from_date: Some("31/12/2024".to_string()),
            to_date: Some("01/01/2024".to_string()),
            ..ActionInput::default()
        };
        assert!(matches!(
            ledger.validate_input(&reversed),
            Err(ValidationError::DateOrder { .. })
        ));
    }

    #[test]
    fn test_receipt_list_validation() {
        let receipts = ActionRegistry::default().get("payment_receipts").unwrap();

        assert_eq!(
            receipts.validate_input(&ActionInput::default()),
            Err(ValidationError::MissingField("item_ids"))
        );
        let blank = ActionInput {
            item_ids: Some(vec![" ".to_string()]),
            ..ActionInput::default()
        };
        assert_eq!(
            receipts.validate_input(&blank),
            Err(ValidationError::EmptyList("item_ids"))
        );
        let ok = ActionInput {
            item_ids: Some(vec!["R1".to_string()]),
            ..ActionInput::default()
        };
        assert!(receipts.validate_input(&ok).is_ok());
    }

    #[test]
    fn test_retry_input_for_failed_pages() {
        let failures = FailedWork::Pages(MissingPages::Pages(BTreeSet::from([4, 2])));
        assert_eq!(
            failures.retry_input(),
            RetryInput {
                pages: Some(vec![2, 4]),
                ..RetryInput::default()
            }
        );

        let input = dates().with_retry(&failures.retry_input());
        assert_eq!(input.pages, Some(vec![2, 4]));
        assert_eq!(input.from_date, dates().from_date);
    }

    #[test]
    fn test_retry_input_when_page_count_unknown() {
        let failures = FailedWork::Pages(MissingPages::All);
        assert!(!failures.is_empty());

        let retry = failures.retry_input();
        assert_eq!(retry.pages, Some(vec![]));

        let previous = ActionInput {
            pages: Some(vec![3]),
            ..dates()
        };
        assert_eq!(previous.with_retry(&retry).pages, None);
    }

    #[test]
    fn test_retry_input_per_tax_type() {
        let failures = FailedWork::TaxTypes(BTreeMap::from([
            (TaxTypeId::new("VAT"), MissingPages::Pages(BTreeSet::from([2]))),
            (TaxTypeId::new("PAYE"), MissingPages::All),
            (TaxTypeId::new("CIT"), MissingPages::Pages(BTreeSet::new())),
        ]));

        let retry = failures.retry_input();
        assert_eq!(
            retry.tax_types,
            Some(vec![TaxTypeId::new("PAYE"), TaxTypeId::new("VAT")])
        );
        assert_eq!(
            retry.tax_type_pages,
            Some(BTreeMap::from([(TaxTypeId::new("VAT"), vec![2])]))
        );
        assert!(retry.pages.is_none());
    }

    #[test]
    fn test_no_failures_means_empty_retry() {
        assert!(FailedWork::None.retry_input().is_empty());
        assert!(FailedWork::Items(BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_or_defaults_keeps_explicit_fields() {
        let defaults = ActionInput {
            from_date: Some("01/01/2020".to_string()),
            item_ids: Some(vec!["R9".to_string()]),
            ..ActionInput::default()
        };
        let input = ActionInput {
            from_date: Some("01/01/2024".to_string()),
            ..ActionInput::default()
        }
        .or_defaults(&defaults);

        assert_eq!(input.from_date.as_deref(), Some("01/01/2024"));
        assert_eq!(input.item_ids, Some(vec!["R9".to_string()]));
        assert!(input.to_date.is_none());
    }

    fn output(pages: &[(u32, &str)]) -> ActionOutput {
        ActionOutput::from_units(
            pages
                .iter()
                .map(|&(page, label)| (WorkUnit::Page { page }, vec![record(label)]))
                .collect(),
        )
    }

    #[test]
    fn test_merge_fills_gaps_from_retries() {
        let first = output(&[(1, "a"), (3, "c"), (5, "e")]);
        let retry = output(&[(2, "b"), (4, "d")]);

        let merged = merge_all_run_outputs(&[first, retry]);
        assert_eq!(page_units(&merged), vec![1, 2, 3, 4, 5]);
        assert_eq!(merged.record_count(), 5);
    }

    #[test]
    fn test_merge_is_idempotent_and_first_wins() {
        let first = output(&[(1, "a"), (2, "b")]);
        assert_eq!(merge_all_run_outputs(&[first.clone(), first.clone()]), first);

        let conflicting = output(&[(2, "late"), (3, "c")]);
        let merged = merge_all_run_outputs(&[first.clone(), conflicting.clone()]);
        assert!(merged.records().any(|r| r["ref"] == "b"));
        assert!(!merged.records().any(|r| r["ref"] == "late"));

        let left = merge_all_run_outputs(&[
            merge_all_run_outputs(&[first.clone(), conflicting.clone()]),
            output(&[(4, "d")]),
        ]);
        let right = merge_all_run_outputs(&[
            first,
            merge_all_run_outputs(&[conflicting, output(&[(4, "d")])]),
        ]);
        assert_eq!(left, right);
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        assert!(!ActionError::Validation(ValidationError::MissingField("from_date")).is_retryable());
        assert!(ActionError::Fetch("timeout".to_string()).is_retryable());
        assert!(ActionError::Session("expired".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_ledger_partial_failure() {
        let portal = portal(&[("ledger:2", 1), ("ledger:4", 1)]);
        let (instance, root) = run_instance(&portal, "ledger_records", dates(), None).await;

        assert_eq!(instance.state(), RunnerState::Warning);
        assert!(instance.should_retry());
        assert_eq!(instance.retry_input().pages, Some(vec![2, 4]));
        let output = instance.output.as_ref().unwrap();
        assert_eq!(page_units(output), vec![1, 3, 5]);

        let task = root
            .tree()
            .get_task(instance.task_id().unwrap())
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Warning);
        assert_eq!(task.children.len(), 5);
    }

    #[tokio::test]
    async fn test_ledger_retry_fetches_only_missing_pages() {
        let portal = portal(&[("ledger:2", 1), ("ledger:4", 1)]);
        let (first, _) = run_instance(&portal, "ledger_records", dates(), None).await;

        let retry_input = first.input.with_retry(&first.retry_input());
        let (retry, _) = run_instance(&portal, "ledger_records", retry_input, None).await;

        assert_eq!(retry.state(), RunnerState::Success);
        assert!(!retry.should_retry());
        assert_eq!(page_units(retry.output.as_ref().unwrap()), vec![2, 4]);

        let log = portal.fetch_log("c1").await;
        let mut retried: Vec<&String> = log.iter().skip(5).collect();
        retried.sort();
        assert_eq!(retried, vec!["ledger:2", "ledger:4"]);

        let merged = first.merge_outputs(&[
            first.output.clone().unwrap(),
            retry.output.clone().unwrap(),
        ]);
        assert_eq!(page_units(&merged), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_an_error() {
        let portal = portal(&[("ledger:1", 1)]);
        let (instance, _) = run_instance(&portal, "ledger_records", dates(), None).await;

        assert_eq!(instance.state(), RunnerState::Error);
        assert_eq!(instance.failures, FailedWork::Pages(MissingPages::All));
        assert!(instance.should_retry());
        assert_eq!(dates().with_retry(&instance.retry_input()).pages, None);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_work() {
        let portal = portal(&[]);
        let registry = ActionRegistry::default();
        let root = SharedTaskTree::new()
            .create_root("Run #1", TaskOptions::default())
            .await
            .unwrap();
        let session = Session::new("c1");
        let ctx = RunContext {
            parent_task: &root,
            session: Some(&session),
            fetcher: &portal,
            tax_types: None,
        };

        let mut instance =
            ActionInstance::new(registry.get("ledger_records").unwrap(), ActionInput::default());
        instance.init(client(), ActionConfig::default());
        let result = instance.run(ctx).await;

        assert!(matches!(result, Err(ActionError::Validation(_))));
        assert_eq!(instance.state(), RunnerState::Error);
        assert!(!instance.should_retry());
        assert!(root.snapshot().await.unwrap().children.is_empty());
        assert!(portal.fetch_log("c1").await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_records_skipped_action() {
        let root = SharedTaskTree::new()
            .create_root("Run #1", TaskOptions::default())
            .await
            .unwrap();
        let mut instance = ActionInstance::new(
            ActionRegistry::default().get("ledger_records").unwrap(),
            dates(),
        );
        instance.init(client(), ActionConfig::default());
        instance
            .fail(&root, ActionError::Session("login refused".to_string()))
            .await;

        assert_eq!(instance.state(), RunnerState::Error);
        assert!(instance.should_retry());
        let task = root
            .tree()
            .get_task(instance.task_id().unwrap())
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Error);
        assert_eq!(task.error.as_deref(), Some("Session error: login refused"));
    }

    #[tokio::test]
    async fn test_run_before_init_fails() {
        let portal = portal(&[]);
        let root = SharedTaskTree::new()
            .create_root("Run #1", TaskOptions::default())
            .await
            .unwrap();
        let ctx = RunContext {
            parent_task: &root,
            session: None,
            fetcher: &portal,
            tax_types: None,
        };
        let mut instance = ActionInstance::new(
            ActionRegistry::default().get("ledger_records").unwrap(),
            dates(),
        );

        assert!(matches!(instance.run(ctx).await, Err(ActionError::Internal(_))));
        assert_eq!(instance.state(), RunnerState::NotStarted);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let mut instance = ActionInstance::new(
            ActionRegistry::default().get("ledger_records").unwrap(),
            dates(),
        );
        instance.init(client(), ActionConfig { max_concurrent: 1 });
        let other = Client {
            id: "c2".to_string(),
            ..client()
        };
        instance.init(other, ActionConfig::default());
        assert_eq!(instance.client_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_return_history_needs_tax_types() {
        let portal = portal(&[]);
        let (instance, _) = run_instance(&portal, "return_history", dates(), None).await;

        assert_eq!(instance.state(), RunnerState::Error);
        assert!(matches!(
            instance.error,
            Some(ActionError::MissingPrerequisite(_))
        ));
        assert!(instance.should_retry());
    }

    #[tokio::test]
    async fn test_return_history_per_tax_type() {
        let portal = portal(&[("returns:VAT:2", 1)]);
        let tax_types = vec![TaxTypeId::new("VAT"), TaxTypeId::new("PAYE")];
        let (instance, root) =
            run_instance(&portal, "return_history", dates(), Some(&tax_types)).await;

        assert_eq!(instance.state(), RunnerState::Warning);
        let task = root
            .tree()
            .get_task(instance.task_id().unwrap())
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Warning);
        let mut tax_type_states = Vec::new();
        for child in &task.children {
            let tax_task = root.tree().get_task(*child).await.unwrap();
            tax_type_states.push((tax_task.title, tax_task.state));
        }
        assert_eq!(
            tax_type_states,
            vec![
                ("VAT".to_string(), TaskState::Error),
                ("PAYE".to_string(), TaskState::Success),
            ]
        );
        assert_eq!(
            instance.failures,
            FailedWork::TaxTypes(BTreeMap::from([(
                TaxTypeId::new("VAT"),
                MissingPages::Pages(BTreeSet::from([2]))
            )]))
        );
        let output = instance.output.as_ref().unwrap();
        assert!(output.contains(&WorkUnit::TaxTypePage {
            tax_type: TaxTypeId::new("PAYE"),
            page: 1
        }));
        assert_eq!(output.record_count(), 2);

        let retry = dates().with_retry(&instance.retry_input());
        assert_eq!(retry.tax_types, Some(vec![TaxTypeId::new("VAT")]));
        let (retried, _) =
            run_instance(&portal, "return_history", retry, Some(&tax_types)).await;
        assert_eq!(retried.state(), RunnerState::Success);
        assert_eq!(retried.output.as_ref().unwrap().units.len(), 1);
    }

    #[tokio::test]
    async fn test_receipts_track_failed_items() {
        let portal = portal(&[("receipt:R2", 1)]);
        let input = ActionInput {
            item_ids: Some(vec!["R1".to_string(), "R2".to_string(), "R1".to_string()]),
            ..ActionInput::default()
        };
        let (instance, _) = run_instance(&portal, "payment_receipts", input, None).await;

        assert_eq!(instance.state(), RunnerState::Warning);
        assert_eq!(
            instance.failures,
            FailedWork::Items(BTreeSet::from(["R2".to_string()]))
        );
        assert_eq!(
            instance.retry_input().item_ids,
            Some(vec!["R2".to_string()])
        );
        assert_eq!(instance.output.as_ref().unwrap().record_count(), 1);
    }
}
