#[cfg(test)]
mod tests {
    use crate::task::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    async fn root() -> TaskHandle {
        SharedTaskTree::new()
            .create_root("Run #1", TaskOptions::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_state_aggregation() {
        use TaskState::*;

        let counts: ChildStateCounts = [Success, Success, Warning].into_iter().collect();
        assert_eq!(counts.aggregate(), Warning);

        let counts: ChildStateCounts = [Success, Error, Warning].into_iter().collect();
        assert_eq!(counts.aggregate(), Error);

        let counts: ChildStateCounts = [Success, Success].into_iter().collect();
        assert_eq!(counts.aggregate(), Success);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn test_tree_requires_existing_parent() {
        let mut tree = TaskTree::new();
        let root = tree.create_task(None, "root", &TaskOptions::default()).unwrap();
        let child = tree
            .create_task(Some(root), "child", &TaskOptions::default())
            .unwrap();

        assert_eq!(tree.roots, vec![root]);
        assert_eq!(tree.get_task(root).unwrap().children, vec![child]);
        assert_eq!(tree.get_task(child).unwrap().parent_id, Some(root));
        assert!(
            tree.create_task(Some(uuid::Uuid::new_v4()), "orphan", &TaskOptions::default())
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_state_from_children() {
        let root = root().await;
        let a = root.create_child("a", TaskOptions::default()).await.unwrap();
        let b = root.create_child("b", TaskOptions::default()).await.unwrap();
        a.set_state(TaskState::Success).await;
        b.set_state(TaskState::Warning).await;

        assert_eq!(root.set_state_from_children().await, TaskState::Warning);
        assert_eq!(root.state().await, TaskState::Warning);
    }

    #[tokio::test]
    async fn test_effective_progress_counts_terminal_children() {
        let root = root().await;
        let children: Vec<TaskHandle> = futures::future::join_all(
            (0..4).map(|i| root.create_child(format!("child {}", i), TaskOptions::default())),
        )
        .await
        .into_iter()
        .collect::<anyhow::Result<_>>()
        .unwrap();

        children[0].set_state(TaskState::Success).await;
        children[1].set_state(TaskState::Error).await;

        let progress = root.effective_progress().await.unwrap();
        assert_eq!(progress.max, Some(4.0));
        assert_eq!(progress.current, 2.0);
        assert_eq!(progress.fraction(), Some(0.5));
    }

    #[tokio::test]
    async fn test_effective_progress_running_child_fraction() {
        let tree = SharedTaskTree::new();
        let parallel = tree
            .create_root("parallel", TaskOptions::default())
            .await
            .unwrap();
        let sequential = tree
            .create_root("sequential", TaskOptions::default().sequential())
            .await
            .unwrap();

        for parent in [&parallel, &sequential] {
            let child = parent
                .create_child("child", TaskOptions::default().with_progress_max(4))
                .await
                .unwrap();
            child.set_state(TaskState::Running).await;
            child.add_step("one").await;
            child.add_step("two").await;
        }

        let progress = parallel.effective_progress().await.unwrap();
        assert_eq!(progress.current, 0.5);
        let progress = sequential.effective_progress().await.unwrap();
        assert_eq!(progress.current, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_max_progress() {
        let root = root().await;
        let task = root
            .create_child("pages", TaskOptions::default().unknown_max_progress())
            .await
            .unwrap();
        assert_eq!(task.effective_progress().await.unwrap().fraction(), None);

        task.set_progress_max(Some(2.0)).await;
        task.add_step("page 1").await;
        assert_eq!(task.effective_progress().await.unwrap().fraction(), Some(0.5));
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        struct Collect(Arc<std::sync::Mutex<Vec<String>>>);
        impl TaskEventHandler for Collect {
            fn handle_event(&self, event: &TaskEvent) -> anyhow::Result<()> {
                let name = match event {
                    TaskEvent::Created { .. } => "created",
                    TaskEvent::StateChanged { .. } => "state",
                    TaskEvent::StatusChanged { .. } => "status",
                    TaskEvent::ProgressChanged { .. } => "progress",
                };
                self.0.lock().unwrap().push(name.to_string());
                Ok(())
            }
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tree = SharedTaskTree::new();
        tree.add_event_handler(Box::new(Collect(seen.clone()))).await;

        let task = tree.create_root("root", TaskOptions::default()).await.unwrap();
        task.set_state(TaskState::Running).await;
        task.set_state(TaskState::Running).await;
        task.set_status("working").await;

        assert_eq!(*seen.lock().unwrap(), vec!["created", "state", "status"]);
    }

    #[tokio::test]
    async fn test_task_function_success() {
        let task = root().await;
        let result: Result<Option<u32>, String> =
            task_function(&task, TaskFunctionOptions::default(), async { Ok(7) }).await;

        assert_eq!(result, Ok(Some(7)));
        assert_eq!(task.state().await, TaskState::Success);
    }

    #[tokio::test]
    async fn test_task_function_error_is_recorded_and_returned() {
        let task = root().await;
        let result: Result<Option<()>, String> = task_function(
            &task,
            TaskFunctionOptions::default(),
            async { Err("boom".to_string()) },
        )
        .await;

        assert_eq!(result, Err("boom".to_string()));
        let snapshot = task.snapshot().await.unwrap();
        assert_eq!(snapshot.state, TaskState::Error);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_task_function_catch_errors() {
        let task = root().await;
        let result: Result<Option<()>, String> = task_function(
            &task,
            TaskFunctionOptions::catch_errors(),
            async { Err("swallowed".to_string()) },
        )
        .await;

        assert_eq!(result, Ok(None));
        assert_eq!(task.state().await, TaskState::Error);
    }

    #[tokio::test]
    async fn test_task_function_state_from_children() {
        let task = root().await;
        let result: Result<Option<()>, String> =
            task_function(&task, TaskFunctionOptions::from_children(), async {
                let ok = task.create_child("ok", TaskOptions::default()).await.unwrap();
                ok.set_state(TaskState::Success).await;
                let bad = task.create_child("bad", TaskOptions::default()).await.unwrap();
                bad.set_error("failed").await;
                Ok(())
            })
            .await;

        assert_eq!(result, Ok(Some(())));
        assert_eq!(task.state().await, TaskState::Error);
    }

    #[tokio::test]
    async fn test_task_function_keeps_warning_set_by_body() {
        let task = root().await;
        let _: Result<Option<()>, String> =
            task_function(&task, TaskFunctionOptions::default(), async {
                task.set_state(TaskState::Warning).await;
                Ok(())
            })
            .await;
        assert_eq!(task.state().await, TaskState::Warning);
    }

    #[tokio::test]
    async fn test_task_function_manual_state() {
        let task = root().await;
        let _: Result<Option<()>, String> =
            task_function(&task, TaskFunctionOptions::manual_state(), async { Ok(()) }).await;
        assert_eq!(task.state().await, TaskState::Running);
    }

    #[tokio::test]
    async fn test_parallel_task_map_preserves_order() {
        let task = root().await;
        let items = vec![40u64, 5, 25, 1, 10];
        let results = parallel_task_map(
            &task,
            items.clone(),
            2,
            |ms| format!("Item {}", ms),
            |ms, _child| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, String>(ms * 2)
            },
        )
        .await
        .unwrap();

        let values: Vec<u64> = results.iter().map(|r| *r.result.as_ref().unwrap()).collect();
        assert_eq!(values, vec![80, 10, 50, 2, 20]);
        let order: Vec<u64> = results.iter().map(|r| r.item).collect();
        assert_eq!(order, items);
    }

    #[tokio::test]
    async fn test_parallel_task_map_isolates_failures() {
        let task = root().await;
        let results = parallel_task_map(
            &task,
            vec![1u32, 2, 3, 4],
            3,
            |n| format!("Item {}", n),
            |n, _child| async move {
                tokio::time::sleep(Duration::from_millis(u64::from(5 - n) * 5)).await;
                if n % 2 == 0 {
                    Err(format!("item {} failed", n))
                } else {
                    Ok(n)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 4);
        assert!(results[0].result.is_ok());
        assert_eq!(results[1].result, Err("item 2 failed".to_string()));
        assert!(results[2].result.is_ok());
        assert!(results[3].result.is_err());

        let counts = task.child_state_counts().await;
        assert_eq!(counts.success, 2);
        assert_eq!(counts.error, 2);
    }

    #[tokio::test]
    async fn test_parallel_task_map_respects_bound() {
        let task = root().await;
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = parallel_task_map(
            &task,
            (0..10).collect::<Vec<u32>>(),
            3,
            |n| format!("Item {}", n),
            |n, _child| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    fn report(num_pages: u32) -> BTreeMap<u32, String> {
        (1..=num_pages).map(|p| (p, format!("page {}", p))).collect()
    }

    #[tokio::test]
    async fn test_paged_data_fetches_page_one_first() {
        let task = root().await;
        let pages = report(4);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let paged = get_paged_data(&task, None, 3, |page, _child| {
            let calls = calls.clone();
            let value = pages[&page].clone();
            async move {
                calls.lock().await.push(page);
                Ok::<_, String>(PageData {
                    num_pages: 4,
                    value,
                })
            }
        })
        .await
        .unwrap();

        let calls = calls.lock().await.clone();
        assert_eq!(calls[0], 1);
        assert_eq!(calls.len(), 4);
        assert_eq!(paged.num_pages, Some(4));
        assert!(paged.failed_pages().is_empty());
        let values: Vec<&String> = paged.successful().map(|(_, v)| v).collect();
        assert_eq!(values, vec!["page 1", "page 2", "page 3", "page 4"]);

        task.set_state(TaskState::Success).await;
        let progress = task.effective_progress().await.unwrap();
        assert_eq!(progress.max, Some(4.0));
    }

    #[tokio::test]
    async fn test_paged_data_records_failed_pages() {
        let task = root().await;
        let paged = get_paged_data(&task, None, 2, |page, _child| async move {
            if page == 2 || page == 4 {
                Err(format!("page {} timed out", page))
            } else {
                Ok(PageData {
                    num_pages: 5,
                    value: page,
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(paged.failed_pages().into_iter().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(paged.successful().count(), 3);
        assert!(!paged.discovery_failed);
    }

    #[tokio::test]
    async fn test_paged_data_discovery_failure() {
        let task = root().await;
        let paged = get_paged_data(&task, None, 2, |_page, _child| async move {
            Err::<PageData<()>, _>("login expired".to_string())
        })
        .await
        .unwrap();

        assert!(paged.discovery_failed);
        assert_eq!(paged.num_pages, None);
        assert_eq!(paged.pages.len(), 1);
    }

    #[tokio::test]
    async fn test_paged_data_explicit_pages() {
        let task = root().await;
        let calls = Arc::new(Mutex::new(Vec::new()));

        let paged = get_paged_data(&task, Some(vec![4, 2, 4, 0]), 3, |page, _child| {
            let calls = calls.clone();
            async move {
                calls.lock().await.push(page);
                Ok::<_, String>(PageData {
                    num_pages: 5,
                    value: page,
                })
            }
        })
        .await
        .unwrap();

        let mut calls = calls.lock().await.clone();
        calls.sort();
        assert_eq!(calls, vec![2, 4]);
        assert_eq!(paged.pages.keys().copied().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(paged.num_pages, Some(5));
    }
}
