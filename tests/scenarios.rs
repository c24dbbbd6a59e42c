use std::sync::Arc;
use std::time::Duration;

use navigator_agent::dom::{DocumentSpec, el};
use navigator_agent::page::DomEvent;
use navigator_agent::resolver::Intent;
use navigator_agent::snapshot::NodeRecord;
use navigator_agent::store::load;
use navigator_agent::types::PlanningRecord;
use navigator_agent::{
    Executor, ExecutorTiming, JsonFileStore, Locator, MemoryPage, NodeAddress, Orchestrator,
    OrchestratorConfig, PageLink, PlanResponse, PlanStep, PlannedAction, Resolver, RetryPolicy,
    ScriptedPlanner, Snapshotter, StoreKey, Strategy, TaskStatus, TransportTimeouts,
};
use serde_json::Value;

fn quiet_timing() -> ExecutorTiming {
    ExecutorTiming {
        show_cursor: false,
        resolve_retries: 0,
        ..Default::default()
    }
}

fn form_page() -> DocumentSpec {
    DocumentSpec::new("https://shop.test/checkout").root(
        el("html").child(
            el("body").rect(0.0, 0.0, 1280.0, 800.0).child(
                el("form").rect(0.0, 0.0, 400.0, 200.0).child(
                    el("button")
                        .attr("id", "submit")
                        .attr("type", "submit")
                        .rect(20.0, 20.0, 100.0, 40.0)
                        .text("Pay"),
                ),
            ),
        ),
    )
}

#[tokio::test(start_paused = true)]
async fn scenario_visible_button_by_id() {
    let page = Arc::new(MemoryPage::new(form_page()));
    let resolved = Resolver::default()
        .resolve(page.as_ref(), &Locator::by_id("submit"), Intent::Click)
        .await
        .unwrap();
    assert_eq!(resolved.strategy, Strategy::ElementId);
    assert!(resolved.visible);

    let executor = Executor::new(page.clone(), Resolver::default(), quiet_timing());
    let result = executor
        .execute_one(&PlannedAction::click(Locator::by_id("submit")).unwrap())
        .await;
    assert!(result.success, "{}", result.message);
    assert_eq!(
        page.events_for(&resolved.address.to_string()).last(),
        Some(&DomEvent::Click)
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_missing_selector_backs_off_then_fails() {
    let page = Arc::new(MemoryPage::new(form_page()));
    let resolver = Resolver::new(RetryPolicy {
        attempts: 3,
        backoff_unit: Duration::from_millis(100),
    });

    let started = tokio::time::Instant::now();
    let err = resolver
        .resolve(page.as_ref(), &Locator::by_selector("#missing"), Intent::Click)
        .await
        .unwrap_err();
    assert_eq!(started.elapsed(), Duration::from_millis(300));
    assert!(err.to_string().contains("#missing"));

    let executor = Executor::new(page.clone(), resolver, quiet_timing());
    let result = executor
        .execute_one(&PlannedAction::click(Locator::by_selector("#missing")).unwrap())
        .await;
    assert!(!result.success);
    assert!(page.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_failed_click_does_not_stop_navigation() {
    let page = Arc::new(MemoryPage::new(form_page()));
    let executor = Executor::new(
        page.clone(),
        Resolver::new(RetryPolicy {
            attempts: 1,
            backoff_unit: Duration::from_millis(10),
        }),
        quiet_timing(),
    );
    let steps: Vec<PlanStep> = vec![
        PlannedAction::click(Locator::by_text("No such thing")).unwrap().into(),
        PlannedAction::navigate("/thanks").unwrap().into(),
    ];

    let results = executor.execute_all(&steps).await;
    let outcomes: Vec<bool> = results.iter().map(|r| r.success).collect();
    assert_eq!(outcomes, vec![false, true]);
    assert_eq!(page.current_url(), "https://shop.test/thanks");
}

#[tokio::test(start_paused = true)]
async fn scenario_iteration_limit_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = Arc::new(JsonFileStore::open(&path).await.unwrap());

    let page = Arc::new(MemoryPage::new(form_page()));
    let link = PageLink::spawn(page, Resolver::default(), quiet_timing(), TransportTimeouts::default());
    let planner = Arc::new(ScriptedPlanner::new("task-d", PlanResponse::new(vec![], false)));
    let config = OrchestratorConfig {
        tick_interval: Duration::from_millis(500),
        max_iterations: 10,
        stuck_timeout: Duration::from_secs(30),
    };
    let handle = Orchestrator::restore(config, link, planner.clone(), store.clone())
        .await
        .unwrap()
        .spawn();

    handle.start("look around").await.unwrap();
    let view = loop {
        let view = handle.status().await.unwrap();
        if view.task.status == TaskStatus::Idle {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };

    assert_eq!(view.task.iteration, 10);
    assert_eq!(planner.requests().len(), 10);
    let record: PlanningRecord = load(store.as_ref(), StoreKey::LastResult).await.unwrap().unwrap();
    assert!(!record.is_done);
    assert_eq!(record.iteration, 9);

    let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(on_disk["task_id"], "task-d");
    assert_eq!(on_disk["iterations"], 10);
    assert_eq!(on_disk["task_status"], "idle");
    assert_eq!(on_disk["last_origin"], "https://shop.test");
}

#[tokio::test(start_paused = true)]
async fn scenario_link_inside_frame_round_trips() {
    let inner = DocumentSpec::new("https://shop.test/embedded").root(
        el("html").child(
            el("body")
                .rect(0.0, 0.0, 600.0, 300.0)
                .child(el("a").attr("href", "/help").rect(10.0, 10.0, 60.0, 20.0).text("Help")),
        ),
    );
    let outer = DocumentSpec::new("https://shop.test/").root(
        el("html").child(
            el("body")
                .rect(0.0, 0.0, 1280.0, 800.0)
                .child(el("iframe").rect(0.0, 100.0, 600.0, 300.0).frame_document(inner)),
        ),
    );
    let page = Arc::new(MemoryPage::new(outer));

    let snapshot = Snapshotter::new().capture(&page.document());
    let links: Vec<_> = snapshot
        .nodes
        .values()
        .filter_map(|node| match node {
            NodeRecord::Element(e) if e.tag_name == "a" => Some(e),
            _ => None,
        })
        .collect();
    assert_eq!(links.len(), 1);
    let path = links[0].xpath.clone();
    assert_eq!(path, "/html/body/iframe >> /html/body/a");

    let resolved = Resolver::default()
        .resolve(page.as_ref(), &Locator::by_path(&path), Intent::Click)
        .await
        .unwrap();
    assert_eq!(resolved.address, NodeAddress::parse(&path));

    let executor = Executor::new(page.clone(), Resolver::default(), quiet_timing());
    let result = executor
        .execute_one(&PlannedAction::click(Locator::by_path(&path)).unwrap())
        .await;
    assert!(result.success, "{}", result.message);
    assert!(page.events_for(&path).contains(&DomEvent::Click));
}
