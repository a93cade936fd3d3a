//! Recording a session, saving it, and replaying it against a changed page.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockElement, MockHost, MockPage};
use serde_json::json;
use wayfarer_runner::config::ReplaySettings;
use wayfarer_runner::{
    AgentHistory, Config, Error, EventKind, Navigator, ProposedAction, Runner, ScriptedModel, TaskSettings,
};

const SHOP: &str = "https://shop.test/";

fn shop(elements: Vec<MockElement>) -> MockPage {
    MockPage::new("Shop", elements)
}

/// Record `[go_to_url SHOP]` then `[click buy]` on a fresh navigator.
async fn record(host: &Arc<MockHost>) -> AgentHistory {
    host.set_page(
        SHOP,
        shop(vec![
            MockElement::link("home", "Home", "https://shop.test/home"),
            MockElement::button("buy", "Buy now"),
        ]),
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![ProposedAction::new("go_to_url", json!({ "url": SHOP }))]);
    model.push_actions(vec![ProposedAction::new("click_element", json!({"index": 1}))]);
    let mut nav = Navigator::builder("buy", host.clone(), model)
        .build()
        .unwrap();
    nav.execute_step().await.unwrap();
    nav.execute_step().await.unwrap();
    nav.agent_history()
}

fn replayer(host: &Arc<MockHost>, settings: TaskSettings) -> Navigator {
    Navigator::builder("replay", host.clone(), Arc::new(ScriptedModel::default()))
        .settings(settings)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_replay_follows_moved_element() {
    let host = MockHost::new();
    let history = record(&host).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    history.save(&path).unwrap();
    let loaded = AgentHistory::load(&path).unwrap();
    assert!(loaded.steps[1].action_results[0]
        .interacted_element()
        .is_some());

    // A new button now sits before the one that was clicked.
    host.set_page(
        SHOP,
        shop(vec![
            MockElement::link("home", "Home", "https://shop.test/home"),
            MockElement::button("promo", "Summer sale"),
            MockElement::button("buy", "Buy now"),
        ]),
    );

    let mut nav = replayer(&host, TaskSettings::default());
    let results = nav.replay_history(&loaded).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.is_error()));
    let clicks = host.clicks();
    assert_eq!(clicks.last().unwrap().1, "buy");
    assert_ne!(clicks.last().unwrap().0, clicks[0].0);
}

#[tokio::test(start_paused = true)]
async fn test_replay_skips_step_after_retries() {
    let host = MockHost::new();
    let history = record(&host).await;
    host.set_page(
        SHOP,
        shop(vec![MockElement::link("home", "Home", "https://shop.test/home")]),
    );

    let mut nav = replayer(&host, TaskSettings::default());
    nav.execute_replay_step(&history.steps[0], 0, 2).await.unwrap();
    let results = nav
        .execute_replay_step(&history.steps[1], 1, 2)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].error().unwrap().contains("not found"));
    assert_eq!(host.clicks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replay_without_skip_returns_error() {
    let host = MockHost::new();
    let history = record(&host).await;
    host.set_page(SHOP, shop(vec![]));

    let settings = TaskSettings {
        replay: ReplaySettings {
            max_retries: 2,
            delay_ms: 10,
            skip_failures: false,
        },
        ..Default::default()
    };
    let mut nav = replayer(&host, settings);
    let err = nav.replay_history(&history).await.unwrap_err();
    assert!(matches!(err, Error::ElementNotFound(_)), "{}", err);
}

#[tokio::test(start_paused = true)]
async fn test_replay_skips_actions_that_failed_when_recorded() {
    let host = MockHost::new();
    host.set_page(
        SHOP,
        shop(vec![MockElement::button("buy", "Buy now")]),
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![
        ProposedAction::new("go_to_url", json!({ "url": SHOP })),
    ]);
    model.push_actions(vec![
        ProposedAction::new("click_element", json!({"index": 9})),
        ProposedAction::new("click_element", json!({"index": 0})),
    ]);
    let mut nav = Navigator::builder("buy", host.clone(), model)
        .build()
        .unwrap();
    nav.execute_step().await.unwrap();
    nav.execute_step().await.unwrap();
    let history = nav.agent_history();
    assert!(history.steps[1].action_results[0].is_error());

    let mut replay = replayer(&host, TaskSettings::default());
    let results = replay.replay_history(&history).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.is_error()));
}

#[tokio::test(start_paused = true)]
async fn test_runner_runs_plan_to_done() {
    let host = MockHost::new();
    host.set_page(
        SHOP,
        shop(vec![
            MockElement::link("home", "Home", "https://shop.test/home"),
            MockElement::button("buy", "Buy now"),
        ]),
    );
    let config = Config::parse(
        r#"
name: Buy
target:
  url: "${site:-https://shop.test/}"
steps:
  - goal: buy it
    actions:
      - click_element:
          index: 1
"#,
    )
    .unwrap();

    let runner = Runner::with_host(host.clone());
    let (result, history) = runner.run(&config).await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert!(result.done);
    assert_eq!(result.steps_executed, 2);
    assert_eq!(result.actions_executed, 2);
    assert_eq!(result.final_result.as_deref(), Some("plan finished"));
    assert_eq!(history.steps[0].url.as_deref(), Some(SHOP));
    assert_eq!(host.clicks()[0].1, "buy");

    let (replayed, results) = runner.replay(&history, TaskSettings::default()).await.unwrap();
    assert!(replayed.success, "{:?}", replayed.error);
    assert_eq!(results.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_replay_does_not_retry_invalid_input() {
    let host = MockHost::new();
    let mut history = record(&host).await;
    history.steps[1].actions[0].args = json!({"index": "not-a-number"});

    let settings = TaskSettings {
        replay: ReplaySettings {
            max_retries: 3,
            delay_ms: 1000,
            skip_failures: false,
        },
        ..Default::default()
    };
    let mut nav = replayer(&host, settings);
    nav.execute_replay_step(&history.steps[0], 0, 2).await.unwrap();

    let start = tokio::time::Instant::now();
    let err = nav
        .execute_replay_step(&history.steps[1], 1, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{}", err);
    assert!(start.elapsed() < Duration::from_millis(1000));
    assert_eq!(host.clicks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_delay_leaves_navigator_usable() {
    let host = MockHost::new();
    let history = record(&host).await;
    host.set_page(
        SHOP,
        shop(vec![MockElement::link("home", "Home", "https://shop.test/home")]),
    );

    let settings = TaskSettings {
        replay: ReplaySettings {
            max_retries: 3,
            delay_ms: 1000,
            skip_failures: true,
        },
        ..Default::default()
    };
    let mut nav = replayer(&host, settings);
    nav.execute_replay_step(&history.steps[0], 0, 2).await.unwrap();

    let mut rx = nav.events().subscribe();
    let handle = nav.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.cancel();
    });
    let err = nav
        .execute_replay_step(&history.steps[1], 1, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "{}", err);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::StepCancelled), "{:?}", kinds);
    assert!(!kinds.contains(&EventKind::StepFailed), "{:?}", kinds);

    let outcome = nav.execute_step().await.unwrap();
    assert!(outcome.done);
}
