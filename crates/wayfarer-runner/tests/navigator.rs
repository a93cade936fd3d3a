//! Navigator scenarios against in-memory surfaces.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{MockElement, MockHost, MockPage};
use serde_json::json;
use wayfarer_agent::SurfaceHost;
use wayfarer_runner::actions::{Action, ActionContext, ActionHandler, ActionOutcome};
use wayfarer_runner::navigator::Phase;
use wayfarer_runner::{
    ActionInput, ActionKind, ActionResult, CancelCause, Error, EventKind, ExecutionEvent, Navigator,
    ProposedAction, Registry, ScriptedModel, StepStatus, TaskSettings, UrlPolicy,
};

const SHOP: &str = "https://shop.test/";
const SERP: &str = "https://www.google.com/search?q=rust&udm=14";

fn click(index: u32) -> ProposedAction {
    ProposedAction::new("click_element", json!({ "index": index }))
}

fn shop() -> MockPage {
    MockPage::new(
        "Shop",
        vec![
            MockElement::link("home", "Home", "https://shop.test/home"),
            MockElement::button("buy", "Buy now"),
            MockElement::button("wish", "Wishlist"),
        ],
    )
}

async fn bound(host: &Arc<MockHost>, model: &Arc<ScriptedModel>, settings: TaskSettings, url: &str) -> Navigator {
    let surface = host.open(url).await.unwrap();
    Navigator::builder("test task", host.clone(), model.clone())
        .settings(settings)
        .surface(surface)
        .build()
        .unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_too_many_failures_keeps_partial_results() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions((40..45).map(click).collect());
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    let err = nav.execute_step().await.unwrap_err();
    assert!(
        matches!(err, Error::TooManyFailures { failures: 4, limit: 3 }),
        "{}",
        err
    );

    let record = &nav.history()[0];
    assert_eq!(record.actions.len(), 5);
    assert_eq!(record.action_results.len(), 4);
    assert!(record.action_results.iter().all(|r| r.is_error()));
    assert!(record.action_results[0]
        .error()
        .unwrap()
        .contains("index 40 does not exist"));
    assert!(matches!(record.status, StepStatus::Failed(ref m) if m.contains("too many failures")));
    assert_eq!(nav.phase(), Phase::Failed);
    assert!(host.clicks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_click_twice_opens_one_surface() {
    let host = MockHost::new();
    host.set_page(
        SHOP,
        MockPage::new(
            "Shop",
            vec![
                MockElement::button("other", "Other"),
                MockElement::popup("promo", "Open promo", "promo", "https://shop.test/promo"),
            ],
        ),
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![click(1), click(1)]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;
    let original = nav.surface().unwrap().id().clone();
    let mut rx = nav.events().subscribe();

    let outcome = nav.execute_step().await.unwrap();
    assert!(!outcome.done);
    assert_eq!(outcome.status, StepStatus::Completed);

    let events = drain(&mut rx);
    let created: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::SurfaceCreated)
        .collect();
    assert_eq!(created.len(), 1);
    assert_ne!(created[0].surface_id.as_ref(), Some(&original));
    assert_eq!(host.surface_count(), 2);

    // Both clicks ran on the original surface, against the same element.
    let clicks = host.clicks();
    assert_eq!(clicks.len(), 2);
    assert!(clicks.iter().all(|(s, el)| s == &original && el == "promo"));
    assert_eq!(nav.surface().unwrap().id(), &original);

    let record = &nav.history()[0];
    assert_eq!(record.action_results.len(), 2);
    assert!(record.action_results.iter().all(|r| !r.is_error()));
    assert!(record.action_results[0]
        .extracted_content()
        .unwrap()
        .contains("new tab opened"));
    assert!(record.action_results[0].interacted_element().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_google_extraction_turns_the_page() {
    let host = MockHost::new();
    let page2 = "https://www.google.com/search?q=rust&start=10";
    host.set_page(
        SERP,
        MockPage {
            title: "rust - Google".into(),
            results: vec![("Rust".into(), "https://www.rust-lang.org/".into())],
            next: Some(page2.into()),
            ..Default::default()
        },
    );
    host.set_page(
        page2,
        MockPage {
            title: "rust - Google".into(),
            results: vec![("The Rust Book".into(), "https://doc.rust-lang.org/book/".into())],
            ..Default::default()
        },
    );
    let model = Arc::new(ScriptedModel::default());
    let extract = ProposedAction::new("extract_google_results", json!({}));
    model.push_actions(vec![extract.clone(), extract]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SERP).await;

    nav.execute_step().await.unwrap();

    let record = &nav.history()[0];
    let names: Vec<&str> = record.actions.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["next_page", "extract_google_results"]);
    let text = record.action_results[1].extracted_content().unwrap();
    assert!(text.contains("The Rust Book"), "{}", text);
    assert!(!text.contains("www.rust-lang.org"));
}

#[tokio::test(start_paused = true)]
async fn test_extraction_of_a_page_read_last_step_turns_the_page() {
    let host = MockHost::new();
    let page2 = "https://www.google.com/search?q=rust&start=10";
    host.set_page(
        SERP,
        MockPage {
            title: "rust - Google".into(),
            results: vec![("Rust".into(), "https://www.rust-lang.org/".into())],
            next: Some(page2.into()),
            ..Default::default()
        },
    );
    let model = Arc::new(ScriptedModel::default());
    let extract = ProposedAction::new("extract_google_results", json!({}));
    model.push_actions(vec![extract.clone()]);
    model.push_actions(vec![extract]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SERP).await;

    nav.execute_step().await.unwrap();
    nav.execute_step().await.unwrap();

    let second = &nav.history()[1];
    assert_eq!(second.actions[0].name, "next_page");
    assert_eq!(second.actions.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_first_action() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![click(1), click(2), click(1)]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    let handle = nav.cancel_handle();
    let mut rx = nav.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.kind == EventKind::ActionOk {
                handle.cancel();
                break;
            }
        }
    });

    let err = nav.execute_step().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "{}", err);

    let record = &nav.history()[0];
    assert_eq!(record.action_results.len(), 1);
    assert!(!record.action_results[0].is_error());
    assert_eq!(record.status, StepStatus::Cancelled(CancelCause::User));
    assert_eq!(nav.phase(), Phase::Cancelled);
    assert_eq!(host.clicks().len(), 1);

    // The navigator stays usable after a cancel.
    model.push_actions(vec![ProposedAction::new("done", json!({"text": "ok"}))]);
    let outcome = nav.execute_step().await.unwrap();
    assert!(outcome.done);
    assert_eq!(nav.phase(), Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_step_deadline_is_recorded_as_timeout() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![
        click(1),
        ProposedAction::new("wait", json!({"seconds": 30})),
        click(2),
    ]);
    let settings = TaskSettings {
        step_timeout_ms: Some(5_000),
        ..Default::default()
    };
    let mut nav = bound(&host, &model, settings, SHOP).await;

    let err = nav.execute_step().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{}", err);
    let record = &nav.history()[0];
    assert_eq!(record.action_results.len(), 1);
    assert_eq!(record.status, StepStatus::Cancelled(CancelCause::Deadline));
}

#[tokio::test(start_paused = true)]
async fn test_stale_index_follows_element_after_navigation() {
    let host = MockHost::new();
    host.set_page(
        SHOP,
        MockPage::new(
            "Shop",
            vec![
                MockElement::link("next", "Next", "https://shop.test/b"),
                MockElement::button("buy", "Buy now"),
            ],
        ),
    );
    host.set_page(
        "https://shop.test/b",
        MockPage::new(
            "Shop B",
            vec![
                MockElement::button("promo", "Promo"),
                MockElement::link("back", "Back", SHOP),
                MockElement::button("buy", "Buy now"),
            ],
        ),
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![click(0), click(1)]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    nav.execute_step().await.unwrap();

    let clicked: Vec<String> = host.clicks().into_iter().map(|(_, el)| el).collect();
    assert_eq!(clicked, vec!["next", "buy"]);
    let record = &nav.history()[0];
    assert!(record.action_results.iter().all(|r| !r.is_error()));
}

#[tokio::test(start_paused = true)]
async fn test_stale_index_of_removed_element_fails() {
    let host = MockHost::new();
    host.set_page(
        SHOP,
        MockPage::new(
            "Shop",
            vec![
                MockElement::link("next", "Next", "https://shop.test/b"),
                MockElement::button("buy", "Buy now"),
            ],
        ),
    );
    host.set_page(
        "https://shop.test/b",
        MockPage::new("Shop B", vec![MockElement::link("back", "Back", SHOP)]),
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![click(0), click(1)]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    nav.execute_step().await.unwrap();

    let record = &nav.history()[0];
    assert_eq!(record.action_results.len(), 2);
    assert!(record.action_results[1]
        .error()
        .unwrap()
        .contains("no longer on the page"));
    assert_eq!(host.clicks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_policy_violation_aborts_batch() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![
        ProposedAction::new("go_to_url", json!({"url": "https://evil.test/login"})),
        click(1),
    ]);
    let settings = TaskSettings {
        url_policy: UrlPolicy::new().deny("evil.test"),
        ..Default::default()
    };
    let mut nav = bound(&host, &model, settings, SHOP).await;

    let err = nav.execute_step().await.unwrap_err();
    assert!(matches!(err, Error::PolicyViolation(_)), "{}", err);

    let record = &nav.history()[0];
    assert_eq!(record.action_results.len(), 1);
    assert!(record.action_results[0].is_error());
    assert!(matches!(record.status, StepStatus::Failed(_)));
    assert!(host.clicks().is_empty());
    assert_eq!(nav.surface().unwrap().url().await.unwrap(), SHOP);
}

#[tokio::test(start_paused = true)]
async fn test_unbound_navigator_gets_placeholder_and_a_surface() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![ProposedAction::new("go_to_url", json!({"url": "shop.test/"}))]);
    let mut nav = Navigator::builder("buy shoes", host.clone(), model.clone())
        .build()
        .unwrap();
    assert!(nav.get_cached_state().is_none());
    let mut rx = nav.events().subscribe();

    nav.execute_step().await.unwrap();

    let calls = model.calls();
    let prompt = &calls[0].last().unwrap().content;
    assert!(prompt.contains("No page is open"), "{}", prompt);
    assert!(prompt.contains("buy shoes"));

    let created = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == EventKind::SurfaceCreated)
        .count();
    assert_eq!(created, 1);

    let state = nav.get_state().await.unwrap();
    assert_eq!(state.url, SHOP);
    assert_eq!(state.selector_map.len(), 3);

    // Next prompt lists the page.
    nav.execute_step().await.unwrap();
    let calls = model.calls();
    let prompt = &calls[1].last().unwrap().content;
    assert!(prompt.contains("[1] <button"), "{}", prompt);
    assert!(prompt.contains("Navigated to https://shop.test/"));
}

#[tokio::test(start_paused = true)]
async fn test_done_ends_the_batch() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![
        ProposedAction::new("done", json!({"text": "bought", "success": true})),
        click(1),
    ]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;
    let mut rx = nav.events().subscribe();

    let outcome = nav.execute_step().await.unwrap();
    assert!(outcome.done);
    assert_eq!(nav.history()[0].action_results.len(), 1);
    assert!(host.clicks().is_empty());
    assert_eq!(nav.agent_history().final_result(), Some("bought"));

    let kinds: Vec<EventKind> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::StepStarted,
            EventKind::ActionStarted,
            EventKind::ActionOk,
            EventKind::StepOk
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_reply_is_recorded() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push(wayfarer_runner::ModelReply::Raw("I think I should click".into()));
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    let err = nav.execute_step().await.unwrap_err();
    assert!(matches!(err, Error::Model(_)), "{}", err);
    let record = &nav.history()[0];
    assert_eq!(record.model_output_raw, "I think I should click");
    assert!(record.action_results.is_empty());
    assert_eq!(record.url.as_deref(), Some(SHOP));
}

#[tokio::test(start_paused = true)]
async fn test_closed_surface_is_unbound() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;
    let id = nav.surface().unwrap().id().clone();

    host.close(&id).await.unwrap();
    model.push_actions(vec![ProposedAction::new("done", json!({"text": "x"}))]);
    nav.execute_step().await.unwrap();

    assert!(nav.surface().is_none());
    let prompt = model.calls()[0].last().unwrap().content.clone();
    assert!(prompt.contains("No page is open"));
}

#[tokio::test(start_paused = true)]
async fn test_every_stale_index_is_remapped() {
    let host = MockHost::new();
    host.set_page(
        SHOP,
        MockPage::new(
            "Shop",
            vec![
                MockElement::link("next", "Next", "https://shop.test/b"),
                MockElement::button("buy", "Buy now"),
                MockElement::button("wish", "Wishlist"),
            ],
        ),
    );
    host.set_page(
        "https://shop.test/b",
        MockPage::new(
            "Shop B",
            vec![
                MockElement::button("promo", "Promo"),
                MockElement::link("back", "Back", SHOP),
                MockElement::button("buy", "Buy now"),
                MockElement::button("wish", "Wishlist"),
            ],
        ),
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![click(0), click(1), click(2)]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    nav.execute_step().await.unwrap();

    let clicked: Vec<String> = host.clicks().into_iter().map(|(_, el)| el).collect();
    assert_eq!(clicked, vec!["next", "buy", "wish"]);
    // One rebuild after the navigation serves both remaps.
    let trace = host.trace();
    let first = trace.iter().position(|t| t == "click buy").unwrap();
    let last = trace.iter().position(|t| t == "click wish").unwrap();
    assert!(trace[first..last].iter().all(|t| !t.starts_with("capture")));
}

#[tokio::test(start_paused = true)]
async fn test_bound_first_step_keeps_action_order() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    host.set_page("https://shop.test/b", MockPage::new("Shop B", vec![]));
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![
        click(1),
        ProposedAction::new("go_to_url", json!({"url": "https://shop.test/b"})),
    ]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    nav.execute_step().await.unwrap();

    let record = &nav.history()[0];
    let names: Vec<&str> = record.actions.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["click_element", "go_to_url"]);
    assert!(record.action_results.iter().all(|r| !r.is_error()));
    assert_eq!(host.clicks()[0].1, "buy");
}

#[tokio::test(start_paused = true)]
async fn test_unbound_first_step_opens_pages_first() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![
        ProposedAction::new("scroll_down", json!({})),
        ProposedAction::new("go_to_url", json!({"url": SHOP})),
    ]);
    let mut nav = Navigator::builder("shop", host.clone(), model.clone())
        .build()
        .unwrap();

    nav.execute_step().await.unwrap();

    let names: Vec<&str> = nav.history()[0]
        .actions
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(names, vec!["go_to_url", "scroll_down"]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_without_navigation_never_rebuilds() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![
        click(1),
        click(2),
        ProposedAction::new("scroll_down", json!({})),
        click(1),
    ]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    nav.execute_step().await.unwrap();

    let trace = host.trace();
    let first = trace.iter().position(|t| t == "click buy").unwrap();
    let last = trace.iter().rposition(|t| t == "click buy").unwrap();
    assert!(first < last);
    assert!(
        trace[first..last].iter().all(|t| !t.starts_with("capture")),
        "{:?}",
        trace
    );
    assert!(trace[..first].iter().any(|t| t.starts_with("capture")));
}

#[tokio::test(start_paused = true)]
async fn test_file_uploader_is_not_clicked() {
    let host = MockHost::new();
    host.set_page(
        SHOP,
        MockPage::new(
            "Upload",
            vec![
                MockElement::file_input("avatar"),
                MockElement::button("save", "Save"),
            ],
        ),
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![click(0), click(1)]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SHOP).await;

    nav.execute_step().await.unwrap();

    let record = &nav.history()[0];
    assert!(record.action_results[0]
        .error()
        .unwrap()
        .contains("file chooser"));
    assert!(!record.action_results[1].is_error());
    let clicked: Vec<String> = host.clicks().into_iter().map(|(_, el)| el).collect();
    assert_eq!(clicked, vec!["save"]);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_search_results_fail_the_action() {
    let host = MockHost::new();
    host.set_page(
        SERP,
        MockPage {
            title: "rust - Google".into(),
            raw_results: Some(json!({"error": "blocked"})),
            ..Default::default()
        },
    );
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![ProposedAction::new("extract_google_results", json!({}))]);
    let mut nav = bound(&host, &model, TaskSettings::default(), SERP).await;

    nav.execute_step().await.unwrap();

    let result = &nav.history()[0].action_results[0];
    assert!(
        result.error().unwrap().contains("unreadable search results"),
        "{:?}",
        result
    );
}

/// Clicks without recording what it touched.
struct PressHandler;

#[async_trait]
impl ActionHandler for PressHandler {
    async fn call(
        &self,
        input: ActionInput,
        _ctx: &ActionContext,
    ) -> wayfarer_runner::Result<ActionOutcome> {
        Ok(ActionOutcome {
            result: ActionResult::extracted(format!("pressed {}", input.args()), false),
            ..Default::default()
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_index_handler_gets_element_record() {
    let host = MockHost::new();
    host.set_page(SHOP, shop());
    let mut registry = Registry::with_defaults();
    registry.register(Action::new(ActionKind::ClickElement, Arc::new(PressHandler)));
    let model = Arc::new(ScriptedModel::default());
    model.push_actions(vec![click(1)]);
    let surface = host.open(SHOP).await.unwrap();
    let mut nav = Navigator::builder("press", host.clone(), model.clone())
        .registry(registry)
        .surface(surface)
        .build()
        .unwrap();

    nav.execute_step().await.unwrap();

    let result = &nav.history()[0].action_results[0];
    let record = result.interacted_element().unwrap();
    assert_eq!(record.tag, "button");
    assert_eq!(record.attributes.get("id").map(String::as_str), Some("buy"));
    assert_eq!(record.interaction_index, Some(1));
}
