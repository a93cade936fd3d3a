use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};
use wayfarer_agent::dom::truncate;
use wayfarer_agent::history::record_for_index;
use wayfarer_agent::{ElementNode, ElementTarget, PageState, Surface, SurfaceHost, SurfaceId};

use super::*;
use crate::config::TaskSettings;
use crate::policy::normalize_url;
use crate::result::ActionResult;
use crate::signal::StepSignal;

/// Page text handed back by `extract_content` is cut to this many chars.
const EXTRACT_LIMIT: usize = 10_000;
const MAX_WAIT_SECS: u64 = 60;

/// What a handler may touch.
pub struct ActionContext {
    pub host: Arc<dyn SurfaceHost>,
    /// Surface the navigator is bound to, if any.
    pub surface: Option<Arc<dyn Surface>>,
    /// Snapshot the batch runs against.
    pub state: Option<Arc<PageState>>,
    pub signal: StepSignal,
    pub settings: TaskSettings,
}

impl ActionContext {
    pub fn surface(&self) -> Result<&Arc<dyn Surface>> {
        self.surface
            .as_ref()
            .ok_or_else(|| Error::SurfaceUnavailable("no surface bound".into()))
    }

    pub fn state(&self) -> Result<&PageState> {
        self.state
            .as_deref()
            .ok_or_else(|| Error::SurfaceUnavailable("no page state".into()))
    }

    /// One document operation, bounded and cancellable.
    pub async fn op<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = wayfarer_agent::Result<T>>,
    {
        self.signal
            .bounded(self.settings.op_timeout(), what, async {
                fut.await.map_err(Error::from)
            })
            .await
    }

    fn element(&self, index: u32) -> Result<(ElementTarget, &ElementNode)> {
        let state = self.state()?;
        let missing = || {
            Error::ElementNotFound(format!(
                "element with index {} does not exist, retry or use alternative actions",
                index
            ))
        };
        let (_, el) = state.element(index).ok_or_else(missing)?;
        let target = state.target(index).ok_or_else(missing)?;
        Ok((target, el))
    }

    async fn surface_ids(&self) -> Result<HashSet<SurfaceId>> {
        let infos = self.op("list tabs", self.host.surfaces()).await?;
        Ok(infos.into_iter().map(|i| i.id).collect())
    }

    /// Reject the page `surface` ended up on if policy forbids it.
    async fn check_landing(&self, surface: &Arc<dyn Surface>) -> Result<String> {
        let url = self.op("url", surface.url()).await?;
        if let Err(e) = self.settings.url_policy.check(&url) {
            warn!("Landed on disallowed page {}, going back", url);
            let _ = self.op("go back", surface.go_back()).await;
            return Err(e);
        }
        Ok(url)
    }
}

/// Side effects of an action the navigator must react to.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    pub result: ActionResult,
    /// The bound surface's document changed; the cached snapshot is stale.
    pub navigated: bool,
    /// Surfaces that appeared during the action.
    pub opened: Vec<SurfaceId>,
    /// Surface the navigator should bind to next.
    pub switch_to: Option<SurfaceId>,
}

impl ActionOutcome {
    fn new(result: ActionResult) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    fn navigated(mut self) -> Self {
        self.navigated = true;
        self
    }
}

/// Handler for every built-in [`ActionKind`].
pub struct BuiltinHandler;

#[async_trait]
impl ActionHandler for BuiltinHandler {
    async fn call(&self, input: ActionInput, ctx: &ActionContext) -> Result<ActionOutcome> {
        match input {
            ActionInput::Done(p) => Ok(ActionOutcome::new(ActionResult::done(p.text, p.success))),
            ActionInput::SearchGoogle(p) => search_google(p, ctx).await,
            ActionInput::GoToUrl(p) => go_to_url(p, ctx).await,
            ActionInput::GoBack => go_back(ctx).await,
            ActionInput::Wait(p) => wait(p, ctx).await,
            ActionInput::ClickElement(p) => click_element(p, ctx).await,
            ActionInput::InputText(p) => input_text(p, ctx).await,
            ActionInput::SwitchTab(p) => switch_tab(p, ctx).await,
            ActionInput::OpenTab(p) => open_tab(p, ctx).await,
            ActionInput::CloseTab(p) => close_tab(p, ctx).await,
            ActionInput::CacheContent(p) => Ok(ActionOutcome::new(ActionResult::extracted(
                format!("Cached findings: {}", p.content),
                true,
            ))),
            ActionInput::ExtractContent(p) => extract_content(p, ctx).await,
            ActionInput::ExtractGoogleResults => extract_google_results(ctx).await,
            ActionInput::ScrollDown(p) => scroll(p, 1, ctx).await,
            ActionInput::ScrollUp(p) => scroll(p, -1, ctx).await,
            ActionInput::NextPage => next_page(ctx).await,
            ActionInput::ScrollToText(p) => scroll_to_text(p, ctx).await,
            ActionInput::SendKeys(p) => send_keys(p, ctx).await,
            ActionInput::GetDropdownOptions(p) => get_dropdown_options(p, ctx).await,
            ActionInput::SelectDropdownOption(p) => select_dropdown_option(p, ctx).await,
        }
    }
}

// =========================================================================
// Navigation
// =========================================================================

async fn navigate_to(url: &str, ctx: &ActionContext) -> Result<String> {
    ctx.settings.url_policy.check(url)?;
    let surface = ctx.surface()?;
    info!("Navigating to: {}", url);
    ctx.op("navigate", surface.navigate(url)).await?;
    ctx.op("settle", surface.wait_for_stable()).await?;
    // Redirects may end somewhere else.
    ctx.check_landing(surface).await
}

async fn search_google(p: SearchGoogleParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let query: String = url::form_urlencoded::byte_serialize(p.query.as_bytes()).collect();
    navigate_to(
        &format!("https://www.google.com/search?q={}&udm=14", query),
        ctx,
    )
    .await?;
    Ok(ActionOutcome::new(ActionResult::extracted(
        format!("Searched for \"{}\" in Google", p.query),
        true,
    ))
    .navigated())
}

async fn go_to_url(p: UrlParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let url = normalize_url(&p.url);
    let landed = navigate_to(&url, ctx).await?;
    Ok(ActionOutcome::new(ActionResult::extracted(format!("Navigated to {}", landed), true)).navigated())
}

async fn go_back(ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    ctx.op("go back", surface.go_back()).await?;
    ctx.op("settle", surface.wait_for_stable()).await?;
    Ok(ActionOutcome::new(ActionResult::extracted("Navigated back", true)).navigated())
}

async fn wait(p: WaitParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let secs = p.seconds.min(MAX_WAIT_SECS);
    ctx.signal.sleep(Duration::from_secs(secs)).await?;
    Ok(ActionOutcome::new(ActionResult::extracted(
        format!("Waited for {} seconds", secs),
        true,
    )))
}

// =========================================================================
// Element interaction
// =========================================================================

fn label(state: &PageState, index: u32) -> String {
    state
        .selector_map
        .get(&index)
        .map(|&id| state.tree.text_until_next_interactive(id))
        .filter(|t| !t.is_empty())
        .map(|t| format!(" \"{}\"", truncate(&t, 40)))
        .unwrap_or_default()
}

async fn click_element(p: IndexParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let state = ctx.state()?;
    let (target, el) = ctx.element(p.index)?;
    if el.is_file_uploader {
        return Err(Error::ActionFailed(format!(
            "index {} opens a file chooser and cannot be clicked",
            p.index
        )));
    }
    let record = record_for_index(state, p.index);

    let before_url = ctx.op("url", surface.url()).await?;
    let before = ctx.surface_ids().await?;

    ctx.op("click", surface.click(&target)).await?;
    ctx.op("settle", surface.wait_for_stable()).await?;

    let after_url = ctx.op("url", surface.url()).await?;
    let navigated = after_url != before_url;
    if navigated {
        debug!("Click on [{}] navigated to {}", p.index, after_url);
        ctx.check_landing(surface).await?;
    }

    let mut opened: Vec<SurfaceId> = Vec::new();
    for info in ctx.op("list tabs", ctx.host.surfaces()).await? {
        if before.contains(&info.id) {
            continue;
        }
        if let Err(e) = ctx.settings.url_policy.check(&info.url) {
            warn!("Closing disallowed tab {} ({})", info.id, info.url);
            let _ = ctx.op("close tab", ctx.host.close(&info.id)).await;
            return Err(e);
        }
        opened.push(info.id);
    }
    opened.sort();

    let mut msg = format!("Clicked element [{}]{}", p.index, label(state, p.index));
    if !opened.is_empty() {
        let ids: Vec<&str> = opened.iter().map(|id| id.as_str()).collect();
        msg.push_str(&format!("; new tab opened: {}", ids.join(", ")));
    }

    Ok(ActionOutcome {
        result: ActionResult::extracted(msg, true).with_interacted(record),
        navigated,
        opened,
        switch_to: None,
    })
}

async fn input_text(p: InputTextParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let state = ctx.state()?;
    let (target, el) = ctx.element(p.index)?;
    let shown = if el.input_type().as_deref() == Some("password") {
        "*".repeat(p.text.chars().count().min(8))
    } else {
        p.text.clone()
    };

    ctx.op("input", surface.input_text(&target, &p.text)).await?;

    Ok(ActionOutcome::new(
        ActionResult::extracted(format!("Input \"{}\" into index {}", shown, p.index), true)
            .with_interacted(record_for_index(state, p.index)),
    ))
}

async fn get_dropdown_options(p: IndexParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let state = ctx.state()?;
    let (target, el) = ctx.element(p.index)?;
    if el.tag != "select" {
        return Err(Error::ActionFailed(format!(
            "index {} is a <{}>, not a <select>",
            p.index, el.tag
        )));
    }

    let options = ctx.op("dropdown options", surface.dropdown_options(&target)).await?;
    let mut msg = String::new();
    for (i, (value, text)) in options.iter().enumerate() {
        msg.push_str(&format!("{}: text={:?} value={:?}\n", i, text, value));
    }
    msg.push_str("Use the exact text in select_dropdown_option");

    Ok(ActionOutcome::new(
        ActionResult::extracted(msg, true).with_interacted(record_for_index(state, p.index)),
    ))
}

async fn select_dropdown_option(p: SelectOptionParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let state = ctx.state()?;
    let (target, _) = ctx.element(p.index)?;

    ctx.op("select option", surface.select_option(&target, &p.text)).await?;

    Ok(ActionOutcome::new(
        ActionResult::extracted(
            format!("Selected option \"{}\" in index {}", p.text, p.index),
            true,
        )
        .with_interacted(record_for_index(state, p.index)),
    ))
}

async fn send_keys(p: SendKeysParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let before_url = ctx.op("url", surface.url()).await?;

    ctx.op("send keys", surface.send_keys(&p.keys)).await?;
    ctx.op("settle", surface.wait_for_stable()).await?;

    let after_url = ctx.op("url", surface.url()).await?;
    let navigated = after_url != before_url;
    if navigated {
        ctx.check_landing(surface).await?;
    }
    Ok(ActionOutcome {
        navigated,
        ..ActionOutcome::new(ActionResult::extracted(format!("Sent keys: {}", p.keys), true))
    })
}

// =========================================================================
// Tabs
// =========================================================================

async fn switch_tab(p: TabParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let id = SurfaceId::new(p.tab_id);
    let surface = ctx.op("switch tab", ctx.host.activate(&id)).await?;
    let url = ctx.op("url", surface.url()).await?;
    ctx.settings.url_policy.check(&url)?;
    Ok(ActionOutcome {
        switch_to: Some(id.clone()),
        ..ActionOutcome::new(ActionResult::extracted(
            format!("Switched to tab {} ({})", id, url),
            true,
        ))
        .navigated()
    })
}

async fn open_tab(p: UrlParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let url = normalize_url(&p.url);
    ctx.settings.url_policy.check(&url)?;
    let surface = ctx.op("open tab", ctx.host.open(&url)).await?;
    let id = surface.id().clone();
    if let Err(e) = ctx.check_landing(&surface).await {
        let _ = ctx.op("close tab", ctx.host.close(&id)).await;
        return Err(e);
    }
    Ok(ActionOutcome {
        result: ActionResult::extracted(format!("Opened new tab {} with {}", id, url), true),
        navigated: true,
        opened: vec![id.clone()],
        switch_to: Some(id),
    })
}

async fn close_tab(p: TabParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let id = SurfaceId::new(p.tab_id);
    let is_current = ctx.surface.as_ref().is_some_and(|s| s.id() == &id);
    ctx.op("close tab", ctx.host.close(&id)).await?;

    let mut outcome = ActionOutcome::new(ActionResult::extracted(format!("Closed tab {}", id), true));
    if is_current {
        outcome.navigated = true;
        outcome.switch_to = ctx
            .op("list tabs", ctx.host.surfaces())
            .await?
            .into_iter()
            .map(|i| i.id)
            .find(|other| other != &id);
    }
    Ok(outcome)
}

// =========================================================================
// Reading
// =========================================================================

async fn extract_content(p: ExtractContentParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let text = ctx.op("read text", surface.text()).await?;
    let text = truncate(text.trim(), EXTRACT_LIMIT);
    Ok(ActionOutcome::new(ActionResult::extracted(
        format!("Extracted page content for \"{}\":\n{}", p.goal, text),
        true,
    )))
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    title: String,
    url: String,
}

const GOOGLE_RESULTS_JS: &str = r#"(() => {
    const out = [];
    for (const h of document.querySelectorAll('#search a h3, #rso a h3')) {
        const a = h.closest('a');
        if (!a || !a.href || out.some(r => r.url === a.href)) continue;
        out.push({ title: h.innerText.trim(), url: a.href });
    }
    return out;
})()"#;

async fn extract_google_results(ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let value = ctx.op("read results", surface.evaluate(GOOGLE_RESULTS_JS)).await?;
    let results: Vec<SearchResult> = serde_json::from_value(value)
        .map_err(|e| Error::ActionFailed(format!("unreadable search results: {}", e)))?;

    let msg = if results.is_empty() {
        "No search results found on this page".to_string()
    } else {
        results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {} - {}", i + 1, r.title, r.url))
            .collect::<Vec<_>>()
            .join("\n")
    };
    Ok(ActionOutcome::new(ActionResult::extracted(msg, true)))
}

fn page_height(ctx: &ActionContext) -> i64 {
    ctx.state
        .as_ref()
        .map(|s| s.viewport_height)
        .filter(|h| *h > 0.0)
        .unwrap_or(720.0) as i64
}

async fn scroll(p: ScrollParams, direction: i64, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let amount = p.amount.unwrap_or_else(|| page_height(ctx)).abs();
    ctx.op("scroll", surface.scroll_by(direction * amount)).await?;
    let which = if direction > 0 { "down" } else { "up" };
    Ok(ActionOutcome::new(ActionResult::extracted(
        format!("Scrolled {} by {} pixels", which, amount),
        true,
    )))
}

const NEXT_PAGE_JS: &str = r#"(() => {
    const selectors = ['a[rel="next"]', '#pnnext', 'a[aria-label="Next page"]',
        'a[aria-label="Next"]', 'button[aria-label="Next page"]'];
    for (const s of selectors) {
        const el = document.querySelector(s);
        if (el) { el.click(); return true; }
    }
    return false;
})()"#;

async fn next_page(ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    let clicked = ctx.op("next page", surface.evaluate(NEXT_PAGE_JS)).await?;

    if clicked.as_bool() == Some(true) {
        ctx.op("settle", surface.wait_for_stable()).await?;
        let url = ctx.check_landing(surface).await?;
        return Ok(
            ActionOutcome::new(ActionResult::extracted(format!("Moved to next page: {}", url), true))
                .navigated(),
        );
    }

    let amount = page_height(ctx);
    ctx.op("scroll", surface.scroll_by(amount)).await?;
    Ok(ActionOutcome::new(ActionResult::extracted(
        format!("No next-page link; scrolled down by {} pixels", amount),
        true,
    )))
}

async fn scroll_to_text(p: TextParams, ctx: &ActionContext) -> Result<ActionOutcome> {
    let surface = ctx.surface()?;
    if ctx.op("scroll to text", surface.scroll_to_text(&p.text)).await? {
        Ok(ActionOutcome::new(ActionResult::extracted(
            format!("Scrolled to text: {}", p.text),
            true,
        )))
    } else {
        Err(Error::ElementNotFound(format!(
            "text '{}' not found on the page",
            p.text
        )))
    }
}
