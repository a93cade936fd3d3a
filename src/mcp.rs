use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use wayfarer_agent::{EokaHost, LaunchOptions, SurfaceHost};
use wayfarer_runner::{
    AgentHistory, Navigator, ProposedAction, ScriptedModel, StepHistoryRecord, StepStatus,
    TaskSettings,
};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct NavigateRequest {
    #[schemars(description = "URL to navigate to")]
    pub url: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StateRequest {
    #[schemars(description = "Attach an annotated screenshot with numbered element labels")]
    #[serde(default)]
    pub screenshot: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ExecuteRequest {
    #[schemars(
        description = "Ordered actions, each an object with one key, e.g. [{\"click_element\": {\"index\": 3}}, {\"input_text\": {\"index\": 5, \"text\": \"hi\"}}]"
    )]
    pub actions: Vec<Value>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ReplayRequest {
    #[schemars(description = "Path of a history file written by `history`")]
    pub path: Option<String>,
    #[schemars(description = "History JSON, used when no path is given")]
    pub history: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct HistoryRequest {
    #[schemars(description = "Also write the history to this file")]
    pub path: Option<String>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn err(e: impl std::fmt::Display) -> ErrorData {
    ErrorData::internal_error(e.to_string(), None::<Value>)
}

fn text_ok(s: impl Into<String>) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::success(vec![Content::text(s.into())]))
}

/// Turn `[{"name": {...}}, "name"]` into proposed actions.
pub fn parse_actions(raw: Vec<Value>) -> Result<Vec<ProposedAction>, ErrorData> {
    raw.into_iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value(v).map_err(|e| {
                ErrorData::invalid_params(format!("action {}: {}", i, e), None::<Value>)
            })
        })
        .collect()
}

/// One line per planned action: its result, or why it never ran.
pub fn render_step(record: &StepHistoryRecord) -> String {
    let mut out = match &record.status {
        StepStatus::Completed => format!("Step {}: completed\n", record.step),
        StepStatus::Failed(e) => format!("Step {}: failed: {}\n", record.step, e),
        StepStatus::Cancelled(cause) => {
            format!("Step {}: cancelled ({:?})\n", record.step, cause)
        }
    };
    for (i, action) in record.actions.iter().enumerate() {
        let line = match record.action_results.get(i) {
            Some(r) if r.is_error() => {
                format!("✗ {}: {}", action.name, r.error().unwrap_or_default())
            }
            Some(r) => match r.extracted_content() {
                Some(text) => format!("✓ {}: {}", action.name, text),
                None => format!("✓ {}", action.name),
            },
            None => format!("- {}: not run", action.name),
        };
        out.push_str(&line);
        out.push('\n');
    }
    if let Some(url) = &record.url {
        out.push_str(&format!("URL: {}\n", url));
    }
    out
}

/// A live browser plus the navigator driving it. The model is scripted: each
/// `execute` call queues exactly the batch the client sent.
struct Session {
    browser: Option<Arc<EokaHost>>,
    model: Arc<ScriptedModel>,
    navigator: Navigator,
}

impl Session {
    fn new(
        host: Arc<dyn SurfaceHost>,
        settings: Arc<RwLock<TaskSettings>>,
    ) -> Result<Self, ErrorData> {
        let model = Arc::new(ScriptedModel::default());
        let navigator = Navigator::builder("mcp", host, model.clone())
            .settings(settings)
            .build()
            .map_err(err)?;
        Ok(Self {
            browser: None,
            model,
            navigator,
        })
    }

    /// Run `actions` as one step and describe what happened.
    async fn step(&mut self, actions: Vec<ProposedAction>) -> Result<CallToolResult, ErrorData> {
        self.model.push_actions(actions);
        let outcome = self.navigator.execute_step().await;
        let rendered = self
            .navigator
            .history()
            .last()
            .map(render_step)
            .unwrap_or_default();
        match outcome {
            Ok(_) => text_ok(rendered),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "{}Error: {}",
                rendered, e
            ))])),
        }
    }
}

#[derive(Clone)]
pub struct WayfarerServer {
    session: Arc<Mutex<Option<Session>>>,
    host: Option<Arc<dyn SurfaceHost>>,
    launch: LaunchOptions,
    settings: Arc<RwLock<TaskSettings>>,
    tool_router: ToolRouter<Self>,
}

impl WayfarerServer {
    /// Serve an existing host instead of launching Chrome.
    pub fn with_host(host: Arc<dyn SurfaceHost>, settings: TaskSettings) -> Self {
        let mut server = Self::with_settings(LaunchOptions::default(), settings);
        server.host = Some(host);
        server
    }

    pub fn with_settings(launch: LaunchOptions, settings: TaskSettings) -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            host: None,
            launch,
            settings: Arc::new(RwLock::new(settings)),
            tool_router: Self::tool_router(),
        }
    }

    /// Settings shared with the navigator; changes apply from the next step.
    pub fn settings(&self) -> &Arc<RwLock<TaskSettings>> {
        &self.settings
    }

    async fn ensure_session(&self) -> Result<(), ErrorData> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(match &self.host {
                Some(host) => Session::new(host.clone(), self.settings.clone())?,
                None => {
                    let browser =
                        Arc::new(EokaHost::launch_with(&self.launch).await.map_err(err)?);
                    let mut session = Session::new(browser.clone(), self.settings.clone())?;
                    session.browser = Some(browser);
                    session
                }
            });
        }
        Ok(())
    }
}

impl Default for WayfarerServer {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_router]
impl WayfarerServer {
    pub fn new() -> Self {
        Self::with_settings(LaunchOptions::default(), TaskSettings::default())
    }

    #[tool(description = "Navigate to a URL. Launches browser on first call.")]
    pub async fn navigate(
        &self,
        req: Parameters<NavigateRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        self.ensure_session().await?;
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| err("browser session missing"))?;
        session
            .step(vec![ProposedAction::new("go_to_url", json!({ "url": req.0.url }))])
            .await
    }

    #[tool(
        description = "Snapshot the current page: URL, title, scroll position and the indexed list of interactive elements. Indices stay valid until the next action that changes the page."
    )]
    pub async fn state(&self, req: Parameters<StateRequest>) -> Result<CallToolResult, ErrorData> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(|| {
            ErrorData::internal_error("No page open. Use navigate first.", None::<Value>)
        })?;

        let previous = std::mem::replace(&mut self.settings.write().use_vision, req.0.screenshot);
        let state = session.navigator.get_state().await;
        self.settings.write().use_vision = previous;
        let state = state.map_err(err)?;

        let list = state.element_list();
        let mut content = vec![Content::text(format!(
            "URL: {}\nTitle: {}\nScroll: {:.0}px above, {:.0}px below\n\n{}",
            state.url,
            state.title,
            state.pixels_above(),
            state.pixels_below(),
            if list.is_empty() {
                "No interactive elements found."
            } else {
                list.as_str()
            }
        ))];
        if let Some(png) = &state.screenshot {
            content.push(Content::image(BASE64.encode(png), "image/png"));
        }
        Ok(CallToolResult::success(content))
    }

    #[tool(
        description = "Execute a batch of actions as one step, in order, against the last state. Elements that moved after an earlier action are re-found; returns one line per action."
    )]
    pub async fn execute(
        &self,
        req: Parameters<ExecuteRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let actions = parse_actions(req.0.actions)?;
        if actions.is_empty() {
            return Err(ErrorData::invalid_params("no actions given", None::<Value>));
        }
        self.ensure_session().await?;
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| err("browser session missing"))?;
        session.step(actions).await
    }

    #[tool(description = "Return the step history as JSON, optionally saving it to a file.")]
    pub async fn history(
        &self,
        req: Parameters<HistoryRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let guard = self.session.lock().await;
        let history = guard
            .as_ref()
            .map(|s| s.navigator.agent_history())
            .unwrap_or_default();
        if let Some(path) = &req.0.path {
            history.save(path).map_err(err)?;
        }
        text_ok(serde_json::to_string_pretty(&history).map_err(err)?)
    }

    #[tool(
        description = "Replay a recorded history, re-finding each clicked element on the current page. Pass a file path or the JSON itself."
    )]
    pub async fn replay(&self, req: Parameters<ReplayRequest>) -> Result<CallToolResult, ErrorData> {
        let history = match (&req.0.path, &req.0.history) {
            (Some(path), _) => AgentHistory::load(path).map_err(err)?,
            (None, Some(json)) => serde_json::from_str(json).map_err(|e| {
                ErrorData::invalid_params(format!("history: {}", e), None::<Value>)
            })?,
            (None, None) => {
                return Err(ErrorData::invalid_params(
                    "pass either path or history",
                    None::<Value>,
                ))
            }
        };
        info!("Replaying {} steps over MCP", history.steps.len());

        self.ensure_session().await?;
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| err("browser session missing"))?;
        let results = session.navigator.replay_history(&history).await.map_err(err)?;

        let failed = results.iter().filter(|r| r.is_error()).count();
        let mut out = format!(
            "Replayed {} actions ({} failed)\n",
            results.len(),
            failed
        );
        for r in results.iter().filter(|r| r.is_error()) {
            out.push_str(&format!("✗ {}\n", r.error().unwrap_or_default()));
        }
        text_ok(out)
    }

    #[tool(description = "Close the browser and release resources.")]
    pub async fn close(&self) -> Result<CallToolResult, ErrorData> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            if let Some(browser) = session.browser {
                browser.shutdown().await.map_err(err)?;
            }
        }
        text_ok("Browser closed.")
    }
}

#[tool_handler]
impl ServerHandler for WayfarerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "wayfarer-tools".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Browser agent server. Use 'navigate' to open a URL (launches browser automatically), \
                 'state' to list indexed interactive elements, then 'execute' a batch of actions by index. \
                 Elements that move after an earlier action in the batch are re-found automatically. \
                 'history' returns the recorded steps; 'replay' runs them again."
                    .into(),
            ),
        }
    }
}

pub async fn run_server(server: WayfarerServer) -> anyhow::Result<()> {
    use rmcp::ServiceExt;

    let service = server.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
