//! In-memory surfaces for navigator tests.
//!
//! A `MockHost` serves a tiny site of `MockPage`s. Every page renders as
//! `<html><body>` plus one child per `MockElement`, each carrying its `id`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use wayfarer_agent::{
    ElementTarget, Error, Highlight, RawCapture, Rect, Result, Surface, SurfaceEvent, SurfaceHost,
    SurfaceId, SurfaceInfo,
};

#[derive(Clone, Debug)]
pub enum OnClick {
    Nothing,
    Navigate(String),
    /// `window.open(url, name)`: reuses the window if one with `name` exists.
    OpenWindow { name: String, url: String },
}

#[derive(Clone, Debug)]
pub struct MockElement {
    pub tag: &'static str,
    pub id: String,
    pub text: String,
    pub on_click: OnClick,
    /// `type` attribute, for inputs.
    pub input_type: Option<&'static str>,
}

impl MockElement {
    pub fn button(id: &str, text: &str) -> Self {
        Self {
            tag: "button",
            id: id.into(),
            text: text.into(),
            on_click: OnClick::Nothing,
            input_type: None,
        }
    }

    pub fn file_input(id: &str) -> Self {
        Self {
            tag: "input",
            id: id.into(),
            text: String::new(),
            on_click: OnClick::Nothing,
            input_type: Some("file"),
        }
    }

    pub fn link(id: &str, text: &str, href: &str) -> Self {
        Self {
            tag: "a",
            id: id.into(),
            text: text.into(),
            on_click: OnClick::Navigate(href.into()),
            input_type: None,
        }
    }

    pub fn popup(id: &str, text: &str, name: &str, url: &str) -> Self {
        Self {
            tag: "button",
            id: id.into(),
            text: text.into(),
            on_click: OnClick::OpenWindow {
                name: name.into(),
                url: url.into(),
            },
            input_type: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockPage {
    pub title: String,
    pub elements: Vec<MockElement>,
    /// Search results as `(title, url)`.
    pub results: Vec<(String, String)>,
    /// Target of the page's "next" link.
    pub next: Option<String>,
    /// Returned verbatim by the results script instead of `results`.
    pub raw_results: Option<Value>,
}

impl MockPage {
    pub fn new(title: &str, elements: Vec<MockElement>) -> Self {
        Self {
            title: title.into(),
            elements,
            ..Default::default()
        }
    }

    /// CSS path the snapshot builder derives for each element.
    fn locate(&self, css: &str) -> Option<&MockElement> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        self.elements.iter().find(|el| {
            let n = counts.entry(el.tag).or_insert(0);
            *n += 1;
            css == format!(
                "html:nth-of-type(1) > body:nth-of-type(1) > {}:nth-of-type({})",
                el.tag, n
            )
        })
    }

    fn capture(&self, url: &str) -> RawCapture {
        let mut cap = RawCapture::new(url, self.title.clone());
        let full = Some(Rect {
            x: 0.0,
            y: 0.0,
            width: 1280.0,
            height: 720.0,
        });
        let html = cap.push_element(None, "html", &[], full);
        let body = cap.push_element(Some(html), "body", &[], full);
        for (i, el) in self.elements.iter().enumerate() {
            let rect = Some(Rect {
                x: 10.0,
                y: 10.0 + 40.0 * i as f64,
                width: 120.0,
                height: 30.0,
            });
            let mut attrs: Vec<(&str, &str)> = vec![("id", el.id.as_str())];
            if let OnClick::Navigate(href) = &el.on_click {
                attrs.push(("href", href.as_str()));
            }
            if let Some(kind) = el.input_type {
                attrs.push(("type", kind));
            }
            let node = cap.push_element(Some(body), el.tag, &attrs, rect);
            cap.push_text(node, &el.text);
        }
        cap
    }
}

pub struct MockHost {
    me: Weak<MockHost>,
    site: Mutex<HashMap<String, MockPage>>,
    surfaces: Mutex<Vec<Arc<MockSurface>>>,
    events: broadcast::Sender<SurfaceEvent>,
    next_id: AtomicUsize,
    clicks: Mutex<Vec<(SurfaceId, String)>>,
    trace: Mutex<Vec<String>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            site: Mutex::new(HashMap::new()),
            surfaces: Mutex::new(Vec::new()),
            events,
            next_id: AtomicUsize::new(1),
            clicks: Mutex::new(Vec::new()),
            trace: Mutex::new(Vec::new()),
        })
    }

    pub fn set_page(&self, url: &str, page: MockPage) {
        self.site.lock().insert(url.to_string(), page);
    }

    fn page(&self, url: &str) -> MockPage {
        self.site.lock().get(url).cloned().unwrap_or_default()
    }

    fn spawn(&self, url: &str, window: Option<String>) -> Arc<MockSurface> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let surface = Arc::new(MockSurface {
            id: SurfaceId::new(format!("t{}", n)),
            window,
            host: self.me.clone(),
            url: Mutex::new(url.to_string()),
            back: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.surfaces.lock().push(surface.clone());
        surface
    }

    fn by_window(&self, name: &str) -> Option<Arc<MockSurface>> {
        self.surfaces
            .lock()
            .iter()
            .find(|s| !s.is_closed() && s.window.as_deref() == Some(name))
            .cloned()
    }

    /// Live surfaces.
    pub fn surface_count(&self) -> usize {
        self.surfaces.lock().iter().filter(|s| !s.is_closed()).count()
    }

    /// Every click so far as `(surface, element id)`.
    pub fn clicks(&self) -> Vec<(SurfaceId, String)> {
        self.clicks.lock().clone()
    }

    /// Captures and clicks in the order they happened: `capture <url>`,
    /// `click <element id>`.
    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().clone()
    }
}

#[async_trait]
impl SurfaceHost for MockHost {
    async fn open(&self, url: &str) -> Result<Arc<dyn Surface>> {
        Ok(self.spawn(url, None))
    }

    async fn surfaces(&self) -> Result<Vec<SurfaceInfo>> {
        let surfaces = self.surfaces.lock().clone();
        Ok(surfaces
            .iter()
            .filter(|s| !s.is_closed())
            .map(|s| {
                let url = s.url.lock().clone();
                SurfaceInfo {
                    id: s.id.clone(),
                    title: self.page(&url).title,
                    url,
                }
            })
            .collect())
    }

    fn surface(&self, id: &SurfaceId) -> Option<Arc<dyn Surface>> {
        self.surfaces
            .lock()
            .iter()
            .find(|s| &s.id == id && !s.is_closed())
            .map(|s| s.clone() as Arc<dyn Surface>)
    }

    async fn activate(&self, id: &SurfaceId) -> Result<Arc<dyn Surface>> {
        self.surface(id)
            .ok_or_else(|| Error::SurfaceUnavailable(id.to_string()))
    }

    async fn close(&self, id: &SurfaceId) -> Result<()> {
        let found = self.surfaces.lock().iter().find(|s| &s.id == id).cloned();
        let surface = found.ok_or_else(|| Error::SurfaceUnavailable(id.to_string()))?;
        surface.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(SurfaceEvent::Closed(id.clone()));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }
}

pub struct MockSurface {
    id: SurfaceId,
    window: Option<String>,
    host: Weak<MockHost>,
    url: Mutex<String>,
    back: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockSurface {
    fn host(&self) -> Result<Arc<MockHost>> {
        self.host
            .upgrade()
            .ok_or_else(|| Error::SurfaceUnavailable("host dropped".into()))
    }

    fn live(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SurfaceUnavailable(self.id.to_string()));
        }
        Ok(())
    }

    fn current(&self) -> Result<MockPage> {
        self.live()?;
        let url = self.url.lock().clone();
        Ok(self.host()?.page(&url))
    }

    fn go(&self, url: &str) {
        let mut current = self.url.lock();
        self.back.lock().push(current.clone());
        *current = url.to_string();
    }
}

#[async_trait]
impl Surface for MockSurface {
    fn id(&self) -> &SurfaceId {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn capture(&self, _viewport_expansion: i64) -> Result<RawCapture> {
        let page = self.current()?;
        let url = self.url.lock().clone();
        self.host()?.trace.lock().push(format!("capture {}", url));
        Ok(page.capture(&url))
    }

    async fn screenshot(&self, _highlights: &[Highlight]) -> Result<Vec<u8>> {
        self.live()?;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn url(&self) -> Result<String> {
        self.live()?;
        Ok(self.url.lock().clone())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.current()?.title)
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.live()?;
        self.go(url);
        Ok(())
    }

    async fn go_back(&self) -> Result<()> {
        self.live()?;
        if let Some(prev) = self.back.lock().pop() {
            *self.url.lock() = prev;
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.live()
    }

    async fn click(&self, target: &ElementTarget) -> Result<()> {
        let page = self.current()?;
        let el = page
            .locate(&target.css)
            .cloned()
            .ok_or_else(|| Error::ElementNotFound(target.css.clone()))?;
        let host = self.host()?;
        host.clicks.lock().push((self.id.clone(), el.id.clone()));
        host.trace.lock().push(format!("click {}", el.id));
        match el.on_click {
            OnClick::Nothing => {}
            OnClick::Navigate(url) => self.go(&url),
            OnClick::OpenWindow { name, url } => match host.by_window(&name) {
                Some(existing) => existing.go(&url),
                None => {
                    host.spawn(&url, Some(name));
                }
            },
        }
        Ok(())
    }

    async fn input_text(&self, target: &ElementTarget, _text: &str) -> Result<()> {
        let page = self.current()?;
        page.locate(&target.css)
            .map(|_| ())
            .ok_or_else(|| Error::ElementNotFound(target.css.clone()))
    }

    async fn scroll_by(&self, _dy: i64) -> Result<()> {
        self.live()
    }

    async fn scroll_to_text(&self, text: &str) -> Result<bool> {
        Ok(self.text().await?.contains(text))
    }

    async fn send_keys(&self, _keys: &str) -> Result<()> {
        self.live()
    }

    async fn text(&self) -> Result<String> {
        let page = self.current()?;
        Ok(page
            .elements
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn dropdown_options(&self, _target: &ElementTarget) -> Result<Vec<(String, String)>> {
        self.live()?;
        Ok(Vec::new())
    }

    async fn select_option(&self, _target: &ElementTarget, _option: &str) -> Result<()> {
        self.live()
    }

    async fn evaluate(&self, js: &str) -> Result<Value> {
        let page = self.current()?;
        if js.contains("#pnnext") {
            return Ok(match page.next {
                Some(next) => {
                    self.go(&next);
                    json!(true)
                }
                None => json!(false),
            });
        }
        if js.contains("#rso") {
            if let Some(raw) = page.raw_results {
                return Ok(raw);
            }
            return Ok(Value::Array(
                page.results
                    .iter()
                    .map(|(title, url)| json!({"title": title, "url": url}))
                    .collect(),
            ));
        }
        Ok(Value::Null)
    }

    async fn wait_for_stable(&self) -> Result<()> {
        self.live()
    }
}
