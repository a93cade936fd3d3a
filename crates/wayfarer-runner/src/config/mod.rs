pub mod params;
pub mod schema;
pub mod settings;

pub use params::{ParamDef, Params};
pub use schema::{BrowserConfig, Config, PlanStep, TargetUrl, Viewport};
pub use settings::{Delays, ReplaySettings, SettingsSource, TaskSettings};
