use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Values supplied for `${name}` placeholders in a plan.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse `key=value` pairs from the command line.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut params = Self::new();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                Error::Config(format!("invalid param '{}', expected key=value", arg))
            })?;
            if key.trim().is_empty() {
                return Err(Error::Config(format!("invalid param '{}', empty key", arg)));
            }
            params.values.insert(key.trim().to_string(), value.to_string());
        }
        Ok(params)
    }
}

/// Declared plan parameter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ParamDef {
    #[serde(default)]
    pub required: bool,
    pub default: Option<String>,
    pub description: Option<String>,
}

fn placeholder() -> Result<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // ${name} or ${name:-fallback}
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok())
        .as_ref()
        .ok_or_else(|| Error::Config("placeholder pattern failed to compile".into()))
}

/// Replace `${name}` placeholders in `template`.
///
/// Lookup order: supplied value, inline `:-` fallback, declared default.
/// A required parameter with no value is an error; an optional one becomes
/// empty. Undeclared names without a value are left untouched.
pub fn substitute(
    template: &str,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder()?.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        let inline = caps.get(2).map(|m| m.as_str());

        let value = match (params.get(name), inline, defs.get(name)) {
            (Some(v), _, _) => v.to_string(),
            (None, Some(fallback), _) => fallback.to_string(),
            (None, None, Some(def)) => match (&def.default, def.required) {
                (Some(d), _) => d.clone(),
                (None, true) => {
                    return Err(Error::Config(format!(
                        "missing required parameter: {}",
                        name
                    )))
                }
                (None, false) => String::new(),
            },
            (None, None, None) => whole.as_str().to_string(),
        };

        out.push_str(&template[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Apply [`substitute`] to every string scalar in a YAML document.
pub fn substitute_value(
    value: &mut serde_yaml::Value,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => *s = substitute(s, params, defs)?,
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => substitute_value(&mut tagged.value, params, defs)?,
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs(entries: &[(&str, ParamDef)]) -> HashMap<String, ParamDef> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_substitute_values_and_defaults() {
        let params = Params::new().set("query", "rust");
        let defs = defs(&[(
            "region",
            ParamDef {
                default: Some("eu".into()),
                ..Default::default()
            },
        )]);
        let out = substitute("${query} in ${region}", &params, &defs).unwrap();
        assert_eq!(out, "rust in eu");
    }

    #[test]
    fn test_substitute_inline_fallback() {
        let out = substitute("page ${n:-1}", &Params::new(), &HashMap::new()).unwrap();
        assert_eq!(out, "page 1");
        let out = substitute("page ${n:-1}", &Params::new().set("n", "3"), &HashMap::new()).unwrap();
        assert_eq!(out, "page 3");
    }

    #[test]
    fn test_substitute_required_missing() {
        let defs = defs(&[(
            "token",
            ParamDef {
                required: true,
                ..Default::default()
            },
        )]);
        let err = substitute("x=${token}", &Params::new(), &defs).unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_unknown_left_alone() {
        let out = substitute("${HOME}/x", &Params::new(), &HashMap::new()).unwrap();
        assert_eq!(out, "${HOME}/x");
    }

    #[test]
    fn test_params_from_args() {
        let params = Params::from_args(&["q=a=b".into(), "n=2".into()]).unwrap();
        assert_eq!(params.get("q"), Some("a=b"));
        assert_eq!(params.get("n"), Some("2"));
        assert!(Params::from_args(&["novalue".into()]).is_err());
        assert!(Params::from_args(&["=x".into()]).is_err());
    }
}
