//! # Nested key/value configuration tree.
//!
//! Simulation and platform files are INI-like:
//!
//! ```text
//! SIM_NAME = ITER_run
//! SIM_ROOT = ${PWD}/${SIM_NAME}     # interpolated
//! [PORTS]
//!     NAMES = DRIVER WORKER
//!     [[DRIVER]]
//!         IMPLEMENTATION = HELLO_DRIVER
//! [HELLO_DRIVER]
//!     NAME = HelloDriver
//! ```
//!
//! ## Rules
//! - `[A]` opens a top-level section, `[[B]]` a section nested in the last `[..]`, and so on.
//! - `#` starts a comment at line start or after whitespace outside quotes.
//! - Values may be wrapped in single or double quotes; the quotes are stripped.
//! - `${NAME}` and `$NAME` resolve against the current section, then each
//!   enclosing section up to the root, then the process environment.
//!   Configuration wins over the environment.
//! - An unresolvable reference is a [`ConfigError::MissingKey`].

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

/// Maximum depth of nested `${..}` expansion before the value is rejected as cyclic.
const MAX_EXPANSION_DEPTH: usize = 16;

/// One section of a parsed configuration file. The root is a section too.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigTree {
    values: BTreeMap<String, String>,
    sections: BTreeMap<String, ConfigTree>,
}

impl ConfigTree {
    /// Reads, parses and interpolates a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, &BTreeMap::new())
    }

    /// Like [`ConfigTree::load`], but top-level `overrides` replace file values
    /// before interpolation runs.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, &e))?;
        Self::parse_str(&text, &path.display().to_string(), overrides)
    }

    /// Parses text; `origin` only labels errors.
    pub fn parse_str(
        text: &str,
        origin: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut raw = parse_raw(text, origin)?;
        for (k, v) in overrides {
            raw.values.insert(k.clone(), v.clone());
        }
        let mut scopes = Vec::new();
        raw.interpolate(&mut scopes)
    }

    /// Top-level value of this section.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value that must exist; `scope` names the section in the error.
    pub fn require(&self, key: &str, scope: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey {
            key: key.to_string(),
            scope: scope.to_string(),
        })
    }

    /// Value split on whitespace and commas. Missing keys give an empty list.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Value parsed into `T`; `None` when absent.
    pub fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    /// Boolean in the spellings found in IPS files (`True`, `yes`, `1`, ...).
    pub fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(None),
            Some(v) if matches!(v.as_str(), "true" | "yes" | "on" | "1") => Ok(Some(true)),
            Some(v) if matches!(v.as_str(), "false" | "no" | "off" | "0") => Ok(Some(false)),
            Some(v) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: v,
            }),
        }
    }

    /// Dotted lookup, e.g. `PORTS.NAMES` or `PORTS.DRIVER.IMPLEMENTATION`.
    pub fn lookup(&self, dotted: &str) -> Option<&str> {
        let mut parts: Vec<&str> = dotted.split('.').collect();
        let key = parts.pop()?;
        let mut node = self;
        for p in parts {
            node = node.sections.get(p)?;
        }
        node.get(key)
    }

    /// Sets a top-level value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Named sub-section.
    pub fn section(&self, name: &str) -> Option<&ConfigTree> {
        self.sections.get(name)
    }

    /// Iterates `(key, value)` pairs of this section in key order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterates sub-sections in name order.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &ConfigTree)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn interpolate<'a>(&'a self, scopes: &mut Vec<&'a ConfigTree>) -> Result<Self, ConfigError> {
        scopes.push(self);
        let mut out = ConfigTree::default();
        for (k, v) in &self.values {
            out.values
                .insert(k.clone(), expand(v, k, scopes, MAX_EXPANSION_DEPTH)?);
        }
        for (name, sub) in &self.sections {
            out.sections.insert(name.clone(), sub.interpolate(scopes)?);
        }
        scopes.pop();
        Ok(out)
    }
}

/// Looks `name` up from the innermost scope outwards, then in the environment.
fn resolve(name: &str, scopes: &[&ConfigTree]) -> Option<(String, usize)> {
    for (depth, scope) in scopes.iter().enumerate().rev() {
        if let Some(v) = scope.values.get(name) {
            return Some((v.clone(), depth + 1));
        }
    }
    std::env::var(name).ok().map(|v| (v, 0))
}

fn expand(
    value: &str,
    key: &str,
    scopes: &[&ConfigTree],
    budget: usize,
) -> Result<String, ConfigError> {
    if !value.contains('$') {
        return Ok(value.to_string());
    }
    if budget == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(stripped) = after.strip_prefix('{') {
            match stripped.find('}') {
                Some(end) => (&stripped[..end], end + 2),
                None => {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }

        let (raw, depth) = resolve(name, scopes).ok_or_else(|| ConfigError::MissingKey {
            key: name.to_string(),
            scope: format!("interpolation of {key}"),
        })?;
        // A referenced value is expanded against the scope it was found in.
        let visible = &scopes[..depth];
        out.push_str(&expand(&raw, name, visible, budget - 1)?);
        rest = &after[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut prev_ws = true;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '#' && prev_ws => return &line[..i],
            None => {}
        }
        prev_ws = c.is_whitespace();
    }
    line
}

fn unquote(v: &str) -> &str {
    let v = v.trim();
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

fn parse_raw(text: &str, origin: &str) -> Result<ConfigTree, ConfigError> {
    let mut root = ConfigTree::default();
    // Names of the currently open sections, outermost first.
    let mut path: Vec<String> = Vec::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let err = |reason: &str| ConfigError::Parse {
            path: origin.to_string(),
            line: idx + 1,
            reason: reason.to_string(),
        };

        if line.starts_with('[') {
            let depth = line.chars().take_while(|c| *c == '[').count();
            let closing = line.chars().rev().take_while(|c| *c == ']').count();
            if depth != closing || line.len() <= 2 * depth {
                return Err(err("unbalanced section header"));
            }
            let name = line[depth..line.len() - depth].trim();
            if name.is_empty() {
                return Err(err("empty section name"));
            }
            if depth > path.len() + 1 {
                return Err(err("section nested deeper than its parent"));
            }
            path.truncate(depth - 1);
            path.push(name.to_string());
            let mut node = &mut root;
            for p in &path {
                node = node.sections.entry(p.clone()).or_default();
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(err("expected KEY = VALUE"));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(err("empty key"));
        }
        let mut node = &mut root;
        for p in &path {
            node = node.sections.entry(p.clone()).or_default();
        }
        node.values
            .insert(key.to_string(), unquote(value).to_string());
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ConfigTree, ConfigError> {
        ConfigTree::parse_str(text, "test.conf", &BTreeMap::new())
    }

    #[test]
    fn test_nested_sections_and_lookup() {
        let tree = parse(
            "SIM_NAME = demo\n\
             [PORTS]\n\
             NAMES = DRIVER WORKER\n\
             [[DRIVER]]\n\
             IMPLEMENTATION = HELLO_DRIVER\n\
             [[WORKER]]\n\
             IMPLEMENTATION = HELLO_WORKER\n\
             [HELLO_DRIVER]\n\
             NAME = HelloDriver\n",
        )
        .unwrap();
        assert_eq!(tree.get("SIM_NAME"), Some("demo"));
        assert_eq!(tree.lookup("PORTS.DRIVER.IMPLEMENTATION"), Some("HELLO_DRIVER"));
        assert_eq!(
            tree.section("PORTS").unwrap().list("NAMES"),
            vec!["DRIVER", "WORKER"]
        );
        assert_eq!(tree.lookup("HELLO_DRIVER.NAME"), Some("HelloDriver"));
    }

    #[test]
    fn test_interpolation_walks_outwards() {
        let tree = parse(
            "ROOT = /tmp/ips\n\
             SIM_NAME = s1\n\
             SIM_ROOT = ${ROOT}/$SIM_NAME\n\
             [W]\n\
             BIN = ${SIM_ROOT}/bin\n\
             NAME = local\n\
             LABEL = ${NAME}-x\n",
        )
        .unwrap();
        assert_eq!(tree.get("SIM_ROOT"), Some("/tmp/ips/s1"));
        assert_eq!(tree.lookup("W.BIN"), Some("/tmp/ips/s1/bin"));
        assert_eq!(tree.lookup("W.LABEL"), Some("local-x"));
    }

    #[test]
    fn test_configuration_wins_over_environment() {
        let tree = parse("PATH = mine\nP = ${PATH}\n").unwrap();
        assert_eq!(tree.get("P"), Some("mine"));
        let tree = parse("P = ${PATH}\n").unwrap();
        assert_eq!(tree.get("P"), std::env::var("PATH").ok().as_deref());
    }

    #[test]
    fn test_missing_reference_is_reported() {
        let err = parse("A = ${NO_SUCH_KEY_IN_CONFIG_OR_ENV_42}\n").unwrap_err();
        assert_eq!(err.as_label(), "config_missing_key");
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = parse("A = ${B}\nB = ${A}\n").unwrap_err();
        assert_eq!(err.as_label(), "config_invalid_value");
    }

    #[test]
    fn test_comments_and_quotes() {
        let tree = parse(
            "# header\n\
             A = 'hello # not a comment'\n\
             B = 3   # trailing\n\
             C = \"x y\"\n",
        )
        .unwrap();
        assert_eq!(tree.get("A"), Some("hello # not a comment"));
        assert_eq!(tree.parse::<u32>("B").unwrap(), Some(3));
        assert_eq!(tree.get("C"), Some("x y"));
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = parse("A = 1\nnot a pair\n").unwrap_err();
        match err {
            ConfigError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("[[TOO_DEEP]]\n").is_err());
        assert!(parse("[BROKEN\n").is_err());
    }

    #[test]
    fn test_overrides_apply_before_interpolation() {
        let mut ov = BTreeMap::new();
        ov.insert("SIM_NAME".to_string(), "child".to_string());
        let tree =
            ConfigTree::parse_str("SIM_NAME = parent\nOUT = ${SIM_NAME}.log\n", "t", &ov).unwrap();
        assert_eq!(tree.get("OUT"), Some("child.log"));
    }

    #[test]
    fn test_flag_spellings() {
        let tree = parse("A = True\nB = no\nC = maybe\n").unwrap();
        assert_eq!(tree.flag("A").unwrap(), Some(true));
        assert_eq!(tree.flag("B").unwrap(), Some(false));
        assert!(tree.flag("C").is_err());
        assert_eq!(tree.flag("D").unwrap(), None);
    }
}
