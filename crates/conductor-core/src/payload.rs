//! Injectable payload template.
//!
//! The payload is a script evaluated inside the host's shared scripting
//! context. It opens a WebSocket back to the relay and performs the
//! `init:` handshake. The template carries three placeholders:
//!
//! - `$PORT`: the relay's listener port
//! - `$SECRET`: the current handshake secret
//! - `$REPLACE`: `true`/`false`, whether an already-running payload
//!   should close its socket and make way for this one

use crate::error::{ConductorError, ConductorResult};
use regex::{Captures, Regex};
use std::path::Path;

const PLACEHOLDERS: &str = r"\$(PORT|SECRET|REPLACE)";

/// A loaded payload template.
#[derive(Debug, Clone)]
pub struct PayloadTemplate {
    source: String,
    placeholders: Regex,
}

impl PayloadTemplate {
    /// Wrap template text.
    pub fn new(source: impl Into<String>) -> ConductorResult<Self> {
        let placeholders = Regex::new(PLACEHOLDERS)
            .map_err(|e| ConductorError::Template(format!("bad placeholder pattern: {e}")))?;
        Ok(Self {
            source: source.into(),
            placeholders,
        })
    }

    /// Read a template from disk.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Template(format!("cannot read {}: {e}", path.display()))
        })?;
        if source.trim().is_empty() {
            return Err(ConductorError::Template(format!(
                "{} is empty",
                path.display()
            )));
        }
        Self::new(source)
    }

    /// Substitute all placeholders in a single pass.
    pub fn render(&self, port: u16, secret: &str, replace: bool) -> String {
        self.placeholders
            .replace_all(&self.source, |caps: &Captures| match &caps[1] {
                "PORT" => port.to_string(),
                "SECRET" => secret.to_string(),
                _ => replace.to_string(),
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCRIPT: &str = r#"if ($REPLACE) { rpc.close(); }
let ws = new WebSocket("ws://localhost:$PORT");
ws.addEventListener("open", () => ws.send("init:$SECRET"));"#;

    #[test]
    fn renders_all_placeholders() {
        let tpl = PayloadTemplate::new(SCRIPT).unwrap();
        let out = tpl.render(7355, "abc123", true);
        assert!(out.contains("if (true)"));
        assert!(out.contains("ws://localhost:7355"));
        assert!(out.contains(r#"ws.send("init:abc123")"#));
        assert!(!out.contains('$'));
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let tpl = PayloadTemplate::new("$SECRET/$PORT").unwrap();
        assert_eq!(tpl.render(1, "$PORT", false), "$PORT/1");
    }

    #[test]
    fn replace_flag_false() {
        let tpl = PayloadTemplate::new("x = $REPLACE;").unwrap();
        assert_eq!(tpl.render(1, "s", false), "x = false;");
    }

    #[test]
    fn load_missing_file_fails() {
        let err = PayloadTemplate::load(Path::new("/nonexistent/payload.js")).unwrap_err();
        assert!(matches!(err, ConductorError::Template(_)));
    }

    #[test]
    fn load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCRIPT.as_bytes()).unwrap();
        let tpl = PayloadTemplate::load(file.path()).unwrap();
        assert!(tpl.render(9, "s", false).contains("localhost:9"));
    }
}
