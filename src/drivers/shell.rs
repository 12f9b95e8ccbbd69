//! Shell-command driver: invokes the `create`/`read`/`update`/`delete`
//! command templates configured for a source, substituting `%fk` for the
//! foreign key and exchanging the Document as JSON over stdio (§4.3, §6.3).

use std::process::Stdio;

use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use reconciler_core::document::Document;
use reconciler_core::key::{ForeignKey, SourceName};

use crate::config::SourceConfig;
use crate::error::ReconcileError;

/// A driver whose CRUD operations are shell command templates.
#[derive(Clone, Debug)]
pub struct ShellDriver {
    source: SourceName,
    config: SourceConfig,
}

impl ShellDriver {
    #[must_use]
    pub fn new(source: SourceName, config: SourceConfig) -> Self {
        Self { source, config }
    }

    fn substitute(&self, template: &str, fk: &ForeignKey) -> String {
        template.replace("%fk", &shell_quote(fk.id()))
    }

    async fn run(&self, command: &str, stdin_data: Option<Vec<u8>>) -> Result<Vec<u8>, ReconcileError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.unavailable(format!("failed to spawn '{command}': {e}")))?;

        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin
                .write_all(&data)
                .await
                .map_err(|e| self.unavailable(format!("failed to write stdin for '{command}': {e}")))?;
            drop(stdin);
        } else {
            drop(child.stdin.take());
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.unavailable(format!("failed to wait for '{command}': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(format!(
                "'{command}' exited with {}: {stderr}",
                output.status
            )));
        }

        Ok(output.stdout)
    }

    fn unavailable(&self, detail: String) -> ReconcileError {
        ReconcileError::Unavailable {
            source: self.source.clone(),
            detail,
        }
    }

    pub async fn read(&self, fk: &ForeignKey) -> Result<Option<Document>, ReconcileError> {
        let command = self.substitute(&self.config.read, fk);
        let stdout = self.run(&command, None).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|e| self.unavailable(format!("'{command}' produced invalid JSON: {e}")))?;
        let doc = Document::from_json(&value)
            .map_err(|e| self.unavailable(format!("'{command}' produced a malformed document: {e}")))?;
        Ok(Some(doc))
    }

    pub async fn create(&self, fk: &ForeignKey, doc: &Document) -> Result<(), ReconcileError> {
        let command = self.substitute(&self.config.create, fk);
        let body = serde_json::to_vec(&doc.to_json())
            .expect("Document JSON is always serializable");
        self.run(&command, Some(body)).await?;
        Ok(())
    }

    pub async fn update(&self, fk: &ForeignKey, doc: &Document) -> Result<(), ReconcileError> {
        let command = self.substitute(&self.config.update, fk);
        let body = serde_json::to_vec(&doc.to_json())
            .expect("Document JSON is always serializable");
        self.run(&command, Some(body)).await?;
        Ok(())
    }

    pub async fn delete(&self, fk: &ForeignKey) -> Result<(), ReconcileError> {
        let command = self.substitute(&self.config.delete, fk);
        self.run(&command, None).await?;
        Ok(())
    }
}

/// Wrap `value` in single quotes for safe interpolation into a `sh -c`
/// command string, escaping any embedded single quotes.
fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> SourceConfig {
        SourceConfig {
            create: "cat > /dev/null && echo '{}'".to_owned(),
            read: "echo '{\"tier\": \"gold\"}'".to_owned(),
            update: "cat".to_owned(),
            delete: "true".to_owned(),
        }
    }

    fn fk(id: &str) -> ForeignKey {
        ForeignKey::new("customer", "crm", id).unwrap()
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }

    #[test]
    fn substitute_replaces_fk_token() {
        let driver = ShellDriver::new("crm".to_owned(), config());
        let out = driver.substitute("curl crm/%fk", &fk("cust_001"));
        assert_eq!(out, "curl crm/'cust_001'");
    }

    #[tokio::test]
    async fn read_parses_json_stdout() {
        let driver = ShellDriver::new("crm".to_owned(), config());
        let doc = driver.read(&fk("1")).await.unwrap().unwrap();
        assert_eq!(doc.get(&reconciler_core::document::Path::parse("tier").unwrap()), Some("gold"));
    }

    #[tokio::test]
    async fn update_echoes_stdin_through_cat() {
        let driver = ShellDriver::new("crm".to_owned(), config());
        let doc = Document::from_json(&json!({"tier": "platinum"})).unwrap();
        driver.update(&fk("1"), &doc).await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_unavailable() {
        let mut cfg = config();
        cfg.read = "exit 7".to_owned();
        let driver = ShellDriver::new("crm".to_owned(), cfg);
        let err = driver.read(&fk("1")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Unavailable { .. }));
    }
}
