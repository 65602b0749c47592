use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Dispatcher, SentReceipt};
use crate::error::DeliveryError;

const OSASCRIPT: &str = "osascript";

/// Sends replies through Messages.app by running an AppleScript.
pub struct AppleScriptDispatcher {
    chat_name: String,
    timeout: Duration,
    program: String,
}

impl AppleScriptDispatcher {
    pub fn new(chat_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            chat_name: chat_name.into(),
            timeout,
            program: OSASCRIPT.to_string(),
        }
    }

    /// Runs `program -e <script>` instead of `osascript`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn script(&self, text: &str) -> String {
        format!(
            "tell application \"Messages\"\n\
             \tset targetChat to first chat whose name is \"{}\"\n\
             \tsend \"{}\" to targetChat\n\
             end tell",
            escape_applescript(&self.chat_name),
            escape_applescript(text)
        )
    }
}

/// Backslashes first, then quotes, so inserted escapes are not doubled.
pub fn escape_applescript(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

#[async_trait]
impl Dispatcher for AppleScriptDispatcher {
    async fn send(&self, text: &str) -> Result<SentReceipt, DeliveryError> {
        let script = self.script(text);
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.program)
                .arg("-e")
                .arg(&script)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| DeliveryError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DeliveryError::Command(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr
            )));
        }

        tracing::info!("Sent message to '{}'", self.chat_name);
        Ok(SentReceipt {
            text: text.to_string(),
            sent_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_backslashes_before_quotes() {
        assert_eq!(escape_applescript(r#"say "hi" \o/"#), r#"say \"hi\" \\o/"#);
    }

    #[test]
    fn script_targets_the_configured_chat() {
        let dispatcher = AppleScriptDispatcher::new("Mom & \"Dad\"", Duration::from_secs(1));
        let script = dispatcher.script("ok!");
        assert!(script.contains("first chat whose name is \"Mom & \\\"Dad\\\"\""));
        assert!(script.contains("send \"ok!\" to targetChat"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_decides_delivery() {
        let ok = AppleScriptDispatcher::new("Family", Duration::from_secs(5)).with_program("true");
        let receipt = ok.send("hello").await.unwrap();
        assert_eq!(receipt.text, "hello");

        let failing = AppleScriptDispatcher::new("Family", Duration::from_secs(5)).with_program("false");
        assert!(matches!(failing.send("hello").await, Err(DeliveryError::Command(_))));

        let missing = AppleScriptDispatcher::new("Family", Duration::from_secs(5))
            .with_program("/nonexistent/osascript");
        assert!(matches!(missing.send("hello").await, Err(DeliveryError::Launch(_))));
    }
}
