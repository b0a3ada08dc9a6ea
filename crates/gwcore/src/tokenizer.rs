use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::client::parse_request_content;

/// Runs a one-shot tokenizer subprocess per call: writes the prompt text to
/// stdin, reads a trailing JSON integer array off stdout.
///
/// Used as the cheap first pass of two-tier token estimation: much faster
/// than asking a running engine, but approximate, since it doesn't apply
/// the model's chat template before counting.
pub struct StandaloneTokenizer {
    binary: String,
    args: Vec<String>,
    add_tokens_per_message: u32,
}

impl StandaloneTokenizer {
    pub fn new(binary: impl Into<String>, args: Vec<String>, add_tokens_per_message: u32) -> Self {
        Self {
            binary: binary.into(),
            args,
            add_tokens_per_message,
        }
    }

    /// Returns a token estimate, never failing: any subprocess or parse
    /// error falls back to `max_tokens` extracted from the request, the
    /// same conservative floor the engine-side estimator uses.
    pub async fn estimate_tokens(&self, request: &serde_json::Value) -> u32 {
        let (_, prompt, max_tokens, message_count) = parse_request_content(request);

        let workdir = Path::new(&self.binary)
            .parent()
            .map(|p| p.to_path_buf());

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn standalone tokenizer");
                return max_tokens;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::warn!(error = %e, "failed to write prompt to tokenizer stdin");
            }
        }

        let output = match child.wait_with_output().await {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(error = %e, "tokenizer process failed");
                return max_tokens;
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            tracing::warn!("tokenizer stderr: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let token_count = match Self::parse_token_count(stdout.trim()) {
            Some(n) => n,
            None => return max_tokens,
        };

        token_count as u32 + max_tokens + message_count * self.add_tokens_per_message
    }

    fn parse_token_count(stdout: &str) -> Option<usize> {
        let start = stdout.rfind('[')?;
        let tail = &stdout[start..];
        let end = tail.find(']')?;
        let array_str = &tail[..=end];
        let tokens: serde_json::Value = serde_json::from_str(array_str).ok()?;
        tokens.as_array().map(|a| a.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trailing_token_array() {
        let out = "loading model...\n[1, 2, 3, 4]\n";
        assert_eq!(StandaloneTokenizer::parse_token_count(out.trim()), Some(4));
    }

    #[test]
    fn parses_array_with_noise_after() {
        let out = "[10, 20] done in 3ms";
        assert_eq!(StandaloneTokenizer::parse_token_count(out), Some(2));
    }

    #[test]
    fn missing_brackets_returns_none() {
        assert_eq!(StandaloneTokenizer::parse_token_count("no tokens here"), None);
    }

    #[tokio::test]
    async fn falls_back_to_max_tokens_on_missing_binary() {
        let t = StandaloneTokenizer::new("/no/such/tokenizer-xyz", vec![], 0);
        let req = serde_json::json!({"input": "hi", "max_tokens": 42});
        let estimate = t.estimate_tokens(&req).await;
        assert_eq!(estimate, 42);
    }
}
