//! Redaction of credential values from step output.

/// Replacement for redacted values.
pub const REDACTED: &str = "((redacted))";

/// Buffers output up to each newline and replaces known credential values
/// in complete lines. Values of a single character are never redacted.
#[derive(Debug, Default)]
pub struct RedactingWriter {
    secrets: Vec<String>,
    buffer: String,
}

impl RedactingWriter {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| s.chars().count() > 1).collect();
        // Longest first so a secret containing another is replaced whole.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self {
            secrets,
            buffer: String::new(),
        }
    }

    /// Feed a chunk; returns the redacted text of every line it completed.
    pub fn write(&mut self, chunk: &str) -> Option<String> {
        self.buffer.push_str(chunk);
        let end = self.buffer.rfind('\n')? + 1;
        let complete: String = self.buffer.drain(..end).collect();
        Some(self.redact(&complete))
    }

    /// Flush a trailing partial line.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(self.redact(&rest))
    }

    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_on_line_boundaries() {
        let mut writer = RedactingWriter::new(vec!["hunter2".to_string()]);
        // A secret split across chunks is still caught.
        assert_eq!(writer.write("password=hun"), None);
        assert_eq!(
            writer.write("ter2\nnext"),
            Some(format!("password={REDACTED}\n"))
        );
        assert_eq!(writer.flush(), Some("next".to_string()));
        assert_eq!(writer.flush(), None);
    }

    #[test]
    fn test_single_char_values_not_redacted() {
        let mut writer = RedactingWriter::new(vec!["a".to_string(), "".to_string()]);
        assert_eq!(writer.write("banana\n"), Some("banana\n".to_string()));
    }

    #[test]
    fn test_longest_secret_wins() {
        let mut writer = RedactingWriter::new(vec!["abc".to_string(), "abcdef".to_string()]);
        assert_eq!(writer.write("xabcdefx\n"), Some(format!("x{REDACTED}x\n")));
    }
}
