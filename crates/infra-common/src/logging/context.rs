use std::collections::BTreeMap;
use std::fmt;
use tracing::{Level, Span};

/// Context information for logging
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component that is generating the log
    pub component: String,
    /// Operation or action being performed
    pub operation: Option<String>,
    /// Additional contextual fields
    pub fields: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new<S: Into<String>>(component: S) -> Self {
        LogContext {
            component: component.into(),
            operation: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_operation<S: Into<String>, T: Into<String>>(component: S, operation: T) -> Self {
        LogContext {
            component: component.into(),
            operation: Some(operation.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field<S: Into<String>, T: Into<String>>(mut self, key: S, value: T) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Create a span carrying this context.
    ///
    /// Extra fields are folded into a single `fields` value since span field
    /// names have to be known at compile time.
    pub fn span(&self, level: Level) -> Span {
        let op = self.operation.as_deref().unwrap_or("");
        let extra = self.fields_string();
        match level {
            Level::TRACE => tracing::trace_span!("sbc", component = %self.component, operation = %op, fields = %extra),
            Level::DEBUG => tracing::debug_span!("sbc", component = %self.component, operation = %op, fields = %extra),
            Level::INFO => tracing::info_span!("sbc", component = %self.component, operation = %op, fields = %extra),
            Level::WARN => tracing::warn_span!("sbc", component = %self.component, operation = %op, fields = %extra),
            Level::ERROR => tracing::error_span!("sbc", component = %self.component, operation = %op, fields = %extra),
        }
    }

    /// Prefix used in log lines, e.g. `[CID=abc] `
    pub fn log_id(&self) -> String {
        if self.fields.is_empty() {
            return String::new();
        }
        let mut id = String::new();
        for (key, value) in &self.fields {
            id.push_str(&format!("[{}={}]", key, value));
        }
        id.push(' ');
        id
    }

    fn fields_string(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.component)?;
        if let Some(op) = &self.operation {
            write!(f, "[{}]", op)?;
        }
        for (key, value) in &self.fields {
            write!(f, "[{}={}]", key, value)?;
        }
        Ok(())
    }
}

/// Enter a logging context for the duration of a closure
pub fn with_context<F, R>(context: &LogContext, level: Level, f: F) -> R
where
    F: FnOnce() -> R,
{
    let span = context.span(level);
    let _guard = span.enter();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_log_id() {
        let ctx = LogContext::with_operation("relay", "handle_sdp").with_field("CID", "abc123");
        assert_eq!(ctx.to_string(), "[relay][handle_sdp][CID=abc123]");
        assert_eq!(ctx.log_id(), "[CID=abc123] ");
        assert_eq!(LogContext::new("x").log_id(), "");
    }

    #[test]
    fn test_with_context_returns_value() {
        let ctx = LogContext::new("dialog");
        assert_eq!(with_context(&ctx, Level::DEBUG, || 7), 7);
    }
}
