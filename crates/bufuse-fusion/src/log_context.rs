use std::fmt;

/// Prefix carried into every log line emitted while a pattern is processed.
#[derive(Clone, Copy, Debug)]
pub struct LogContext<'a> {
    pub pass: &'a str,
    pub pattern: &'a str,
}

impl<'a> LogContext<'a> {
    pub fn new(pass: &'a str, pattern: &'a str) -> Self {
        Self { pass, pattern }
    }
}

impl fmt::Display for LogContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.pass, self.pattern)
    }
}
