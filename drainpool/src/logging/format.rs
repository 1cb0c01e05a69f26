// SPDX-License-Identifier: MIT

use std::fmt;

use log::Level;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_FORMAT: &str = "[{time}] [{pid}] [{level}] [{target}] {message}";

/// A log record, captured where it was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub time: OffsetDateTime,
    pub pid: u32,
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl LogLine {
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            time: OffsetDateTime::now_utc(),
            pid: std::process::id(),
            level,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn capture(record: &log::Record<'_>) -> Self {
        Self::new(record.level(), record.target(), record.args().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Time,
    Pid,
    Level,
    Target,
    Message,
}

/// Line template with `{time}`, `{pid}`, `{level}`, `{target}` and
/// `{message}` placeholders. Anything else is copied verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormat {
    template: String,
    segments: Vec<Segment>,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::new(DEFAULT_FORMAT)
    }
}

impl LogFormat {
    pub fn new(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            rest = &rest[open..];

            let Some(close) = rest.find('}') else { break };
            let name = &rest[1..close];
            // Only the last `{` before the `}` can open a placeholder.
            if let Some(inner) = name.rfind('{') {
                literal.push_str(&rest[..=inner]);
                rest = &rest[inner + 1..];
                continue;
            }
            let placeholder = match name {
                "time" => Segment::Time,
                "pid" => Segment::Pid,
                "level" => Segment::Level,
                "target" => Segment::Target,
                "message" => Segment::Message,
                _ => {
                    literal.push_str(&rest[..=close]);
                    rest = &rest[close + 1..];
                    continue;
                }
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(placeholder);
            rest = &rest[close + 1..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            template: template.to_string(),
            segments,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render(&self, line: &LogLine) -> String {
        let mut out = String::with_capacity(self.template.len() + line.message.len() + 32);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Time => match line.time.format(&Rfc3339) {
                    Ok(time) => out.push_str(&time),
                    Err(_) => out.push_str(&line.time.unix_timestamp().to_string()),
                },
                Segment::Pid => out.push_str(&line.pid.to_string()),
                Segment::Level => out.push_str(line.level.as_str()),
                Segment::Target => out.push_str(&line.target),
                Segment::Message => out.push_str(&line.message),
            }
        }
        out
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}
