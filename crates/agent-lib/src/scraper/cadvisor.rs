//! Exposition-format parser for the cumulative node endpoint
//!
//! The endpoint returns text lines of the form
//! `name{label="value",...} 123 [timestamp]`. Only a handful of counter
//! families and two label pairs matter to the agent; everything else is
//! tolerated and ignored. Malformed lines are skipped, an empty document
//! is valid.

use std::collections::HashMap;

/// One parsed sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl Sample {
    /// Pod UID and container name of this sample, from either label
    /// spelling the endpoint has used across versions.
    pub fn container_ref(&self) -> Option<(&str, &str)> {
        let pod = self
            .labels
            .get("pod")
            .or_else(|| self.labels.get("pod_name"))?;
        let container = self
            .labels
            .get("container")
            .or_else(|| self.labels.get("container_name"))?;
        if pod.is_empty() || container.is_empty() {
            return None;
        }
        Some((pod.as_str(), container.as_str()))
    }
}

/// Samples grouped by metric family name.
pub type SampleTable = HashMap<String, Vec<Sample>>;

/// Parses an exposition document into a label-indexed sample table.
pub fn parse_exposition(text: &str) -> SampleTable {
    let mut table = SampleTable::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, sample)) = parse_sample_line(line) {
            table.entry(name).or_default().push(sample);
        }
    }
    table
}

fn parse_sample_line(line: &str) -> Option<(String, Sample)> {
    let (name_part, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            if close < open {
                return None;
            }
            (&line[..open], &line[open..=close])
        }
        None => {
            let space = line.find(char::is_whitespace)?;
            (&line[..space], "")
        }
    };

    let labels = if rest.is_empty() {
        HashMap::new()
    } else {
        parse_labels(&rest[1..rest.len() - 1])?
    };

    let value_part = line[name_part.len() + rest.len()..].trim();
    let value: f64 = value_part.split_whitespace().next()?.parse().ok()?;

    Some((
        name_part.to_string(),
        Sample { labels, value },
    ))
}

fn parse_labels(body: &str) -> Option<HashMap<String, String>> {
    let mut labels = HashMap::new();
    let mut chars = body.chars().peekable();

    while chars.peek().is_some() {
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if chars.next()? != '"' {
            return None;
        }
        let mut value = String::new();
        let mut escaped = false;
        for c in chars.by_ref() {
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                break;
            } else {
                value.push(c);
            }
        }
        labels.insert(key.trim().to_string(), value);
        // Skip a separating comma, if any.
        if chars.peek() == Some(&',') {
            chars.next();
        }
    }

    Some(labels)
}
