use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::warn;

/// Callback invoked for each new pattern occurrence.
///
/// Handlers run on the session task: keep them fast and non-blocking. A
/// handler error is reported through `tracing` and never affects delivery
/// of later matches or other triggers.
pub type TriggerHandler = Box<dyn FnMut(MatchEvent) -> anyhow::Result<()> + Send>;

/// What a newly registered trigger does with output observed before
/// registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backlog {
    /// Deliver matches already present in the accumulated output.
    #[default]
    ReplayHistory,
    /// Only deliver matches appearing in output from this point on.
    NewOutputOnly,
}

/// A single pattern occurrence delivered to a trigger handler.
#[derive(Clone, Debug, Serialize)]
pub struct MatchEvent {
    /// Text matched by the whole pattern.
    pub text: String,
    /// Byte offset of the match in the accumulated output.
    pub start: usize,
    /// Byte offset one past the end of the match.
    pub end: usize,
    /// Positional capture groups, starting at group 1.
    pub groups: Vec<Option<String>>,
    /// Named capture groups that participated in the match.
    pub named: HashMap<String, String>,
    /// When the match was observed.
    pub at: DateTime<Utc>,
}

impl MatchEvent {
    fn from_captures(pattern: &Regex, caps: &regex::Captures<'_>) -> Option<Self> {
        let whole = caps.get(0)?;
        let groups = (1..caps.len())
            .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
            .collect();
        let mut named = HashMap::new();
        for name in pattern.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                named.insert(name.to_string(), m.as_str().to_string());
            }
        }
        Some(Self {
            text: whole.as_str().to_string(),
            start: whole.start(),
            end: whole.end(),
            groups,
            named,
            at: Utc::now(),
        })
    }
}

/// A compiled pattern, its handler, and the count of matches already
/// delivered. The count never exceeds the number of matches currently in
/// the accumulated text, and only ever grows.
struct TriggerRule {
    pattern: Regex,
    handler: TriggerHandler,
    delivered: usize,
}

impl TriggerRule {
    /// Matches in `text` past the delivered watermark, in text order.
    ///
    /// The whole buffer is evaluated every time so that patterns spanning
    /// chunk boundaries are found; the watermark selects the new suffix of
    /// the match sequence.
    fn pending(&self, text: &str) -> Vec<MatchEvent> {
        self.pattern
            .captures_iter(text)
            .skip(self.delivered)
            .filter_map(|caps| MatchEvent::from_captures(&self.pattern, &caps))
            .collect()
    }
}

/// The registered triggers of one session, in registration order.
#[derive(Default)]
pub(crate) struct TriggerSet {
    rules: Vec<TriggerRule>,
}

impl TriggerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a rule and run its first evaluation against `text`
    /// according to the backlog policy.
    pub(crate) fn insert(
        &mut self,
        pattern: Regex,
        backlog: Backlog,
        handler: TriggerHandler,
        text: &str,
    ) {
        let mut rule = TriggerRule {
            pattern,
            handler,
            delivered: 0,
        };
        match backlog {
            Backlog::ReplayHistory => Self::dispatch(&mut rule, text),
            Backlog::NewOutputOnly => rule.delivered = rule.pattern.find_iter(text).count(),
        }
        self.rules.push(rule);
    }

    /// One dispatch cycle: evaluate every rule against the full text and
    /// deliver matches past each rule's watermark. Rules run in
    /// registration order.
    pub(crate) fn scan(&mut self, text: &str) {
        for rule in &mut self.rules {
            Self::dispatch(rule, text);
        }
    }

    fn dispatch(rule: &mut TriggerRule, text: &str) {
        let new = rule.pending(text);
        if new.is_empty() {
            return;
        }
        // advance before delivery so a failing handler cannot cause
        // redelivery of the same occurrence
        rule.delivered += new.len();
        for event in new {
            if let Err(err) = (rule.handler)(event) {
                warn!(pattern = %rule.pattern, error = %err, "trigger handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::buffer::OutputBuffer;

    type Log = Arc<Mutex<Vec<MatchEvent>>>;

    fn collect(log: &Log) -> TriggerHandler {
        let log = Arc::clone(log);
        Box::new(move |event| {
            log.lock().unwrap().push(event);
            Ok(())
        })
    }

    fn regex(pattern: &str) -> Regex {
        Regex::new(pattern).unwrap()
    }

    fn texts(log: &Log) -> Vec<String> {
        log.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }

    #[test]
    fn delivers_one_match_per_chunk_without_duplicates() {
        let mut buffer = OutputBuffer::new();
        let mut set = TriggerSet::new();
        let log = Log::default();
        set.insert(
            regex(r"Build(ing| succeeded)"),
            Backlog::ReplayHistory,
            collect(&log),
            buffer.as_str(),
        );

        buffer.push(b"Building...\n");
        set.scan(buffer.as_str());
        assert_eq!(texts(&log), ["Building"]);

        buffer.push(b"Build succeeded\n");
        set.scan(buffer.as_str());
        assert_eq!(texts(&log), ["Building", "Build succeeded"]);

        // a cycle with no new output delivers nothing
        set.scan(buffer.as_str());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn chunked_delivery_equals_matches_of_concatenation() {
        let chunks: [&[u8]; 4] = [b"item 1\nit", b"em 2\n", b"item 3\nitem", b" 4\n"];
        let mut buffer = OutputBuffer::new();
        let mut set = TriggerSet::new();
        let log = Log::default();
        set.insert(
            regex(r"item \d"),
            Backlog::ReplayHistory,
            collect(&log),
            buffer.as_str(),
        );

        for chunk in chunks {
            buffer.push(chunk);
            set.scan(buffer.as_str());
        }

        assert_eq!(texts(&log), ["item 1", "item 2", "item 3", "item 4"]);
        let starts: Vec<usize> = log.lock().unwrap().iter().map(|m| m.start).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn pattern_spanning_chunk_boundary_is_found() {
        let mut buffer = OutputBuffer::new();
        let mut set = TriggerSet::new();
        let log = Log::default();
        set.insert(
            regex(r"READY: \d+"),
            Backlog::ReplayHistory,
            collect(&log),
            buffer.as_str(),
        );

        buffer.push(b"READY");
        set.scan(buffer.as_str());
        assert!(texts(&log).is_empty());

        buffer.push(b": 42\n");
        set.scan(buffer.as_str());
        assert_eq!(texts(&log), ["READY: 42"]);
    }

    #[test]
    fn rules_fire_in_registration_order_within_a_cycle() {
        let mut buffer = OutputBuffer::new();
        let mut set = TriggerSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, pattern) in [("errors", r"ERROR"), ("warnings", r"WARN")] {
            let order = Arc::clone(&order);
            set.insert(
                regex(pattern),
                Backlog::ReplayHistory,
                Box::new(move |event| {
                    order.lock().unwrap().push((name, event.text));
                    Ok(())
                }),
                buffer.as_str(),
            );
        }

        buffer.push(b"WARN: low disk\nERROR: disk full\n");
        set.scan(buffer.as_str());

        // first-registered rule delivers first, even though its match
        // occurs later in the text
        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            [
                ("errors", "ERROR".to_string()),
                ("warnings", "WARN".to_string())
            ]
        );
    }

    #[test]
    fn failing_handler_does_not_suppress_later_matches_or_rules() {
        let mut buffer = OutputBuffer::new();
        let mut set = TriggerSet::new();

        let seen = Log::default();
        let seen_in_handler = Arc::clone(&seen);
        set.insert(
            regex(r"part\d"),
            Backlog::ReplayHistory,
            Box::new(move |event| {
                let first = event.text == "part1";
                seen_in_handler.lock().unwrap().push(event);
                if first {
                    anyhow::bail!("boom");
                }
                Ok(())
            }),
            buffer.as_str(),
        );
        let other = Log::default();
        set.insert(
            regex(r"part2"),
            Backlog::ReplayHistory,
            collect(&other),
            buffer.as_str(),
        );

        buffer.push(b"part1 part2 part3\n");
        set.scan(buffer.as_str());

        assert_eq!(texts(&seen), ["part1", "part2", "part3"]);
        assert_eq!(texts(&other), ["part2"]);

        // the failed occurrence is not redelivered
        set.scan(buffer.as_str());
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn replay_history_delivers_backlog_at_registration() {
        let mut buffer = OutputBuffer::new();
        buffer.push(b"tick tick\n");
        let mut set = TriggerSet::new();
        let log = Log::default();
        set.insert(
            regex(r"tick"),
            Backlog::ReplayHistory,
            collect(&log),
            buffer.as_str(),
        );
        assert_eq!(texts(&log), ["tick", "tick"]);

        buffer.push(b"tick\n");
        set.scan(buffer.as_str());
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn new_output_only_skips_backlog() {
        let mut buffer = OutputBuffer::new();
        buffer.push(b"tick tick\n");
        let mut set = TriggerSet::new();
        let log = Log::default();
        set.insert(
            regex(r"tick"),
            Backlog::NewOutputOnly,
            collect(&log),
            buffer.as_str(),
        );
        assert!(texts(&log).is_empty());

        buffer.push(b"tick\n");
        set.scan(buffer.as_str());
        assert_eq!(texts(&log), ["tick"]);
        assert_eq!(log.lock().unwrap()[0].start, 10);
    }

    #[test]
    fn capture_groups_are_extracted() {
        let mut buffer = OutputBuffer::new();
        let mut set = TriggerSet::new();
        let log = Log::default();
        set.insert(
            regex(r"error\[(?P<code>E\d+)\]: (.+)"),
            Backlog::ReplayHistory,
            collect(&log),
            buffer.as_str(),
        );

        buffer.push(b"error[E0308]: mismatched types\n");
        set.scan(buffer.as_str());

        let log = log.lock().unwrap();
        let event = &log[0];
        assert_eq!(event.text, "error[E0308]: mismatched types");
        assert_eq!(event.start, 0);
        assert_eq!(event.named["code"], "E0308");
        assert_eq!(event.groups[0].as_deref(), Some("E0308"));
        assert_eq!(event.groups[1].as_deref(), Some("mismatched types"));
    }
}
