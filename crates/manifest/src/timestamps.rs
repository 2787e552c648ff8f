//! Plain YAML timestamp scalars, rendered as RFC3339 UTC in the submitted document.
//!
//! Only unquoted scalars are timestamps in YAML; quoted strings that happen to look like a date
//! are left as written.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value as Json;
use tracing::debug;
use yaml_rust2::parser::{Event, EventReceiver, Parser};
use yaml_rust2::scanner::TScalarStyle;

/// Reformat a YAML timestamp scalar as RFC3339 UTC; `None` when `s` is not a timestamp.
pub fn to_rfc3339_utc(s: &str) -> Option<String> {
    let s = s.trim();
    if s.len() < 16 || !s.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    let normalized = s.replacen('t', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f %:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f %#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true));
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A plain timestamp scalar: where it sits, what was written, and its RFC3339 form.
#[derive(Debug, Clone, PartialEq)]
struct PlainTimestamp {
    path: Vec<Segment>,
    written: String,
    rfc3339: String,
}

enum Kind {
    Seq(usize),
    Map { awaiting_value: bool, key: Option<String> },
}

struct Frame {
    at: Option<Segment>,
    /// False under complex (collection) keys, which have no JSON path.
    reachable: bool,
    kind: Kind,
}

enum Slot {
    Root,
    Key,
    Value(Option<Segment>),
}

#[derive(Default)]
struct Collector {
    frames: Vec<Frame>,
    found: Vec<PlainTimestamp>,
}

impl Collector {
    /// Claim the position of the next node in the enclosing collection.
    fn slot(&mut self) -> Slot {
        let Some(top) = self.frames.last_mut() else { return Slot::Root };
        match &mut top.kind {
            Kind::Seq(next) => {
                let at = Segment::Index(*next);
                *next += 1;
                Slot::Value(Some(at))
            }
            Kind::Map { awaiting_value, key } => {
                if *awaiting_value {
                    *awaiting_value = false;
                    Slot::Value(key.take().map(Segment::Key))
                } else {
                    *awaiting_value = true;
                    *key = None;
                    Slot::Key
                }
            }
        }
    }

    fn reachable(&self) -> bool {
        self.frames.last().map_or(true, |f| f.reachable)
    }

    fn open(&mut self, kind: Kind) {
        let parent_reachable = self.reachable();
        let (at, reachable) = match self.slot() {
            Slot::Root => (None, true),
            Slot::Key => (None, false),
            Slot::Value(at) => {
                let reachable = parent_reachable && at.is_some();
                (at, reachable)
            }
        };
        self.frames.push(Frame { at, reachable, kind });
    }

    fn scalar(&mut self, value: String, style: TScalarStyle) {
        let parent_reachable = self.reachable();
        match self.slot() {
            Slot::Root => {}
            Slot::Key => {
                if let Some(Frame { kind: Kind::Map { key, .. }, .. }) = self.frames.last_mut() {
                    *key = Some(value);
                }
            }
            Slot::Value(Some(at)) if parent_reachable && style == TScalarStyle::Plain => {
                if let Some(rfc3339) = to_rfc3339_utc(&value) {
                    let mut path: Vec<Segment> = self.frames.iter().filter_map(|f| f.at.clone()).collect();
                    path.push(at);
                    self.found.push(PlainTimestamp { path, written: value, rfc3339 });
                }
            }
            Slot::Value(_) => {}
        }
    }
}

impl EventReceiver for Collector {
    fn on_event(&mut self, ev: Event) {
        match ev {
            Event::Scalar(value, style, ..) => self.scalar(value, style),
            Event::SequenceStart(..) => self.open(Kind::Seq(0)),
            Event::MappingStart(..) => self.open(Kind::Map { awaiting_value: false, key: None }),
            Event::SequenceEnd | Event::MappingEnd => {
                self.frames.pop();
            }
            Event::Alias(..) => {
                self.slot();
            }
            _ => {}
        }
    }
}

fn plain_timestamps(text: &str) -> Vec<PlainTimestamp> {
    let mut collector = Collector::default();
    if let Err(e) = Parser::new_from_str(text).load(&mut collector, false) {
        debug!(error = %e, "manifest: timestamp scan skipped");
        return Vec::new();
    }
    collector.found
}

fn lookup_mut<'a>(json: &'a mut Json, path: &[Segment]) -> Option<&'a mut Json> {
    path.iter().try_fold(json, |node, seg| match seg {
        Segment::Key(k) => node.as_object_mut()?.get_mut(k),
        Segment::Index(i) => node.as_array_mut()?.get_mut(*i),
    })
}

/// Rewrite the plain timestamp scalars of `text` in its parsed form `json` as RFC3339 UTC.
pub fn normalize_plain_timestamps(text: &str, json: &mut Json) {
    for ts in plain_timestamps(text) {
        if let Some(Json::String(s)) = lookup_mut(json, &ts.path) {
            if *s == ts.written {
                *s = ts.rfc3339;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_are_rendered_rfc3339_utc() {
        assert_eq!(to_rfc3339_utc("2001-12-14t21:59:43.10-05:00").as_deref(), Some("2001-12-15T02:59:43.100Z"));
        assert_eq!(to_rfc3339_utc("2001-12-14 21:59:43 +01:00").as_deref(), Some("2001-12-14T20:59:43Z"));
        assert_eq!(to_rfc3339_utc("2002-12-14 10:00:00").as_deref(), Some("2002-12-14T10:00:00Z"));
        assert_eq!(to_rfc3339_utc("2020-01-01T00:00:00Z").as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(to_rfc3339_utc("2002-12-14"), None);
        assert_eq!(to_rfc3339_utc("hello world, not a date"), None);
    }

    #[test]
    fn only_plain_scalars_are_rewritten() {
        let text = "spec:\n  at: 2002-12-14 10:00:00\n  quoted: \"2024-03-01 09:30:00+02:00\"\n  single: '2024-03-01 09:30:00'\n  list:\n  - x\n  - 2001-12-14t21:59:43.10-05:00\n";
        let mut v = json!({"spec": {
            "at": "2002-12-14 10:00:00",
            "quoted": "2024-03-01 09:30:00+02:00",
            "single": "2024-03-01 09:30:00",
            "list": ["x", "2001-12-14t21:59:43.10-05:00"]
        }});
        normalize_plain_timestamps(text, &mut v);
        assert_eq!(v["spec"]["at"], "2002-12-14T10:00:00Z");
        assert_eq!(v["spec"]["quoted"], "2024-03-01 09:30:00+02:00");
        assert_eq!(v["spec"]["single"], "2024-03-01 09:30:00");
        assert_eq!(v["spec"]["list"][0], "x");
        assert_eq!(v["spec"]["list"][1], "2001-12-15T02:59:43.100Z");
    }

    #[test]
    fn json_documents_keep_their_strings() {
        let text = r#"{"apiVersion": "v1", "kind": "ConfigMap", "data": {"at": "2002-12-14 10:00:00"}}"#;
        let mut v: Json = serde_json::from_str(text).unwrap();
        normalize_plain_timestamps(text, &mut v);
        assert_eq!(v["data"]["at"], "2002-12-14 10:00:00");
    }

    #[test]
    fn nested_sequences_of_mappings_are_addressed() {
        let text = "items:\n- name: a\n  at: 2020-01-01 00:00:00\n- name: b\n  at: \"2020-01-01 00:00:00\"\n";
        let mut v = json!({"items": [
            {"name": "a", "at": "2020-01-01 00:00:00"},
            {"name": "b", "at": "2020-01-01 00:00:00"}
        ]});
        normalize_plain_timestamps(text, &mut v);
        assert_eq!(v["items"][0]["at"], "2020-01-01T00:00:00Z");
        assert_eq!(v["items"][1]["at"], "2020-01-01 00:00:00");
    }
}
