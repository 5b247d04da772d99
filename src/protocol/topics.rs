//! MQTT topic tree shared by the router, the components and the subscriber.
//!
//! All daemon topics live under a configurable prefix (default `br`):
//!
//! ```text
//! br/d/<pin>[/read|/mode]      br/a/<pin>[/read]
//! br/console/{in,out}          br/datastore/{put,get}/<key>
//! br/mailbox/*                 br/sh/{run,run_async,poll/<pid>,kill/<pid>}
//! br/file/{read,write,remove}/<path>
//! br/system/{version,free_memory,status,handshake,bridge/...}
//! ```

/// Default topic prefix when none is configured.
pub const DEFAULT_TOPIC_PREFIX: &str = "br";

/// Single-segment MQTT wildcard.
pub const WILDCARD_SINGLE: &str = "+";
/// Multi-segment MQTT wildcard.
pub const WILDCARD_MULTI: &str = "#";

/// Topic suffix constants shared across components.
pub const SUFFIX_INCOMING_AVAILABLE: &str = "incoming_available";
pub const SUFFIX_OUTGOING_AVAILABLE: &str = "outgoing_available";
pub const SUFFIX_RESPONSE: &str = "response";
pub const SUFFIX_ERROR: &str = "error";

/// First topic segment under the prefix, selecting a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Analog pin operations (`a`).
    Analog,
    /// Remote console (`console`).
    Console,
    /// Key-value storage (`datastore`).
    Datastore,
    /// Digital pin operations (`d`).
    Digital,
    /// File system operations (`file`).
    File,
    /// Message passing (`mailbox`).
    Mailbox,
    /// Shell command execution (`sh`).
    Shell,
    /// System control and info (`system`).
    System,
}

impl Topic {
    /// Wire segment for this topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Analog => "a",
            Topic::Console => "console",
            Topic::Datastore => "datastore",
            Topic::Digital => "d",
            Topic::File => "file",
            Topic::Mailbox => "mailbox",
            Topic::Shell => "sh",
            Topic::System => "system",
        }
    }

    /// Parse a topic segment.
    pub fn from_segment(segment: &str) -> Option<Topic> {
        Some(match segment {
            "a" => Topic::Analog,
            "console" => Topic::Console,
            "datastore" => Topic::Datastore,
            "d" => Topic::Digital,
            "file" => Topic::File,
            "mailbox" => Topic::Mailbox,
            "sh" => Topic::Shell,
            "system" => Topic::System,
            _ => return None,
        })
    }
}

/// Parsed representation of an inbound MQTT topic targeting the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    /// Original topic string.
    pub raw: String,
    /// Normalized prefix the topic matched.
    pub prefix: String,
    /// Component selector.
    pub topic: Topic,
    /// Segments after the component selector.
    pub segments: Vec<String>,
}

impl TopicRoute {
    /// First segment after the component selector, or empty.
    pub fn identifier(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }

    /// Segments after the identifier.
    pub fn remainder(&self) -> &[String] {
        if self.segments.len() > 1 {
            &self.segments[1..]
        } else {
            &[]
        }
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Join `prefix`, `topic` and optional sub-segments into a topic path.
pub fn topic_path(prefix: &str, topic: Topic, segments: &[&str]) -> String {
    let mut parts: Vec<&str> = split_segments(prefix);
    parts.push(topic.as_str());
    for segment in segments {
        let cleaned = segment.trim_matches('/');
        if !cleaned.is_empty() {
            parts.push(cleaned);
        }
    }
    parts.join("/")
}

/// Parse an incoming MQTT topic into a [`TopicRoute`].
///
/// Returns `None` when the topic does not start with `prefix` or names an
/// unknown component.
pub fn parse_topic(prefix: &str, topic_name: &str) -> Option<TopicRoute> {
    let prefix_segments = split_segments(prefix);
    let topic_segments = split_segments(topic_name);
    if topic_segments.len() < prefix_segments.len() + 1 {
        return None;
    }
    if topic_segments[..prefix_segments.len()] != prefix_segments[..] {
        return None;
    }
    let topic = Topic::from_segment(topic_segments[prefix_segments.len()])?;
    let segments = topic_segments[prefix_segments.len() + 1..]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    Some(TopicRoute {
        raw: topic_name.to_string(),
        prefix: prefix_segments.join("/"),
        topic,
        segments,
    })
}

/// Topic used for handshake telemetry.
pub fn handshake_topic(prefix: &str) -> String {
    topic_path(prefix, Topic::System, &["handshake"])
}

/// Topic mirroring MCU status frames and forbidden-action reports.
pub fn system_status_topic(prefix: &str) -> String {
    topic_path(prefix, Topic::System, &["status"])
}

/// Topic reporting queued MCU→Linux mailbox messages.
pub fn mailbox_incoming_available_topic(prefix: &str) -> String {
    topic_path(prefix, Topic::Mailbox, &[SUFFIX_INCOMING_AVAILABLE])
}

/// Topic reporting queued Linux→MCU mailbox messages.
pub fn mailbox_outgoing_available_topic(prefix: &str) -> String {
    topic_path(prefix, Topic::Mailbox, &[SUFFIX_OUTGOING_AVAILABLE])
}

/// Static subscription table derived from the command enumeration.
///
/// Every entry is `(component topic, trailing segments)`; all subscriptions
/// use QoS 0.
pub const COMMAND_SUBSCRIPTIONS: &[(Topic, &[&str])] = &[
    (Topic::Digital, &[WILDCARD_SINGLE, "mode"]),
    (Topic::Digital, &[WILDCARD_SINGLE, "read"]),
    (Topic::Digital, &[WILDCARD_SINGLE]),
    (Topic::Analog, &[WILDCARD_SINGLE, "read"]),
    (Topic::Analog, &[WILDCARD_SINGLE]),
    (Topic::Console, &["in"]),
    (Topic::Datastore, &["put", WILDCARD_MULTI]),
    (Topic::Datastore, &["get", WILDCARD_MULTI]),
    (Topic::Mailbox, &["write"]),
    (Topic::Mailbox, &["read"]),
    (Topic::Shell, &["run"]),
    (Topic::Shell, &["run_async"]),
    (Topic::Shell, &["poll", WILDCARD_MULTI]),
    (Topic::Shell, &["kill", WILDCARD_MULTI]),
    (Topic::System, &["free_memory", "get"]),
    (Topic::System, &["version", "get"]),
    (Topic::System, &["bridge", "handshake", "get"]),
    (Topic::System, &["bridge", "summary", "get"]),
    (Topic::System, &["bridge", "state", "get"]),
    (Topic::File, &["write", WILDCARD_MULTI]),
    (Topic::File, &["read", WILDCARD_MULTI]),
    (Topic::File, &["remove", WILDCARD_MULTI]),
];

/// Render the subscription table into concrete filters under `prefix`.
pub fn subscription_filters(prefix: &str) -> Vec<String> {
    COMMAND_SUBSCRIPTIONS
        .iter()
        .map(|(topic, segments)| topic_path(prefix, *topic, segments))
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_path_joins_and_cleans_segments() {
        assert_eq!(topic_path("br", Topic::Digital, &["5", "value"]), "br/d/5/value");
        assert_eq!(topic_path("a/b/", Topic::System, &["status"]), "a/b/system/status");
        assert_eq!(topic_path("br", Topic::Console, &["", "out"]), "br/console/out");
    }

    #[test]
    fn parse_topic_strips_prefix() {
        let route = parse_topic("br", "br/d/5/read").unwrap();
        assert_eq!(route.topic, Topic::Digital);
        assert_eq!(route.segments, vec!["5", "read"]);
        assert_eq!(route.identifier(), "5");
        assert_eq!(route.remainder(), &["read".to_string()]);
    }

    #[test]
    fn parse_topic_supports_multi_segment_prefix() {
        let route = parse_topic("site/dev", "site/dev/datastore/put/a/b").unwrap();
        assert_eq!(route.prefix, "site/dev");
        assert_eq!(route.topic, Topic::Datastore);
        assert_eq!(route.segments, vec!["put", "a", "b"]);
    }

    #[test]
    fn parse_topic_rejects_foreign_prefix() {
        assert!(parse_topic("br", "other/d/5").is_none());
    }

    #[test]
    fn parse_topic_rejects_unknown_component() {
        assert!(parse_topic("br", "br/nonsense/5").is_none());
    }

    #[test]
    fn parse_topic_requires_component_segment() {
        assert!(parse_topic("br", "br").is_none());
    }

    #[test]
    fn route_with_no_segments_has_empty_identifier() {
        let route = parse_topic("br", "br/mailbox").unwrap();
        assert_eq!(route.identifier(), "");
        assert!(route.remainder().is_empty());
    }

    #[test]
    fn helper_topics() {
        assert_eq!(handshake_topic("br"), "br/system/handshake");
        assert_eq!(system_status_topic("br"), "br/system/status");
        assert_eq!(mailbox_incoming_available_topic("br"), "br/mailbox/incoming_available");
        assert_eq!(mailbox_outgoing_available_topic("br"), "br/mailbox/outgoing_available");
    }

    #[test]
    fn subscription_filters_cover_every_component() {
        let filters = subscription_filters("br");
        assert_eq!(filters.len(), COMMAND_SUBSCRIPTIONS.len());
        assert!(filters.contains(&"br/d/+".to_string()));
        assert!(filters.contains(&"br/sh/poll/#".to_string()));
        assert!(filters.contains(&"br/file/remove/#".to_string()));
        assert!(filters.contains(&"br/system/bridge/state/get".to_string()));
    }

    #[test]
    fn topic_segment_round_trips() {
        for topic in [
            Topic::Analog,
            Topic::Console,
            Topic::Datastore,
            Topic::Digital,
            Topic::File,
            Topic::Mailbox,
            Topic::Shell,
            Topic::System,
        ] {
            assert_eq!(Topic::from_segment(topic.as_str()), Some(topic));
        }
    }
}
