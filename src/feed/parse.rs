use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FeedError;

use super::update::{CanonicalUpdate, UpdateKind};

/// Envelope `type` values that carry route data. Anything else is a control
/// frame (subscription acks, pongs, errors) and yields nothing.
const DATA_ENVELOPES: [&str; 2] = ["ris_message", "data"];
const UNKNOWN_PEER: &str = "unknown";

/// Decodes one text frame. Only invalid JSON is an error; unrecognised
/// envelopes decode to an empty batch.
pub fn parse_frame(raw: &str, received_at: i64) -> Result<Vec<CanonicalUpdate>, FeedError> {
    let value: Value = serde_json::from_str(raw)?;
    Ok(normalize(&value, received_at))
}

pub fn normalize(raw: &Value, now: i64) -> Vec<CanonicalUpdate> {
    let Some(object) = raw.as_object() else {
        return Vec::new();
    };

    let envelope = object.get("type").and_then(Value::as_str).unwrap_or_default();
    if !DATA_ENVELOPES.contains(&envelope) {
        if envelope == "ris_error" {
            warn!(frame = %raw, "feed reported an error frame");
        } else {
            debug!(envelope, "ignoring control frame");
        }
        return Vec::new();
    }

    let Some(data) = object.get("data").filter(|data| data.is_object()) else {
        return Vec::new();
    };

    let message = MessageAttrs::from_data(data, now);
    let mut updates = Vec::new();

    if let Some(announcements) = data.get("announcements").and_then(Value::as_array) {
        for entry in announcements {
            message.push_announcements(entry, &mut updates);
        }
    }

    if let Some(withdrawals) = data.get("withdrawals").and_then(Value::as_array) {
        for entry in withdrawals {
            let Some(prefix) = withdrawn_prefix(entry) else {
                continue;
            };
            updates.push(message.update(UpdateKind::Withdraw, prefix, RouteAttrs::default()));
        }
    }

    updates
}

struct MessageAttrs<'a> {
    data: &'a Value,
    origin_timestamp: i64,
    received_at: i64,
    peer: String,
    host: Option<String>,
    peer_asn: Option<u32>,
}

#[derive(Clone, Default)]
struct RouteAttrs {
    origin_as: Option<u32>,
    next_hop: Option<String>,
    as_path: Option<String>,
}

impl<'a> MessageAttrs<'a> {
    fn from_data(data: &'a Value, now: i64) -> Self {
        Self {
            data,
            origin_timestamp: data
                .get("timestamp")
                .and_then(seconds_to_millis)
                .unwrap_or(now),
            received_at: now,
            peer: data
                .get("peer")
                .and_then(text)
                .unwrap_or_else(|| UNKNOWN_PEER.to_owned()),
            host: data.get("host").and_then(text),
            peer_asn: data.get("peer_asn").and_then(coerce_asn),
        }
    }

    fn push_announcements(&self, entry: &Value, updates: &mut Vec<CanonicalUpdate>) {
        let attrs = self.route_attrs(entry);

        if let Some(prefix) = entry.as_str() {
            if let Some(prefix) = clean_prefix(prefix) {
                updates.push(self.update(UpdateKind::Announce, prefix, attrs));
            }
            return;
        }

        if let Some(prefixes) = entry.get("prefixes").and_then(Value::as_array) {
            for prefix in prefixes.iter().filter_map(Value::as_str).filter_map(clean_prefix) {
                updates.push(self.update(UpdateKind::Announce, prefix, attrs.clone()));
            }
        } else if let Some(prefix) = entry.get("prefix").and_then(Value::as_str).and_then(clean_prefix) {
            updates.push(self.update(UpdateKind::Announce, prefix, attrs));
        }
    }

    fn route_attrs(&self, entry: &Value) -> RouteAttrs {
        let path_value = ["as_path", "path"]
            .iter()
            .find_map(|key| entry.get(*key))
            .or_else(|| ["path", "as_path"].iter().find_map(|key| self.data.get(*key)));
        let path = path_value.map(flatten_as_path).unwrap_or_default();

        let origin_as = path.last().copied().or_else(|| {
            entry
                .get("origin_asn")
                .and_then(coerce_asn)
                .or_else(|| self.data.get("origin_asn").and_then(coerce_asn))
        });

        let next_hop = entry
            .get("next_hop")
            .and_then(text)
            .or_else(|| self.data.get("next_hop").and_then(text));

        RouteAttrs {
            origin_as,
            next_hop,
            as_path: (!path.is_empty()).then(|| join_as_path(&path)),
        }
    }

    fn update(&self, kind: UpdateKind, prefix: String, attrs: RouteAttrs) -> CanonicalUpdate {
        CanonicalUpdate {
            kind,
            origin_timestamp: self.origin_timestamp,
            received_at: self.received_at,
            prefix,
            peer: self.peer.clone(),
            host: self.host.clone(),
            peer_asn: self.peer_asn,
            origin_as: attrs.origin_as,
            next_hop: attrs.next_hop,
            as_path: attrs.as_path,
        }
    }
}

fn withdrawn_prefix(entry: &Value) -> Option<String> {
    match entry {
        Value::String(prefix) => clean_prefix(prefix),
        Value::Object(object) => object.get("prefix").and_then(Value::as_str).and_then(clean_prefix),
        _ => None,
    }
}

fn clean_prefix(prefix: &str) -> Option<String> {
    let prefix = prefix.trim();
    (!prefix.is_empty()).then(|| prefix.to_owned())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_owned()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn seconds_to_millis(value: &Value) -> Option<i64> {
    let seconds = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (seconds.is_finite() && seconds >= 0.0).then(|| (seconds * 1000.0).round() as i64)
}

/// Accepts ASNs as JSON integers or numeric strings.
pub fn coerce_asn(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|asn| u32::try_from(asn).ok()),
        Value::String(text) => text.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// Flattens a path attribute (flat or nested as AS sets) into one ordered
/// sequence, dropping members that are not integers.
pub fn flatten_as_path(value: &Value) -> Vec<u32> {
    let mut path = Vec::new();
    collect_path(value, &mut path);
    path
}

fn collect_path(value: &Value, path: &mut Vec<u32>) {
    match value {
        Value::Array(members) => {
            for member in members {
                collect_path(member, path);
            }
        }
        Value::Number(number) => {
            if let Some(asn) = number.as_u64().and_then(|asn| u32::try_from(asn).ok()) {
                path.push(asn);
            }
        }
        _ => {}
    }
}

pub fn join_as_path(path: &[u32]) -> String {
    path.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
