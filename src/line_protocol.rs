// ABOUTME: Line-protocol record construction for the telemetry endpoint
// ABOUTME: asset,instance=<id> <sensor>=<value>[,...] <unix_ns> - one record per source row

use chrono::{DateTime, Utc};

/// Build one record from the non-null fields of a row.
///
/// Returns `None` when there is nothing to write (no fields) or the timestamp
/// cannot be expressed in nanoseconds.
pub fn format_record(
    asset_id: &str,
    instance_id: &str,
    fields: &[(&str, f64)],
    time: DateTime<Utc>,
) -> Option<String> {
    if fields.is_empty() {
        return None;
    }
    let timestamp_ns = time.timestamp_nanos_opt()?;

    let mut line = escape_measurement(asset_id);
    line.push_str(",instance=");
    line.push_str(&escape_tag(instance_id));
    line.push(' ');

    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_tag(key));
        line.push('=');
        line.push_str(&value.to_string());
    }

    line.push(' ');
    line.push_str(&timestamp_ns.to_string());
    Some(line)
}

/// Spaces and commas must be escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys additionally escape equals signs.
fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
