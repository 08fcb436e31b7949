use crate::codec::point::{FieldValue, Point, Precision};
use crate::error::{RelayError, RelayResult};

/// Decodes an InfluxDB line protocol payload into points.
///
/// One line per point: `measurement,tag=val,tag=val field=val,field=val timestamp`.
/// The timestamp is optional; `precision` converts whatever unit the `precision`
/// query parameter named into nanoseconds.
pub fn decode(body: &str, precision: Precision) -> RelayResult<Vec<Point>> {
    let mut points = Vec::new();
    for (lineno, raw_line) in body.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        points.push(decode_line(line, precision).map_err(|e| {
            RelayError::LineProtocol(format!("line {}: {}", lineno + 1, e))
        })?);
    }
    Ok(points)
}

fn decode_line(line: &str, precision: Precision) -> Result<Point, String> {
    let (key_and_tags, rest) = split_unescaped(line, ' ').ok_or("missing field set")?;
    let (fields_part, timestamp_part) = match split_unescaped(rest, ' ') {
        Some((f, t)) => (f, Some(t)),
        None => (rest, None),
    };

    let mut key_iter = key_and_tags.split(',');
    let measurement = key_iter
        .next()
        .filter(|s| !s.is_empty())
        .ok_or("empty measurement name")?
        .to_string();

    let mut point = Point::new(measurement);
    for tag_pair in key_iter {
        if tag_pair.is_empty() {
            continue;
        }
        let (k, v) = tag_pair
            .split_once('=')
            .ok_or_else(|| format!("malformed tag pair: {}", tag_pair))?;
        point.tags.insert(unescape(k), unescape(v));
    }

    for field_pair in fields_part.split(',') {
        if field_pair.is_empty() {
            continue;
        }
        let (k, v) = field_pair
            .split_once('=')
            .ok_or_else(|| format!("malformed field pair: {}", field_pair))?;
        point
            .fields
            .insert(unescape(k), parse_field_value(v)?);
    }
    if point.fields.is_empty() {
        return Err("point has no fields".to_string());
    }

    if let Some(ts) = timestamp_part {
        let raw: i64 = ts
            .trim()
            .parse()
            .map_err(|_| format!("malformed timestamp: {}", ts))?;
        point.timestamp = Some(raw * precision.multiplier_to_nanos());
    }

    Ok(point)
}

fn parse_field_value(raw: &str) -> Result<FieldValue, String> {
    if let Some(stripped) = raw.strip_suffix('i') {
        return stripped
            .parse::<i64>()
            .map(FieldValue::Int)
            .map_err(|_| format!("malformed integer field: {}", raw));
    }
    if let Some(stripped) = raw.strip_suffix('u') {
        return stripped
            .parse::<u64>()
            .map(FieldValue::UInt)
            .map_err(|_| format!("malformed unsigned field: {}", raw));
    }
    if raw == "t" || raw == "T" || raw == "true" || raw == "True" {
        return Ok(FieldValue::Bool(true));
    }
    if raw == "f" || raw == "F" || raw == "false" || raw == "False" {
        return Ok(FieldValue::Bool(false));
    }
    if raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2 {
        return Ok(FieldValue::Str(raw[1..raw.len() - 1].to_string()));
    }
    raw.parse::<f64>()
        .map(FieldValue::Float)
        .map_err(|_| format!("malformed field value: {}", raw))
}

/// Splits on the first unescaped occurrence of `sep` (not preceded by `\`).
fn split_unescaped(s: &str, sep: char) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] as char == sep && (i == 0 || bytes[i - 1] != b'\\') {
            return Some((&s[..i], &s[i + 1..]));
        }
        i += 1;
    }
    None
}

fn unescape(s: &str) -> String {
    s.replace("\\,", ",").replace("\\ ", " ").replace("\\=", "=")
}

/// Re-encodes points back into line protocol, e.g. after a `rename_data` or
/// `drop_data` rule mutated the batch.
pub fn encode(points: &[Point]) -> String {
    let mut out = String::new();
    for p in points {
        out.push_str(&escape(&p.measurement));
        for (k, v) in &p.tags {
            out.push(',');
            out.push_str(&escape(k));
            out.push('=');
            out.push_str(&escape(v));
        }
        out.push(' ');
        let mut first = true;
        for (k, v) in &p.fields {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(&escape(k));
            out.push('=');
            out.push_str(&encode_field_value(v));
        }
        if let Some(ts) = p.timestamp {
            out.push(' ');
            out.push_str(&ts.to_string());
        }
        out.push('\n');
    }
    out
}

fn escape(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ").replace('=', "\\=")
}

fn encode_field_value(v: &FieldValue) -> String {
    match v {
        FieldValue::Float(f) => f.to_string(),
        FieldValue::Int(i) => format!("{}i", i),
        FieldValue::UInt(u) => format!("{}u", u),
        FieldValue::Str(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        FieldValue::Bool(b) => b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_line() {
        let points = decode("weather,city=sf temp=72.5 1000000000", Precision::Nanos).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "weather");
        assert_eq!(points[0].tags.get("city").unwrap(), "sf");
        assert_eq!(points[0].timestamp, Some(1_000_000_000));
    }

    #[test]
    fn decodes_multiple_field_types() {
        let points = decode("m count=3i,ok=t,name=\"x\",rate=1.5", Precision::Nanos).unwrap();
        let f = &points[0].fields;
        assert_eq!(f.get("count").unwrap(), &FieldValue::Int(3));
        assert_eq!(f.get("ok").unwrap(), &FieldValue::Bool(true));
        assert_eq!(f.get("name").unwrap(), &FieldValue::Str("x".into()));
        assert_eq!(f.get("rate").unwrap(), &FieldValue::Float(1.5));
    }

    #[test]
    fn rejects_point_with_no_fields() {
        assert!(decode("measurement_only", Precision::Nanos).is_err());
    }

    #[test]
    fn applies_precision_multiplier() {
        let points = decode("m v=1 5", Precision::Seconds).unwrap();
        assert_eq!(points[0].timestamp, Some(5_000_000_000));
    }

    #[test]
    fn round_trips_through_encode() {
        let points = decode("weather,city=sf temp=72.5 1000000000", Precision::Nanos).unwrap();
        let encoded = encode(&points);
        let reparsed = decode(&encoded, Precision::Nanos).unwrap();
        assert_eq!(points, reparsed);
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let points = decode("\n# comment\nm v=1\n", Precision::Nanos).unwrap();
        assert_eq!(points.len(), 1);
    }
}
