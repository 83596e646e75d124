//! Single-pass parser and validator for metric batch request bodies.
//!
//! The body is scanned exactly once, left to right; schema validation runs
//! inline as each metric field is decoded, so a rejected batch costs no more
//! than the prefix that was read. Numbers are parsed straight out of the
//! input buffer. Unknown keys at any level are skipped without allocation of
//! their values' structure, which keeps the wire format forward compatible.
//!
//! The parser is pure and total: any byte sequence yields either a batch or
//! a [`ParseError`]; nothing is shared and nothing panics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use metrion_types::{Metric, MAX_NAME_LEN, MAX_TAGS, MAX_TAG_LEN, MAX_VALUE_MAGNITUDE};
use thiserror::Error;

/// Maximum nesting depth tolerated while skipping unknown values.
const MAX_DEPTH: u32 = 64;

/// A rejected body: byte position of the offending input plus a message
/// suitable for echoing back to the client in the 400 response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid batch at byte {pos}: {msg}")]
pub struct ParseError {
    pub pos: usize,
    pub msg: String,
}

/// Parse a request body of the shape `{"metrics":[…]}` into validated
/// metrics. The client identifier travels in the request headers, not the
/// body, so the caller assembles the final `MetricBatch`.
pub fn parse(body: &[u8]) -> Result<Vec<Metric>, ParseError> {
    let mut scanner = Scanner::new(body);
    scanner.skip_ws();
    scanner.expect(b'{')?;

    let mut metrics: Option<Vec<Metric>> = None;
    scanner.skip_ws();
    if scanner.peek() == Some(b'}') {
        scanner.bump();
    } else {
        loop {
            scanner.skip_ws();
            let key = scanner.parse_string()?;
            scanner.skip_ws();
            scanner.expect(b':')?;
            if key == "metrics" {
                scanner.skip_ws();
                metrics = Some(scanner.parse_metric_array()?);
            } else {
                scanner.skip_value(0)?;
            }
            scanner.skip_ws();
            match scanner.bump() {
                Some(b',') => continue,
                Some(b'}') => break,
                _ => return Err(scanner.err("expected ',' or '}' in batch object")),
            }
        }
    }

    scanner.skip_ws();
    if scanner.pos != scanner.buf.len() {
        return Err(scanner.err("trailing data after batch object"));
    }
    metrics.ok_or(ParseError {
        pos: body.len(),
        msg: "missing \"metrics\" key".to_string(),
    })
}

struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn err(&self, msg: impl Into<String>) -> ParseError {
        self.err_at(self.pos, msg)
    }

    fn err_at(&self, pos: usize, msg: impl Into<String>) -> ParseError {
        ParseError {
            pos,
            msg: msg.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: u8) -> Result<(), ParseError> {
        match self.bump() {
            Some(byte) if byte == expected => Ok(()),
            _ => Err(self.err_at(
                self.pos.saturating_sub(1),
                format!("expected '{}'", expected as char),
            )),
        }
    }

    fn expect_literal(&mut self, literal: &[u8]) -> Result<(), ParseError> {
        let start = self.pos;
        if self.buf[self.pos..].starts_with(literal) {
            self.pos += literal.len();
            Ok(())
        } else {
            Err(self.err_at(start, "expected a JSON value"))
        }
    }

    fn parse_metric_array(&mut self) -> Result<Vec<Metric>, ParseError> {
        self.expect(b'[')
            .map_err(|e| self.err_at(e.pos, "\"metrics\" must be an array"))?;
        let mut metrics = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.bump();
            return Ok(metrics);
        }
        loop {
            metrics.push(self.parse_metric()?);
            self.skip_ws();
            match self.bump() {
                Some(b',') => continue,
                Some(b']') => break,
                _ => return Err(self.err("expected ',' or ']' in metrics array")),
            }
        }
        Ok(metrics)
    }

    fn parse_metric(&mut self) -> Result<Metric, ParseError> {
        self.skip_ws();
        let object_start = self.pos;
        self.expect(b'{')
            .map_err(|e| self.err_at(e.pos, "each metric must be an object"))?;

        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut name: Option<String> = None;
        let mut value: Option<f64> = None;
        let mut tags: Option<BTreeMap<String, String>> = None;

        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.bump();
        } else {
            loop {
                self.skip_ws();
                let key = self.parse_string()?;
                self.skip_ws();
                self.expect(b':')?;
                self.skip_ws();
                match key.as_str() {
                    "timestamp" => {
                        let field_pos = self.pos;
                        let raw = self
                            .parse_string()
                            .map_err(|e| self.err_at(e.pos, "\"timestamp\" must be a string"))?;
                        let parsed = DateTime::parse_from_rfc3339(&raw)
                            .map_err(|_| self.err_at(field_pos, "invalid timestamp"))?;
                        timestamp = Some(parsed.with_timezone(&Utc));
                    }
                    "name" => {
                        let field_pos = self.pos;
                        let raw = self
                            .parse_string()
                            .map_err(|e| self.err_at(e.pos, "\"name\" must be a string"))?;
                        validate_name(&raw).map_err(|msg| self.err_at(field_pos, msg))?;
                        name = Some(raw);
                    }
                    "value" => {
                        let field_pos = self.pos;
                        let parsed = self.parse_number()?;
                        if !parsed.is_finite() || parsed.abs() > MAX_VALUE_MAGNITUDE {
                            return Err(self.err_at(field_pos, "value out of range"));
                        }
                        value = Some(parsed);
                    }
                    "tags" => {
                        tags = Some(self.parse_tags()?);
                    }
                    _ => self.skip_value(0)?,
                }
                self.skip_ws();
                match self.bump() {
                    Some(b',') => continue,
                    Some(b'}') => break,
                    _ => return Err(self.err("expected ',' or '}' in metric object")),
                }
            }
        }

        let missing = |field: &str| ParseError {
            pos: object_start,
            msg: format!("metric missing \"{field}\""),
        };
        Ok(Metric {
            timestamp: timestamp.ok_or_else(|| missing("timestamp"))?,
            name: name.ok_or_else(|| missing("name"))?,
            value: value.ok_or_else(|| missing("value"))?,
            tags: tags.unwrap_or_default(),
        })
    }

    fn parse_tags(&mut self) -> Result<BTreeMap<String, String>, ParseError> {
        self.expect(b'{')
            .map_err(|e| self.err_at(e.pos, "\"tags\" must be an object"))?;
        let mut tags = BTreeMap::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.bump();
            return Ok(tags);
        }
        loop {
            self.skip_ws();
            let key_pos = self.pos;
            let key = self.parse_string()?;
            if key.len() > MAX_TAG_LEN {
                return Err(self.err_at(key_pos, "tag key too long"));
            }
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            let value_pos = self.pos;
            let value = self
                .parse_string()
                .map_err(|e| self.err_at(e.pos, "tag values must be strings"))?;
            if value.len() > MAX_TAG_LEN {
                return Err(self.err_at(value_pos, "tag value too long"));
            }
            // Duplicate keys keep the last value, matching common JSON
            // object semantics.
            tags.insert(key, value);
            if tags.len() > MAX_TAGS {
                return Err(self.err_at(key_pos, "too many tags"));
            }
            self.skip_ws();
            match self.bump() {
                Some(b',') => continue,
                Some(b'}') => break,
                _ => return Err(self.err("expected ',' or '}' in tags object")),
            }
        }
        Ok(tags)
    }

    /// Decode a JSON string, including escape sequences and surrogate pairs.
    fn parse_string(&mut self) -> Result<String, ParseError> {
        self.expect(b'"')?;
        let start = self.pos;
        let mut out: Vec<u8> = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.err_at(start, "unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    None => return Err(self.err_at(start, "unterminated string")),
                    Some(b'"') => out.push(b'"'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'/') => out.push(b'/'),
                    Some(b'b') => out.push(0x08),
                    Some(b'f') => out.push(0x0c),
                    Some(b'n') => out.push(b'\n'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'u') => {
                        let decoded = self.parse_unicode_escape()?;
                        let mut utf8 = [0u8; 4];
                        out.extend_from_slice(decoded.encode_utf8(&mut utf8).as_bytes());
                    }
                    Some(_) => {
                        return Err(self
                            .err_at(self.pos.saturating_sub(1), "invalid escape sequence"))
                    }
                },
                Some(byte) if byte < 0x20 => {
                    return Err(
                        self.err_at(self.pos.saturating_sub(1), "control character in string")
                    )
                }
                Some(byte) => out.push(byte),
            }
        }
        String::from_utf8(out).map_err(|_| self.err_at(start, "invalid utf-8 in string"))
    }

    fn parse_unicode_escape(&mut self) -> Result<char, ParseError> {
        let escape_pos = self.pos.saturating_sub(2);
        let high = self.parse_hex4()?;
        let code = if (0xd800..=0xdbff).contains(&high) {
            if self.bump() != Some(b'\\') || self.bump() != Some(b'u') {
                return Err(self.err_at(escape_pos, "unpaired surrogate in \\u escape"));
            }
            let low = self.parse_hex4()?;
            if !(0xdc00..=0xdfff).contains(&low) {
                return Err(self.err_at(escape_pos, "unpaired surrogate in \\u escape"));
            }
            0x10000 + ((high - 0xd800) << 10) + (low - 0xdc00)
        } else if (0xdc00..=0xdfff).contains(&high) {
            return Err(self.err_at(escape_pos, "unpaired surrogate in \\u escape"));
        } else {
            high
        };
        char::from_u32(code).ok_or_else(|| self.err_at(escape_pos, "invalid \\u escape"))
    }

    fn parse_hex4(&mut self) -> Result<u32, ParseError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let digit = match self.bump() {
                Some(byte @ b'0'..=b'9') => u32::from(byte - b'0'),
                Some(byte @ b'a'..=b'f') => u32::from(byte - b'a') + 10,
                Some(byte @ b'A'..=b'F') => u32::from(byte - b'A') + 10,
                _ => {
                    return Err(
                        self.err_at(self.pos.saturating_sub(1), "invalid \\u escape digit")
                    )
                }
            };
            code = code << 4 | digit;
        }
        Ok(code)
    }

    /// Parse a JSON number directly from the input buffer. The matched byte
    /// range is handed to the float parser as a borrowed str; no
    /// intermediate string is allocated.
    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        match self.peek() {
            Some(b'0') => {
                self.pos += 1;
            }
            Some(b'1'..=b'9') => {
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos += 1;
                }
            }
            _ => return Err(self.err_at(start, "invalid number")),
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.err_at(start, "invalid number"));
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.err_at(start, "invalid number"));
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| self.err_at(start, "invalid number"))?;
        text.parse::<f64>()
            .map_err(|_| self.err_at(start, "invalid number"))
    }

    /// Skip any JSON value, validating structure but discarding content.
    fn skip_value(&mut self, depth: u32) -> Result<(), ParseError> {
        if depth >= MAX_DEPTH {
            return Err(self.err("value nesting too deep"));
        }
        self.skip_ws();
        match self.peek() {
            Some(b'"') => {
                self.parse_string()?;
                Ok(())
            }
            Some(b'{') => {
                self.bump();
                self.skip_ws();
                if self.peek() == Some(b'}') {
                    self.bump();
                    return Ok(());
                }
                loop {
                    self.skip_ws();
                    self.parse_string()?;
                    self.skip_ws();
                    self.expect(b':')?;
                    self.skip_value(depth + 1)?;
                    self.skip_ws();
                    match self.bump() {
                        Some(b',') => continue,
                        Some(b'}') => return Ok(()),
                        _ => return Err(self.err("expected ',' or '}' in object")),
                    }
                }
            }
            Some(b'[') => {
                self.bump();
                self.skip_ws();
                if self.peek() == Some(b']') {
                    self.bump();
                    return Ok(());
                }
                loop {
                    self.skip_value(depth + 1)?;
                    self.skip_ws();
                    match self.bump() {
                        Some(b',') => continue,
                        Some(b']') => return Ok(()),
                        _ => return Err(self.err("expected ',' or ']' in array")),
                    }
                }
            }
            Some(b't') => self.expect_literal(b"true"),
            Some(b'f') => self.expect_literal(b"false"),
            Some(b'n') => self.expect_literal(b"null"),
            Some(b'-' | b'0'..=b'9') => {
                self.parse_number()?;
                Ok(())
            }
            _ => Err(self.err("expected a JSON value")),
        }
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name too long".to_string());
    }
    let valid = name
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'_');
    if !valid {
        return Err("name contains invalid characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_a_single_metric() {
        let body = br#"{"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"cpu","value":75.5}]}"#;
        let metrics = parse(body).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "cpu");
        assert_eq!(metrics[0].value, 75.5);
        assert_eq!(
            metrics[0].timestamp,
            Utc.with_ymd_and_hms(2025, 10, 12, 15, 30, 0).unwrap()
        );
        assert!(metrics[0].tags.is_empty());
    }

    #[test]
    fn parses_tags_and_normalizes_order() {
        let body = br#"{"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"cpu","value":1,
            "tags":{"zone":"us-1","host":"web-2"}}]}"#;
        let metrics = parse(body).unwrap();
        let keys: Vec<_> = metrics[0].tags.keys().collect();
        assert_eq!(keys, ["host", "zone"]);
    }

    #[test]
    fn empty_batch_is_valid() {
        assert!(parse(br#"{"metrics":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn missing_fields_are_named_in_the_error() {
        let err = parse(br#"{"metrics":[{"name":"x"}]}"#).unwrap_err();
        assert!(err.msg.contains("timestamp"), "{err}");
    }

    #[test]
    fn missing_metrics_key_is_rejected() {
        let err = parse(br#"{"other":1}"#).unwrap_err();
        assert!(err.msg.contains("metrics"), "{err}");
    }

    #[test]
    fn unknown_keys_are_ignored_at_every_level() {
        let body = br#"{"version":2,"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"cpu",
            "value":1,"unit":"pct","meta":{"nested":[1,2,{"deep":true}]}}],"extra":null}"#;
        assert_eq!(parse(body).unwrap().len(), 1);
    }

    #[test]
    fn rejects_invalid_names() {
        for name in ["", "cpu load", "cpu/load", "日本"] {
            let body =
                format!(r#"{{"metrics":[{{"timestamp":"2025-10-12T15:30:00Z","name":"{name}","value":1}}]}}"#);
            assert!(parse(body.as_bytes()).is_err(), "name {name:?} accepted");
        }
        let long = "a".repeat(MAX_NAME_LEN + 1);
        let body =
            format!(r#"{{"metrics":[{{"timestamp":"2025-10-12T15:30:00Z","name":"{long}","value":1}}]}}"#);
        assert!(parse(body.as_bytes()).is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        for value in ["1e308", "-2e15", "1000000000000001"] {
            let body = format!(
                r#"{{"metrics":[{{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":{value}}}]}}"#
            );
            assert!(parse(body.as_bytes()).is_err(), "value {value} accepted");
        }
        // The boundary itself is accepted.
        let body = br#"{"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":1e15}]}"#;
        assert!(parse(body).is_ok());
    }

    #[test]
    fn nan_is_not_valid_json() {
        let body = br#"{"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":NaN}]}"#;
        assert!(parse(body).is_err());
    }

    #[test]
    fn timestamps_have_no_lower_bound() {
        let body = br#"{"metrics":[{"timestamp":"1900-01-01T00:00:00Z","name":"x","value":1}]}"#;
        assert!(parse(body).is_ok());
    }

    #[test]
    fn rejects_invalid_timestamps() {
        for ts in ["2025-13-40T99:99:99Z", "yesterday", "1760283000"] {
            let body =
                format!(r#"{{"metrics":[{{"timestamp":"{ts}","name":"x","value":1}}]}}"#);
            assert!(parse(body.as_bytes()).is_err(), "timestamp {ts:?} accepted");
        }
    }

    #[test]
    fn enforces_tag_limits() {
        let many: String = (0..=MAX_TAGS)
            .map(|i| format!(r#""k{i}":"v""#))
            .collect::<Vec<_>>()
            .join(",");
        let body = format!(
            r#"{{"metrics":[{{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":1,"tags":{{{many}}}}}]}}"#
        );
        assert!(parse(body.as_bytes()).is_err());

        let long_value = "v".repeat(MAX_TAG_LEN + 1);
        let body = format!(
            r#"{{"metrics":[{{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":1,"tags":{{"k":"{long_value}"}}}}]}}"#
        );
        assert!(parse(body.as_bytes()).is_err());
    }

    #[test]
    fn duplicate_tag_keys_keep_the_last_value() {
        let body = br#"{"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":1,
            "tags":{"k":"first","k":"second"}}]}"#;
        let metrics = parse(body).unwrap();
        assert_eq!(metrics[0].tags["k"], "second");
    }

    #[test]
    fn decodes_string_escapes() {
        let body = r#"{"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":1,
            "tags":{"path":"a\/b\n","emoji":"😀","pair":"\ud83d\ude00","quote":"\"q\""}}]}"#;
        let metrics = parse(body.as_bytes()).unwrap();
        assert_eq!(metrics[0].tags["path"], "a/b\n");
        assert_eq!(metrics[0].tags["emoji"], "\u{1f600}");
        assert_eq!(metrics[0].tags["pair"], "\u{1f600}");
        assert_eq!(metrics[0].tags["quote"], "\"q\"");
    }

    #[test]
    fn unpaired_surrogates_are_rejected() {
        let body = r#"{"metrics":[{"timestamp":"2025-10-12T15:30:00Z","name":"x","value":1,
            "tags":{"k":"\ud83d"}}]}"#;
        assert!(parse(body.as_bytes()).is_err());
    }

    #[test]
    fn error_carries_the_byte_position() {
        let err = parse(b"{\"metrics\": oops}").unwrap_err();
        assert_eq!(err.pos, 12);
    }

    #[test]
    fn deep_nesting_in_skipped_values_is_bounded() {
        let mut body = String::from(r#"{"junk":"#);
        body.push_str(&"[".repeat(500));
        body.push_str(&"]".repeat(500));
        body.push_str(r#","metrics":[]}"#);
        assert!(parse(body.as_bytes()).is_err());
    }

    #[test]
    fn garbage_inputs_error_rather_than_panic() {
        for body in [
            &b""[..],
            b"{",
            b"[]",
            b"{\"metrics\":}",
            b"{\"metrics\":[{]}",
            b"\xff\xfe\x00",
            b"{\"metrics\":[]}trailing",
        ] {
            assert!(parse(body).is_err());
        }
    }
}
