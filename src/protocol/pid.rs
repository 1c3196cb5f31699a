//! Mode 01 reply parsing and the PID decoder registry.
//!
//! Replies arrive as ASCII hex lines such as `41 0C 1A F8\r\r>`. The first
//! token acknowledges Mode 01 (`41`), the second names the PID and the rest
//! are the data bytes. Anything that does not fit that shape, including
//! adapter chatter like `OK`, `SEARCHING...` or `NO DATA`, yields no metric.

use std::collections::HashMap;
use tracing::trace;

/// First token of every positive Mode 01 reply.
pub const MODE_01_ACK: &str = "41";

/// Prompt the adapter prints when it is ready for the next command.
pub const PROMPT: char = '>';

/// Engine RPM.
pub const ENGINE_RPM: u8 = 0x0C;
/// Vehicle speed.
pub const VEHICLE_SPEED: u8 = 0x0D;
/// Throttle position.
pub const THROTTLE_POSITION: u8 = 0x11;
/// Fuel tank level input.
pub const FUEL_TANK_LEVEL: u8 = 0x2F;

/// A decoded metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedMetric {
    /// PID the reply carried.
    pub pid: u8,
    /// Metric name, the key in the telemetry store.
    pub name: &'static str,
    /// Decoded value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: &'static str,
}

/// Decode formula over the data bytes of a reply.
pub type DecodeFn = fn(&[u8]) -> Option<f64>;

/// How to turn the data bytes of one PID into a metric.
#[derive(Debug, Clone, Copy)]
pub struct PidDecoder {
    /// Metric name.
    pub name: &'static str,
    /// Unit of the decoded value.
    pub unit: &'static str,
    /// Minimum number of data bytes the formula reads.
    pub data_bytes: usize,
    decode: DecodeFn,
}

impl PidDecoder {
    /// Create a decoder.
    pub const fn new(
        name: &'static str,
        unit: &'static str,
        data_bytes: usize,
        decode: DecodeFn,
    ) -> Self {
        Self {
            name,
            unit,
            data_bytes,
            decode,
        }
    }

    /// Decode the data bytes, or `None` if there are too few of them.
    pub fn decode(&self, data: &[u8]) -> Option<f64> {
        if data.len() < self.data_bytes {
            return None;
        }
        (self.decode)(data).filter(|value| value.is_finite())
    }
}

fn engine_rpm(data: &[u8]) -> Option<f64> {
    match data {
        [a, b, ..] => Some((*a as f64 * 256.0 + *b as f64) / 4.0),
        _ => None,
    }
}

fn single_byte(data: &[u8]) -> Option<f64> {
    data.first().map(|a| *a as f64)
}

fn percentage(data: &[u8]) -> Option<f64> {
    data.first().map(|a| *a as f64 * 100.0 / 255.0)
}

/// Maps PIDs to decoders.
///
/// Supporting another PID means registering a decoder here; the polling
/// scheduler only deals in command strings.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<u8, PidDecoder>,
}

impl DecoderRegistry {
    /// A registry with no decoders.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// A registry with the four standard PIDs.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(
            ENGINE_RPM,
            PidDecoder::new("Engine RPM", "rpm", 2, engine_rpm),
        );
        registry.register(
            VEHICLE_SPEED,
            PidDecoder::new("Vehicle Speed", "km/h", 1, single_byte),
        );
        registry.register(
            THROTTLE_POSITION,
            PidDecoder::new("Throttle Position", "%", 1, percentage),
        );
        registry.register(
            FUEL_TANK_LEVEL,
            PidDecoder::new("Fuel Tank Level", "%", 1, percentage),
        );
        registry
    }

    /// Register a decoder, returning the one it replaces.
    pub fn register(&mut self, pid: u8, decoder: PidDecoder) -> Option<PidDecoder> {
        self.decoders.insert(pid, decoder)
    }

    /// Get the decoder for a PID.
    pub fn get(&self, pid: u8) -> Option<&PidDecoder> {
        self.decoders.get(&pid)
    }

    /// Check whether a PID has a decoder.
    pub fn supports(&self, pid: u8) -> bool {
        self.decoders.contains_key(&pid)
    }

    /// Number of registered decoders.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Check whether no decoders are registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Parse one reply line.
    ///
    /// Returns `None` for anything that is not a well-formed Mode 01 reply
    /// for a registered PID. Never panics.
    pub fn parse_reply(&self, line: &str) -> Option<ParsedMetric> {
        let tokens = normalize(line);
        if tokens.len() < 3 || tokens[0] != MODE_01_ACK {
            return None;
        }

        let pid = hex_byte(tokens[1])?;
        let Some(decoder) = self.decoders.get(&pid) else {
            trace!("No decoder for PID {:02X}", pid);
            return None;
        };

        let data = tokens[2..]
            .iter()
            .map(|token| hex_byte(token))
            .collect::<Option<Vec<u8>>>()?;

        let value = decoder.decode(&data)?;

        Some(ParsedMetric {
            pid,
            name: decoder.name,
            value,
            unit: decoder.unit,
        })
    }

    /// Parse a raw notification payload.
    ///
    /// A payload can carry several lines; each is parsed on its own.
    /// Non-UTF-8 bytes are replaced rather than rejected.
    pub fn parse_notification(&self, payload: &[u8]) -> Vec<ParsedMetric> {
        self.parse_lines(&String::from_utf8_lossy(payload))
    }

    /// Parse text that may hold several CR or LF separated replies.
    pub fn parse_lines(&self, text: &str) -> Vec<ParsedMetric> {
        text.split(['\r', '\n'])
            .filter_map(|line| self.parse_reply(line))
            .collect()
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Strip framing and the prompt from a reply line and split it into tokens.
pub fn normalize(line: &str) -> Vec<&str> {
    line.trim_matches(|c: char| c.is_whitespace() || c == '\0' || c == PROMPT)
        .split_whitespace()
        .collect()
}

/// Parse exactly two hex digits.
fn hex_byte(token: &str) -> Option<u8> {
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(token, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse(line: &str) -> Option<ParsedMetric> {
        DecoderRegistry::standard().parse_reply(line)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_engine_rpm() {
        let metric = parse("41 0C 1A F8").unwrap();
        assert_eq!(metric.pid, ENGINE_RPM);
        assert_eq!(metric.name, "Engine RPM");
        assert_eq!(metric.unit, "rpm");
        assert_close(metric.value, 1726.0);
    }

    #[test]
    fn test_vehicle_speed() {
        let metric = parse("41 0D 3C").unwrap();
        assert_eq!(metric.name, "Vehicle Speed");
        assert_eq!(metric.unit, "km/h");
        assert_close(metric.value, 60.0);
    }

    #[test]
    fn test_throttle_position() {
        let metric = parse("41 11 FF").unwrap();
        assert_eq!(metric.name, "Throttle Position");
        assert_eq!(metric.unit, "%");
        assert_close(metric.value, 100.0);

        let metric = parse("41 11 80").unwrap();
        assert_close(metric.value, 128.0 * 100.0 / 255.0);
    }

    #[test]
    fn test_fuel_tank_level() {
        let metric = parse("41 2F 40").unwrap();
        assert_eq!(metric.name, "Fuel Tank Level");
        assert_eq!(metric.unit, "%");
        assert_close(metric.value, 64.0 * 100.0 / 255.0);
    }

    #[test]
    fn test_framing_and_prompt_are_stripped() {
        assert_close(parse("41 0C 1A F8 \r\r>").unwrap().value, 1726.0);
        assert_close(parse(">41 0D 3C\r").unwrap().value, 60.0);
        assert_close(parse("\0 41 0D 3C \n").unwrap().value, 60.0);
    }

    #[test]
    fn test_lowercase_reply() {
        assert_close(parse("41 0c 1a f8").unwrap().value, 1726.0);
    }

    #[test]
    fn test_extra_data_bytes_are_ignored() {
        assert_close(parse("41 0D 3C 00 00").unwrap().value, 60.0);
    }

    #[test]
    fn test_not_a_mode_01_reply() {
        assert_eq!(parse("7F 01 12"), None);
        assert_eq!(parse("42 0C 1A F8"), None);
        assert_eq!(parse("OK"), None);
        assert_eq!(parse("SEARCHING..."), None);
        assert_eq!(parse("NO DATA"), None);
        assert_eq!(parse(">"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn test_too_few_tokens() {
        assert_eq!(parse("41 0C"), None);
        assert_eq!(parse("41"), None);
    }

    #[test]
    fn test_unknown_pid() {
        assert_eq!(parse("41 05 7B"), None);
    }

    #[test]
    fn test_malformed_data() {
        // Partial fragment: RPM needs two data bytes.
        assert_eq!(parse("41 0C 1A"), None);
        assert_eq!(parse("41 0C 1A ZZ"), None);
        assert_eq!(parse("41 0C 1AF8"), None);
        assert_eq!(parse("41 0D +1"), None);
        // Compact replies are not tokenized.
        assert_eq!(parse("410C1AF8"), None);
    }

    #[test]
    fn test_parse_notification_with_several_lines() {
        let registry = DecoderRegistry::standard();
        let metrics = registry.parse_notification(b"41 0C 1A F8\r41 0D 3C\r\r>");
        let names: Vec<_> = metrics.iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["Engine RPM", "Vehicle Speed"]);
    }

    #[test]
    fn test_parse_lines_skips_chatter() {
        let registry = DecoderRegistry::standard();
        let metrics = registry.parse_lines("SEARCHING...\n41 11 FF\nNO DATA\n");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].pid, THROTTLE_POSITION);
    }

    #[test]
    fn test_parse_notification_invalid_utf8() {
        let registry = DecoderRegistry::standard();
        assert!(registry.parse_notification(&[0xFF, 0xFE, b'4', b'1']).is_empty());
    }

    #[test]
    fn test_register_custom_decoder() {
        fn coolant(data: &[u8]) -> Option<f64> {
            data.first().map(|a| *a as f64 - 40.0)
        }

        let mut registry = DecoderRegistry::standard();
        assert!(!registry.supports(0x05));
        assert!(registry
            .register(0x05, PidDecoder::new("Coolant Temperature", "°C", 1, coolant))
            .is_none());
        assert_eq!(registry.len(), 5);

        let metric = registry.parse_reply("41 05 7B").unwrap();
        assert_eq!(metric.name, "Coolant Temperature");
        assert_close(metric.value, 83.0);
    }

    #[test]
    fn test_empty_registry() {
        let registry = DecoderRegistry::empty();
        assert!(registry.is_empty());
        assert_eq!(registry.parse_reply("41 0C 1A F8"), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(" 41 0C  1A F8 \r\r>"), vec!["41", "0C", "1A", "F8"]);
        assert!(normalize("\r\n>").is_empty());
    }

    proptest! {
        #[test]
        fn parse_reply_never_panics(line in ".*") {
            let _ = DecoderRegistry::standard().parse_reply(&line);
        }

        #[test]
        fn parse_notification_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = DecoderRegistry::standard().parse_notification(&payload);
        }

        #[test]
        fn rpm_matches_formula(a in any::<u8>(), b in any::<u8>()) {
            let line = format!("41 0C {:02X} {:02X}", a, b);
            let metric = DecoderRegistry::standard().parse_reply(&line).unwrap();
            prop_assert!((metric.value - (a as f64 * 256.0 + b as f64) / 4.0).abs() < 1e-9);
        }
    }
}
