mod fields;

pub use fields::FieldId;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use fields::ValueKind;
use thiserror::Error;

/// Upper bound for a single framed telegram; anything larger is line noise.
const MAX_TELEGRAM_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("telegram has no '/' header line")]
    MissingHeader,
    #[error("telegram has no '!' footer line")]
    MissingFooter,
    #[error("telegram footer carries no checksum")]
    MissingChecksum,
    #[error("telegram checksum mismatch (expected {expected:04X}, computed {computed:04X})")]
    ChecksumMismatch { expected: u16, computed: u16 },
    #[error("invalid value {raw:?} for {field}")]
    InvalidValue { field: FieldId, raw: String },
    #[error("invalid timestamp {raw:?} for {field}")]
    InvalidTimestamp { field: FieldId, raw: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Number { value: f64, unit: Option<String> },
    Timestamp(DateTime<FixedOffset>),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Number { .. } => "number",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Text(_) => "text",
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Number {
                value,
                unit: Some(unit),
            } => write!(f, "{value} {unit}"),
            FieldValue::Number { value, unit: None } => write!(f, "{value}"),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            FieldValue::Text(text) => f.write_str(text),
        }
    }
}

/// One decoded read cycle, fields in the order the meter sent them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Telegram {
    fields: Vec<(FieldId, FieldValue)>,
}

impl Telegram {
    #[cfg(test)]
    pub fn from_fields(fields: Vec<(FieldId, FieldValue)>) -> Self {
        Self { fields }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &FieldValue)> {
        self.fields.iter().map(|(id, value)| (*id, value))
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| *field == id)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Decodes a `\r\n` terminated DSMR telegram. Lines with OBIS references the
/// daemon does not know are skipped.
pub fn decode(text: &str, validate_checksum: bool) -> Result<Telegram, DecodeError> {
    let start = text.find('/').ok_or(DecodeError::MissingHeader)?;
    let footer = text[start..]
        .find('!')
        .map(|offset| start + offset)
        .ok_or(DecodeError::MissingFooter)?;

    if validate_checksum {
        let digits: String = text[footer + 1..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        if digits.len() != 4 {
            return Err(DecodeError::MissingChecksum);
        }
        let expected =
            u16::from_str_radix(&digits, 16).map_err(|_| DecodeError::MissingChecksum)?;
        let computed = crc16(&text.as_bytes()[start..=footer]);
        if expected != computed {
            return Err(DecodeError::ChecksumMismatch { expected, computed });
        }
    }

    let mut fields = Vec::new();
    for line in text[start..footer].lines().skip(1) {
        let line = line.trim();
        let Some(open) = line.find('(') else {
            continue;
        };
        let Some(field) = FieldId::from_obis(&line[..open]) else {
            tracing::trace!(line, "skipping unknown telegram line");
            continue;
        };
        let groups = value_groups(&line[open..]);
        fields.push((field, decode_value(field, &groups)?));
    }

    Ok(Telegram { fields })
}

fn value_groups(rest: &str) -> Vec<&str> {
    rest.split(')')
        .filter_map(|chunk| chunk.trim().strip_prefix('('))
        .collect()
}

fn decode_value(field: FieldId, groups: &[&str]) -> Result<FieldValue, DecodeError> {
    let raw = match field.kind() {
        ValueKind::StampedNumber => groups.last(),
        _ => groups.first(),
    }
    .copied()
    .unwrap_or_default();

    match field.kind() {
        ValueKind::Number | ValueKind::StampedNumber => {
            let (number, unit) = match raw.split_once('*') {
                Some((number, unit)) => (number, Some(unit.to_string())),
                None => (raw, None),
            };
            let value = number
                .trim()
                .parse::<f64>()
                .map_err(|_| DecodeError::InvalidValue {
                    field,
                    raw: raw.to_string(),
                })?;
            Ok(FieldValue::Number { value, unit })
        }
        ValueKind::Timestamp => parse_dsmr_timestamp(raw)
            .map(FieldValue::Timestamp)
            .ok_or_else(|| DecodeError::InvalidTimestamp {
                field,
                raw: raw.to_string(),
            }),
        ValueKind::Text => Ok(FieldValue::Text(raw.to_string())),
    }
}

/// `YYMMDDhhmmssX` where X is `S` (summer, UTC+2) or `W` (winter, UTC+1).
pub fn parse_dsmr_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    if raw.len() != 13 || !raw.is_ascii() {
        return None;
    }
    let (stamp, season) = raw.split_at(12);
    let offset_hours = match season {
        "S" => 2,
        "W" => 1,
        _ => return None,
    };
    let naive = NaiveDateTime::parse_from_str(stamp, "%y%m%d%H%M%S").ok()?;
    let offset = FixedOffset::east_opt(offset_hours * 3600)?;
    naive.and_local_timezone(offset).single()
}

/// CRC16/ARC, as used by DSMR 4+ telegram footers.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Reassembles telegrams from a line-oriented byte stream.
#[derive(Debug, Default)]
pub struct TelegramFramer {
    buffer: String,
    in_telegram: bool,
}

impl TelegramFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (including its terminator). Returns the full telegram
    /// text once the footer line arrives.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        if line.starts_with('/') {
            if self.in_telegram {
                tracing::debug!(
                    discarded = self.buffer.len(),
                    "telegram header before footer; restarting frame"
                );
            }
            self.buffer.clear();
            self.in_telegram = true;
        }
        if !self.in_telegram {
            return None;
        }

        self.buffer.push_str(line);
        if line.starts_with('!') {
            self.in_telegram = false;
            return Some(std::mem::take(&mut self.buffer));
        }
        if self.buffer.len() > MAX_TELEGRAM_BYTES {
            tracing::warn!(bytes = self.buffer.len(), "oversized telegram frame discarded");
            self.buffer.clear();
            self.in_telegram = false;
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) const SAMPLE_TELEGRAM: &str = concat!(
        "/ISK5\\2M550T-1012\r\n",
        "\r\n",
        "1-3:0.2.8(50)\r\n",
        "0-0:1.0.0(230615120500S)\r\n",
        "0-0:96.1.1(4530303434303037313331363530363138)\r\n",
        "1-0:1.8.1(001581.123*kWh)\r\n",
        "1-0:1.8.2(001435.706*kWh)\r\n",
        "1-0:2.8.1(000000.000*kWh)\r\n",
        "1-0:2.8.2(000000.000*kWh)\r\n",
        "0-0:96.14.0(0002)\r\n",
        "1-0:1.7.0(02.793*kW)\r\n",
        "1-0:2.7.0(00.000*kW)\r\n",
        "0-0:96.7.21(00015)\r\n",
        "0-0:96.7.9(00007)\r\n",
        "1-0:99.97.0(1)(0-0:96.7.19)(000104180320W)(0000237126*s)\r\n",
        "1-0:32.7.0(229.0*V)\r\n",
        "1-0:31.7.0(012*A)\r\n",
        "1-0:21.7.0(02.793*kW)\r\n",
        "1-0:22.7.0(00.000*kW)\r\n",
        "0-1:24.1.0(003)\r\n",
        "0-1:24.2.1(230615120000S)(04872.561*m3)\r\n",
        "!0281\r\n",
    );

    #[test]
    fn decodes_sample_telegram_with_checksum() {
        let telegram = decode(SAMPLE_TELEGRAM, true).expect("decoded");

        assert_eq!(
            telegram
                .get(FieldId::CurrentElectricityUsage)
                .and_then(FieldValue::as_number),
            Some(2.793)
        );
        assert_eq!(
            telegram.get(FieldId::ElectricityUsedTariff1),
            Some(&FieldValue::Number {
                value: 1581.123,
                unit: Some("kWh".to_string())
            })
        );
        assert_eq!(
            telegram
                .get(FieldId::HourlyGasMeterReading)
                .and_then(FieldValue::as_number),
            Some(4872.561)
        );
        assert_eq!(
            telegram
                .get(FieldId::LongPowerFailureCount)
                .and_then(FieldValue::as_number),
            Some(7.0)
        );
        let expected = FixedOffset::east_opt(7200)
            .unwrap()
            .with_ymd_and_hms(2023, 6, 15, 12, 5, 0)
            .unwrap();
        assert_eq!(
            telegram.get(FieldId::P1MessageTimestamp),
            Some(&FieldValue::Timestamp(expected))
        );
        // 99.97.0 and 24.1.0 are not tracked
        assert_eq!(telegram.len(), 17);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let corrupted = SAMPLE_TELEGRAM.replace("(229.0*V)", "(239.0*V)");
        match decode(&corrupted, true) {
            Err(DecodeError::ChecksumMismatch { expected, .. }) => assert_eq!(expected, 0x0281),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(decode(&corrupted, false).is_ok());
    }

    #[test]
    fn rejects_unparsable_number() {
        let broken = SAMPLE_TELEGRAM.replace("(02.793*kW)\r\n1-0:2.7.0", "(x.yz*kW)\r\n1-0:2.7.0");
        assert!(matches!(
            decode(&broken, false),
            Err(DecodeError::InvalidValue {
                field: FieldId::CurrentElectricityUsage,
                ..
            })
        ));
    }

    #[test]
    fn parses_winter_timestamps() {
        let ts = parse_dsmr_timestamp("231224235959W").expect("parsed");
        assert_eq!(ts.offset().local_minus_utc(), 3600);
        assert_eq!(ts.timestamp(), 1_703_458_799);
        assert!(parse_dsmr_timestamp("231224235959").is_none());
        assert!(parse_dsmr_timestamp("231324235959W").is_none());
    }

    #[test]
    fn framer_emits_complete_telegrams_only() {
        let mut framer = TelegramFramer::new();
        assert_eq!(framer.push_line("1-0:1.7.0(02.793*kW)\r\n"), None);

        let mut framed = None;
        for line in SAMPLE_TELEGRAM.split_inclusive("\r\n") {
            if let Some(text) = framer.push_line(line) {
                framed = Some(text);
            }
        }
        assert_eq!(framed.as_deref(), Some(SAMPLE_TELEGRAM));
    }

    #[test]
    fn framer_restarts_on_new_header() {
        let mut framer = TelegramFramer::new();
        framer.push_line("/XMX5LGBBFG1009\r\n");
        framer.push_line("1-0:1.8.1(000001.000*kWh)\r\n");
        framer.push_line("/ISK5\\2M550T-1012\r\n");
        let text = framer.push_line("!ABCD\r\n").expect("frame");
        assert!(text.starts_with("/ISK5"));
        assert!(!text.contains("000001.000"));
    }
}
