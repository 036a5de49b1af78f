//! ZFS output parser set (spec §4.4, C4): a tab-separated "machine" parser
//! for `zfs ... -Hp` output and an adaptive-column "human" parser for
//! unparsed tabular `zpool`/`zfs` output, plus shared value converters.
//!
//! Size conversion follows the `K/M/G/T/P` → `KiB/MiB/GiB/TiB/PiB` mashing
//! used by `rollcat-zfs-autosnap`'s `zfs::parse_used`.

use byte_unit::Byte;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::InputError;

/// Values recognized as NULL in machine (`-Hp`) output.
const NULL_TOKENS: &[&str] = &["-", "none"];

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(u64),
    Ratio(f64),
    DateTime(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    Str,
    Int,
    Bool,
    Size,
    Ratio,
    /// `%a %b %e %H:%M %Y`, as emitted by `zfs list -o creation`.
    Date,
}

fn is_null(token: &str) -> bool {
    NULL_TOKENS.contains(&token)
}

/// Size strings: `k/m/g/t/p` suffixes denote binary units (zfs(1) convention).
pub fn parse_size(token: &str) -> Result<u64, InputError> {
    let mashed = match token.chars().last() {
        Some(c) if "KMGTPEZkmgtpez".contains(c) => format!("{token}iB"),
        _ => token.to_string(),
    };
    let byte = Byte::from_str(&mashed)
        .map_err(|e| InputError::ParseError(format!("bad size '{token}': {e}")))?;
    Ok(byte.get_bytes() as u64)
}

/// Ratio strings of the form `1.23x`.
pub fn parse_ratio(token: &str) -> Result<f64, InputError> {
    let digits = token
        .strip_suffix('x')
        .ok_or_else(|| InputError::ParseError(format!("bad ratio '{token}': missing 'x' suffix")))?;
    digits
        .parse()
        .map_err(|_| InputError::ParseError(format!("bad ratio '{token}'")))
}

pub fn parse_bool(token: &str) -> Result<bool, InputError> {
    match token {
        "yes" | "on" | "active" | "enabled" => Ok(true),
        "no" | "off" | "inactive" | "disabled" => Ok(false),
        _ => Err(InputError::ParseError(format!("bad boolean '{token}'"))),
    }
}

pub fn parse_int(token: &str) -> Result<i64, InputError> {
    if let Ok(n) = token.parse() {
        return Ok(n);
    }
    // Integer columns sometimes carry boolean-shaped values (e.g. a
    // `quota`-like column reporting "none"/"-"): fall back for robustness.
    parse_bool(token).map(|b| b as i64)
}

pub fn parse_date(token: &str) -> Result<DateTime<Utc>, InputError> {
    NaiveDateTime::parse_from_str(token, "%a %b %e %H:%M %Y")
        .map(|naive| naive.and_utc())
        .map_err(|e| InputError::ParseError(format!("bad date '{token}': {e}")))
}

fn convert(token: &str, converter: Converter) -> Result<Value, InputError> {
    if is_null(token) {
        return Ok(Value::Null);
    }
    Ok(match converter {
        Converter::Str => Value::Str(token.to_string()),
        Converter::Int => Value::Int(parse_int(token)?),
        Converter::Bool => Value::Bool(parse_bool(token)?),
        Converter::Size => Value::Bytes(parse_size(token)?),
        Converter::Ratio => Value::Ratio(parse_ratio(token)?),
        Converter::Date => Value::DateTime(parse_date(token)?),
    })
}

/// Parses `zfs ... -H` (tab-separated, no header) output against a fixed
/// `(name, converter)` schema.
pub struct MachineParser {
    schema: Vec<(String, Converter)>,
}

impl MachineParser {
    pub fn new(schema: Vec<(&str, Converter)>) -> Self {
        MachineParser {
            schema: schema.into_iter().map(|(n, c)| (n.to_string(), c)).collect(),
        }
    }

    /// One `Vec<(column_name, Value)>` per non-empty input line.
    pub fn parse(&self, output: &str) -> Result<Vec<Vec<(String, Value)>>, InputError> {
        let mut rows = Vec::new();
        for line in output.lines().filter(|l| !l.is_empty()) {
            let tokens: Vec<&str> = line.split('\t').collect();
            if tokens.len() != self.schema.len() {
                return Err(InputError::ParseError(format!(
                    "expected {} columns, got {} in line '{line}'",
                    self.schema.len(),
                    tokens.len()
                )));
            }
            let mut row = Vec::with_capacity(tokens.len());
            for (token, (name, converter)) in tokens.iter().zip(self.schema.iter()) {
                row.push((name.clone(), convert(token, *converter)?));
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// A learned column: its header name, converter, and the absolute character
/// offset at which the *next* column begins (used to detect NULLs and
/// multi-token spans).
#[derive(Debug, Clone)]
struct HumanColumn {
    name: String,
    converter: Converter,
    start: usize,
}

/// Adaptive-column ("human"-readable, whitespace-aligned) parser: the schema
/// is learned from a header line, and each data line is re-split at the
/// header's measured column offsets rather than on naive whitespace, so that
/// multi-token columns (e.g. dates) and embedded spaces survive.
pub struct HumanParser {
    columns: Vec<HumanColumn>,
}

impl HumanParser {
    /// `header` is the first line of `zfs`/`zpool` tabular output;
    /// `type_map` supplies the converter for each header name in order.
    pub fn from_header(header: &str, type_map: &[(&str, Converter)]) -> Self {
        let mut columns = Vec::new();
        let mut search_from = 0usize;
        for (name, converter) in type_map {
            let start = header[search_from..]
                .find(name)
                .map(|i| i + search_from)
                .unwrap_or(search_from);
            columns.push(HumanColumn {
                name: name.to_string(),
                converter: *converter,
                start,
            });
            search_from = start + name.len();
        }
        HumanParser { columns }
    }

    /// Parses one data line using the learned column boundaries. A value
    /// that begins at or past the next column's offset denotes NULL for the
    /// current column, and the cursor resets to that boundary.
    pub fn parse_line(&self, line: &str) -> Result<Vec<(String, Value)>, InputError> {
        let bytes = line.as_bytes();
        let len = bytes.len();
        let mut out = Vec::with_capacity(self.columns.len());
        let mut cursor = 0usize;

        for (i, col) in self.columns.iter().enumerate() {
            let next_start = self.columns.get(i + 1).map(|c| c.start).unwrap_or(len);
            if cursor >= next_start.min(len) {
                out.push((col.name.clone(), Value::Null));
                cursor = next_start.min(len);
                continue;
            }
            let segment = &line[cursor.min(len)..next_start.min(len)];
            let token = segment.trim();
            if token.is_empty() {
                out.push((col.name.clone(), Value::Null));
            } else {
                out.push((col.name.clone(), convert(token, col.converter)?));
            }
            cursor = next_start.min(len);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_parser_columns_and_nulls() {
        let parser = MachineParser::new(vec![
            ("name", Converter::Str),
            ("used", Converter::Size),
            ("quota", Converter::Size),
            ("compression", Converter::Str),
        ]);
        let rows = parser.parse("tank/fs\t1.5G\t-\tlz4\n").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].1, Value::Str("tank/fs".into()));
        assert_eq!(rows[0][2].1, Value::Null);
        assert!(matches!(rows[0][1].1, Value::Bytes(_)));
    }

    #[test]
    fn machine_parser_rejects_wrong_column_count() {
        let parser = MachineParser::new(vec![("name", Converter::Str), ("used", Converter::Size)]);
        assert!(parser.parse("tank/fs\t1G\textra\n").is_err());
    }

    #[test]
    fn size_mashing_matches_zfs_binary_convention() {
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
    }

    #[test]
    fn ratio_and_bool_converters() {
        assert_eq!(parse_ratio("1.30x").unwrap(), 1.30);
        assert!(parse_bool("on").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_ratio("1.30").is_err());
    }

    #[test]
    fn human_parser_learns_offsets_and_detects_null() {
        let header = "NAME                 USED  AVAIL";
        let parser = HumanParser::from_header(
            header,
            &[("NAME", Converter::Str), ("USED", Converter::Size), ("AVAIL", Converter::Size)],
        );
        let line = "tank/fs              1.5G  -";
        let row = parser.parse_line(line).unwrap();
        assert_eq!(row[0].1, Value::Str("tank/fs".into()));
        assert_eq!(row[2].1, Value::Null);
    }
}
