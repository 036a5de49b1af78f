//! Report Engine (spec §4.6, C6): an in-memory tabular report with typed
//! columns, reducers, and CSV/TTY serialization, grounded in
//! `original_source/src/python/bit/reports/base.py`'s `Report`/`Table`.

use std::fmt;

/// A single cell value. `Report` keeps values plain and defers formatting
/// to each column's formatter, matching the reference `Report.serialize`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A running binary reduction over a column's values (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Sum,
    Average,
    /// Distinct-string count; the aggregate cell renders as `#N`.
    Distinct,
}

impl Reducer {
    fn fold(&self, values: &[Value]) -> Value {
        match self {
            Reducer::Sum => {
                if values.iter().all(|v| matches!(v, Value::Int(_))) {
                    Value::Int(values.iter().map(|v| match v {
                        Value::Int(i) => *i,
                        _ => 0,
                    }).sum())
                } else {
                    Value::Float(values.iter().map(Self::as_f64).sum())
                }
            }
            Reducer::Average => {
                let sum: f64 = values.iter().map(Self::as_f64).sum();
                let avg = if values.is_empty() { 0.0 } else { sum / values.len() as f64 };
                Value::Float(avg)
            }
            Reducer::Distinct => {
                let mut seen = std::collections::BTreeSet::new();
                for v in values {
                    seen.insert(v.to_string());
                }
                Value::Str(format!("#{}", seen.len()))
            }
        }
    }

    fn as_f64(v: &Value) -> f64 {
        match v {
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Str(s) => s.parse().unwrap_or(0.0),
        }
    }
}

/// A column: name, and optionally a reducer used to synthesize the
/// aggregate row (spec §4.6).
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub reducer: Option<Reducer>,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            reducer: None,
        }
    }

    pub fn with_reducer(name: impl Into<String>, reducer: Reducer) -> Column {
        Column {
            name: name.into(),
            reducer: Some(reducer),
        }
    }
}

pub enum SerializeMode {
    Csv,
    Tty,
}

/// A schema of columns plus records; serializes to CSV or TTY (spec §4.6).
#[derive(Debug, Clone)]
pub struct Report {
    pub columns: Vec<Column>,
    pub records: Vec<Vec<Value>>,
}

impl Report {
    pub fn new(columns: Vec<Column>) -> Report {
        Report {
            columns,
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: Vec<Value>) {
        assert_eq!(record.len(), self.columns.len(), "record arity must match column schema");
        self.records.push(record);
    }

    /// Appends a final row folding every reduced column over all current
    /// records; a no-op on an empty report (spec §4.6 Aggregate row).
    pub fn append_aggregate_row(&mut self) {
        if self.records.is_empty() {
            return;
        }
        let mut agg = Vec::with_capacity(self.columns.len());
        for (ci, col) in self.columns.iter().enumerate() {
            match col.reducer {
                Some(reducer) => {
                    let values: Vec<Value> = self.records.iter().map(|r| r[ci].clone()).collect();
                    agg.push(reducer.fold(&values));
                }
                None => agg.push(Value::Str(String::new())),
            }
        }
        self.records.push(agg);
    }

    /// CSV: semicolon-separated; TTY: space-padded columns sized to the
    /// widest formatted value or header (spec §4.6). Reports never raise on
    /// missing data (spec §7): an empty report serializes to nothing, the
    /// caller is expected to print an informational "No records found" row.
    pub fn serialize(&self, mode: SerializeMode, column_names: bool) -> String {
        if self.is_empty() {
            return String::new();
        }
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        let mut out = String::new();

        match mode {
            SerializeMode::Csv => {
                if column_names {
                    out.push_str(&names.join(";"));
                    out.push('\n');
                }
                for rec in &self.records {
                    let row: Vec<String> = rec.iter().map(|v| v.to_string()).collect();
                    out.push_str(&row.join(";"));
                    out.push('\n');
                }
            }
            SerializeMode::Tty => {
                let mut widths: Vec<usize> = names.iter().map(|n| n.len()).collect();
                for rec in &self.records {
                    for (i, v) in rec.iter().enumerate() {
                        widths[i] = widths[i].max(v.to_string().len());
                    }
                }
                let last = names.len().saturating_sub(1);
                if column_names {
                    for (i, name) in names.iter().enumerate() {
                        Self::write_col(&mut out, i, &name.to_uppercase(), widths[i], last);
                    }
                }
                for rec in &self.records {
                    for (i, v) in rec.iter().enumerate() {
                        Self::write_col(&mut out, i, &v.to_string(), widths[i], last);
                    }
                }
            }
        }
        out
    }

    fn write_col(out: &mut String, ci: usize, s: &str, width: usize, last: usize) {
        if ci > 0 {
            out.push_str("  ");
        }
        out.push_str(s);
        if ci == last {
            out.push('\n');
        } else {
            out.push_str(&" ".repeat(width.saturating_sub(s.len())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> Report {
        let mut r = Report::new(vec![
            Column::new("host"),
            Column::with_reducer("free", Reducer::Sum),
        ]);
        r.push(vec![Value::Str("h1".into()), Value::Int(10)]);
        r.push(vec![Value::Str("h2".into()), Value::Int(20)]);
        r
    }

    #[test]
    fn csv_serialization() {
        let r = sample_report();
        let csv = r.serialize(SerializeMode::Csv, true);
        assert_eq!(csv, "host;free\nh1;10\nh2;20\n");
    }

    #[test]
    fn tty_columns_padded_to_widest_value() {
        let r = sample_report();
        let tty = r.serialize(SerializeMode::Tty, true);
        assert!(tty.starts_with("HOST  FREE\n"));
    }

    #[test]
    fn aggregate_row_sums_reduced_columns_and_skips_plain_ones() {
        let mut r = sample_report();
        r.append_aggregate_row();
        assert_eq!(r.records.last().unwrap()[1], Value::Int(30));
    }

    #[test]
    fn aggregate_skipped_on_empty_report() {
        let mut r = Report::new(vec![Column::with_reducer("n", Reducer::Sum)]);
        r.append_aggregate_row();
        assert!(r.records.is_empty());
    }

    #[test]
    fn distinct_reducer_counts_unique_strings() {
        let mut r = Report::new(vec![Column::with_reducer("host", Reducer::Distinct)]);
        r.push(vec![Value::Str("h1".into())]);
        r.push(vec![Value::Str("h1".into())]);
        r.push(vec![Value::Str("h2".into())]);
        r.append_aggregate_row();
        assert_eq!(r.records.last().unwrap()[0], Value::Str("#2".into()));
    }

    #[test]
    fn empty_report_serializes_to_nothing() {
        let r = Report::new(vec![Column::new("host")]);
        assert_eq!(r.serialize(SerializeMode::Csv, true), "");
    }
}
