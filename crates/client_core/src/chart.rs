//! Price series extraction for the technical agent and the derived series
//! handed to the plotting sink.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

pub const SMA_WINDOWS: [usize; 3] = [5, 10, 20];

const KLINE_KEYS: [&str; 4] = ["daily_kline", "kline", "daily_prices", "price_data"];
const CLOSE_KEYS: [&str; 2] = ["close", "Close"];
const HIGH_KEYS: [&str; 3] = ["high", "max", "High"];
const LOW_KEYS: [&str; 3] = ["low", "min", "Low"];
const DATE_KEYS: [&str; 2] = ["date", "Date"];

fn embedded_kline() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)["']?daily_kline["']?\s*:\s*(\[.*?\])"#)
            .expect("kline pattern compiles")
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceRecord {
    pub date: Option<String>,
    pub close: f64,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

impl PriceRecord {
    fn from_object(object: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            date: first_field(object, &DATE_KEYS).and_then(|value| match value {
                Value::String(date) => Some(date.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            }),
            close: first_field(object, &CLOSE_KEYS).and_then(as_price)?,
            high: first_field(object, &HIGH_KEYS).and_then(as_price),
            low: first_field(object, &LOW_KEYS).and_then(as_price),
        })
    }
}

fn first_field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn as_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn records_from_array(items: &[Value]) -> Vec<PriceRecord> {
    items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(PriceRecord::from_object)
        .collect()
}

/// Layered extraction: known structured keys first, then a regex over the raw
/// text, then a scan of every array nested anywhere in the tool data.
pub fn extract_price_records(
    tool_data: Option<&Value>,
    raw_text: Option<&str>,
) -> Vec<PriceRecord> {
    if let Some(records) = tool_data.and_then(structured_records) {
        return records;
    }

    let embedded_text = tool_data.and_then(Value::as_str);
    for text in [embedded_text, raw_text].into_iter().flatten() {
        if let Some(records) = regex_records(text) {
            debug!(count = records.len(), "price records recovered from text");
            return records;
        }
    }

    let mut best = Vec::new();
    if let Some(data) = tool_data {
        scan_for_records(data, &mut best);
    }
    if best.is_empty() {
        if let Some(parsed) = raw_text.and_then(|text| serde_json::from_str::<Value>(text).ok()) {
            scan_for_records(&parsed, &mut best);
        }
    }
    best
}

fn structured_records(data: &Value) -> Option<Vec<PriceRecord>> {
    if let Some(items) = data.as_array() {
        let records = records_from_array(items);
        return (!records.is_empty()).then_some(records);
    }
    KLINE_KEYS.iter().find_map(|key| {
        let records = records_from_array(data.get(*key)?.as_array()?);
        (!records.is_empty()).then_some(records)
    })
}

fn regex_records(text: &str) -> Option<Vec<PriceRecord>> {
    let array = embedded_kline().captures(text)?.get(1)?.as_str();
    let parsed = serde_json::from_str::<Value>(array)
        .or_else(|_| serde_json::from_str::<Value>(&python_literal_to_json(array)))
        .ok()?;
    let records = records_from_array(parsed.as_array()?);
    (!records.is_empty()).then_some(records)
}

/// Tool output is sometimes a Python repr rather than JSON.
fn python_literal_to_json(text: &str) -> String {
    text.replace('\'', "\"")
        .replace("None", "null")
        .replace("True", "true")
        .replace("False", "false")
}

fn scan_for_records(value: &Value, best: &mut Vec<PriceRecord>) {
    match value {
        Value::Array(items) => {
            let records = records_from_array(items);
            if records.len() > best.len() {
                *best = records;
            }
            for item in items {
                scan_for_records(item, best);
            }
        }
        Value::Object(object) => {
            for nested in object.values() {
                scan_for_records(nested, best);
            }
        }
        _ => {}
    }
}

/// `None` until the window is full, then the mean of the last `window` values.
pub fn simple_moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let mut averages = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (index, value) in values.iter().enumerate() {
        sum += value;
        if index >= window {
            sum -= values[index - window];
        }
        if index + 1 >= window {
            averages.push(Some(sum / window as f64));
        } else {
            averages.push(None);
        }
    }
    averages
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesStyle {
    Price,
    Band,
    Average,
}

/// One named line for the plotting sink. Gaps are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSeries {
    pub name: String,
    pub style: SeriesStyle,
    pub points: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceChart {
    pub labels: Vec<String>,
    pub close: Vec<f64>,
    pub high: Vec<Option<f64>>,
    pub low: Vec<Option<f64>>,
    pub moving_averages: Vec<(usize, Vec<Option<f64>>)>,
}

impl PriceChart {
    pub fn from_records(records: &[PriceRecord]) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        let close: Vec<f64> = records.iter().map(|record| record.close).collect();
        let labels = records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                record
                    .date
                    .clone()
                    .unwrap_or_else(|| format!("D{}", index + 1))
            })
            .collect();

        Some(Self {
            labels,
            high: records.iter().map(|record| record.high).collect(),
            low: records.iter().map(|record| record.low).collect(),
            moving_averages: SMA_WINDOWS
                .iter()
                .map(|window| (*window, simple_moving_average(&close, *window)))
                .collect(),
            close,
        })
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    pub fn latest_close(&self) -> Option<f64> {
        self.close.last().copied()
    }

    /// Declarative description consumed by the plotting sink.
    pub fn series(&self) -> Vec<ChartSeries> {
        let mut series = vec![
            ChartSeries {
                name: "close".into(),
                style: SeriesStyle::Price,
                points: self.close.iter().copied().map(Some).collect(),
            },
            ChartSeries {
                name: "high".into(),
                style: SeriesStyle::Band,
                points: self.high.clone(),
            },
            ChartSeries {
                name: "low".into(),
                style: SeriesStyle::Band,
                points: self.low.clone(),
            },
        ];
        series.extend(self.moving_averages.iter().map(|(window, points)| ChartSeries {
            name: format!("sma{window}"),
            style: SeriesStyle::Average,
            points: points.clone(),
        }));
        series
    }
}

#[cfg(test)]
#[path = "tests/chart_tests.rs"]
mod tests;
