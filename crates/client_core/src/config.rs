use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use tracing::warn;

pub const SETTINGS_FILE: &str = "analyst.toml";
const ENV_PREFIX: &str = "ANALYST__";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Host the view is served from; decides between local and production origin.
    pub page_host: String,
    pub local_origin: String,
    pub production_origin: String,
    pub report_watchdog: Duration,
    pub connect_timeout: Duration,
    pub offline: bool,
    pub max_steps: Option<u32>,
    pub debate_rounds: Option<u32>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            page_host: "localhost".into(),
            local_origin: "http://localhost:8000".into(),
            production_origin: "https://stock-genie.onrender.com".into(),
            report_watchdog: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            offline: false,
            max_steps: None,
            debate_rounds: None,
        }
    }
}

/// Defaults, then `analyst.toml` in the working directory, then `ANALYST__*` env vars.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if Path::new(SETTINGS_FILE).exists() {
        match read_settings_file(Path::new(SETTINGS_FILE)) {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => warn!("ignoring {SETTINGS_FILE}: {err:#}"),
        }
    }

    apply_overrides(&mut settings, |key| {
        std::env::var(format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())).ok()
    });

    settings
}

fn read_settings_file(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let table: toml::Table = toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;

    Ok(table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

pub fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("page_host") {
        settings.page_host = v;
    }
    if let Some(v) = lookup("local_origin") {
        settings.local_origin = v;
    }
    if let Some(v) = lookup("production_origin") {
        settings.production_origin = v;
    }
    if let Some(secs) = lookup("report_watchdog_secs")
        .and_then(|v| parse_or_warn::<u64>("report_watchdog_secs", &v))
    {
        settings.report_watchdog = Duration::from_secs(secs);
    }
    if let Some(secs) = lookup("connect_timeout_secs")
        .and_then(|v| parse_or_warn::<u64>("connect_timeout_secs", &v))
    {
        settings.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(v) = lookup("offline") {
        settings.offline = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    if let Some(v) = lookup("max_steps").and_then(|v| parse_or_warn::<u32>("max_steps", &v)) {
        settings.max_steps = Some(v);
    }
    if let Some(v) =
        lookup("debate_rounds").and_then(|v| parse_or_warn::<u32>("debate_rounds", &v))
    {
        settings.debate_rounds = Some(v);
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn overrides_replace_only_known_and_parsable_keys() {
        let mut settings = ClientSettings::default();
        let overrides = HashMap::from([
            ("page_host", "analyst.example.com"),
            ("report_watchdog_secs", "45"),
            ("max_steps", "not-a-number"),
            ("offline", "TRUE"),
        ]);
        apply_overrides(&mut settings, |key| overrides.get(key).map(|v| v.to_string()));

        assert_eq!(settings.page_host, "analyst.example.com");
        assert_eq!(settings.report_watchdog, Duration::from_secs(45));
        assert_eq!(settings.max_steps, None);
        assert!(settings.offline);
        assert_eq!(settings.local_origin, ClientSettings::default().local_origin);
    }

    #[test]
    fn settings_file_accepts_strings_and_numbers() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("analyst_settings_{suffix}.toml"));
        fs::write(
            &path,
            "production_origin = \"https://analysis.example.com\"\ndebate_rounds = 3\n",
        )
        .expect("write settings");

        let file_cfg = read_settings_file(&path).expect("parse settings");
        let mut settings = ClientSettings::default();
        apply_overrides(&mut settings, |key| file_cfg.get(key).cloned());

        assert_eq!(settings.production_origin, "https://analysis.example.com");
        assert_eq!(settings.debate_rounds, Some(3));
        fs::remove_file(path).expect("cleanup");
    }
}
