// SUMO Live Data Loop (Rust edition)
// Copyright (C) 2026 the project contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! INI configuration reader: sections `Loop`, `Detector`, `Database`, `PSM`,
//! with `.<region>` shadowing and the absolute/relative date grammar of
//! spec.md §6.
//!
//! Grounded on `original_source/sumo_ldl/setting.py` (`getOption`,
//! `_checkSubOption`, `getOptionDate`); the `ini` crate itself is enriched
//! from `dropbox-dTOOL`'s use of it, since no teacher repo in the pack
//! touches config-file parsing.

use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use ini::Ini;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] ini::Error),
    #[error("missing required option [{section}] {key}")]
    Missing { section: String, key: String },
    #[error("option [{section}] {key} has invalid value {value:?}: {reason}")]
    Invalid { section: String, key: String, value: String, reason: String },
}

/// A loaded INI file plus the active region, implementing the `.<region>`
/// suffix-shadowing rule: `key.region` overrides `key` when present.
pub struct Config {
    ini: Ini,
    region: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>, region: Option<String>) -> Result<Self, Error> {
        let ini = Ini::load_from_file(path.as_ref())?;
        Ok(Config { ini, region })
    }

    fn raw(&self, section: &str, key: &str) -> Option<String> {
        let sec = self.ini.section(Some(section))?;
        if let Some(region) = &self.region {
            if let Some(v) = sec.get(format!("{key}.{region}")) {
                return Some(v.to_string());
            }
        }
        sec.get(key).map(str::to_string)
    }

    pub fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.raw(section, key)
    }

    pub fn require_string(&self, section: &str, key: &str) -> Result<String, Error> {
        self.raw(section, key).ok_or_else(|| Error::Missing { section: section.into(), key: key.into() })
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.raw(section, key)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(default)
    }

    pub fn get_f64(&self, section: &str, key: &str) -> Result<Option<f64>, Error> {
        match self.raw(section, key) {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: std::num::ParseFloatError| Error::Invalid {
                    section: section.into(),
                    key: key.into(),
                    value: v,
                    reason: e.to_string(),
                }),
        }
    }

    /// Minutes options are floating point, per spec.md §6; converted to a
    /// [`Duration`] (sub-second precision truncated).
    pub fn get_minutes(&self, section: &str, key: &str) -> Result<Option<Duration>, Error> {
        Ok(self.get_f64(section, key)?.map(|m| Duration::milliseconds((m * 60_000.0).round() as i64)))
    }

    /// Parses the spec.md §6 date grammar: `YYYY-MM-DD HH:MM` absolute, or
    /// `-H:MM` relative to `now`.
    pub fn get_option_date(&self, section: &str, key: &str, now: NaiveDateTime) -> Result<Option<NaiveDateTime>, Error> {
        let Some(raw) = self.raw(section, key) else { return Ok(None) };
        parse_date(&raw, now)
            .map(Some)
            .map_err(|reason| Error::Invalid { section: section.into(), key: key.into(), value: raw, reason })
    }
}

/// Parses the same absolute/relative grammar as [`Config::get_option_date`],
/// exposed for callers (the CLI's `--begin`/`--end` overrides) that need to
/// parse a raw string outside of an INI file.
pub fn parse_date(raw: &str, now: NaiveDateTime) -> Result<NaiveDateTime, String> {
    let raw = raw.trim();
    if let Some(rel) = raw.strip_prefix('-') {
        let (h, m) = rel.split_once(':').ok_or_else(|| "relative date must be -H:MM".to_string())?;
        let h: i64 = h.parse().map_err(|_| "invalid hour in relative date".to_string())?;
        let m: i64 = m.parse().map_err(|_| "invalid minute in relative date".to_string())?;
        Ok(now - Duration::hours(h) - Duration::minutes(m))
    } else {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 7, 26).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    #[test]
    fn parses_absolute_date() {
        let t = parse_date("2026-07-26 08:30", now()).unwrap();
        assert_eq!(t, NaiveDate::from_ymd_opt(2026, 7, 26).unwrap().and_hms_opt(8, 30, 0).unwrap());
    }

    #[test]
    fn parses_relative_date() {
        let t = parse_date("-1:30", now()).unwrap();
        assert_eq!(t, now() - Duration::hours(1) - Duration::minutes(30));
    }

    #[test]
    fn region_suffix_shadows_base_key() {
        let mut ini = Ini::new();
        ini.with_section(Some("Loop")).set("repeat", "5").set("repeat.leipzig", "10");
        let cfg = Config { ini, region: Some("leipzig".to_string()) };
        assert_eq!(cfg.get_string("Loop", "repeat").as_deref(), Some("10"));

        let cfg_no_region = Config { ini: cfg.ini, region: None };
        assert_eq!(cfg_no_region.get_string("Loop", "repeat").as_deref(), Some("5"));
    }
}
