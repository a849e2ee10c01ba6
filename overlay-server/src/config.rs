// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    env,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::Context;
use lazy_static::lazy_static;
use tracing::warn;

use crate::hud::{Cell, HudTable, MetricRef, Rgba};

lazy_static! {
    static ref DEFAULT_CFG: parsed::Config =
        serde_yaml::from_str(include_str!("../mangohud.default.yml")).unwrap();
}

/// Serde representation of MangoHud.yml.
mod parsed {
    use converge::Converge;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct Config {
        pub(super) hud_table: Option<HudTableCfg>,
        #[converge(nest)]
        pub(super) options: Option<OptionsCfg>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct HudTableCfg {
        pub(super) cols: Option<usize>,
        pub(super) rows: Vec<Vec<ParsedCell>>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    pub(super) struct OptionsCfg {
        pub(super) font_size: Option<u32>,
        pub(super) fps_limit: Option<f32>,
        /// Anything not in the recognized-option registry above. Logged and
        /// ignored rather than rejecting the whole document.
        #[serde(flatten)]
        pub(super) unrecognized: std::collections::HashMap<String, serde_yaml::Value>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct ParsedMetricRef {
        pub(super) group: String,
        pub(super) name: String,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct ParsedGraph {
        pub(super) min: f32,
        pub(super) max: f32,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub(super) struct ParsedCell {
        pub(super) text: Option<String>,
        pub(super) metric: Option<ParsedMetricRef>,
        pub(super) unit: Option<String>,
        pub(super) graph: Option<ParsedGraph>,
        pub(super) precision: Option<u8>,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub hud_table: HudTable,
    pub font_size: u32,
    pub fps_limit: f32,
    signature: Option<StatSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StatSignature {
    len: u64,
    mtime_sec: i64,
    mtime_nsec: i64,
}

impl Config {
    /// Loads the config file from `$XDG_CONFIG_HOME/MangoHud/MangoHud.yml`
    /// (falling back to `$HOME/.config`), merging it over the built-in
    /// default. Absence of the file is not an error: the built-in default
    /// layout is used, per the "config absent" row of the failure-semantics
    /// table.
    pub fn load() -> anyhow::Result<Self> {
        let path = locate_config_file();
        Self::load_from(path.as_deref())
    }

    /// Loads from an explicit path, as given on the command line. Unlike
    /// [`Config::load`], a missing file at an explicitly given path is an
    /// error rather than a silent fallback to defaults.
    pub fn load_path(path: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(path.exists(), "config file not found: {}", path.display());
        Self::load_from(Some(path))
    }

    fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let (parsed, signature) = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(content) => {
                    let signature = stat_signature(path).ok();
                    let parsed: parsed::Config = serde_yaml::from_str(&content)
                        .context(format!("parsing config file {}", path.display()))?;
                    (Some(parsed), signature)
                }
                Err(e) => {
                    warn!(?path, error = %e, "could not read config file, using defaults");
                    (None, None)
                }
            },
            None => (None, None),
        };

        Ok(Self::build(parsed, signature))
    }

    fn build(cfg: Option<parsed::Config>, signature: Option<StatSignature>) -> Self {
        use converge::Converge;

        let defaults = DEFAULT_CFG.clone();
        let input = match cfg {
            Some(cfg) => cfg.converge(defaults),
            None => defaults,
        };

        let options = input.options.unwrap_or(parsed::OptionsCfg {
            font_size: Some(24),
            fps_limit: Some(0.0),
            unrecognized: Default::default(),
        });

        for key in options.unrecognized.keys() {
            warn!(option = key, "unrecognized config option, ignoring");
        }

        let hud_table = input
            .hud_table
            .map(convert_table)
            .unwrap_or_else(|| convert_table(DEFAULT_CFG.hud_table.clone().unwrap()));

        Self {
            hud_table,
            font_size: options.font_size.unwrap_or(24),
            fps_limit: options.fps_limit.unwrap_or(0.0),
            signature,
        }
    }

    /// Returns true if the on-disk file's (existence, size, mtime) signature
    /// differs from the one this config was loaded with, meaning a reload is
    /// warranted. A config loaded without a path (defaults only) never needs
    /// reloading.
    pub fn needs_reload(&self, path: &Path) -> bool {
        match (self.signature, stat_signature(path).ok()) {
            (Some(old), Some(new)) => old != new,
            (None, None) => false,
            _ => true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build(None, None)
    }
}

fn convert_table(cfg: parsed::HudTableCfg) -> HudTable {
    let cols = cfg.cols.unwrap_or_else(|| {
        cfg.rows.iter().map(|r| r.len()).max().unwrap_or(1)
    });

    let mut table = HudTable::new(cols);
    for row in cfg.rows {
        let cells = row.into_iter().map(convert_cell).collect();
        table.push_row(cells);
    }

    table
}

fn convert_cell(cell: parsed::ParsedCell) -> Option<Cell> {
    if let Some(graph) = cell.graph {
        return Some(Cell::Graph {
            metric: MetricRef::new("GLOBAL", "frametime"),
            min: graph.min,
            max: graph.max,
            color: Rgba::WHITE,
        });
    }

    if let Some(metric) = cell.metric {
        return Some(Cell::Value {
            metric: MetricRef::new(metric.group, metric.name),
            unit_override: cell.unit,
            color: Rgba::WHITE,
            precision: cell.precision.unwrap_or(0),
        });
    }

    cell.text.map(|text| Cell::Text {
        text,
        color: Rgba::WHITE,
        unit: cell.unit,
        samples: None,
    })
}

fn stat_signature(path: &Path) -> std::io::Result<StatSignature> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta.modified()?;
    let dur = mtime
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();

    Ok(StatSignature {
        len: meta.len(),
        mtime_sec: dur.as_secs() as i64,
        mtime_nsec: dur.subsec_nanos() as i64,
    })
}

fn locate_config_file() -> Option<PathBuf> {
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;

    let path = base.join("MangoHud").join("MangoHud.yml");
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_has_default_layout() {
        let config = Config::default();
        assert_eq!(config.font_size, 24);
        assert_eq!(config.fps_limit, 0.0);
        assert!(!config.hud_table.rows.is_empty());
    }

    #[test]
    fn overriding_only_font_size_keeps_other_defaults() {
        let input: parsed::Config = serde_yaml::from_str(
            r#"
            options:
              font_size: 32
            "#,
        )
        .unwrap();

        let config = Config::build(Some(input), None);
        let default = Config::default();

        assert_eq!(config.font_size, 32);
        assert_eq!(config.fps_limit, default.fps_limit);
        assert_eq!(config.hud_table, default.hud_table);
    }

    #[test]
    fn unrecognized_top_level_key_is_rejected() {
        let result: Result<parsed::Config, _> = serde_yaml::from_str(
            r#"
            not_a_real_field: true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unrecognized_option_is_ignored_not_rejected() {
        let input: parsed::Config = serde_yaml::from_str(
            r#"
            options:
              font_size: 20
              some_future_option: true
            "#,
        )
        .unwrap();

        let config = Config::build(Some(input), None);
        assert_eq!(config.font_size, 20);
    }

    #[test]
    fn custom_hud_table_replaces_default_wholesale() {
        let input: parsed::Config = serde_yaml::from_str(
            r#"
            hud_table:
              cols: 1
              rows:
                - - text: "hello"
            "#,
        )
        .unwrap();

        let config = Config::build(Some(input), None);
        assert_eq!(config.hud_table.cols, 1);
        assert_eq!(config.hud_table.rows.len(), 1);
    }

    #[test]
    fn unchanged_stat_signature_does_not_need_reload() {
        let dir = std::env::temp_dir().join(format!("hudtest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("MangoHud.yml");
        std::fs::write(&path, "options:\n  font_size: 24\n").unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert!(!config.needs_reload(&path));

        std::fs::remove_dir_all(&dir).ok();
    }
}
