// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The table of metric references and literal text the renderer draws. This
//! module only defines the shape; filling in `MetricRef`s with live values is
//! the metrics collector's job, external to this crate.

use std::sync::Arc;

/// A group/name pair identifying a single metric. `GLOBAL` groups are rebound
/// by the collector to the requesting client's PID; everything else is
/// domain-static ("CPU", "RAM", "GPU0", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricRef {
    pub group: String,
    pub name: String,
}

impl MetricRef {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba { r: 1.0, g: 1.0, b: 1.0, a: 1.0 };

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// A single HUD entry. A cell with a sample buffer renders as a graph row;
/// otherwise it renders as a value row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text {
        text: String,
        color: Rgba,
        unit: Option<String>,
        samples: Option<Arc<[f32]>>,
    },
    Value {
        metric: MetricRef,
        unit_override: Option<String>,
        color: Rgba,
        precision: u8,
    },
    Graph {
        metric: MetricRef,
        min: f32,
        max: f32,
        color: Rgba,
    },
}

impl Cell {
    pub fn is_graph_row(&self) -> bool {
        matches!(
            self,
            Cell::Graph { .. }
                | Cell::Text {
                    samples: Some(_),
                    ..
                }
        )
    }
}

/// A row-major, optionally sparse grid of cells. An absent cell renders as
/// blank padding so columns line up across rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HudTable {
    pub cols: usize,
    pub rows: Vec<Vec<Option<Cell>>>,
}

impl HudTable {
    pub fn new(cols: usize) -> Self {
        Self {
            cols,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, mut row: Vec<Option<Cell>>) {
        row.resize(self.cols, None);
        self.rows.push(row);
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        self.rows.get(row).and_then(|r| r.get(col)).and_then(|c| c.as_ref())
    }
}

/// A shared, atomically-replaceable snapshot of the current table. The
/// collector (external to this crate) publishes new snapshots; the renderer
/// takes a clone of the `Arc` under the client-resources lock so the table it
/// draws from is immutable for the duration of one tick.
pub type SharedHudTable = Arc<HudTable>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_rows_pad_to_column_count() {
        let mut table = HudTable::new(3);
        table.push_row(vec![Some(Cell::Text {
            text: "GPU".into(),
            color: Rgba::WHITE,
            unit: None,
            samples: None,
        })]);

        assert_eq!(table.rows[0].len(), 3);
        assert!(table.rows[0][1].is_none());
        assert!(table.rows[0][2].is_none());
    }

    #[test]
    fn graph_row_detection() {
        let graph = Cell::Graph {
            metric: MetricRef::new("GPU0", "frametime"),
            min: 0.0,
            max: 33.0,
            color: Rgba::WHITE,
        };
        assert!(graph.is_graph_row());

        let value = Cell::Value {
            metric: MetricRef::new("CPU", "freq"),
            unit_override: None,
            color: Rgba::WHITE,
            precision: 0,
        };
        assert!(!value.is_graph_row());
    }
}
