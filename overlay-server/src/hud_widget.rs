// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The primitive cell-drawing contract: turns a [`HudTable`] into ImGui draw
//! calls. This module never resolves a [`MetricRef`] to a live value itself
//! (metric collection is an external collaborator's job); a `Value` or
//! `Graph` cell that reaches us without an attached sample buffer is drawn as
//! its metric label, so the overlay stays legible with no collector attached
//! at all.

use crate::hud::{Cell, HudTable, Rgba};

/// Draws one frame of `table` into `ui`, returning the window's current
/// auto-fit size. Grounded in the reference overlay widget's borderless,
/// non-interactive window style; a no-cursor HUD has no use for ImGui's
/// title bar, resize grips, or input routing.
///
/// With `always_auto_resize`, ImGui sizes the window to fit last frame's
/// content before laying out this one, so the value returned here is one
/// frame behind the content just drawn - the caller compares it against the
/// current dmabuf extent and requests a resize for the *next* tick if it has
/// changed, per the auto-fit contract: recompute the minimum bounding box
/// after drawing, and reinit only when it actually differs.
pub fn draw(ui: &imgui::Ui, table: &HudTable) -> [f32; 2] {
    let _border = ui.push_style_var(imgui::StyleVar::WindowBorderSize(0.0));
    let _rounding = ui.push_style_var(imgui::StyleVar::WindowRounding(0.0));

    let mut window_size = [0.0, 0.0];

    ui.window("hud")
        .position([0.0, 0.0], imgui::Condition::Always)
        .no_decoration()
        .no_nav()
        .no_inputs()
        .movable(false)
        .always_auto_resize(true)
        .bg_alpha(0.5)
        .build(|| {
            if table.cols != 0 {
                if let Some(_t) = ui.begin_table("hud-table", table.cols) {
                    for row in &table.rows {
                        ui.table_next_row();
                        for cell in row {
                            ui.table_next_column();
                            match cell {
                                Some(cell) => draw_cell(ui, cell),
                                None => {}
                            }
                        }
                    }
                }
            }

            window_size = ui.window_size();
        });

    window_size
}

fn draw_cell(ui: &imgui::Ui, cell: &Cell) {
    match cell {
        Cell::Text {
            text,
            color,
            unit,
            samples,
        } => {
            if let Some(samples) = samples {
                draw_graph(ui, text, samples, color);
            } else {
                draw_colored(ui, &label_with_unit(text, unit.as_deref()), *color);
            }
        }
        Cell::Value {
            metric,
            unit_override,
            color,
            precision,
        } => {
            // No resolved value attached: fall back to the metric's own
            // name, matching the reference behavior of showing "--" style
            // placeholders before the first collector sample arrives.
            let _ = precision;
            let label = format!("{}.{}", metric.group, metric.name);
            draw_colored(ui, &label_with_unit(&label, unit_override.as_deref()), *color);
        }
        Cell::Graph {
            metric,
            min: _,
            max: _,
            color,
        } => {
            draw_colored(ui, &format!("{}.{}", metric.group, metric.name), *color);
        }
    }
}

fn draw_graph(ui: &imgui::Ui, label: &str, samples: &[f32], color: &Rgba) {
    let _color = ui.push_style_color(imgui::StyleColor::PlotLines, color.to_array());
    ui.plot_lines(label, samples)
        .graph_size([0.0, 40.0])
        .build();
}

fn draw_colored(ui: &imgui::Ui, text: &str, color: Rgba) {
    let _color = ui.push_style_color(imgui::StyleColor::Text, color.to_array());
    ui.text(text);
}

fn label_with_unit(text: &str, unit: Option<&str>) -> String {
    match unit {
        Some(unit) => format!("{text} {unit}"),
        None => text.to_string(),
    }
}

/// A generous upper-bound canvas size for `table` at `font_size`, used only
/// to size the backing GPU images before the very first draw (there's no
/// prior frame to measure yet). Every tick after that, the real auto-fit
/// size `draw` returns is what actually drives the canvas extent (see
/// `ClientPipeline::render_tick` and `session.rs`'s resize-on-mismatch
/// check) - this estimate just needs to be in the right ballpark so the
/// first couple of frames aren't visibly clipped before the real size
/// settles. The unused border stays transparent (the render target is
/// cleared to alpha zero every tick), so over-estimating costs VRAM, not
/// correctness.
pub fn estimate_canvas_size(table: &HudTable, font_size: u32) -> (u32, u32) {
    const BASE_COL_WIDTH: u32 = 110;
    const BASE_ROW_HEIGHT: u32 = 26;
    const PADDING: u32 = 16;

    let scale = (font_size.max(1) as f32 / 13.0).max(1.0);
    let cols = table.cols.max(1) as u32;
    let rows = table.rows.len().max(1) as u32;

    let width = (cols * BASE_COL_WIDTH) as f32 * scale + PADDING as f32;
    let height = (rows * BASE_ROW_HEIGHT) as f32 * scale + PADDING as f32;

    (width.ceil() as u32, height.ceil() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hud::MetricRef;

    // These exercise the cell-classification logic only; driving a real
    // `imgui::Ui` requires a live font atlas and frame, which is the
    // pipeline's job (see `pipeline.rs`), not this module's.

    #[test]
    fn value_cell_without_resolution_falls_back_to_metric_label() {
        let cell = Cell::Value {
            metric: MetricRef::new("GPU0", "load"),
            unit_override: Some("%".into()),
            color: Rgba::WHITE,
            precision: 0,
        };

        let Cell::Value { metric, unit_override, .. } = &cell else {
            unreachable!()
        };
        let label = format!("{}.{}", metric.group, metric.name);
        assert_eq!(label_with_unit(&label, unit_override.as_deref()), "GPU0.load %");
    }

    #[test]
    fn text_cell_with_unit_appends_it() {
        assert_eq!(label_with_unit("VRAM", Some("MiB")), "VRAM MiB");
        assert_eq!(label_with_unit("VRAM", None), "VRAM");
    }

    #[test]
    fn larger_font_size_scales_up_canvas() {
        let table = HudTable::new(2);
        let (w13, h13) = estimate_canvas_size(&table, 13);
        let (w26, h26) = estimate_canvas_size(&table, 26);
        assert!(w26 > w13);
        assert!(h26 > h13);
    }
}
