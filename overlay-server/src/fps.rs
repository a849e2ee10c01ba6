// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Per-client FPS/frametime synthesis from the `(seq, timestamp_ns)` samples
//! a client pushes over its `frame_samples` channel. This module only turns
//! those samples into a smoothed average FPS and frametime; resolving them
//! into a `HudTable` cell is the metrics collector's job, same as any other
//! `MetricRef` (see `hud.rs`).

use std::collections::VecDeque;

use hudbus_protocol::FrameSample;

/// Hard cap on the sample deque, matching the reference implementation's
/// `FT_MAX` constant, independent of the 500 ms window below - a client
/// bursting samples faster than the window drains can't grow this unbounded.
const FT_MAX: usize = 200;

const WINDOW_NS: u64 = 500_000_000;

/// A computed interval outside this band (a stall, a suspended/resumed
/// client, a clock discontinuity) is treated as noise: the smoothed value is
/// left untouched rather than let one bad sample spike the displayed FPS.
const MIN_SANE_FRAMETIME_MS: f32 = 0.1;
const MAX_SANE_FRAMETIME_MS: f32 = 1000.0;

/// The bounded sample/frametime deques for one client, plus the smoothed
/// values computed from them. Lives behind the per-session lock (see the
/// server's documented lock order: clients-list -> session -> client-resources
/// -> samples/frametimes).
pub struct FrameStats {
    samples: VecDeque<FrameSample>,
    frametimes_ms: VecDeque<f32>,
    smoothed_fps: f32,
    smoothed_frametime_ms: f32,
}

impl FrameStats {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(FT_MAX),
            frametimes_ms: VecDeque::with_capacity(FT_MAX),
            smoothed_fps: 0.0,
            smoothed_frametime_ms: 0.0,
        }
    }

    /// Appends freshly received samples to the deque, evicts anything older
    /// than the 500 ms window or beyond the absolute cap, and recomputes the
    /// smoothed fps/frametime over what's left.
    pub fn push(&mut self, samples: &[FrameSample]) {
        for sample in samples {
            if let Some(prev) = self.samples.back() {
                if sample.timestamp_ns > prev.timestamp_ns {
                    let dt_ms = (sample.timestamp_ns - prev.timestamp_ns) as f32 / 1_000_000.0;
                    self.frametimes_ms.push_back(dt_ms);
                    if self.frametimes_ms.len() > FT_MAX {
                        self.frametimes_ms.pop_front();
                    }
                }
            }

            self.samples.push_back(sample.clone());
            if self.samples.len() > FT_MAX {
                self.samples.pop_front();
            }
        }

        self.trim_window();
        self.recompute();
    }

    fn trim_window(&mut self) {
        let Some(newest) = self.samples.back().map(|s| s.timestamp_ns) else {
            return;
        };

        while let Some(oldest) = self.samples.front() {
            if newest.saturating_sub(oldest.timestamp_ns) > WINDOW_NS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn recompute(&mut self) {
        if self.samples.len() < 2 {
            // Coerced to the previous smoothed value: not enough samples yet
            // to say anything new.
            return;
        }

        let first_ts = self.samples.front().unwrap().timestamp_ns;
        let last_ts = self.samples.back().unwrap().timestamp_ns;
        if last_ts <= first_ts {
            return;
        }

        let span_ms = (last_ts - first_ts) as f32 / 1_000_000.0;
        let intervals = (self.samples.len() - 1) as f32;
        let frametime_ms = span_ms / intervals;

        if !(MIN_SANE_FRAMETIME_MS..=MAX_SANE_FRAMETIME_MS).contains(&frametime_ms) {
            return;
        }

        self.smoothed_frametime_ms = frametime_ms;
        self.smoothed_fps = 1000.0 / frametime_ms;
    }

    /// The current smoothed average FPS, 0.0 before the first window fills.
    pub fn fps(&self) -> f32 {
        self.smoothed_fps
    }

    /// The current smoothed average frametime, in milliseconds.
    pub fn frametime_ms(&self) -> f32 {
        self.smoothed_frametime_ms
    }

    /// The frametime ring, oldest first, for a frametime graph cell.
    pub fn frametime_samples(&self) -> &VecDeque<f32> {
        &self.frametimes_ms
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64, timestamp_ns: u64) -> FrameSample {
        FrameSample { seq, timestamp_ns }
    }

    #[test]
    fn insufficient_samples_keeps_zeroed_defaults() {
        let mut stats = FrameStats::new();
        stats.push(&[sample(1, 0)]);
        assert_eq!(stats.fps(), 0.0);
    }

    #[test]
    fn steady_60hz_samples_converge_on_60_fps() {
        let mut stats = FrameStats::new();
        let interval_ns = 16_666_667u64;
        for i in 0..10 {
            stats.push(&[sample(i, i * interval_ns)]);
        }

        assert!((stats.fps() - 60.0).abs() < 1.0, "fps was {}", stats.fps());
        assert!((stats.frametime_ms() - 16.667).abs() < 0.1);
    }

    #[test]
    fn window_evicts_samples_older_than_500ms() {
        let mut stats = FrameStats::new();
        stats.push(&[sample(0, 0), sample(1, 1_000_000)]);
        // Jump far past the 500ms window; the old samples should be trimmed
        // so the average reflects only the recent, dense burst.
        stats.push(&[sample(2, 2_000_000_000), sample(3, 2_001_000_000)]);

        assert!((stats.frametime_ms() - 1.0).abs() < 0.01, "frametime was {}", stats.frametime_ms());
    }

    #[test]
    fn a_stall_is_coerced_to_the_previous_smoothed_value() {
        let mut stats = FrameStats::new();
        let interval_ns = 16_666_667u64;
        for i in 0..5 {
            stats.push(&[sample(i, i * interval_ns)]);
        }
        let steady_fps = stats.fps();

        // A 2-second stall between two samples blows the frametime way
        // outside the sane band; the smoothed value should hold steady
        // rather than crater to ~0.5 fps.
        stats.push(&[sample(5, 5 * interval_ns + 2_000_000_000)]);

        assert_eq!(stats.fps(), steady_fps);
    }

    #[test]
    fn absolute_cap_bounds_the_deque_even_within_the_window() {
        let mut stats = FrameStats::new();
        // All within one window, but far more than FT_MAX entries.
        for i in 0..(FT_MAX as u64 * 2) {
            stats.push(&[sample(i, i * 1000)]);
        }

        assert!(stats.samples.len() <= FT_MAX);
    }
}
