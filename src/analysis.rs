//! Frame analysis collaborators.
//!
//! The session loop only relies on `FrameAnalyzer`: it hands over each decoded
//! frame, records the annotated frame it gets back, and watches `lap_count` for
//! progress. `ZoneLapCounter` is the bundled implementation; a real swimmer
//! detector plugs in through the same trait.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::{RawFrame, BGR_CHANNELS};

/// Per-frame analysis with a monotonically non-decreasing lap counter.
pub trait FrameAnalyzer: Send {
    /// Analyze one frame and return it, possibly annotated.
    fn process(&mut self, frame: RawFrame) -> Result<RawFrame>;

    /// Laps counted so far. Never decreases.
    fn lap_count(&self) -> u64;
}

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Zone {
    /// Bounding box of a polygon.
    pub fn bounding(points: &[(u32, u32)]) -> Option<Zone> {
        let min_x = points.iter().map(|p| p.0).min()?;
        let max_x = points.iter().map(|p| p.0).max()?;
        let min_y = points.iter().map(|p| p.1).min()?;
        let max_y = points.iter().map(|p| p.1).max()?;
        Some(Zone {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with a `width` x `height` frame.
    fn clipped(&self, width: u32, height: u32) -> Option<Zone> {
        let x_end = self.x.saturating_add(self.width).min(width);
        let y_end = self.y.saturating_add(self.height).min(height);
        if self.x >= x_end || self.y >= y_end {
            return None;
        }
        Some(Zone {
            x: self.x,
            y: self.y,
            width: x_end - self.x,
            height: y_end - self.y,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ZoneSettings {
    pub start: Zone,
    pub end: Zone,
    /// Mean absolute luma change (0-255) above which a zone counts as active.
    pub motion_threshold: f32,
    /// Analyze one frame out of every N.
    pub process_every_n_frames: u32,
    /// Draw zone outlines into the returned frames.
    pub annotate: bool,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        // Bounding boxes of the pool's start and end wall polygons.
        Self {
            start: Zone {
                x: 644,
                y: 682,
                width: 274,
                height: 109,
            },
            end: Zone {
                x: 905,
                y: 559,
                width: 222,
                height: 76,
            },
            motion_threshold: 12.0,
            process_every_n_frames: 1,
            annotate: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Leg {
    AwaitingStart,
    HeadingToEnd,
}

/// Counts a lap each time motion moves from the start zone to the end zone.
pub struct ZoneLapCounter {
    settings: ZoneSettings,
    previous_start: Option<Vec<u8>>,
    previous_end: Option<Vec<u8>>,
    leg: Leg,
    laps: u64,
    frames_seen: u64,
}

const START_COLOR: [u8; 3] = [0, 255, 0];
const END_COLOR: [u8; 3] = [0, 0, 255];

impl ZoneLapCounter {
    pub fn new(settings: ZoneSettings) -> Self {
        Self {
            settings,
            previous_start: None,
            previous_end: None,
            leg: Leg::AwaitingStart,
            laps: 0,
            frames_seen: 0,
        }
    }

    fn observe(&mut self, frame: &RawFrame) {
        let start_active = zone_activity(
            frame,
            self.settings.start,
            &mut self.previous_start,
            self.settings.motion_threshold,
        );
        let end_active = zone_activity(
            frame,
            self.settings.end,
            &mut self.previous_end,
            self.settings.motion_threshold,
        );

        match self.leg {
            Leg::AwaitingStart if start_active && !end_active => {
                self.leg = Leg::HeadingToEnd;
            }
            Leg::HeadingToEnd if end_active && !start_active => {
                self.laps += 1;
                self.leg = Leg::AwaitingStart;
                log::debug!("analysis: lap {} at frame {}", self.laps, frame.sequence);
            }
            _ => {}
        }
    }
}

impl FrameAnalyzer for ZoneLapCounter {
    fn process(&mut self, mut frame: RawFrame) -> Result<RawFrame> {
        let every = u64::from(self.settings.process_every_n_frames.max(1));
        if self.frames_seen % every == 0 {
            self.observe(&frame);
        }
        self.frames_seen += 1;

        if self.settings.annotate {
            draw_outline(&mut frame, self.settings.start, START_COLOR);
            draw_outline(&mut frame, self.settings.end, END_COLOR);
        }
        Ok(frame)
    }

    fn lap_count(&self) -> u64 {
        self.laps
    }
}

/// Compare the zone's luma with the previous sample and store the new one.
fn zone_activity(
    frame: &RawFrame,
    zone: Zone,
    previous: &mut Option<Vec<u8>>,
    threshold: f32,
) -> bool {
    let Some(zone) = zone.clipped(frame.width, frame.height) else {
        return false;
    };
    let mut current = Vec::with_capacity((zone.width * zone.height) as usize);
    for y in zone.y..zone.y + zone.height {
        for x in zone.x..zone.x + zone.width {
            current.push(frame.luma(x, y).unwrap_or(0));
        }
    }

    let active = match previous.as_ref() {
        Some(prev) if prev.len() == current.len() && !current.is_empty() => {
            let total: u64 = prev
                .iter()
                .zip(&current)
                .map(|(a, b)| u64::from(a.abs_diff(*b)))
                .sum();
            (total as f32 / current.len() as f32) > threshold
        }
        _ => false,
    };
    *previous = Some(current);
    active
}

fn draw_outline(frame: &mut RawFrame, zone: Zone, color: [u8; 3]) {
    let Some(zone) = zone.clipped(frame.width, frame.height) else {
        return;
    };
    let width = frame.width as usize;
    let x_last = zone.x + zone.width - 1;
    let y_last = zone.y + zone.height - 1;
    let data = frame.as_bytes_mut();
    let mut paint = |x: u32, y: u32| {
        let idx = (y as usize * width + x as usize) * BGR_CHANNELS;
        data[idx..idx + BGR_CHANNELS].copy_from_slice(&color);
    };
    for x in zone.x..=x_last {
        paint(x, zone.y);
        paint(x, y_last);
    }
    for y in zone.y..=y_last {
        paint(zone.x, y);
        paint(x_last, y);
    }
}

// ----------------------------------------------------------------------------
// Lap label
// ----------------------------------------------------------------------------

const LABEL_ORIGIN: (u32, u32) = (20, 10);
const LABEL_SCALE: u32 = 4;
const LABEL_COLOR: [u8; 3] = [0, 255, 255];

/// 3x5 bitmap rows, most significant of the three bits on the left.
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'a' => [0b000, 0b110, 0b011, 0b101, 0b111],
        'p' => [0b000, 0b111, 0b101, 0b111, 0b100],
        's' => [0b000, 0b111, 0b110, 0b011, 0b111],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        _ => [0; 5],
    }
}

/// Burn `Laps: N` into the top-left corner. Pixels outside the frame are skipped.
pub fn draw_lap_label(frame: &mut RawFrame, laps: u64) {
    let (width, height) = (frame.width, frame.height);
    let data = frame.as_bytes_mut();
    let label = format!("Laps: {}", laps);
    for (i, c) in label.chars().enumerate() {
        let left = LABEL_ORIGIN.0 + i as u32 * 4 * LABEL_SCALE;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..3u32 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                let x0 = left + col * LABEL_SCALE;
                let y0 = LABEL_ORIGIN.1 + row as u32 * LABEL_SCALE;
                for y in y0..(y0 + LABEL_SCALE).min(height) {
                    for x in x0..(x0 + LABEL_SCALE).min(width) {
                        let idx = (y as usize * width as usize + x as usize) * BGR_CHANNELS;
                        data[idx..idx + BGR_CHANNELS].copy_from_slice(&LABEL_COLOR);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_len;

    const W: u32 = 20;
    const H: u32 = 10;

    fn settings() -> ZoneSettings {
        ZoneSettings {
            start: Zone {
                x: 0,
                y: 0,
                width: 5,
                height: 5,
            },
            end: Zone {
                x: 15,
                y: 5,
                width: 5,
                height: 5,
            },
            motion_threshold: 10.0,
            process_every_n_frames: 1,
            annotate: false,
        }
    }

    /// A dark frame with an optional bright block in one zone.
    fn frame(bright: Option<Zone>, seq: u64) -> RawFrame {
        let mut data = vec![0u8; frame_len(W, H)];
        if let Some(zone) = bright {
            for y in zone.y..zone.y + zone.height {
                for x in zone.x..zone.x + zone.width {
                    let idx = ((y * W + x) as usize) * 3;
                    data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
                }
            }
        }
        RawFrame::new(data, W, H, seq).unwrap()
    }

    #[test]
    fn counts_start_then_end_as_one_lap() {
        let s = settings();
        let mut counter = ZoneLapCounter::new(s.clone());
        counter.process(frame(None, 0)).unwrap();
        counter.process(frame(Some(s.start), 1)).unwrap();
        assert_eq!(counter.lap_count(), 0);
        counter.process(frame(None, 2)).unwrap();
        // Start going dark is still start-zone motion.
        assert_eq!(counter.lap_count(), 0);
        counter.process(frame(Some(s.end), 3)).unwrap();
        assert_eq!(counter.lap_count(), 1);
    }

    #[test]
    fn end_activity_without_start_is_ignored() {
        let s = settings();
        let mut counter = ZoneLapCounter::new(s.clone());
        counter.process(frame(None, 0)).unwrap();
        counter.process(frame(Some(s.end), 1)).unwrap();
        counter.process(frame(None, 2)).unwrap();
        assert_eq!(counter.lap_count(), 0);
    }

    #[test]
    fn static_scene_never_counts() {
        let mut counter = ZoneLapCounter::new(settings());
        for seq in 0..50 {
            counter.process(frame(None, seq)).unwrap();
        }
        assert_eq!(counter.lap_count(), 0);
    }

    #[test]
    fn zones_outside_the_frame_are_inert() {
        let mut s = settings();
        s.start = Zone {
            x: 100,
            y: 100,
            width: 5,
            height: 5,
        };
        s.annotate = true;
        let mut counter = ZoneLapCounter::new(s);
        let out = counter.process(frame(None, 0)).unwrap();
        assert_eq!(out.len(), frame_len(W, H));
    }

    #[test]
    fn annotation_outlines_zones() {
        let mut s = settings();
        s.annotate = true;
        let mut counter = ZoneLapCounter::new(s);
        let out = counter.process(frame(None, 0)).unwrap();
        assert_eq!(out.pixel(0, 0), Some(START_COLOR));
        assert_eq!(out.pixel(19, 9), Some(END_COLOR));
        assert_eq!(out.pixel(10, 5), Some([0, 0, 0]));
    }

    #[test]
    fn lap_label_is_drawn_in_the_corner() {
        let mut out = RawFrame::new(vec![0u8; frame_len(200, 40)], 200, 40, 0).unwrap();
        draw_lap_label(&mut out, 7);
        // "L" stem and foot.
        assert_eq!(out.pixel(20, 10), Some(LABEL_COLOR));
        assert_eq!(out.pixel(31, 29), Some(LABEL_COLOR));
        assert_eq!(out.pixel(24, 10), Some([0, 0, 0]));
        // "7" is the seventh glyph: full top row, open lower left.
        let left = 20 + 6 * 16;
        assert_eq!(out.pixel(left, 10), Some(LABEL_COLOR));
        assert_eq!(out.pixel(left + 11, 10), Some(LABEL_COLOR));
        assert_eq!(out.pixel(left, 20), Some([0, 0, 0]));
        assert_eq!(out.pixel(left + 8, 20), Some(LABEL_COLOR));
        assert_eq!(out.pixel(10, 5), Some([0, 0, 0]));
    }

    #[test]
    fn lap_label_clips_to_small_frames() {
        let mut out = frame(None, 0);
        draw_lap_label(&mut out, 123);
        assert_eq!(out.pixel(19, 9), Some([0, 0, 0]));

        let mut tiny = RawFrame::new(vec![0u8; frame_len(24, 12)], 24, 12, 0).unwrap();
        draw_lap_label(&mut tiny, 1);
        assert_eq!(tiny.pixel(20, 10), Some(LABEL_COLOR));
        assert_eq!(tiny.pixel(23, 11), Some(LABEL_COLOR));
    }

    #[test]
    fn bounding_box_of_polygon() {
        let zone = Zone::bounding(&[(644, 726), (726, 682), (918, 735), (829, 791)]).unwrap();
        assert_eq!(
            zone,
            Zone {
                x: 644,
                y: 682,
                width: 274,
                height: 109
            }
        );
        assert!(Zone::bounding(&[]).is_none());
    }
}
