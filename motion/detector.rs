// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Background-subtraction motion detection with blob tracking.
//!
//! Per frame: grayscale + blur, absolute difference against an
//! exponentially-learned background model, fixed threshold, exclusion-zone
//! masking, dilation, connected-component blob extraction, then
//! centroid-distance matching against the tracked objects. An object is
//! reported only once it has persisted for `min_frames` frames, is large
//! enough relative to the frame, and is not "static-dynamic" (long-lived
//! with near-zero centroid variance, e.g. a flag or a parked car's shadow).

use image::DynamicImage;
use std::collections::VecDeque;

const CENTROID_HISTORY: usize = 30;
const DIFF_THRESHOLD: i16 = 25;
const BACKGROUND_LEARNING_RATE: f32 = 0.01;
const ROI_EMA_ALPHA: f64 = 0.3;
const JPEG_QUALITY: u8 = 85;

/// A rectangle in pixel space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn area(&self) -> i64 {
        self.w as i64 * self.h as i64
    }

    fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.clamp(0, width as i32);
        let y = self.y.clamp(0, height as i32);
        let w = (self.w + (self.x - x)).clamp(0, width as i32 - x);
        let h = (self.h + (self.y - y)).clamp(0, height as i32 - y);
        Rect { x, y, w, h }
    }

    fn expand(&self, padding: f64, width: u32, height: u32) -> Rect {
        let dx = (self.w as f64 * padding) as i32;
        let dy = (self.h as f64 * padding) as i32;
        Rect {
            x: self.x - dx,
            y: self.y - dy,
            w: self.w + 2 * dx,
            h: self.h + 2 * dy,
        }
        .clamp_to(width, height)
    }
}

/// Exponential smoothing of a crop window, against jitter. `state` with
/// zero area means uninitialized.
fn smooth_rect_ema(current: Rect, state: &mut Rect, alpha: f64) -> Rect {
    if state.area() == 0 {
        *state = current;
        return *state;
    }
    let mix = |c: i32, s: i32| (alpha * c as f64 + (1.0 - alpha) * s as f64) as i32;
    state.x = mix(current.x, state.x);
    state.y = mix(current.y, state.y);
    state.w = mix(current.w, state.w);
    state.h = mix(current.h, state.h);
    *state
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Minimum blob area as a fraction of the frame area.
    pub min_area_ratio: f64,

    /// Frames an object must persist before it is reported.
    pub min_frames: u32,

    /// Centroid variance (px²) below which a long-lived object is
    /// classified static-dynamic and suppressed.
    pub max_static_variance: f64,

    pub roi_padding: f64,
    pub excluded_zones: Vec<Rect>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_area_ratio: 0.02,
            min_frames: 3,
            max_static_variance: 3.0,
            roi_padding: 0.2,
            excluded_zones: Vec::new(),
        }
    }
}

struct Blob {
    bbox: Rect,
    area: f64,
    centroid: (f32, f32),
}

struct Track {
    bbox: Rect,
    frames_alive: u32,
    centroids: VecDeque<(f32, f32)>,
    static_dynamic: bool,
    /// EMA state for ROI stabilization; persists across frames on the
    /// track itself, not on per-call copies.
    smooth_roi: Rect,
}

impl Track {
    fn new(blob: &Blob) -> Track {
        let mut centroids = VecDeque::with_capacity(CENTROID_HISTORY);
        centroids.push_back(blob.centroid);
        Track {
            bbox: blob.bbox,
            frames_alive: 1,
            centroids,
            static_dynamic: false,
            smooth_roi: Rect::default(),
        }
    }

    fn update(&mut self, blob: &Blob) {
        self.bbox = blob.bbox;
        self.frames_alive += 1;
        if self.centroids.len() == CENTROID_HISTORY {
            self.centroids.pop_front();
        }
        self.centroids.push_back(blob.centroid);
    }

    fn centroid_variance(&self) -> f64 {
        let n = self.centroids.len() as f64;
        let (mut mx, mut my) = (0.0, 0.0);
        for &(x, y) in &self.centroids {
            mx += x as f64;
            my += y as f64;
        }
        mx /= n;
        my /= n;
        let mut var = 0.0;
        for &(x, y) in &self.centroids {
            var += (x as f64 - mx).powi(2) + (y as f64 - my).powi(2);
        }
        var / n
    }
}

/// A stabilized crop of the most prominent moving object, JPEG-encoded.
/// Borrows the detector's per-handle buffer: valid until the next call on
/// the same detector.
pub struct RoiCrop<'a> {
    pub jpeg: &'a [u8],
    pub bbox: Rect,
}

pub struct Detector {
    config: Config,
    width: u32,
    height: u32,
    background: Vec<f32>,
    tracks: Vec<Track>,
    roi_jpeg: Vec<u8>,
}

impl Detector {
    pub fn new(width: u32, height: u32, config: Config) -> Detector {
        Detector {
            config,
            width,
            height,
            background: Vec::new(),
            tracks: Vec::new(),
            roi_jpeg: Vec::new(),
        }
    }

    /// Replaces the exclusion zone set.
    pub fn set_exclusion_zones(&mut self, zones: Vec<Rect>) {
        self.config.excluded_zones = zones;
    }

    /// Runs one frame through the pipeline. True iff any tracked object
    /// passes all filters this frame.
    pub fn process(&mut self, frame: &DynamicImage) -> bool {
        !self.process_frame(frame).is_empty()
    }

    /// Like [`Detector::process`], but also crops the largest reported
    /// object (expanded, EMA-stabilized) and encodes it as JPEG into the
    /// detector-owned buffer.
    pub fn process_roi(&mut self, frame: &DynamicImage) -> Option<RoiCrop<'_>> {
        let valid = self.process_frame(frame);
        let best = valid
            .into_iter()
            .max_by_key(|&i| self.tracks[i].bbox.area())?;
        let track = &mut self.tracks[best];
        let bbox = track.bbox;
        let expanded = bbox.expand(self.config.roi_padding, self.width, self.height);
        let window = smooth_rect_ema(expanded, &mut track.smooth_roi, ROI_EMA_ALPHA)
            .clamp_to(self.width, self.height);
        if window.area() == 0 {
            return None;
        }
        let crop = frame.crop_imm(
            window.x as u32,
            window.y as u32,
            window.w as u32,
            window.h as u32,
        );
        self.roi_jpeg.clear();
        let mut cursor = std::io::Cursor::new(&mut self.roi_jpeg);
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, JPEG_QUALITY);
        if let Err(e) = crop.write_with_encoder(encoder) {
            tracing::warn!(err = %e, "unable to encode roi");
            return None;
        }
        Some(RoiCrop {
            jpeg: &self.roi_jpeg,
            bbox,
        })
    }

    /// Returns indices of tracks passing all filters this frame.
    fn process_frame(&mut self, frame: &DynamicImage) -> Vec<usize> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            // Resolution change: adopt it and relearn the background.
            self.width = frame.width();
            self.height = frame.height();
            self.background.clear();
            self.tracks.clear();
        }
        let Some(mask) = self.detect_mask(frame) else {
            return Vec::new();
        };
        let blobs = extract_blobs(&mask, self.width as usize, self.height as usize);
        self.match_blobs(blobs)
    }

    /// Thresholded foreground mask, or `None` on the background-priming
    /// frame.
    fn detect_mask(&mut self, frame: &DynamicImage) -> Option<Vec<u8>> {
        let gray = frame.to_luma8();
        let blurred = box_blur(gray.as_raw(), self.width as usize, self.height as usize);
        if self.background.is_empty() {
            self.background = blurred.iter().map(|&p| p as f32).collect();
            return None;
        }
        let mut mask: Vec<u8> = blurred
            .iter()
            .zip(&self.background)
            .map(|(&cur, &bg)| {
                if (cur as i16 - bg as i16).abs() > DIFF_THRESHOLD {
                    255
                } else {
                    0
                }
            })
            .collect();
        for (bg, &cur) in self.background.iter_mut().zip(&blurred) {
            *bg = *bg * (1.0 - BACKGROUND_LEARNING_RATE) + cur as f32 * BACKGROUND_LEARNING_RATE;
        }
        for zone in &self.config.excluded_zones {
            let z = zone.clamp_to(self.width, self.height);
            for y in z.y..z.y + z.h {
                let row = y as usize * self.width as usize;
                mask[row + z.x as usize..row + (z.x + z.w) as usize].fill(0);
            }
        }
        Some(dilate(&mask, self.width as usize, self.height as usize))
    }

    fn passes_size(&self, blob: &Blob) -> bool {
        let frame_area = (self.width * self.height) as f64;
        blob.area / frame_area >= self.config.min_area_ratio
    }

    fn match_blobs(&mut self, mut blobs: Vec<Blob>) -> Vec<usize> {
        // Match radius proportional to resolution, with a floor.
        let max_dist = (self.width as f64 * 0.08).max(20.0);
        let mut used = vec![false; blobs.len()];
        let mut updated: Vec<Track> = Vec::new();
        let mut valid = Vec::new();

        for mut track in std::mem::take(&mut self.tracks) {
            let last = *track.centroids.back().expect("tracks always have history");
            let mut best: Option<(usize, f64)> = None;
            for (i, blob) in blobs.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let dist = ((blob.centroid.0 - last.0) as f64).hypot((blob.centroid.1 - last.1) as f64);
                if dist < max_dist && best.map_or(true, |(_, d)| dist < d) {
                    best = Some((i, dist));
                }
            }
            // Unmatched tracks are dropped; no occlusion tolerance yet.
            let Some((i, _)) = best else { continue };
            used[i] = true;
            track.update(&blobs[i]);
            let ok = self.passes_size(&blobs[i])
                && track.frames_alive >= self.config.min_frames
                && !is_static_dynamic(&mut track, &self.config);
            if ok {
                valid.push(updated.len());
            }
            updated.push(track);
        }

        for (i, blob) in blobs.drain(..).enumerate() {
            if used[i] || !self.passes_size(&blob) {
                continue;
            }
            updated.push(Track::new(&blob));
        }

        self.tracks = updated;
        valid
    }
}

/// Long-lived and nearly motionless: mark and suppress.
fn is_static_dynamic(track: &mut Track, config: &Config) -> bool {
    if track.static_dynamic {
        return true;
    }
    if track.centroids.len() < 4 {
        return false;
    }
    if track.centroid_variance() < config.max_static_variance
        && track.frames_alive > config.min_frames
    {
        track.static_dynamic = true;
        return true;
    }
    false
}

/// 3x3 box blur.
fn box_blur(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0u32;
            let mut n = 0u32;
            for dy in y.saturating_sub(1)..(y + 2).min(h) {
                for dx in x.saturating_sub(1)..(x + 2).min(w) {
                    sum += src[dy * w + dx] as u32;
                    n += 1;
                }
            }
            out[y * w + x] = (sum / n) as u8;
        }
    }
    out
}

/// 3x3 max filter, closing small holes so one object yields one blob.
fn dilate(mask: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut out = vec![0u8; mask.len()];
    for y in 0..h {
        for x in 0..w {
            let mut m = 0u8;
            for dy in y.saturating_sub(1)..(y + 2).min(h) {
                for dx in x.saturating_sub(1)..(x + 2).min(w) {
                    m = m.max(mask[dy * w + dx]);
                }
            }
            out[y * w + x] = m;
        }
    }
    out
}

/// 4-connected components of the foreground mask.
fn extract_blobs(mask: &[u8], w: usize, h: usize) -> Vec<Blob> {
    let mut visited = vec![false; mask.len()];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();
    for start in 0..mask.len() {
        if mask[start] == 0 || visited[start] {
            continue;
        }
        let (mut min_x, mut min_y) = (w, h);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let (mut sum_x, mut sum_y, mut count) = (0f64, 0f64, 0u64);
        visited[start] = true;
        stack.push(start);
        while let Some(i) = stack.pop() {
            let (x, y) = (i % w, i / w);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            sum_x += x as f64;
            sum_y += y as f64;
            count += 1;
            let mut visit = |j: usize| {
                if mask[j] != 0 && !visited[j] {
                    visited[j] = true;
                    stack.push(j);
                }
            };
            if x > 0 {
                visit(i - 1);
            }
            if x + 1 < w {
                visit(i + 1);
            }
            if y > 0 {
                visit(i - w);
            }
            if y + 1 < h {
                visit(i + w);
            }
        }
        blobs.push(Blob {
            bbox: Rect {
                x: min_x as i32,
                y: min_y as i32,
                w: (max_x - min_x + 1) as i32,
                h: (max_y - min_y + 1) as i32,
            },
            area: count as f64,
            centroid: ((sum_x / count as f64) as f32, (sum_y / count as f64) as f32),
        });
    }
    blobs
}

#[cfg(test)]
pub(crate) mod testutil {
    use image::{DynamicImage, GrayImage};

    pub const W: u32 = 320;
    pub const H: u32 = 240;

    /// A black frame with a white square at (x, y).
    pub fn square_frame(x: u32, y: u32, size: u32) -> DynamicImage {
        let mut img = GrayImage::new(W, H);
        for yy in y..(y + size).min(H) {
            for xx in x..(x + size).min(W) {
                img.put_pixel(xx, yy, image::Luma([255]));
            }
        }
        DynamicImage::ImageLuma8(img)
    }

    pub fn black_frame() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::new(W, H))
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn detector() -> Detector {
        Detector::new(W, H, Config::default())
    }

    #[test]
    fn priming_frame_reports_nothing() {
        let mut d = detector();
        assert!(!d.process(&square_frame(50, 50, 60)));
    }

    #[test]
    fn moving_object_reported_after_persistence() {
        let mut d = detector();
        d.process(&black_frame()); // primes the background
        let mut reported_at = None;
        for i in 0..6u32 {
            let hit = d.process(&square_frame(40 + i * 8, 60, 60));
            if hit && reported_at.is_none() {
                reported_at = Some(i + 1); // frames_alive when first reported
            }
        }
        // min_frames = 3: the third sighting is the first reportable one.
        assert_eq!(reported_at, Some(3));
    }

    #[test]
    fn small_object_filtered_by_area() {
        let mut d = detector();
        d.process(&black_frame());
        for i in 0..6u32 {
            // 20x20 = 400 px, well under 2% of 320x240.
            assert!(!d.process(&square_frame(40 + i * 8, 60, 20)));
        }
    }

    #[test]
    fn stationary_object_becomes_static_dynamic() {
        let mut d = detector();
        d.process(&black_frame());
        let mut last = false;
        for _ in 0..12 {
            last = d.process(&square_frame(100, 80, 60));
        }
        assert!(!last, "a parked object must stop being reported");
    }

    #[test]
    fn exclusion_zone_suppresses_detection() {
        let mut d = detector();
        d.set_exclusion_zones(vec![Rect {
            x: 0,
            y: 0,
            w: W as i32,
            h: H as i32,
        }]);
        d.process(&black_frame());
        for i in 0..6u32 {
            assert!(!d.process(&square_frame(40 + i * 8, 60, 60)));
        }
    }

    #[test]
    fn roi_crop_is_stabilized_jpeg() {
        let mut d = detector();
        d.process(&black_frame());
        let mut got = None;
        for i in 0..6u32 {
            if let Some(roi) = d.process_roi(&square_frame(40 + i * 8, 60, 60)) {
                assert!(roi.jpeg.starts_with(&[0xff, 0xd8]), "jpeg magic");
                assert!(roi.bbox.area() > 0);
                got = Some(roi.bbox);
            }
        }
        let bbox = got.expect("a moving square must yield a crop");
        assert!(bbox.w >= 55 && bbox.h >= 55, "{bbox:?}");
    }

    #[test]
    fn resolution_change_relearns_background() {
        let mut d = detector();
        d.process(&black_frame());
        let small = DynamicImage::ImageLuma8(image::GrayImage::new(160, 120));
        assert!(!d.process(&small)); // priming frame at the new size
        assert!(d.background.len() == 160 * 120);
    }

    #[test]
    fn blob_extraction_finds_bbox_and_centroid() {
        let mut mask = vec![0u8; 100];
        // A 3x2 block at (2,4) in a 10x10 grid.
        for y in 4..6 {
            for x in 2..5 {
                mask[y * 10 + x] = 255;
            }
        }
        let blobs = extract_blobs(&mask, 10, 10);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].bbox, Rect { x: 2, y: 4, w: 3, h: 2 });
        assert_eq!(blobs[0].area, 6.0);
        assert!((blobs[0].centroid.0 - 3.0).abs() < 1e-5);
        assert!((blobs[0].centroid.1 - 4.5).abs() < 1e-5);
    }

    #[test]
    fn ema_initializes_then_smooths() {
        let mut state = Rect::default();
        let a = Rect { x: 100, y: 100, w: 50, h: 50 };
        assert_eq!(smooth_rect_ema(a, &mut state, 0.3), a);
        let b = Rect { x: 200, y: 100, w: 50, h: 50 };
        let s = smooth_rect_ema(b, &mut state, 0.3);
        assert_eq!(s.x, 130); // 0.3*200 + 0.7*100
        assert_eq!(s.w, 50);
    }
}
