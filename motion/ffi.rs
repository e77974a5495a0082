// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! C-compatible handle API over [`Detector`], for the snapshot-polling
//! consumer process (loaded through an FFI binding layer).
//!
//! A handle is exclusively owned by the caller between `create_detector`
//! and `destroy_detector`. Calls on one handle must be serialized by the
//! caller; distinct handles are independent. The buffer returned by
//! `process_frame_file_roi` is owned by the handle and stays valid until
//! the next call *on that handle* — copy it before then.

use crate::detector::{Config, Detector, Rect};
use std::ffi::{c_char, c_double, c_int, CStr};

fn load_file(path: *const c_char) -> Option<image::DynamicImage> {
    if path.is_null() {
        return None;
    }
    let path = unsafe { CStr::from_ptr(path) };
    let path = path.to_str().ok()?;
    match image::open(path) {
        Ok(img) => Some(img),
        Err(e) => {
            tracing::warn!(path, err = %e, "unable to load frame");
            None
        }
    }
}

/// Creates a detector for `width`x`height` frames. Returns an owned handle;
/// release with [`destroy_detector`]. Never null.
#[no_mangle]
pub extern "C" fn create_detector(
    width: c_int,
    height: c_int,
    min_area_ratio: c_double,
    min_frames: c_int,
    max_static_variance: c_double,
) -> *mut Detector {
    let config = Config {
        min_area_ratio,
        min_frames: min_frames.max(1) as u32,
        max_static_variance,
        ..Config::default()
    };
    Box::into_raw(Box::new(Detector::new(
        width.max(0) as u32,
        height.max(0) as u32,
        config,
    )))
}

/// Releases a handle from [`create_detector`]. Accepts null.
///
/// # Safety
/// `handle` must be a pointer previously returned by [`create_detector`]
/// and not yet destroyed.
#[no_mangle]
pub unsafe extern "C" fn destroy_detector(handle: *mut Detector) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

/// Runs the frame stored at `path` through the detector. Returns 1 if a
/// reportable object is present, 0 otherwise (including load failures).
///
/// # Safety
/// `handle` as for [`destroy_detector`]; `path` must be a NUL-terminated
/// string or null.
#[no_mangle]
pub unsafe extern "C" fn process_frame_file(
    handle: *mut Detector,
    path: *const c_char,
) -> c_int {
    let Some(detector) = (unsafe { handle.as_mut() }) else {
        return 0;
    };
    let Some(frame) = load_file(path) else {
        return 0;
    };
    detector.process(&frame) as c_int
}

/// Like [`process_frame_file`], but the frame is a compressed image in
/// memory (decoded internally).
///
/// # Safety
/// `handle` as for [`destroy_detector`]; `buf` must point to `len`
/// readable bytes or be null.
#[no_mangle]
pub unsafe extern "C" fn process_frame_buffer(
    handle: *mut Detector,
    buf: *const u8,
    len: c_int,
) -> c_int {
    let Some(detector) = (unsafe { handle.as_mut() }) else {
        return 0;
    };
    if buf.is_null() || len <= 0 {
        return 0;
    }
    let data = unsafe { std::slice::from_raw_parts(buf, len as usize) };
    let Ok(frame) = image::load_from_memory(data) else {
        return 0;
    };
    detector.process(&frame) as c_int
}

/// Result of [`process_frame_file_roi`]: a JPEG crop of the most prominent
/// object plus its bounding box on the original frame. `data` is null and
/// `len` 0 when nothing was reported.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct JpegResult {
    /// Borrowed from the handle; valid until the next call on it.
    pub data: *const u8,
    pub len: c_int,
    pub x: c_int,
    pub y: c_int,
    pub w: c_int,
    pub h: c_int,
}

impl JpegResult {
    fn empty() -> JpegResult {
        JpegResult {
            data: std::ptr::null(),
            len: 0,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
        }
    }
}

/// Processes the frame at `path` and, if an object is reported, returns a
/// stabilized JPEG crop of it.
///
/// # Safety
/// As for [`process_frame_file`]. The returned buffer aliases the handle;
/// the caller must copy it before the next call on the same handle.
#[no_mangle]
pub unsafe extern "C" fn process_frame_file_roi(
    handle: *mut Detector,
    path: *const c_char,
) -> JpegResult {
    let Some(detector) = (unsafe { handle.as_mut() }) else {
        return JpegResult::empty();
    };
    let Some(frame) = load_file(path) else {
        return JpegResult::empty();
    };
    match detector.process_roi(&frame) {
        Some(roi) => JpegResult {
            data: roi.jpeg.as_ptr(),
            len: roi.jpeg.len() as c_int,
            x: roi.bbox.x,
            y: roi.bbox.y,
            w: roi.bbox.w,
            h: roi.bbox.h,
        },
        None => JpegResult::empty(),
    }
}

/// Replaces the exclusion zone set with `count` rectangles flattened as
/// `[x, y, w, h]` quadruples.
///
/// # Safety
/// `handle` as for [`destroy_detector`]; `rects` must point to `4 * count`
/// readable `int32_t`s or be null.
#[no_mangle]
pub unsafe extern "C" fn set_exclusion_zones(
    handle: *mut Detector,
    rects: *const i32,
    count: c_int,
) {
    let Some(detector) = (unsafe { handle.as_mut() }) else {
        return;
    };
    if rects.is_null() || count < 0 {
        return;
    }
    let flat = unsafe { std::slice::from_raw_parts(rects, count as usize * 4) };
    let zones = flat
        .chunks_exact(4)
        .map(|q| Rect {
            x: q[0],
            y: q[1],
            w: q[2],
            h: q[3],
        })
        .collect();
    detector.set_exclusion_zones(zones);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn square_png(x: u32, y: u32) -> Vec<u8> {
        let img = crate::detector::testutil::square_frame(x, y, 60);
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn black_png() -> Vec<u8> {
        let img = crate::detector::testutil::black_frame();
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn handle_lifecycle_with_buffers() {
        let handle = create_detector(320, 240, 0.02, 3, 3.0);
        assert!(!handle.is_null());
        unsafe {
            let prime = black_png();
            assert_eq!(
                process_frame_buffer(handle, prime.as_ptr(), prime.len() as c_int),
                0
            );
            let mut hits = 0;
            for i in 0..6u32 {
                let png = square_png(40 + i * 8, 60);
                hits += process_frame_buffer(handle, png.as_ptr(), png.len() as c_int);
            }
            assert!(hits >= 3, "{hits}");
            destroy_detector(handle);
        }
    }

    #[test]
    fn file_roi_returns_handle_owned_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let handle = create_detector(320, 240, 0.02, 3, 3.0);
        unsafe {
            let prime_path = dir.path().join("prime.png");
            std::fs::write(&prime_path, black_png()).unwrap();
            let c_prime = CString::new(prime_path.to_str().unwrap()).unwrap();
            assert_eq!(process_frame_file(handle, c_prime.as_ptr()), 0);

            let mut got = false;
            for i in 0..6u32 {
                let path = dir.path().join(format!("f{i}.png"));
                std::fs::write(&path, square_png(40 + i * 8, 60)).unwrap();
                let c_path = CString::new(path.to_str().unwrap()).unwrap();
                let r = process_frame_file_roi(handle, c_path.as_ptr());
                if !r.data.is_null() {
                    let jpeg = std::slice::from_raw_parts(r.data, r.len as usize);
                    assert!(jpeg.starts_with(&[0xff, 0xd8]));
                    assert!(r.w > 0 && r.h > 0);
                    got = true;
                }
            }
            assert!(got);
            destroy_detector(handle);
        }
    }

    #[test]
    fn exclusion_zones_apply_through_ffi() {
        let handle = create_detector(320, 240, 0.02, 3, 3.0);
        unsafe {
            let zones: [i32; 4] = [0, 0, 320, 240];
            set_exclusion_zones(handle, zones.as_ptr(), 1);
            let prime = black_png();
            process_frame_buffer(handle, prime.as_ptr(), prime.len() as c_int);
            for i in 0..6u32 {
                let png = square_png(40 + i * 8, 60);
                assert_eq!(
                    process_frame_buffer(handle, png.as_ptr(), png.len() as c_int),
                    0
                );
            }
            destroy_detector(handle);
        }
    }

    #[test]
    fn null_handles_and_paths_are_tolerated() {
        unsafe {
            assert_eq!(process_frame_file(std::ptr::null_mut(), std::ptr::null()), 0);
            assert_eq!(
                process_frame_buffer(std::ptr::null_mut(), std::ptr::null(), 0),
                0
            );
            destroy_detector(std::ptr::null_mut());
            set_exclusion_zones(std::ptr::null_mut(), std::ptr::null(), 0);
            let handle = create_detector(320, 240, 0.02, 3, 3.0);
            assert_eq!(process_frame_file(handle, std::ptr::null()), 0);
            destroy_detector(handle);
        }
    }
}
