// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Just enough MPEG transport stream parsing for the recorder.
//!
//! The external demuxer hands us a single-program transport stream; this
//! module finds the first video elementary stream via PAT/PMT, groups its
//! 188-byte packets into access units on payload-unit-start boundaries,
//! flags keyframes from the adaptation field's random-access indicator, and
//! extracts the PES PTS. Packet payloads are never inspected beyond the PES
//! header, so no decoding happens here.

use base::{bail, err, Error};
use bytes::Bytes;

pub const TS_PACKET_SIZE: usize = 188;

const PAT_PID: u16 = 0;

/// Stream types carrying video in a program map.
const VIDEO_STREAM_TYPES: [u8; 5] = [0x01, 0x02, 0x10, 0x1b, 0x24];

/// One video access unit: the raw transport packets composing it, plus the
/// metadata the recorder needs to index it.
#[derive(Clone, Debug)]
pub struct VideoPacket {
    /// Presentation timestamp in 90 kHz units, if the PES header carried one.
    pub pts_90k: Option<i64>,

    /// True iff the unit is decodable without prior state (random access
    /// indicator set on its first transport packet).
    pub is_key: bool,

    /// The unit's transport packets, verbatim.
    pub data: Bytes,
}

/// Rescales `v` from time base `src` to `dst` (each `(num, den)`), rounding
/// to nearest with ties away from zero. `i64::MIN` and `i64::MAX` pass
/// through unchanged so sentinel timestamps survive conversion.
pub fn rescale(v: i64, src: (i64, i64), dst: (i64, i64)) -> i64 {
    if v == i64::MIN || v == i64::MAX {
        return v;
    }
    let num = src.0 as i128 * dst.1 as i128;
    let den = src.1 as i128 * dst.0 as i128;
    debug_assert!(den > 0);
    let a = v as i128 * num;
    let r = if a >= 0 {
        (a + den / 2) / den
    } else {
        (a - den / 2) / den
    };
    r as i64
}

/// 90 kHz PES clock to wall-clock milliseconds.
pub fn pts_to_ms(pts_90k: i64) -> i64 {
    rescale(pts_90k, (1, 90_000), (1, 1_000))
}

struct Header {
    pid: u16,
    pusi: bool,
    /// Offset of the payload within the packet, or `None` if there is none.
    payload: Option<usize>,
    random_access: bool,
}

fn parse_header(pkt: &[u8]) -> Result<Header, Error> {
    if pkt.len() != TS_PACKET_SIZE {
        bail!(InvalidArgument, msg("expected {TS_PACKET_SIZE}-byte packet, got {}", pkt.len()));
    }
    if pkt[0] != 0x47 {
        bail!(DataLoss, msg("lost transport stream sync (byte {:#04x})", pkt[0]));
    }
    let pid = u16::from(pkt[1] & 0x1f) << 8 | u16::from(pkt[2]);
    let pusi = pkt[1] & 0x40 != 0;
    let afc = (pkt[3] >> 4) & 0x3;
    let mut random_access = false;
    let payload = match afc {
        0b01 => Some(4),
        0b10 => None,
        0b11 => {
            let len = usize::from(pkt[4]);
            if len > 0 {
                random_access = pkt[5] & 0x40 != 0;
            }
            let off = 5 + len;
            if off >= TS_PACKET_SIZE {
                None
            } else {
                Some(off)
            }
        }
        _ => bail!(DataLoss, msg("reserved adaptation field control")),
    };
    Ok(Header {
        pid,
        pusi,
        payload,
        random_access,
    })
}

/// Decodes the 33-bit timestamp from a 5-byte PES `PTS` field.
fn parse_pes_timestamp(b: &[u8]) -> i64 {
    (i64::from(b[0] & 0x0e) << 29)
        | (i64::from(b[1]) << 22)
        | (i64::from(b[2] & 0xfe) << 14)
        | (i64::from(b[3]) << 7)
        | (i64::from(b[4]) >> 1)
}

/// PTS from a PES header at the start of `payload`, if present.
fn parse_pes_pts(payload: &[u8]) -> Option<i64> {
    if payload.len() < 14 || payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
        return None;
    }
    let stream_id = payload[3];
    if !(0xe0..=0xef).contains(&stream_id) {
        return None;
    }
    let pts_dts_flags = payload[7] >> 6;
    if pts_dts_flags & 0b10 == 0 {
        return None;
    }
    Some(parse_pes_timestamp(&payload[9..14]))
}

/// Incremental demultiplexer over 188-byte transport packets.
pub struct Demuxer {
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    pat_packet: Option<Vec<u8>>,
    pmt_packet: Option<Vec<u8>>,
    pending: Vec<u8>,
    pending_pts: Option<i64>,
    pending_key: bool,
    assembling: bool,
}

impl Demuxer {
    pub fn new() -> Self {
        Demuxer {
            pmt_pid: None,
            video_pid: None,
            pat_packet: None,
            pmt_packet: None,
            pending: Vec::new(),
            pending_pts: None,
            pending_key: false,
            assembling: false,
        }
    }

    /// True once PAT and PMT have both been seen.
    pub fn has_program(&self) -> bool {
        self.video_pid.is_some()
    }

    /// The most recent PAT and PMT packets, verbatim, for seeding a segment
    /// file so it's playable on its own.
    pub fn psi(&self) -> Bytes {
        let mut out = Vec::with_capacity(2 * TS_PACKET_SIZE);
        if let Some(p) = &self.pat_packet {
            out.extend_from_slice(p);
        }
        if let Some(p) = &self.pmt_packet {
            out.extend_from_slice(p);
        }
        out.into()
    }

    /// Feeds one transport packet. Returns the previous access unit when
    /// this packet starts a new one on the video stream.
    pub fn push(&mut self, pkt: &[u8]) -> Result<Option<VideoPacket>, Error> {
        let h = parse_header(pkt)?;
        let payload = h.payload.map(|off| &pkt[off..]);

        if h.pid == PAT_PID {
            if let (true, Some(p)) = (h.pusi, payload) {
                self.parse_pat(p)?;
                self.pat_packet = Some(pkt.to_vec());
            }
            return Ok(None);
        }
        if Some(h.pid) == self.pmt_pid {
            if let (true, Some(p)) = (h.pusi, payload) {
                self.parse_pmt(p)?;
                self.pmt_packet = Some(pkt.to_vec());
            }
            return Ok(None);
        }
        if Some(h.pid) != self.video_pid {
            return Ok(None); // other streams and null packets
        }

        let mut finished = None;
        if h.pusi {
            finished = self.take_pending();
            self.assembling = true;
            self.pending_key = h.random_access;
            self.pending_pts = payload.and_then(parse_pes_pts);
        }
        if self.assembling {
            self.pending.extend_from_slice(pkt);
        }
        Ok(finished)
    }

    /// Emits the access unit still being assembled, at end of stream.
    pub fn flush(&mut self) -> Option<VideoPacket> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<VideoPacket> {
        if !self.assembling || self.pending.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.pending);
        Some(VideoPacket {
            pts_90k: self.pending_pts.take(),
            is_key: std::mem::take(&mut self.pending_key),
            data: data.into(),
        })
    }

    fn parse_pat(&mut self, payload: &[u8]) -> Result<(), Error> {
        let section = skip_pointer(payload)?;
        if section.first() != Some(&0x00) {
            return Ok(()); // not a program association section
        }
        let len = section_length(section)?;
        if len < 9 {
            bail!(DataLoss, msg("truncated program association section"));
        }
        // Program loop: 8 bytes of fixed fields after the length, 4-byte CRC.
        let mut off = 8;
        let end = 3 + len - 4;
        while off + 4 <= end && off + 4 <= section.len() {
            let program = u16::from(section[off]) << 8 | u16::from(section[off + 1]);
            let pid = u16::from(section[off + 2] & 0x1f) << 8 | u16::from(section[off + 3]);
            if program != 0 {
                self.pmt_pid = Some(pid);
                return Ok(());
            }
            off += 4;
        }
        Ok(())
    }

    fn parse_pmt(&mut self, payload: &[u8]) -> Result<(), Error> {
        let section = skip_pointer(payload)?;
        if section.first() != Some(&0x02) {
            return Ok(());
        }
        let len = section_length(section)?;
        if len < 13 || section.len() < 12 {
            bail!(DataLoss, msg("truncated program map"));
        }
        let program_info_len = usize::from(section[10] & 0x0f) << 8 | usize::from(section[11]);
        let mut off = 12 + program_info_len;
        let end = 3 + len - 4;
        while off + 5 <= end && off + 5 <= section.len() {
            let stream_type = section[off];
            let pid = u16::from(section[off + 1] & 0x1f) << 8 | u16::from(section[off + 2]);
            let es_info_len = usize::from(section[off + 3] & 0x0f) << 8 | usize::from(section[off + 4]);
            if VIDEO_STREAM_TYPES.contains(&stream_type) && self.video_pid.is_none() {
                self.video_pid = Some(pid);
            }
            off += 5 + es_info_len;
        }
        Ok(())
    }
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn skip_pointer(payload: &[u8]) -> Result<&[u8], Error> {
    let Some(&pointer) = payload.first() else {
        return Err(err!(DataLoss, msg("empty section payload")));
    };
    let off = 1 + usize::from(pointer);
    if off >= payload.len() {
        bail!(DataLoss, msg("section pointer past packet end"));
    }
    Ok(&payload[off..])
}

fn section_length(section: &[u8]) -> Result<usize, Error> {
    if section.len() < 3 {
        bail!(DataLoss, msg("truncated section header"));
    }
    Ok(usize::from(section[1] & 0x0f) << 8 | usize::from(section[2]))
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn demuxer_with_program() -> Demuxer {
        let mut d = Demuxer::new();
        assert!(d.push(&pat_packet()).unwrap().is_none());
        assert!(!d.has_program());
        assert!(d.push(&pmt_packet(0x1b)).unwrap().is_none());
        assert!(d.has_program());
        d
    }

    #[test]
    fn finds_first_video_stream() {
        let d = demuxer_with_program();
        assert_eq!(d.video_pid, Some(VIDEO_PID));
        assert_eq!(d.pmt_pid, Some(PMT_PID));
    }

    #[test]
    fn non_video_stream_types_are_skipped() {
        let mut d = Demuxer::new();
        d.push(&pat_packet()).unwrap();
        d.push(&pmt_packet(0x0f)).unwrap(); // AAC audio
        assert!(!d.has_program());
    }

    #[test]
    fn assembles_access_units() {
        let mut d = demuxer_with_program();
        assert!(d.push(&pes_start_packet(90_000, true)).unwrap().is_none());
        assert!(d.push(&pes_cont_packet()).unwrap().is_none());
        let au = d.push(&pes_start_packet(93_600, false)).unwrap().unwrap();
        assert!(au.is_key);
        assert_eq!(au.pts_90k, Some(90_000));
        assert_eq!(au.data.len(), 2 * TS_PACKET_SIZE);

        let last = d.flush().unwrap();
        assert!(!last.is_key);
        assert_eq!(last.pts_90k, Some(93_600));
        assert_eq!(last.data.len(), TS_PACKET_SIZE);
        assert!(d.flush().is_none());
    }

    #[test]
    fn packets_before_first_pusi_are_dropped() {
        let mut d = demuxer_with_program();
        assert!(d.push(&pes_cont_packet()).unwrap().is_none());
        assert!(d.flush().is_none());
    }

    #[test]
    fn psi_snapshot_is_two_packets() {
        let d = demuxer_with_program();
        let psi = d.psi();
        assert_eq!(psi.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(psi[0], 0x47);
        assert_eq!(psi[TS_PACKET_SIZE], 0x47);
    }

    #[test]
    fn rejects_desynced_input() {
        let mut d = Demuxer::new();
        let mut pkt = pat_packet();
        pkt[0] = 0x48;
        assert_eq!(d.push(&pkt).unwrap_err().kind(), base::ErrorKind::DataLoss);
    }

    #[test]
    fn pts_roundtrip() {
        for pts in [0i64, 1, 90_000, (1 << 33) - 1] {
            let enc = encode_pts(pts);
            assert_eq!(parse_pes_timestamp(&enc), pts, "pts {pts}");
        }
    }

    #[test]
    fn rescale_rounds_to_nearest() {
        assert_eq!(rescale(90_000, (1, 90_000), (1, 1_000)), 1_000);
        assert_eq!(rescale(45, (1, 90_000), (1, 1_000)), 1); // 0.5 ms rounds away from zero
        assert_eq!(rescale(44, (1, 90_000), (1, 1_000)), 0);
        assert_eq!(rescale(-45, (1, 90_000), (1, 1_000)), -1);
        assert_eq!(rescale(i64::MIN, (1, 90_000), (1, 1_000)), i64::MIN);
        assert_eq!(rescale(i64::MAX, (1, 90_000), (1, 1_000)), i64::MAX);
        assert_eq!(pts_to_ms(180_000), 2_000);
    }
}
