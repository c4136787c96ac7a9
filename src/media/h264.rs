//! H.264 Annex B bitstream handling (RFC 6184).
//!
//! Three concerns live here, all pure and unit-testable without sockets:
//!
//! - **NAL extraction**: Annex B streams delimit NAL units with 4-byte
//!   (`00 00 00 01`) or 3-byte (`00 00 01`) start codes.
//! - **Packetization**: NALs that fit the MTU travel as Single NAL Unit
//!   packets (§5.6); larger ones are split into FU-A fragments (§5.8),
//!   each carrying a 2-byte FU indicator + FU header:
//!
//!   ```text
//!   FU indicator:  [F|NRI|Type=28]     (1 byte)
//!   FU header:     [S|E|R|NAL_Type]    (1 byte)
//!   ```
//!
//! - **Parameter-set scanning**: the first keyframe of a stream carries the
//!   SPS (NAL type 7) and PPS (NAL type 8) the DESCRIBE response needs.

/// SPS NAL unit type.
pub const NAL_SPS: u8 = 7;
/// PPS NAL unit type.
pub const NAL_PPS: u8 = 8;
/// FU-A aggregation type (RFC 6184 §5.8).
pub const NAL_FU_A: u8 = 28;

/// One RTP payload produced from a frame, with its marker-bit decision.
///
/// The marker is set on the payload that ends the access unit
/// (RFC 6184 §5.1).
#[derive(Debug)]
pub struct Fragment {
    pub bytes: Vec<u8>,
    pub marker: bool,
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Handles both 4-byte and 3-byte start codes and tracks each start code's
/// length so boundaries between adjacent NALs are computed correctly when
/// the two forms are mixed.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = if idx + 1 < start_entries.len() {
            let (next_start, next_sc_len) = start_entries[idx + 1];
            next_start - next_sc_len
        } else {
            data.len()
        };

        if start < end {
            nal_units.push(&data[start..end]);
        }
    }

    nal_units
}

/// Split one access unit into RTP payloads.
///
/// Each NAL unit becomes a Single NAL Unit payload when it fits within
/// `mtu`, or a run of FU-A fragments otherwise. The marker bit lands on
/// the last payload of the last NAL.
pub fn packetize(frame: &[u8], mtu: usize) -> Vec<Fragment> {
    let nal_units = extract_nal_units(frame);
    let mut fragments = Vec::new();

    for (i, nal) in nal_units.iter().enumerate() {
        let is_last_nal = i == nal_units.len() - 1;
        packetize_nal(nal, is_last_nal, mtu, &mut fragments);
    }

    fragments
}

fn packetize_nal(nal_unit: &[u8], is_last_nal: bool, mtu: usize, out: &mut Vec<Fragment>) {
    if nal_unit.is_empty() {
        return;
    }

    if nal_unit.len() <= mtu {
        // Single NAL Unit mode (RFC 6184 §5.6)
        out.push(Fragment {
            bytes: nal_unit.to_vec(),
            marker: is_last_nal,
        });
        return;
    }

    // FU-A fragmentation (RFC 6184 §5.8)
    let nal_header = nal_unit[0];
    let nal_type = nal_header & 0x1f;
    let nri = nal_header & 0x60;

    // FU indicator: NRI from original NAL, type = 28 (FU-A)
    let fu_indicator = nri | NAL_FU_A;
    let payload = &nal_unit[1..];

    let max_fragment = mtu - 2; // FU indicator + FU header
    let mut offset = 0usize;
    let mut first = true;
    let mut produced = 0usize;

    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let last_fragment = remaining <= max_fragment;
        let chunk = &payload[offset..offset + remaining.min(max_fragment)];

        // FU header: S=start, E=end, R=0, Type=original NAL type
        let start_bit = if first { 0x80 } else { 0x00 };
        let end_bit = if last_fragment { 0x40 } else { 0x00 };
        let fu_header = start_bit | end_bit | nal_type;

        let mut bytes = Vec::with_capacity(2 + chunk.len());
        bytes.push(fu_indicator);
        bytes.push(fu_header);
        bytes.extend_from_slice(chunk);
        out.push(Fragment {
            bytes,
            marker: is_last_nal && last_fragment,
        });

        offset += chunk.len();
        first = false;
        produced += 1;
    }

    tracing::trace!(
        nal_type,
        nal_size = nal_unit.len(),
        fragments = produced,
        "FU-A fragmented NAL unit"
    );
}

/// Scan a frame for SPS and PPS NAL units.
///
/// Returns the raw (start-code-stripped) bytes of the first SPS and first
/// PPS found; scanning stops as soon as both are present. Frames without
/// parameter sets (non-keyframes) return `(None, None)` cheaply.
pub fn find_parameter_sets(frame: &[u8]) -> (Option<&[u8]>, Option<&[u8]>) {
    let mut sps = None;
    let mut pps = None;

    for nal in extract_nal_units(frame) {
        match nal[0] & 0x1f {
            NAL_SPS if sps.is_none() => sps = Some(nal),
            NAL_PPS if pps.is_none() => pps = Some(nal),
            _ => {}
        }
        if sps.is_some() && pps.is_some() {
            break;
        }
    }

    (sps, pps)
}

/// Derive the SDP `profile-level-id` from a raw SPS NAL (RFC 6184 §8.1):
/// bytes 1–3 are profile_idc, constraint flags, level_idc.
pub fn profile_level_id(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 {
        return None;
    }
    Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}
