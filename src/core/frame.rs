// Frame layout constants and the 8-byte alignment padding policy.
//
// A frame is [length: 8][payload: length][pad: 0-7]. The length word holds the
// sentinel until the payload, pad, and next sentinel are written; readers skip
// the pad by recomputing the same policy from their position.
use crate::core::error::Error;
use crate::core::pointer::RollingRegionPointer;

/// Width of the length word preceding every payload.
pub const LENGTH_FIELD_LEN: usize = 8;

/// Length-word value marking "no message written here yet".
pub const SENTINEL: i64 = -1;

/// Frames start on 8-byte boundaries; must divide the region size.
pub const FRAME_ALIGNMENT: usize = 8;

/// Pad length at `position` with `remaining` bytes left in the region.
///
/// Conservative no-overshoot policy: the pad is the distance to the next
/// 8-byte boundary, capped at the region remainder so padding never crosses a
/// region boundary. Because regions are aligned multiples of 8, the cap only
/// applies when the remainder itself is the distance to the boundary.
pub fn pad_len(position: u64, remaining: usize) -> usize {
    let align = FRAME_ALIGNMENT - 1;
    let pad = (FRAME_ALIGNMENT - (position as usize & align)) & align;
    pad.min(remaining)
}

/// Zero-fills the pad after a payload, leaving the pointer at the next
/// length-word slot (guaranteed to have 8 writable bytes in its region).
pub fn write_padding(ptr: &mut RollingRegionPointer) -> Result<(), Error> {
    let pad = pad_len(ptr.position()?, ptr.remaining()?);
    if pad > 0 {
        let (region, offset) = ptr.advance(pad, false)?;
        region.fill_zero(offset, pad)?;
    }
    Ok(())
}

/// Advances the pointer past the pad without touching the mapped bytes.
pub fn skip_padding(ptr: &mut RollingRegionPointer) -> Result<(), Error> {
    let pad = pad_len(ptr.position()?, ptr.remaining()?);
    if pad > 0 {
        ptr.advance(pad, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::pad_len;

    #[test]
    fn aligned_positions_need_no_pad() {
        assert_eq!(pad_len(0, 64), 0);
        assert_eq!(pad_len(8, 64), 0);
        assert_eq!(pad_len(4096, 64), 0);
    }

    #[test]
    fn pad_reaches_next_boundary() {
        assert_eq!(pad_len(1, 64), 7);
        assert_eq!(pad_len(5, 64), 3);
        assert_eq!(pad_len(7, 64), 1);
    }

    #[test]
    fn pad_is_capped_by_region_remainder() {
        // Position 60 in a 64-byte region: 4 bytes to the boundary, 4 left.
        assert_eq!(pad_len(60, 4), 4);
        // Remainder equals the alignment distance exactly when capping applies.
        assert_eq!(pad_len(61, 3), 3);
    }
}
