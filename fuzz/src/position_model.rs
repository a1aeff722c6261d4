//! Properties of [`PositionCodec`] for arbitrary term lengths and term ids.

use strand_core::position::{decode, encode, is_after, PositionCodec, FRAME_ALIGNMENT, PARTITION_COUNT};

/// Build the codec input from raw fuzz bytes: term lengths from 64 KiB to
/// 1 GiB, any initial term id, a non-negative term count and an aligned
/// offset inside the term.
pub fn check(shift_byte: u8, initial_term_id: i32, raw_term_count: u32, raw_offset: u32) -> Result<(), String> {
    let shift = 16 + u32::from(shift_byte) % 15;
    let term_length = 1i32 << shift;
    let term_count = (raw_term_count & i32::MAX as u32) as i32;
    let term_offset = (raw_offset as i32 & (term_length - 1)) & !(FRAME_ALIGNMENT - 1);

    let codec = PositionCodec::new(term_length, initial_term_id).map_err(|e| format!("codec: {e}"))?;
    let term_id = initial_term_id.wrapping_add(term_count);

    let position = codec
        .position_for(term_id, term_offset)
        .map_err(|e| format!("term {term_id} offset {term_offset}: {e}"))?;
    if position < 0 {
        return Err(format!("negative position {position} for term count {term_count}"));
    }
    let encoded = encode(i64::from(term_count), term_offset, shift).map_err(|e| e.to_string())?;
    if encoded != position {
        return Err(format!("encode gave {encoded}, position_for gave {position}"));
    }
    if decode(position, shift) != (i64::from(term_count), term_offset) {
        return Err(format!("{position} decodes to {:?}", decode(position, shift)));
    }
    if codec.term_id_for(position) != term_id {
        return Err(format!("{position} maps to term {}, expected {term_id}", codec.term_id_for(position)));
    }
    if codec.term_offset_for(position) != term_offset {
        return Err(format!("{position} maps to offset {}", codec.term_offset_for(position)));
    }
    if codec.term_begin_position(position) != position - i64::from(term_offset) {
        return Err(format!("{position} begins its term at {}", codec.term_begin_position(position)));
    }

    let partition = term_count as usize % PARTITION_COUNT;
    if codec.partition_for_position(position) != partition || codec.partition_for_term(term_id) != partition {
        return Err(format!(
            "term count {term_count}: partitions {} / {}, expected {partition}",
            codec.partition_for_position(position),
            codec.partition_for_term(term_id)
        ));
    }

    if term_count < i32::MAX {
        let next_term_id = term_id.wrapping_add(1);
        if !is_after(next_term_id, term_id) {
            return Err(format!("term {next_term_id} not after {term_id}"));
        }
        let next = codec.position_for(next_term_id, 0).map_err(|e| e.to_string())?;
        if next <= position || next - codec.term_begin_position(position) != i64::from(term_length) {
            return Err(format!("next term starts at {next}, current position {position}"));
        }
    }

    if codec.position_for(initial_term_id.wrapping_sub(1), 0).is_ok() {
        return Err(format!("term before initial {initial_term_id} accepted"));
    }
    if encode(i64::from(term_count), term_offset | 1, shift).is_ok() {
        return Err(format!("misaligned offset {} accepted", term_offset | 1));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_term_ids() {
        check(0, i32::MAX, 5, 4160).unwrap();
        check(14, i32::MIN, 0, u32::MAX).unwrap();
        check(3, -1234, 1_000_000, 8192).unwrap();
    }

    #[test]
    fn test_largest_term_count() {
        check(14, 0, u32::MAX, 0).unwrap();
    }
}
