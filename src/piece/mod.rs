mod bitfield;
mod picker;

pub use bitfield::Bitfield;
pub use picker::PiecePicker;

/// Byte range of a piece within the shared file.
///
/// The last piece may be short; indices past the end have length zero.
pub fn piece_length(index: u32, piece_size: u32, file_size: u64) -> u32 {
    let offset = piece_offset(index, piece_size);
    if offset >= file_size {
        return 0;
    }
    std::cmp::min(piece_size as u64, file_size - offset) as u32
}

pub fn piece_offset(index: u32, piece_size: u32) -> u64 {
    index as u64 * piece_size as u64
}

pub fn num_pieces(file_size: u64, piece_size: u32) -> usize {
    file_size.div_ceil(piece_size as u64) as usize
}
