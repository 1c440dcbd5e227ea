/// Fixed-size piece ownership vector.
///
/// Index 0 maps to the most significant bit of the first byte on the wire.
/// The length is fixed at construction; indexing past it is a caller bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<bool>,
}

impl Bitfield {
    pub fn new(num_pieces: usize, initial: bool) -> Self {
        Self {
            bits: vec![initial; num_pieces],
        }
    }

    pub fn set(&mut self, index: usize) {
        self.bits[index] = true;
    }

    #[cfg(test)]
    pub fn clear(&mut self, index: usize) {
        self.bits[index] = false;
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits[index]
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Number of pieces owned
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.iter().all(|&b| b)
    }

    /// Pack into wire bytes, padding the last byte with zero bits.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.bits.len().div_ceil(8)];
        for (index, _) in self.bits.iter().enumerate().filter(|(_, &b)| b) {
            bytes[index / 8] |= 1 << (7 - (index % 8));
        }
        bytes
    }

    /// Unpack wire bytes. Missing trailing bytes read as zero and spare bits
    /// past `num_pieces` are ignored.
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Self {
        let bits = (0..num_pieces)
            .map(|index| {
                bytes
                    .get(index / 8)
                    .map(|byte| (byte >> (7 - (index % 8))) & 1 == 1)
                    .unwrap_or(false)
            })
            .collect();
        Self { bits }
    }

    /// True if `other` owns a piece that `self` lacks.
    pub fn has_any_piece_missing_locally(&self, other: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(&local, &remote)| remote && !local)
    }

    /// Indices owned by `other` and missing from `self`.
    pub fn missing_from<'a>(&'a self, other: &'a Bitfield) -> impl Iterator<Item = usize> + 'a {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .enumerate()
            .filter(|(_, (&local, &remote))| remote && !local)
            .map(|(index, _)| index)
    }
}
