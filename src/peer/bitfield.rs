/// A bitfield recording which pieces of one file are held.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0; byte_count],
            piece_count,
        }
    }

    /// Creates a bitfield from raw bytes.
    ///
    /// Short input is zero-padded; bits past `piece_count` are cleared.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        let mut bf = Self {
            bits: vec![0xFF; byte_count],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Returns true if the piece at the given index is available.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Sets or clears the bit at `index`, returning the previous value.
    ///
    /// Out-of-range indices are ignored and report `false`.
    pub fn assign(&mut self, index: usize, value: bool) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let previous = self.has(index);
        let byte_index = index / 8;
        let mask = 1u8 << (7 - (index % 8));
        if value {
            self.bits[byte_index] |= mask;
        } else {
            self.bits[byte_index] &= !mask;
        }
        previous
    }

    pub fn set(&mut self, index: usize) {
        self.assign(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        self.assign(index, false);
    }

    /// Returns the number of pieces that are available.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if all pieces are available.
    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.piece_count
    }

    /// Returns true if no pieces are available.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the total number of pieces.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Returns indices of all pieces that are not available.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.piece_count).filter(|&i| !self.has(i)).collect()
    }

    /// Returns indices of all available pieces.
    pub fn available(&self) -> Vec<usize> {
        (0..self.piece_count).filter(|&i| self.has(i)).collect()
    }

    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() * 8) - self.piece_count;
        if spare > 0 && spare < 8 && !self.bits.is_empty() {
            let mask = 0xFFu8 << spare;
            let last = self.bits.len() - 1;
            self.bits[last] &= mask;
        }
    }
}
