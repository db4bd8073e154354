//! Resumable field readers
//!
//! Every reader pulls at most the bytes it still needs from an [`Input`]
//! and keeps its partial value when the input runs dry, so a field split
//! across any number of reads decodes exactly like a contiguous one.

use super::message::{Timestamp, TIMESTAMP_SIZE};

/// Cursor over the bytes handed to a single `feed` call
#[derive(Debug)]
pub(crate) struct Input<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    /// Take up to `max` bytes
    pub fn take(&mut self, max: usize) -> &'a [u8] {
        let n = max.min(self.remaining());
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Give back the last `n` bytes taken
    pub fn rewind(&mut self, n: usize) {
        self.pos -= n.min(self.pos);
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Little-endian `u32`, accumulated one byte at a time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LeU32 {
    value: u32,
    filled: u8,
}

impl LeU32 {
    /// Returns the value once all four bytes are in; the reader is then
    /// ready for the next field.
    pub fn read(&mut self, input: &mut Input<'_>) -> Option<u32> {
        while self.filled < 4 {
            let byte = input.next_byte()?;
            self.value |= (byte as u32) << (8 * self.filled as u32);
            self.filled += 1;
        }
        let value = self.value;
        *self = Self::default();
        Some(value)
    }

    /// Bytes accumulated so far
    pub fn filled(&self) -> usize {
        self.filled as usize
    }
}

/// Fixed-size little-endian byte group, e.g. an encoded [`Timestamp`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LeBytes<const N: usize> {
    bytes: [u8; N],
    filled: usize,
}

impl<const N: usize> LeBytes<N> {
    pub fn new() -> Self {
        Self {
            bytes: [0u8; N],
            filled: 0,
        }
    }

    pub fn read(&mut self, input: &mut Input<'_>) -> Option<[u8; N]> {
        while self.filled < N {
            self.bytes[self.filled] = input.next_byte()?;
            self.filled += 1;
        }
        let bytes = self.bytes;
        *self = Self::new();
        Some(bytes)
    }

    pub fn filled(&self) -> usize {
        self.filled
    }
}

pub(crate) type TimestampField = LeBytes<TIMESTAMP_SIZE>;

impl TimestampField {
    pub fn read_timestamp(&mut self, input: &mut Input<'_>) -> Option<Timestamp> {
        self.read(input).map(Timestamp::from_le_bytes)
    }
}

/// Reorder one PCM word from wire packing into the frame word kept in
/// chunk memory.
///
/// Wire bytes `[b0, b1, b2, b3]` are first packed big-endian into
/// `b0<<24 | b1<<16 | b2<<8 | b3`, then reordered to
/// `b0<<16 | b1<<24 | b2 | b3<<8`. Stored little-endian this gives
/// `[b2, b3, b0, b1]`: the two 16-bit halves of a stereo frame swap places.
pub fn shuffle_pcm_word(wire: [u8; 4]) -> u32 {
    let packed = u32::from_be_bytes(wire);

    let mut word = 0u32;
    word |= ((packed >> 24) & 0xff) << 16;
    word |= ((packed >> 16) & 0xff) << 24;
    word |= (packed >> 8) & 0xff;
    word |= (packed & 0xff) << 8;
    word
}

/// Reassembles PCM payload bytes into frame words, four at a time
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PcmWordAssembler {
    pending: [u8; 4],
    filled: usize,
}

impl PcmWordAssembler {
    /// Push one byte; returns the stored little-endian bytes of a
    /// completed word
    pub fn push(&mut self, byte: u8) -> Option<[u8; 4]> {
        self.pending[self.filled] = byte;
        self.filled += 1;
        if self.filled < 4 {
            return None;
        }
        self.filled = 0;
        Some(shuffle_pcm_word(self.pending).to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_u32_resumes_across_inputs() {
        let bytes = 0xdead_beefu32.to_le_bytes();
        let mut field = LeU32::default();

        let mut first = Input::new(&bytes[..1]);
        assert_eq!(field.read(&mut first), None);

        let mut second = Input::new(&bytes[1..3]);
        assert_eq!(field.read(&mut second), None);
        assert_eq!(field.filled(), 3);

        let mut third = Input::new(&bytes[3..]);
        assert_eq!(field.read(&mut third), Some(0xdead_beef));
        assert_eq!(field.filled(), 0);
    }

    #[test]
    fn test_le_u32_never_over_reads() {
        let bytes = [1, 0, 0, 0, 9, 9];
        let mut input = Input::new(&bytes);
        let mut field = LeU32::default();

        assert_eq!(field.read(&mut input), Some(1));
        assert_eq!(input.remaining(), 2);
    }

    #[test]
    fn test_timestamp_field() {
        let ts = Timestamp::new(-3, 123_456);
        let bytes = ts.to_le_bytes();
        let mut field = TimestampField::new();

        let mut a = Input::new(&bytes[..5]);
        assert_eq!(field.read_timestamp(&mut a), None);
        assert_eq!(field.filled(), 5);

        let mut b = Input::new(&bytes[5..]);
        assert_eq!(field.read_timestamp(&mut b), Some(ts));
    }

    #[test]
    fn test_shuffle_swaps_halves() {
        assert_eq!(shuffle_pcm_word([0x11, 0x22, 0x33, 0x44]), 0x2211_4433);
        assert_eq!(
            shuffle_pcm_word([0x11, 0x22, 0x33, 0x44]).to_le_bytes(),
            [0x33, 0x44, 0x11, 0x22]
        );
    }

    #[test]
    fn test_pcm_assembler() {
        let mut asm = PcmWordAssembler::default();
        assert_eq!(asm.push(1), None);
        assert_eq!(asm.push(2), None);
        assert_eq!(asm.push(3), None);
        assert_eq!(asm.push(4), Some([3, 4, 1, 2]));
        assert_eq!(asm.push(5), None);
    }
}
