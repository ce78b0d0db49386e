//! Fixed-capacity bitmap allocator over 32-bit words.
//!
//! Each bit stands for one allocation unit (a cache page). `get_range` is a
//! first-fit search for a run of clear bits: whole words that are fully set
//! are skipped in one step, everything else is walked bit by bit. It does not
//! try to find the best fit, so a long-lived bitmap can fragment.
//!
//! ```text
//! capacity = 40, words = 2
//!
//! word 0  bit 0 ............................... bit 31
//! word 1  bit 32 ... bit 39 | bits 40..63 never addressed
//! ```

use basalt_core::{Result, ShmError};
use serde::{Deserialize, Serialize};

pub const WORD_BITS: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BitmapRepr", into = "BitmapRepr")]
pub struct Bitmap {
    num_bits: usize,
    words: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitmapRepr {
    num_bits: usize,
    words: Vec<u32>,
}

impl Bitmap {
    pub fn new(num_bits: usize) -> Self {
        Self {
            num_bits,
            words: vec![0; num_bits.div_ceil(WORD_BITS)],
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_bits
    }

    #[inline]
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Clears every bit without reallocating.
    pub fn reset(&mut self) {
        self.words.fill(0);
    }

    #[inline]
    fn locate(&self, bit: usize) -> Result<(usize, u32)> {
        if bit >= self.num_bits {
            return Err(ShmError::OutOfRange {
                index: bit,
                capacity: self.num_bits,
            });
        }
        Ok((bit / WORD_BITS, 1u32 << (bit % WORD_BITS)))
    }

    pub fn is_set(&self, bit: usize) -> Result<bool> {
        let (w, mask) = self.locate(bit)?;
        Ok(self.words[w] & mask != 0)
    }

    pub fn set(&mut self, bit: usize) -> Result<()> {
        let (w, mask) = self.locate(bit)?;
        self.words[w] |= mask;
        Ok(())
    }

    /// Claims `bit` if it is clear. Returns `true` when this call claimed it.
    pub fn test_and_set(&mut self, bit: usize) -> Result<bool> {
        let (w, mask) = self.locate(bit)?;
        if self.words[w] & mask != 0 {
            return Ok(false);
        }
        self.words[w] |= mask;
        Ok(true)
    }

    /// Clears `bit`. Returns `true` if it was set.
    pub fn clear(&mut self, bit: usize) -> Result<bool> {
        let (w, mask) = self.locate(bit)?;
        let was_set = self.words[w] & mask != 0;
        self.words[w] &= !mask;
        Ok(was_set)
    }

    /// Clears `[start, start + len)`. Nothing changes if any part is out of range.
    pub fn clear_range(&mut self, start: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let last = start.checked_add(len - 1).ok_or(ShmError::OutOfRange {
            index: usize::MAX,
            capacity: self.num_bits,
        })?;
        self.locate(last)?;
        for bit in start..=last {
            self.clear(bit)?;
        }
        Ok(())
    }

    /// First-fit search for `len` contiguous clear bits.
    ///
    /// On success every bit of the run is set and its first index returned.
    /// `None` means no run exists (or `len` is zero); the bitmap is untouched.
    pub fn get_range(&mut self, len: usize) -> Option<usize> {
        if len == 0 || len > self.num_bits {
            return None;
        }

        let mut start = 0usize;
        let mut run = 0usize;
        let mut found = None;

        'words: for (w, &word) in self.words.iter().enumerate() {
            if word == u32::MAX {
                run = 0;
                continue;
            }
            for b in 0..WORD_BITS {
                let bit = w * WORD_BITS + b;
                if bit >= self.num_bits {
                    break 'words;
                }
                if word & (1 << b) != 0 {
                    run = 0;
                    continue;
                }
                if run == 0 {
                    start = bit;
                }
                run += 1;
                if run == len {
                    found = Some(start);
                    break 'words;
                }
            }
        }

        let start = found?;
        for bit in start..start + len {
            self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
        Some(start)
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn count_clear(&self) -> usize {
        self.num_bits - self.count_set()
    }
}

impl TryFrom<BitmapRepr> for Bitmap {
    type Error = String;

    fn try_from(repr: BitmapRepr) -> Result<Self, Self::Error> {
        let expected = repr.num_bits.div_ceil(WORD_BITS);
        if repr.words.len() != expected {
            return Err(format!(
                "bitmap of {} bits needs {expected} words, found {}",
                repr.num_bits,
                repr.words.len()
            ));
        }
        let tail = repr.num_bits % WORD_BITS;
        if tail != 0 {
            if let Some(&last) = repr.words.last() {
                if last >> tail != 0 {
                    return Err("bitmap has bits set beyond its capacity".into());
                }
            }
        }
        Ok(Bitmap {
            num_bits: repr.num_bits,
            words: repr.words,
        })
    }
}

impl From<Bitmap> for BitmapRepr {
    fn from(bitmap: Bitmap) -> Self {
        BitmapRepr {
            num_bits: bitmap.num_bits,
            words: bitmap.words,
        }
    }
}
