mod bitmap;

pub use bitmap::{Bitmap, WORD_BITS};
