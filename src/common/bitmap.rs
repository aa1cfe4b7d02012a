use std::fmt;

const WORD_BITS: usize = 64;

/// Fixed-width bit set over dense indices (node numbers, core cells).
///
/// Bits past `nbits` in the last word are kept zero so that counting
/// and whole-word operations never need masking.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    nbits: usize,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new(nbits: usize) -> Self {
        Bitmap {
            nbits,
            words: vec![0; (nbits + WORD_BITS - 1) / WORD_BITS],
        }
    }

    pub fn filled(nbits: usize) -> Self {
        let mut bitmap = Bitmap::new(nbits);
        if nbits > 0 {
            bitmap.set_range(0, nbits - 1);
        }
        bitmap
    }

    #[inline]
    pub fn nbits(&self) -> usize {
        self.nbits
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.nbits);
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        assert!(index < self.nbits);
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    #[inline]
    pub fn unset(&mut self, index: usize) {
        assert!(index < self.nbits);
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }

    /// Set bits `first..=last`; already-set bits stay set.
    pub fn set_range(&mut self, first: usize, last: usize) {
        assert!(first <= last && last < self.nbits);
        for index in first..=last {
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn clear_count(&self) -> usize {
        self.nbits - self.count()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn first_set(&self) -> Option<usize> {
        for (i, word) in self.words.iter().enumerate() {
            if *word != 0 {
                return Some(i * WORD_BITS + word.trailing_zeros() as usize);
            }
        }
        None
    }

    pub fn last_set(&self) -> Option<usize> {
        for (i, word) in self.words.iter().enumerate().rev() {
            if *word != 0 {
                return Some(i * WORD_BITS + (WORD_BITS - 1 - word.leading_zeros() as usize));
            }
        }
        None
    }

    /// Bitmap containing the first `count` set bits, or None if there
    /// are fewer than `count`.
    pub fn pick_count(&self, count: usize) -> Option<Bitmap> {
        let mut picked = Bitmap::new(self.nbits);
        let mut remaining = count;
        if remaining == 0 {
            return Some(picked);
        }
        for index in self.iter_ones() {
            picked.set(index);
            remaining -= 1;
            if remaining == 0 {
                return Some(picked);
            }
        }
        None
    }

    pub fn union_with(&mut self, other: &Bitmap) {
        assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    pub fn intersect_with(&mut self, other: &Bitmap) {
        assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
    }

    /// Clear every bit that is set in `other`.
    pub fn subtract(&mut self, other: &Bitmap) {
        assert_eq!(self.nbits, other.nbits);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    pub fn overlaps(&self, other: &Bitmap) -> bool {
        assert_eq!(self.nbits, other.nbits);
        self.words.iter().zip(&other.words).any(|(w, o)| w & o != 0)
    }

    pub fn is_superset_of(&self, other: &Bitmap) -> bool {
        assert_eq!(self.nbits, other.nbits);
        self.words.iter().zip(&other.words).all(|(w, o)| o & !w == 0)
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let word = *word;
            (0..WORD_BITS)
                .filter(move |b| word & (1 << b) != 0)
                .map(move |b| i * WORD_BITS + b)
        })
    }

    /// Ranged textual form, e.g. "0-3,8,10-12"; empty set gives "".
    /// This is the serialised representation of every bitmap.
    pub fn to_ranged_string(&self) -> String {
        let mut out = String::new();
        let mut run: Option<(usize, usize)> = None;
        for index in self.iter_ones() {
            match run {
                Some((first, last)) if index == last + 1 => run = Some((first, index)),
                Some((first, last)) => {
                    Self::write_range(&mut out, first, last);
                    out.push(',');
                    run = Some((index, index));
                }
                None => run = Some((index, index)),
            }
        }
        if let Some((first, last)) = run {
            Self::write_range(&mut out, first, last);
        }
        out
    }

    fn write_range(out: &mut String, first: usize, last: usize) {
        use std::fmt::Write;
        if first == last {
            let _ = write!(out, "{}", first);
        } else {
            let _ = write!(out, "{}-{}", first, last);
        }
    }

    pub fn from_ranged_string(nbits: usize, text: &str) -> Result<Bitmap, String> {
        let mut bitmap = Bitmap::new(nbits);
        if text.is_empty() {
            return Ok(bitmap);
        }
        for part in text.split(',') {
            let (first, last) = match part.split_once('-') {
                Some((a, b)) => (
                    a.parse::<usize>().map_err(|_| format!("bad range: {}", part))?,
                    b.parse::<usize>().map_err(|_| format!("bad range: {}", part))?,
                ),
                None => {
                    let v = part
                        .parse::<usize>()
                        .map_err(|_| format!("bad index: {}", part))?;
                    (v, v)
                }
            };
            if first > last || last >= nbits {
                return Err(format!("range {} out of bounds for {} bits", part, nbits));
            }
            bitmap.set_range(first, last);
        }
        Ok(bitmap)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap[{}]({})", self.nbits, self.to_ranged_string())
    }
}
