/// A buffer of concatenated encoded rows and the number of rows it holds.
///
/// Moved between owners by swapping, so the allocation is reused.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufRows {
    pub buf: Vec<u8>,
    pub rows: usize,
}

impl BufRows {
    /// The number of encoded bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `rows` rows encoded in `buf`.
    pub fn extend(&mut self, buf: &[u8], rows: usize) {
        self.buf.extend_from_slice(buf);
        self.rows += rows;
    }

    /// Clear the contents, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.rows = 0;
    }

    /// Release the allocation if less than a quarter of it is in use.
    pub(crate) fn shrink_if_sparse(&mut self) -> bool {
        if self.buf.len() >= self.buf.capacity() / 4 {
            return false;
        }
        self.buf.shrink_to_fit();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shrink_if_sparse() {
        let mut br = BufRows {
            buf: Vec::with_capacity(1024),
            rows: 0,
        };
        br.extend(&[1; 100], 1);
        assert!(br.shrink_if_sparse());
        assert!(br.buf.capacity() < 1024);
        assert_eq!(br.buf, vec![1; 100]);

        br.extend(&[2; 100], 1);
        let cap = br.buf.capacity();
        assert!(!br.shrink_if_sparse());
        assert_eq!(br.buf.capacity(), cap);
        assert_eq!(br.rows, 2);

        br.reset();
        assert!(br.is_empty());
        assert_eq!(br.rows, 0);
    }
}
