//! Segmentation: splitting oversized messages and reassembling them.
//!
//! A serialized message is cut into equal sections (the last may be short).
//! The receiver collects sections into a fixed slot array sized by the first
//! count it sees and yields the message only once every slot is filled.
//! Out-of-order and duplicate sections are fine; a duplicate overwrites its
//! own slot.

use raet_types::kinds::MAX_SEGMENT_COUNT;
use raet_types::RaetError;
use thiserror::Error;

/// Errors from segmentation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("Section size must be positive")]
    ZeroSize,
    #[error("Message needs {count} segments (max {max})")]
    TooManySegments { count: usize, max: usize },
    #[error("Segment {index} out of range for count {count}")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("Segment count changed from {expected} to {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("Reassembled length {actual} does not match declared {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

impl From<SegmentError> for RaetError {
    fn from(e: SegmentError) -> Self {
        RaetError::Segment(e.to_string())
    }
}

/// Split `data` into sections of at most `size` bytes.
///
/// An empty message still yields one (empty) section.
pub fn segment(data: &[u8], size: usize) -> Result<Vec<&[u8]>, SegmentError> {
    if size == 0 {
        return Err(SegmentError::ZeroSize);
    }
    if data.is_empty() {
        return Ok(vec![data]);
    }
    let count = data.len().div_ceil(size);
    if count > MAX_SEGMENT_COUNT {
        return Err(SegmentError::TooManySegments {
            count,
            max: MAX_SEGMENT_COUNT,
        });
    }
    Ok(data.chunks(size).collect())
}

/// All-or-nothing collector for the sections of one message.
#[derive(Debug, Clone)]
pub struct Reassembly {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
    total: Option<usize>,
}

impl Reassembly {
    /// Start collecting a message of `count` sections.
    ///
    /// `total`, when known, is checked against the reassembled length.
    pub fn new(count: usize, total: Option<usize>) -> Result<Self, SegmentError> {
        if count == 0 || count > MAX_SEGMENT_COUNT {
            return Err(SegmentError::TooManySegments {
                count,
                max: MAX_SEGMENT_COUNT,
            });
        }
        Ok(Self {
            slots: vec![None; count],
            filled: 0,
            total,
        })
    }

    /// Number of sections expected.
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Number of distinct sections received so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Whether every slot is filled.
    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Store one section. Returns the whole message once complete.
    pub fn accept(
        &mut self,
        index: usize,
        count: usize,
        section: &[u8],
    ) -> Result<Option<Vec<u8>>, SegmentError> {
        if count != self.slots.len() {
            return Err(SegmentError::CountMismatch {
                expected: self.slots.len(),
                actual: count,
            });
        }
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SegmentError::IndexOutOfRange { index, count })?;
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(section.to_vec());

        if !self.is_complete() {
            return Ok(None);
        }
        let message: Vec<u8> = self.slots.iter().flatten().flatten().copied().collect();
        if let Some(expected) = self.total {
            if message.len() != expected {
                return Err(SegmentError::LengthMismatch {
                    expected,
                    actual: message.len(),
                });
            }
        }
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_segment_sizes() {
        let data = sample(2500);
        let sections = segment(&data, 1000).unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].len(), 1000);
        assert_eq!(sections[2].len(), 500);
        assert_eq!(segment(&[], 10).unwrap().len(), 1);
        assert_eq!(segment(&data, 0), Err(SegmentError::ZeroSize));
    }

    #[test]
    fn test_too_many_segments() {
        let data = vec![0u8; MAX_SEGMENT_COUNT + 1];
        assert!(matches!(
            segment(&data, 1),
            Err(SegmentError::TooManySegments { .. })
        ));
    }

    #[test]
    fn test_reassemble_any_order() {
        let data = sample(5003);
        for size in [1usize, 7, 100, 5003, 6000] {
            let sections = segment(&data, size).unwrap();
            let count = sections.len();
            // reversed, then interleaved odd/even
            let mut orders: Vec<Vec<usize>> = vec![(0..count).rev().collect()];
            let mut interleaved: Vec<usize> = (0..count).filter(|i| i % 2 == 1).collect();
            interleaved.extend((0..count).filter(|i| i % 2 == 0));
            orders.push(interleaved);
            for order in orders {
                let mut book = Reassembly::new(count, Some(data.len())).unwrap();
                let mut result = None;
                for (n, &i) in order.iter().enumerate() {
                    let out = book.accept(i, count, sections[i]).unwrap();
                    if n + 1 < count {
                        assert!(out.is_none(), "partial message exposed");
                    } else {
                        result = out;
                    }
                }
                assert_eq!(result.unwrap(), data);
            }
        }
    }

    #[test]
    fn test_duplicates_are_idempotent() {
        let data = sample(30);
        let sections = segment(&data, 10).unwrap();
        let mut book = Reassembly::new(3, None).unwrap();
        assert!(book.accept(0, 3, sections[0]).unwrap().is_none());
        assert!(book.accept(0, 3, sections[0]).unwrap().is_none());
        assert_eq!(book.filled(), 1);
        assert!(book.accept(2, 3, sections[2]).unwrap().is_none());
        assert_eq!(book.accept(1, 3, sections[1]).unwrap().unwrap(), data);
    }

    #[test]
    fn test_bad_sections_rejected() {
        let mut book = Reassembly::new(2, Some(4)).unwrap();
        assert_eq!(
            book.accept(2, 2, b"ab"),
            Err(SegmentError::IndexOutOfRange { index: 2, count: 2 })
        );
        assert_eq!(
            book.accept(0, 3, b"ab"),
            Err(SegmentError::CountMismatch {
                expected: 2,
                actual: 3
            })
        );
        book.accept(0, 2, b"ab").unwrap();
        assert_eq!(
            book.accept(1, 2, b"abc"),
            Err(SegmentError::LengthMismatch {
                expected: 4,
                actual: 5
            })
        );
        assert!(Reassembly::new(0, None).is_err());
    }
}
