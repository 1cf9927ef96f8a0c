use std::ops::Range;

use crate::config::TrainModal;

/// Ordered, contiguous class index ranges covering `0..n_cls`.
///
/// base2novel holds the base half `[0, ceil(n/2))` and the novel half
/// `[ceil(n/2), n)`; cross holds a single range over every class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPartition {
    ranges: Vec<Range<usize>>,
    n_cls: usize,
}

impl ClassPartition {
    pub fn for_modal(modal: TrainModal, n_cls: usize) -> Self {
        match modal {
            TrainModal::Base2Novel => Self::base2novel(n_cls),
            TrainModal::Cross => Self::cross(n_cls),
        }
    }

    pub fn base2novel(n_cls: usize) -> Self {
        let split = n_cls.div_ceil(2);
        let ranges = [0..split, split..n_cls].into_iter().filter(|r| !r.is_empty()).collect();
        Self { ranges, n_cls }
    }

    pub fn cross(n_cls: usize) -> Self {
        let ranges = if n_cls == 0 { Vec::new() } else { vec![0..n_cls] };
        Self { ranges, n_cls }
    }

    pub fn n_cls(&self) -> usize {
        self.n_cls
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Classes seen in training (the first range).
    pub fn base(&self) -> Range<usize> {
        self.ranges.first().cloned().unwrap_or(0..0)
    }

    /// Held-out classes, when the partition has a second range.
    pub fn novel(&self) -> Option<Range<usize>> {
        self.ranges.get(1).cloned()
    }

    /// Sizes of each range, in order.
    pub fn sizes(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.len()).collect()
    }
}
