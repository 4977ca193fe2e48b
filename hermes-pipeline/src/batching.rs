use tracing::debug;

use crate::error::Result;
use crate::packing::PackedExample;

/// Named columns of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    Inputs,
    Targets,
    InputsSegmentation,
    TargetsSegmentation,
    InputsPosition,
    TargetsPosition,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Inputs,
        Feature::Targets,
        Feature::InputsSegmentation,
        Feature::TargetsSegmentation,
        Feature::InputsPosition,
        Feature::TargetsPosition,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Feature::Inputs => "inputs",
            Feature::Targets => "targets",
            Feature::InputsSegmentation => "inputs_segmentation",
            Feature::TargetsSegmentation => "targets_segmentation",
            Feature::InputsPosition => "inputs_position",
            Feature::TargetsPosition => "targets_position",
        }
    }
}

/// Host-local batch; every feature is a row-major `[rows, seq_len]` array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    rows: usize,
    seq_len: usize,
    columns: [Vec<u32>; 6],
}

impl Batch {
    pub fn from_examples(examples: &[PackedExample], seq_len: usize) -> Self {
        let rows = examples.len();
        let mut columns: [Vec<u32>; 6] = Default::default();
        for column in columns.iter_mut() {
            column.reserve(rows * seq_len);
        }
        for ex in examples {
            columns[0].extend_from_slice(&ex.inputs);
            columns[1].extend_from_slice(&ex.targets);
            columns[2].extend_from_slice(&ex.inputs_segmentation);
            columns[3].extend_from_slice(&ex.targets_segmentation);
            columns[4].extend_from_slice(&ex.inputs_position);
            columns[5].extend_from_slice(&ex.targets_position);
        }
        Self {
            rows,
            seq_len,
            columns,
        }
    }

    /// `[rows, seq_len]`, computed from the data actually held.
    pub fn shape(&self) -> Vec<usize> {
        let len = self.columns.iter().map(Vec::len).max().unwrap_or(0);
        let rows = if self.seq_len == 0 { 0 } else { len / self.seq_len };
        vec![rows, self.seq_len]
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn get(&self, feature: Feature) -> &[u32] {
        &self.columns[feature as usize]
    }

    pub fn row(&self, feature: Feature, row: usize) -> &[u32] {
        &self.get(feature)[row * self.seq_len..(row + 1) * self.seq_len]
    }

    /// Rewrite targets as next-token targets of `inputs`.
    ///
    /// `targets[t] = inputs[t + 1]`, with `sentinel` at the last position.
    /// Target segmentation is zeroed wherever the next token belongs to a
    /// different segment or to padding, and at the last position.
    pub fn shift(&mut self, sentinel: u32) {
        let l = self.seq_len;
        let [inputs, targets, inputs_seg, targets_seg, inputs_pos, targets_pos] =
            &mut self.columns;
        for r in 0..self.rows {
            let span = r * l..(r + 1) * l;
            let input = &inputs[span.clone()];
            let seg = &inputs_seg[span.clone()];
            let target = &mut targets[span.clone()];
            let target_seg = &mut targets_seg[span.clone()];
            for t in 0..l {
                if t + 1 < l {
                    target[t] = input[t + 1];
                    target_seg[t] = if seg[t] != 0 && seg[t + 1] == seg[t] {
                        seg[t]
                    } else {
                        0
                    };
                } else {
                    target[t] = sentinel;
                    target_seg[t] = 0;
                }
            }
            targets_pos[span.clone()].copy_from_slice(&inputs_pos[span]);
        }
    }
}

/// Groups examples into batches of exactly `batch_size`, in arrival order.
///
/// A trailing group smaller than `batch_size` is dropped.
pub struct Batcher<I> {
    inner: I,
    batch_size: usize,
    seq_len: usize,
    dropped: usize,
    done: bool,
}

impl<I> Batcher<I>
where
    I: Iterator<Item = Result<PackedExample>>,
{
    pub fn new(inner: I, batch_size: usize, seq_len: usize) -> Self {
        Self {
            inner,
            batch_size,
            seq_len,
            dropped: 0,
            done: false,
        }
    }

    /// Examples discarded by the final incomplete group.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

impl<I> Iterator for Batcher<I>
where
    I: Iterator<Item = Result<PackedExample>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut group = Vec::with_capacity(self.batch_size);
        while group.len() < self.batch_size {
            match self.inner.next() {
                Some(Ok(example)) => group.push(example),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    self.dropped = group.len();
                    if !group.is_empty() {
                        debug!("Dropping {} trailing examples", group.len());
                    }
                    return None;
                }
            }
        }
        Some(Ok(Batch::from_examples(&group, self.seq_len)))
    }
}
