//! Fixed-length examples from variable-length token sequences
//!
//! Segment ids are 1-based per example; 0 marks padding. Positions count
//! from 0 within each segment and are 0 on padding.

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// One fixed-length training example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedExample {
    pub inputs: Vec<u32>,
    pub targets: Vec<u32>,
    pub inputs_segmentation: Vec<u32>,
    pub targets_segmentation: Vec<u32>,
    pub inputs_position: Vec<u32>,
    pub targets_position: Vec<u32>,
}

impl PackedExample {
    fn from_slot(slot: Slot, capacity: usize, pad_id: u32) -> Self {
        let Slot {
            mut tokens,
            mut segmentation,
            mut positions,
            ..
        } = slot;
        tokens.resize(capacity, pad_id);
        segmentation.resize(capacity, 0);
        positions.resize(capacity, 0);
        Self {
            targets: tokens.clone(),
            inputs: tokens,
            targets_segmentation: segmentation.clone(),
            inputs_segmentation: segmentation,
            targets_position: positions.clone(),
            inputs_position: positions,
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Positions holding real tokens.
    pub fn num_tokens(&self) -> usize {
        self.inputs_segmentation.iter().filter(|&&s| s != 0).count()
    }

    pub fn num_segments(&self) -> usize {
        self.inputs_segmentation.iter().copied().max().unwrap_or(0) as usize
    }

    /// The original sequences, padding stripped.
    pub fn segments(&self) -> Vec<Vec<u32>> {
        let mut out = vec![Vec::new(); self.num_segments()];
        for (&token, &segment) in self.inputs.iter().zip(&self.inputs_segmentation) {
            if segment != 0 {
                out[segment as usize - 1].push(token);
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct Slot {
    tokens: Vec<u32>,
    segmentation: Vec<u32>,
    positions: Vec<u32>,
    segments: u32,
}

impl Slot {
    fn append(&mut self, sequence: &[u32]) {
        self.segments += 1;
        self.tokens.extend_from_slice(sequence);
        self.segmentation
            .extend(std::iter::repeat_n(self.segments, sequence.len()));
        self.positions.extend(0..sequence.len() as u32);
    }
}

/// First-fit packer over at most `max_open` open slots.
///
/// A slot is emitted as soon as it is full. When a sequence fits no open
/// slot and the limit is reached, the oldest slot is emitted to make room.
pub struct Packer {
    capacity: usize,
    pad_id: u32,
    max_open: usize,
    open: VecDeque<Slot>,
    ready: VecDeque<PackedExample>,
}

impl Packer {
    pub fn new(capacity: usize, pad_id: u32, max_open: usize) -> Self {
        Self {
            capacity,
            pad_id,
            max_open: max_open.max(1),
            open: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sequence: &[u32]) -> Result<()> {
        if sequence.len() > self.capacity {
            return Err(Error::OversizedSequence {
                length: sequence.len(),
                capacity: self.capacity,
            });
        }
        if sequence.is_empty() {
            return Ok(());
        }

        let fit = self
            .open
            .iter()
            .position(|slot| self.capacity - slot.tokens.len() >= sequence.len());
        let idx = match fit {
            Some(idx) => idx,
            None => {
                if self.open.len() >= self.max_open {
                    self.emit(0);
                }
                self.open.push_back(Slot::default());
                self.open.len() - 1
            }
        };

        self.open[idx].append(sequence);
        if self.open[idx].tokens.len() == self.capacity {
            self.emit(idx);
        }
        Ok(())
    }

    fn emit(&mut self, idx: usize) {
        if let Some(slot) = self.open.remove(idx) {
            self.ready
                .push_back(PackedExample::from_slot(slot, self.capacity, self.pad_id));
        }
    }

    /// Emit every open slot; called once the source is exhausted.
    pub fn finish(&mut self) {
        while !self.open.is_empty() {
            self.emit(0);
        }
    }

    pub fn pop(&mut self) -> Option<PackedExample> {
        self.ready.pop_front()
    }

    pub fn open_slots(&self) -> usize {
        self.open.len()
    }
}

/// One sequence, padded to `capacity`.
pub fn pad_to_length(sequence: &[u32], capacity: usize, pad_id: u32) -> Result<PackedExample> {
    if sequence.len() > capacity {
        return Err(Error::OversizedSequence {
            length: sequence.len(),
            capacity,
        });
    }
    let mut slot = Slot::default();
    if !sequence.is_empty() {
        slot.append(sequence);
    }
    Ok(PackedExample::from_slot(slot, capacity, pad_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// First-fit packing with at most this many open slots
    Pack { max_open: usize },
    /// One padded example per sequence
    Pad,
}

/// Turns a stream of token sequences into fixed-length examples.
pub struct ExampleStream<I> {
    inner: I,
    policy: Policy,
    capacity: usize,
    pad_id: u32,
    packer: Packer,
    exhausted: bool,
    emitted: usize,
}

impl<I> ExampleStream<I>
where
    I: Iterator<Item = Result<Vec<u32>>>,
{
    pub fn new(inner: I, policy: Policy, capacity: usize, pad_id: u32) -> Self {
        let max_open = match policy {
            Policy::Pack { max_open } => max_open,
            Policy::Pad => 1,
        };
        Self {
            inner,
            policy,
            capacity,
            pad_id,
            packer: Packer::new(capacity, pad_id, max_open),
            exhausted: false,
            emitted: 0,
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn next_example(&mut self) -> Option<Result<PackedExample>> {
        if let Policy::Pad = self.policy {
            return match self.inner.next()? {
                Ok(sequence) => Some(pad_to_length(&sequence, self.capacity, self.pad_id)),
                Err(e) => Some(Err(e)),
            };
        }

        loop {
            if let Some(example) = self.packer.pop() {
                return Some(Ok(example));
            }
            if self.exhausted {
                return None;
            }
            match self.inner.next() {
                Some(Ok(sequence)) => {
                    if let Err(e) = self.packer.push(&sequence) {
                        return Some(Err(e));
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.exhausted = true;
                    self.packer.finish();
                }
            }
        }
    }
}

impl<I> Iterator for ExampleStream<I>
where
    I: Iterator<Item = Result<Vec<u32>>>,
{
    type Item = Result<PackedExample>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.next_example();
        if let Some(Ok(_)) = item {
            self.emitted += 1;
        }
        item
    }
}
