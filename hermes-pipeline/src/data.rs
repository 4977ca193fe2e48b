use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::batching::{Batch, Batcher};
use crate::config::{PipelineConfig, PipelineOptions};
use crate::distributed::{Collective, DeviceMesh, HostAssignment};
use crate::error::{Error, Result};
use crate::materialize::{GlobalBatch, Materializer};
use crate::packing::{ExampleStream, Policy};
use crate::shard::{ShardIter, ShardOptions, ShardedSource, Transform};
use crate::source::{JsonlSource, Record, RecordSource};
use crate::tokenizer::{Tokenizer, TokenizerOptions};

/// Host-local batches for one epoch, before global assembly.
pub struct LocalBatches {
    inner: Batcher<ExampleStream<ShardIter<Vec<u32>>>>,
    shift: Option<u32>,
    records: Arc<AtomicUsize>,
}

impl LocalBatches {
    /// Records read from this host's shard so far.
    pub fn records(&self) -> usize {
        self.records.load(Ordering::Relaxed)
    }

    /// Examples produced by packing or padding so far.
    pub fn examples(&self) -> usize {
        self.inner.inner().emitted()
    }

    /// Examples discarded by the incomplete final batch.
    pub fn dropped(&self) -> usize {
        self.inner.dropped()
    }
}

impl Iterator for LocalBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = match self.inner.next()? {
            Ok(batch) => batch,
            Err(e) => return Some(Err(e)),
        };
        if let Some(sentinel) = self.shift {
            batch.shift(sentinel);
        }
        Some(Ok(batch))
    }
}

/// Streaming input pipeline of one host: tokenize, pack or pad, batch,
/// shift, then assemble global batches with the other hosts.
pub struct Pipeline {
    options: PipelineOptions,
    source: ShardedSource,
    tokenizer: Arc<Tokenizer>,
    materializer: Materializer,
    epoch: u64,
    next_step: u64,
}

impl Pipeline {
    /// Checks the batch layout against the mesh before any record is read.
    pub fn new(
        options: PipelineOptions,
        source: Arc<dyn RecordSource>,
        tokenizer: Arc<Tokenizer>,
        mesh: &DeviceMesh,
        host: HostAssignment,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        let materializer = Materializer::new(
            mesh.clone(),
            host,
            options.global_batch_size,
            options.max_target_length,
            collective,
        )?;
        let max_length = tokenizer.options().max_length;
        if max_length >= options.max_target_length {
            return Err(Error::config(format!(
                "tokenizer max_length {} must be below max_target_length {}",
                max_length, options.max_target_length
            )));
        }
        if tokenizer.pad_token_id() != options.pad_id {
            warn!(
                "pad_id {} differs from the tokenizer's pad token {}",
                options.pad_id,
                tokenizer.pad_token_id()
            );
        }

        let shard_options = ShardOptions {
            num_threads: options.num_threads,
            prefetch_buffer_size: options.prefetch_buffer_size,
            drop_remainder: options.drop_remainder,
            shuffle: options
                .shuffle
                .then_some((options.data_shuffle_seed, options.shuffle_buffer_size)),
        };
        let source = ShardedSource::new(source, host, shard_options);

        info!(
            "Host {}/{}: per-host batch {} x {}, packing={}, shift={}, workers={}",
            host.host_index,
            host.host_count,
            materializer.per_host_batch_size(),
            options.max_target_length,
            options.packing,
            options.shift,
            options.num_threads
        );
        if let Some(len) = source.length() {
            info!("Source reports {} records", len);
        }

        Ok(Self {
            options,
            source,
            tokenizer,
            materializer,
            epoch: 0,
            next_step: 0,
        })
    }

    pub fn per_host_batch_size(&self) -> usize {
        self.materializer.per_host_batch_size()
    }

    /// Record count of the underlying source, if it reports one.
    pub fn length(&self) -> Option<usize> {
        self.source.length()
    }

    pub fn host(&self) -> HostAssignment {
        self.source.host()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Step index the next global batch will carry.
    pub fn next_step(&self) -> u64 {
        self.next_step
    }

    fn transform(&self) -> Transform<Vec<u32>> {
        let field = self.options.text_field.clone();
        let tokenizer = Arc::clone(&self.tokenizer);
        Arc::new(move |record: Record| match record.get(&field) {
            Some(Value::String(text)) => tokenizer.encode(text),
            Some(other) => Err(Error::Source(format!(
                "field '{}' is not a string: {}",
                field, other
            ))),
            None => Err(Error::MissingField(field.clone())),
        })
    }

    /// This host's batches for `epoch`, without cross-host agreement.
    pub fn local_batches(&self, epoch: u64) -> LocalBatches {
        let records = self.source.iterate(epoch, self.transform());
        let received = records.received_counter();
        let policy = if self.options.packing {
            Policy::Pack {
                max_open: self.per_host_batch_size(),
            }
        } else {
            Policy::Pad
        };
        let examples = ExampleStream::new(
            records,
            policy,
            self.options.max_target_length,
            self.options.pad_id,
        );
        LocalBatches {
            inner: Batcher::new(
                examples,
                self.per_host_batch_size(),
                self.options.max_target_length,
            ),
            shift: self.options.shift.then_some(self.options.pad_id),
            records: received,
        }
    }

    /// Start the next epoch. Every host must iterate its epoch to the end
    /// so the step agreement stays in lockstep.
    pub fn epoch(&mut self) -> EpochIter<'_> {
        let epoch = self.epoch;
        self.epoch += 1;
        info!("Host {}: starting epoch {}", self.host().host_index, epoch);
        EpochIter {
            batches: self.local_batches(epoch),
            materializer: &self.materializer,
            next_step: &mut self.next_step,
            epoch,
            emitted: 0,
            done: false,
        }
    }
}

/// Global batches of one epoch.
pub struct EpochIter<'a> {
    batches: LocalBatches,
    materializer: &'a Materializer,
    next_step: &'a mut u64,
    epoch: u64,
    emitted: usize,
    done: bool,
}

impl EpochIter<'_> {
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn local(&self) -> &LocalBatches {
        &self.batches
    }

    fn take_step(&mut self) -> u64 {
        let step = *self.next_step;
        *self.next_step += 1;
        step
    }

    fn end(&mut self) {
        self.done = true;
        info!(
            "Epoch {} done: {} batches, {} records, {} examples, {} dropped",
            self.epoch,
            self.emitted,
            self.batches.records(),
            self.batches.examples(),
            self.batches.dropped()
        );
    }
}

impl Iterator for EpochIter<'_> {
    type Item = Result<GlobalBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.batches.next() {
            Some(Ok(batch)) => {
                let step = self.take_step();
                match self.materializer.assemble(step, &batch) {
                    Ok(Some(global)) => {
                        self.emitted += 1;
                        Some(Ok(global))
                    }
                    Ok(None) => {
                        self.end();
                        None
                    }
                    Err(e) => {
                        self.done = true;
                        Some(Err(e))
                    }
                }
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                let step = self.take_step();
                let finished = self.materializer.finish(step);
                self.end();
                finished.err().map(Err)
            }
        }
    }
}

/// Tokenizer settings for `config`; one position is reserved for the shift.
pub fn tokenizer_options(config: &PipelineConfig) -> TokenizerOptions {
    TokenizerOptions {
        add_bos: config.add_bos,
        add_eos: config.add_eos,
        max_length: config.max_target_length.saturating_sub(1),
    }
}

/// Build the training pipeline and, when `eval_interval > 0`, the eval one.
///
/// Batch layouts are checked against the mesh before any dataset file is
/// touched. The two pipelines must not share a collective.
pub fn make_iterators(
    config: &PipelineConfig,
    mesh: &DeviceMesh,
    host: HostAssignment,
    train_collective: Arc<dyn Collective>,
    eval_collective: Arc<dyn Collective>,
    tokenizer: Arc<Tokenizer>,
) -> Result<(Pipeline, Option<Pipeline>)> {
    config.validate()?;
    let train_options = PipelineOptions::train(config);
    mesh.per_host_batch_size(train_options.global_batch_size)?;
    let eval_options = if config.eval_enabled() {
        let options = PipelineOptions::eval(config, mesh.size());
        mesh.per_host_batch_size(options.global_batch_size)?;
        Some(options)
    } else {
        None
    };

    let train_source = JsonlSource::new(&config.train_dataset())?;
    info!(
        "Training data: {} file(s) under {}",
        train_source.files().len(),
        config.hf_path
    );
    let train = Pipeline::new(
        train_options,
        Arc::new(train_source),
        Arc::clone(&tokenizer),
        mesh,
        host,
        train_collective,
    )?;

    let eval = match eval_options {
        Some(options) => {
            let eval_source = JsonlSource::new(&config.eval_dataset())?;
            info!(
                "Eval data: {} file(s), split '{}'",
                eval_source.files().len(),
                config.hf_eval_split
            );
            Some(Pipeline::new(
                options,
                Arc::new(eval_source),
                tokenizer,
                mesh,
                host,
                eval_collective,
            )?)
        }
        None => {
            if !config.hf_eval_files.is_empty() {
                warn!("eval_interval <= 0, ignoring hf_eval_files");
            }
            None
        }
    };

    Ok((train, eval))
}
