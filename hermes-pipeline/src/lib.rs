pub mod batching;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod io;
pub mod materialize;
pub mod packing;
mod pipeline_tests;
pub mod shard;
pub mod source;
pub mod tokenizer;

pub use batching::{Batch, Feature};
pub use config::{DatasetSpec, PipelineConfig, PipelineOptions};
pub use data::{EpochIter, LocalBatches, Pipeline, make_iterators, tokenizer_options};
pub use distributed::{
    Collective, DeviceMesh, FileRendezvous, HostAssignment, InProcessGroup, SingleHost, StepReport,
};
pub use error::{Error, Result};
pub use materialize::{GlobalBatch, Materializer, ShardedArray};
pub use packing::{PackedExample, Policy};
pub use source::{JsonlSource, MemorySource, Record, RecordSource};
pub use tokenizer::{Tokenizer, TokenizerOptions};
