//! Global batch assembly
//!
//! Each host contributes rows `[h * per_host, (h + 1) * per_host)` of the
//! global batch. Its local rows are split evenly over its local devices, so
//! device `d` of host `h` holds global device index `h * local + d`.

use candle_core::{Device, Tensor};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::batching::{Batch, Feature};
use crate::distributed::{Collective, DeviceMesh, HostAssignment, StepReport};
use crate::error::{Error, Result};

/// One device's block of a globally sharded array.
#[derive(Debug, Clone)]
pub struct DeviceShard {
    pub device_index: usize,
    /// Rows of the global batch held by this shard
    pub rows: Range<usize>,
    pub tensor: Tensor,
}

/// The shards of one feature that live on this host.
#[derive(Debug, Clone)]
pub struct ShardedArray {
    pub global_shape: [usize; 2],
    pub shards: Vec<DeviceShard>,
}

impl ShardedArray {
    /// Host-local rows, gathered back from the device shards.
    pub fn local_rows(&self) -> Result<Vec<Vec<u32>>> {
        let mut rows = Vec::new();
        for shard in &self.shards {
            rows.extend(shard.tensor.to_device(&Device::Cpu)?.to_vec2::<u32>()?);
        }
        Ok(rows)
    }
}

/// One training step's batch: a logical `[global_batch, seq_len]` array per
/// feature, of which this host holds its own rows.
#[derive(Debug, Clone)]
pub struct GlobalBatch {
    pub step: u64,
    pub host_index: usize,
    pub global_shape: [usize; 2],
    pub local_rows: Range<usize>,
    arrays: Vec<(Feature, ShardedArray)>,
}

impl GlobalBatch {
    pub fn get(&self, feature: Feature) -> Option<&ShardedArray> {
        self.arrays
            .iter()
            .find(|(f, _)| *f == feature)
            .map(|(_, array)| array)
    }

    pub fn inputs(&self) -> Option<&ShardedArray> {
        self.get(Feature::Inputs)
    }

    pub fn targets(&self) -> Option<&ShardedArray> {
        self.get(Feature::Targets)
    }

    pub fn arrays(&self) -> impl Iterator<Item = (Feature, &ShardedArray)> {
        self.arrays.iter().map(|(f, a)| (*f, a))
    }
}

pub struct Materializer {
    mesh: DeviceMesh,
    host: HostAssignment,
    per_host_batch_size: usize,
    seq_len: usize,
    collective: Arc<dyn Collective>,
}

impl Materializer {
    pub fn new(
        mesh: DeviceMesh,
        host: HostAssignment,
        global_batch_size: usize,
        seq_len: usize,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        if host.host_count != mesh.host_count() {
            return Err(Error::config(format!(
                "host count {} does not match the mesh's {} hosts",
                host.host_count,
                mesh.host_count()
            )));
        }
        let per_host_batch_size = mesh.per_host_batch_size(global_batch_size)?;
        Ok(Self {
            mesh,
            host,
            per_host_batch_size,
            seq_len,
            collective,
        })
    }

    pub fn per_host_batch_size(&self) -> usize {
        self.per_host_batch_size
    }

    pub fn expected_shape(&self) -> Vec<usize> {
        vec![self.per_host_batch_size, self.seq_len]
    }

    pub fn global_shape(&self) -> [usize; 2] {
        [self.per_host_batch_size * self.host.host_count, self.seq_len]
    }

    /// Agree on `step` with every host. Returns `false` when some host has
    /// run out of batches, in which case no host may emit this step.
    fn agree(&self, step: u64, shape: Option<Vec<usize>>) -> Result<bool> {
        let reports = self.collective.all_gather(StepReport {
            host_index: self.host.host_index,
            step,
            shape,
        })?;
        if reports.len() != self.host.host_count {
            return Err(Error::Rendezvous(format!(
                "expected {} reports at step {}, got {}",
                self.host.host_count,
                step,
                reports.len()
            )));
        }

        let expected = self.expected_shape();
        let mut all_ready = true;
        for report in &reports {
            if report.step != step {
                return Err(Error::Rendezvous(format!(
                    "host {} is at step {} while host {} is at step {}",
                    report.host_index, report.step, self.host.host_index, step
                )));
            }
            match &report.shape {
                Some(shape) if *shape != expected => {
                    return Err(Error::ShardMismatch {
                        host: report.host_index,
                        step,
                        expected,
                        got: shape.clone(),
                    });
                }
                Some(_) => {}
                None => all_ready = false,
            }
        }
        Ok(all_ready)
    }

    /// Tell the other hosts this host has no batch for `step`.
    pub fn finish(&self, step: u64) -> Result<()> {
        self.agree(step, None)?;
        Ok(())
    }

    /// Assemble this host's share of the global batch for `step`. Returns
    /// `None` when another host has run out of batches.
    pub fn assemble(&self, step: u64, batch: &Batch) -> Result<Option<GlobalBatch>> {
        if !self.agree(step, Some(batch.shape()))? {
            warn!(
                "Host {}: another host ran out at step {}, discarding local batch",
                self.host.host_index, step
            );
            return Ok(None);
        }

        let devices = self.mesh.local_devices();
        let rows_per_device = self.per_host_batch_size / devices.len();
        let host_offset = self.host.host_index * self.per_host_batch_size;

        let mut arrays = Vec::with_capacity(Feature::ALL.len());
        for feature in Feature::ALL {
            let data = batch.get(feature);
            let mut shards = Vec::with_capacity(devices.len());
            for (d, device) in devices.iter().enumerate() {
                let start = d * rows_per_device;
                let end = start + rows_per_device;
                let tensor = Tensor::from_slice(
                    &data[start * self.seq_len..end * self.seq_len],
                    (rows_per_device, self.seq_len),
                    device,
                )?;
                shards.push(DeviceShard {
                    device_index: self.host.host_index * devices.len() + d,
                    rows: host_offset + start..host_offset + end,
                    tensor,
                });
            }
            arrays.push((
                feature,
                ShardedArray {
                    global_shape: self.global_shape(),
                    shards,
                },
            ));
        }

        debug!("Host {}: materialized step {}", self.host.host_index, step);
        Ok(Some(GlobalBatch {
            step,
            host_index: self.host.host_index,
            global_shape: self.global_shape(),
            local_rows: host_offset..host_offset + self.per_host_batch_size,
            arrays,
        }))
    }
}
