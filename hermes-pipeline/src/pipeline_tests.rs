//! End-to-end tests for multi-host batch delivery
//!
//! Tests cover:
//! - Disjoint host shards whose union is the stream minus the remainder
//! - Step agreement across hosts, in-process and through a shared directory
//! - Deterministic repeated epochs
//! - Fail-fast configuration checks and shape mismatches
//! - Train/eval construction from JSONL files

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::batching::Feature;
    use crate::config::{PipelineConfig, PipelineOptions};
    use crate::data::{Pipeline, make_iterators, tokenizer_options};
    use crate::distributed::{
        Collective, DeviceMesh, FileRendezvous, HostAssignment, InProcessGroup, SingleHost,
    };
    use crate::error::{Error, Result};
    use crate::materialize::GlobalBatch;
    use crate::source::{MemorySource, RecordSource, RecordStream};
    use crate::tokenizer::tests::word_tokenizer;
    use crate::tokenizer::{Tokenizer, TokenizerOptions};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn tokenizer(max_length: usize) -> Arc<Tokenizer> {
        Arc::new(word_tokenizer(TokenizerOptions {
            add_bos: false,
            add_eos: false,
            max_length,
        }))
    }

    /// `n` single-word records; record `i` tokenizes to `[i + 4]`.
    fn single_words(n: usize) -> Arc<dyn RecordSource> {
        let texts: Vec<String> = (0..n).map(|i| format!("w{}", i)).collect();
        Arc::new(MemorySource::from_texts("text", &texts))
    }

    /// Records of one to four words each.
    fn sentences(n: usize) -> Arc<dyn RecordSource> {
        let texts: Vec<String> = (0..n)
            .map(|i| {
                (0..1 + i % 4)
                    .map(|j| format!("w{}", (i * 7 + j) % 100))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        Arc::new(MemorySource::from_texts("text", &texts))
    }

    fn options(global_batch_size: usize, max_target_length: usize) -> PipelineOptions {
        PipelineOptions::train(&PipelineConfig {
            global_batch_size_to_load: global_batch_size,
            max_target_length,
            enable_data_shuffling: false,
            ..Default::default()
        })
    }

    fn first_tokens(batch: &GlobalBatch) -> Vec<u32> {
        batch
            .inputs()
            .unwrap()
            .local_rows()
            .unwrap()
            .iter()
            .map(|row| row[0])
            .collect()
    }

    /// Run one epoch on every host in its own thread.
    fn run_hosts<F>(
        host_count: usize,
        collectives: Vec<Arc<dyn Collective>>,
        build: F,
    ) -> Vec<Result<Vec<GlobalBatch>>>
    where
        F: Fn(HostAssignment, Arc<dyn Collective>) -> Result<Pipeline> + Sync,
    {
        std::thread::scope(|s| {
            let handles: Vec<_> = collectives
                .into_iter()
                .enumerate()
                .map(|(h, collective)| {
                    let build = &build;
                    s.spawn(move || -> Result<Vec<GlobalBatch>> {
                        let host = HostAssignment::new(h, host_count)?;
                        let mut pipeline = build(host, collective)?;
                        pipeline.epoch().collect::<Result<Vec<_>>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn in_process(host_count: usize) -> Vec<Arc<dyn Collective>> {
        InProcessGroup::new(host_count, TIMEOUT)
            .into_iter()
            .map(|g| Arc::new(g) as Arc<dyn Collective>)
            .collect()
    }

    #[test]
    fn test_hosts_see_disjoint_shards() {
        let source = single_words(20);
        let tok = tokenizer(3);
        let mesh = DeviceMesh::cpu(3, 3).unwrap();
        let results = run_hosts(3, in_process(3), |host, collective| {
            let mut opts = options(3, 4);
            opts.packing = false;
            opts.shift = false;
            Pipeline::new(opts, Arc::clone(&source), Arc::clone(&tok), &mesh, host, collective)
        });

        let mut seen = BTreeSet::new();
        for (h, result) in results.into_iter().enumerate() {
            let batches = result.unwrap();
            // Host 2 owns only 6 records, so every host stops after 6 steps
            assert_eq!(batches.len(), 6);
            for (step, batch) in batches.iter().enumerate() {
                assert_eq!(batch.step, step as u64);
                assert_eq!(batch.global_shape, [3, 4]);
                assert_eq!(batch.local_rows, h..h + 1);
                assert_eq!(batch.inputs().unwrap().shards[0].device_index, h);
            }
            let tokens: Vec<u32> = batches.iter().flat_map(first_tokens).collect();
            let expected: Vec<u32> = (0..6).map(|k| (h + 3 * k) as u32 + 4).collect();
            assert_eq!(tokens, expected);
            for token in tokens {
                assert!(seen.insert(token), "token {} delivered twice", token);
            }
        }
        // 20 records over 3 hosts: at most 2 go unassigned to a global batch
        assert_eq!(seen.len(), 18);
    }

    #[test]
    fn test_packed_hosts_agree_on_steps() {
        let source = sentences(60);
        let tok = tokenizer(7);
        let mesh = DeviceMesh::cpu(4, 2).unwrap();
        let results = run_hosts(2, in_process(2), |host, collective| {
            let mut opts = options(4, 8);
            opts.num_threads = 2;
            Pipeline::new(opts, Arc::clone(&source), Arc::clone(&tok), &mesh, host, collective)
        });

        let batches: Vec<Vec<GlobalBatch>> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(!batches[0].is_empty());
        assert_eq!(batches[0].len(), batches[1].len());
        for (h, host_batches) in batches.iter().enumerate() {
            for batch in host_batches {
                let inputs = batch.inputs().unwrap();
                assert_eq!(inputs.shards.len(), 2);
                assert_eq!(inputs.shards[0].rows, 2 * h..2 * h + 1);
                assert_eq!(inputs.shards[1].device_index, 2 * h + 1);

                let rows = inputs.local_rows().unwrap();
                let targets = batch.targets().unwrap().local_rows().unwrap();
                for (input, target) in rows.iter().zip(&targets) {
                    assert_eq!(&target[..7], &input[1..]);
                    assert_eq!(target[7], 0);
                }
            }
        }
    }

    #[test]
    fn test_file_rendezvous_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let source = single_words(9);
        let tok = tokenizer(3);
        let mesh = DeviceMesh::cpu(2, 2).unwrap();
        let collectives: Vec<Arc<dyn Collective>> = (0..2)
            .map(|h| {
                let host = HostAssignment::new(h, 2).unwrap();
                let rendezvous = FileRendezvous::new(dir.path(), host, TIMEOUT)
                    .unwrap()
                    .with_poll_interval(Duration::from_millis(1));
                Arc::new(rendezvous) as Arc<dyn Collective>
            })
            .collect();
        let results = run_hosts(2, collectives, |host, collective| {
            let mut opts = options(2, 4);
            opts.packing = false;
            Pipeline::new(opts, Arc::clone(&source), Arc::clone(&tok), &mesh, host, collective)
        });
        for result in results {
            let batches = result.unwrap();
            assert_eq!(batches.len(), 4);
            assert_eq!(batches[3].step, 3);
        }
    }

    #[test]
    fn test_repeated_epochs_are_identical() {
        let run = |shuffle: bool| {
            let mut opts = options(2, 8);
            opts.shuffle = shuffle;
            opts.shuffle_buffer_size = 16;
            opts.num_threads = 3;
            let mesh = DeviceMesh::cpu(1, 1).unwrap();
            let mut pipeline = Pipeline::new(
                opts,
                sentences(40),
                tokenizer(7),
                &mesh,
                HostAssignment::default(),
                Arc::new(SingleHost),
            )
            .unwrap();
            pipeline
                .epoch()
                .map(|batch| {
                    let batch = batch.unwrap();
                    Feature::ALL
                        .iter()
                        .map(|&f| batch.get(f).unwrap().local_rows().unwrap())
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };

        let first = run(false);
        assert!(!first.is_empty());
        assert_eq!(first, run(false));
        assert_eq!(run(true), run(true));
    }

    #[test]
    fn test_shape_mismatch_between_hosts() {
        let source = single_words(8);
        let tok = tokenizer(3);
        let mesh = DeviceMesh::cpu(2, 2).unwrap();
        let results = run_hosts(2, in_process(2), |host, collective| {
            // Host 1 is misconfigured with a longer sequence length
            let len = if host.host_index == 0 { 4 } else { 6 };
            let mut opts = options(2, len);
            opts.packing = false;
            Pipeline::new(opts, Arc::clone(&source), Arc::clone(&tok), &mesh, host, collective)
        });

        match &results[0] {
            Err(Error::ShardMismatch {
                host, expected, got, ..
            }) => {
                assert_eq!(*host, 1);
                assert_eq!(expected, &vec![1, 4]);
                assert_eq!(got, &vec![1, 6]);
            }
            other => panic!("expected a shard mismatch, got {:?}", other.as_ref().err()),
        }
        assert!(matches!(results[1], Err(Error::ShardMismatch { host: 0, .. })));
    }

    struct CountingSource {
        opened: AtomicUsize,
    }

    impl RecordSource for CountingSource {
        fn open(&self) -> Result<RecordStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[test]
    fn test_indivisible_batch_fails_before_reading() {
        let source = Arc::new(CountingSource {
            opened: AtomicUsize::new(0),
        });
        let mesh = DeviceMesh::cpu(2, 1).unwrap();
        let result = Pipeline::new(
            options(3, 4),
            Arc::clone(&source) as Arc<dyn RecordSource>,
            tokenizer(3),
            &mesh,
            HostAssignment::default(),
            Arc::new(SingleHost),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);

        // Also checked before the dataset path is resolved
        let config = PipelineConfig {
            hf_path: "/nonexistent/dataset".to_string(),
            global_batch_size_to_load: 3,
            max_target_length: 4,
            ..Default::default()
        };
        let result = make_iterators(
            &config,
            &mesh,
            HostAssignment::default(),
            Arc::new(SingleHost),
            Arc::new(SingleHost),
            tokenizer(3),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    fn write_jsonl(path: &Path, texts: &[String]) {
        let lines: Vec<String> = texts
            .iter()
            .map(|t| serde_json::json!({ "text": t, "id": t.len() }).to_string())
            .collect();
        std::fs::write(path, lines.join("\n")).unwrap();
    }

    fn jsonl_dataset(dir: &Path) {
        let train: Vec<String> = (0..30).map(|i| format!("w{} w{} w{}", i, i + 1, i + 2)).collect();
        let eval: Vec<String> = (0..6).map(|i| format!("w{}", 90 + i)).collect();
        write_jsonl(&dir.join("train-00000.jsonl"), &train);
        write_jsonl(&dir.join("validation-00000.jsonl"), &eval);
    }

    #[test]
    fn test_make_iterators_without_eval() {
        let dir = tempfile::tempdir().unwrap();
        jsonl_dataset(dir.path());
        let config = PipelineConfig {
            hf_path: dir.path().to_string_lossy().into_owned(),
            global_batch_size_to_load: 2,
            max_target_length: 8,
            eval_interval: 0,
            ..Default::default()
        };
        let mesh = DeviceMesh::cpu(1, 1).unwrap();
        let (mut train, eval) = make_iterators(
            &config,
            &mesh,
            HostAssignment::default(),
            Arc::new(SingleHost),
            Arc::new(SingleHost),
            tokenizer(7),
        )
        .unwrap();
        assert!(eval.is_none());
        assert!(train.epoch().next().unwrap().is_ok());
    }

    #[test]
    fn test_jsonl_train_and_eval() {
        let dir = tempfile::tempdir().unwrap();
        jsonl_dataset(dir.path());
        let tokenizer_path = dir.path().join("tokenizer.json");
        std::fs::write(
            &tokenizer_path,
            crate::tokenizer::tests::word_tokenizer_json(),
        )
        .unwrap();

        let config = PipelineConfig {
            hf_path: dir.path().to_string_lossy().into_owned(),
            tokenizer_path: tokenizer_path.to_string_lossy().into_owned(),
            global_batch_size_to_load: 4,
            eval_per_device_batch_size: 1,
            eval_interval: 100,
            max_target_length: 8,
            data_shuffle_seed: 7,
            ..Default::default()
        };
        let tok =
            Arc::new(Tokenizer::load(&config.tokenizer_path, tokenizer_options(&config)).unwrap());
        let mesh = DeviceMesh::cpu(2, 1).unwrap();
        let (mut train, eval) = make_iterators(
            &config,
            &mesh,
            HostAssignment::default(),
            Arc::new(SingleHost),
            Arc::new(SingleHost),
            tok,
        )
        .unwrap();
        let mut eval = eval.unwrap();
        assert_eq!(train.per_host_batch_size(), 4);
        assert_eq!(eval.per_host_batch_size(), 2);

        // bos + 3 words + eos = 5 tokens; one per slot at capacity 8
        let train_batches: Vec<GlobalBatch> = train.epoch().map(|b| b.unwrap()).collect();
        assert_eq!(train_batches.len(), 7);
        for batch in &train_batches {
            let segments = batch
                .get(Feature::InputsSegmentation)
                .unwrap()
                .local_rows()
                .unwrap();
            assert!(segments.iter().all(|row| row == &vec![1, 1, 1, 1, 1, 0, 0, 0]));
        }

        // Eval is never shuffled: bos w90 eos + bos w91 eos packed into one row
        let eval_batches: Vec<GlobalBatch> = eval.epoch().map(|b| b.unwrap()).collect();
        assert_eq!(eval_batches.len(), 1);
        let rows = eval_batches[0].inputs().unwrap().local_rows().unwrap();
        assert_eq!(rows[0], vec![1, 94, 2, 1, 95, 2, 0, 0]);
    }
}
