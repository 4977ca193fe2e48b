use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dataset root (a directory or a single JSONL file)
    pub hf_path: String,
    /// Optional subdirectory under `hf_path`
    pub hf_data_dir: Option<String>,
    /// Training files relative to the data directory
    pub hf_train_files: Vec<String>,
    /// Eval files relative to the data directory
    pub hf_eval_files: Vec<String>,
    /// Split name used to pick eval files when none are listed
    pub hf_eval_split: String,
    /// Dataset root for eval, defaults to `hf_path`
    pub hf_eval_path: Option<String>,
    /// Carried to the dataset collaborator; local sources ignore it
    pub hf_access_token: Option<String>,
    /// Tokenizer file or pretrained identifier
    pub tokenizer_path: String,
    /// Global batch size across all hosts
    pub global_batch_size_to_load: usize,
    /// Eval batch size per device, 0 to reuse the training batch size
    pub eval_per_device_batch_size: usize,
    /// Fixed sequence length of every example
    pub max_target_length: usize,
    pub enable_data_shuffling: bool,
    pub data_shuffle_seed: u64,
    /// Evaluation is disabled when <= 0
    pub eval_interval: i64,
    /// Record field holding raw text
    pub text_field: String,
    pub add_bos: bool,
    pub add_eos: bool,
    pub packing: bool,
    pub shift: bool,
    /// Prefetch workers per host
    pub num_threads: usize,
    /// Records buffered between workers and the packing stage
    pub prefetch_buffer_size: usize,
    pub shuffle_buffer_size: usize,
    pub pad_id: u32,
    /// Give every host the same record count when the source length is known
    pub drop_remainder: bool,
    /// Shared directory for cross-process step agreement
    pub rendezvous_dir: Option<PathBuf>,
    pub rendezvous_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hf_path: String::new(),
            hf_data_dir: None,
            hf_train_files: Vec::new(),
            hf_eval_files: Vec::new(),
            hf_eval_split: "validation".to_string(),
            hf_eval_path: None,
            hf_access_token: None,
            tokenizer_path: String::new(),
            global_batch_size_to_load: 8,
            eval_per_device_batch_size: 0,
            max_target_length: 2048,
            enable_data_shuffling: true,
            data_shuffle_seed: 0,
            eval_interval: 0,
            text_field: "text".to_string(),
            add_bos: true,
            add_eos: true,
            packing: true,
            shift: true,
            num_threads: 1,
            prefetch_buffer_size: 128,
            shuffle_buffer_size: 1000,
            pad_id: 0,
            drop_remainder: false,
            rendezvous_dir: None,
            rendezvous_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks settings that do not depend on the device mesh.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.max_target_length < 2 {
            errors.push("max_target_length must be at least 2".to_string());
        }
        if self.global_batch_size_to_load == 0 {
            errors.push("global_batch_size_to_load must be greater than 0".to_string());
        }
        if self.num_threads == 0 {
            errors.push("num_threads must be greater than 0".to_string());
        }
        if self.prefetch_buffer_size == 0 {
            errors.push("prefetch_buffer_size must be greater than 0".to_string());
        }
        if self.enable_data_shuffling && self.shuffle_buffer_size == 0 {
            errors.push("shuffle_buffer_size must be greater than 0 when shuffling".to_string());
        }
        if self.text_field.is_empty() {
            errors.push("text_field must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(errors.join("; ")))
        }
    }

    pub fn eval_enabled(&self) -> bool {
        self.eval_interval > 0
    }

    pub fn train_dataset(&self) -> DatasetSpec {
        DatasetSpec {
            path: self.hf_path.clone(),
            data_dir: self.hf_data_dir.clone(),
            data_files: self.hf_train_files.clone(),
            split: "train".to_string(),
            access_token: self.hf_access_token.clone(),
        }
    }

    pub fn eval_dataset(&self) -> DatasetSpec {
        DatasetSpec {
            path: self
                .hf_eval_path
                .clone()
                .unwrap_or_else(|| self.hf_path.clone()),
            data_dir: self.hf_data_dir.clone(),
            data_files: self.hf_eval_files.clone(),
            split: self.hf_eval_split.clone(),
            access_token: self.hf_access_token.clone(),
        }
    }

    /// Global eval batch size for a mesh of `device_count` devices.
    pub fn eval_batch_size(&self, device_count: usize) -> usize {
        if self.eval_per_device_batch_size > 0 {
            self.eval_per_device_batch_size * device_count
        } else {
            self.global_batch_size_to_load
        }
    }
}

/// Key identifying one split of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub path: String,
    pub data_dir: Option<String>,
    pub data_files: Vec<String>,
    pub split: String,
    pub access_token: Option<String>,
}

/// Per-pipeline settings handed to [`crate::data::Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub global_batch_size: usize,
    pub max_target_length: usize,
    pub shuffle: bool,
    pub data_shuffle_seed: u64,
    pub shuffle_buffer_size: usize,
    pub text_field: String,
    pub packing: bool,
    pub shift: bool,
    pub num_threads: usize,
    pub prefetch_buffer_size: usize,
    pub pad_id: u32,
    pub drop_remainder: bool,
}

impl PipelineOptions {
    pub fn train(config: &PipelineConfig) -> Self {
        Self {
            global_batch_size: config.global_batch_size_to_load,
            max_target_length: config.max_target_length,
            shuffle: config.enable_data_shuffling,
            data_shuffle_seed: config.data_shuffle_seed,
            shuffle_buffer_size: config.shuffle_buffer_size,
            text_field: config.text_field.clone(),
            packing: config.packing,
            shift: config.shift,
            num_threads: config.num_threads,
            prefetch_buffer_size: config.prefetch_buffer_size,
            pad_id: config.pad_id,
            drop_remainder: config.drop_remainder,
        }
    }

    pub fn eval(config: &PipelineConfig, device_count: usize) -> Self {
        Self {
            global_batch_size: config.eval_batch_size(device_count),
            shuffle: false,
            ..Self::train(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"hf_path": "data", "max_target_length": 16}"#).unwrap();
        assert_eq!(config.max_target_length, 16);
        assert_eq!(config.text_field, "text");
        assert_eq!(config.prefetch_buffer_size, 128);
        assert!(config.packing && config.shift);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let config = PipelineConfig {
            max_target_length: 1,
            global_batch_size_to_load: 0,
            num_threads: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_target_length"));
        assert!(err.contains("global_batch_size_to_load"));
        assert!(err.contains("num_threads"));
    }

    #[test]
    fn test_eval_dataset_and_batch_size() {
        let config = PipelineConfig {
            hf_path: "train-root".to_string(),
            hf_eval_path: Some("eval-root".to_string()),
            hf_eval_split: "test".to_string(),
            global_batch_size_to_load: 32,
            eval_per_device_batch_size: 2,
            enable_data_shuffling: true,
            ..Default::default()
        };
        let eval = config.eval_dataset();
        assert_eq!(eval.path, "eval-root");
        assert_eq!(eval.split, "test");
        assert_eq!(config.eval_batch_size(8), 16);

        let options = PipelineOptions::eval(&config, 8);
        assert_eq!(options.global_batch_size, 16);
        assert!(!options.shuffle);

        let fallback = PipelineConfig {
            eval_per_device_batch_size: 0,
            ..config
        };
        assert_eq!(fallback.eval_batch_size(8), 32);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let config = PipelineConfig {
            hf_path: "corpus".to_string(),
            max_target_length: 64,
            ..Default::default()
        };
        config.save_json(path.to_str().unwrap()).unwrap();
        let loaded = PipelineConfig::from_json(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.hf_path, "corpus");
        assert_eq!(loaded.max_target_length, 64);
    }
}
