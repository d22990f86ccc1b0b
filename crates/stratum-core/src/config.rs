//! Configuration types for the batching and KV-cache core.

use serde::{Deserialize, Serialize};

/// Scheduler- and allocator-wide tunables (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on concurrently running requests.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum prompt length accepted at enqueue time.
    #[serde(default = "default_max_token_len")]
    pub max_token_len: usize,

    /// Total tokens consumable by one forward step (CONTEXT+DECODE).
    #[serde(default = "default_max_step_tokens")]
    pub max_step_tokens: usize,

    /// Backpressure threshold for Enqueue.
    #[serde(default = "default_max_waiting_queue_len")]
    pub max_waiting_queue_len: usize,

    /// Bytes per KV block. Must equal `block_token_num * per_token_kv_bytes`
    /// and be identical across host and device allocators.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Tokens of KV held per block.
    #[serde(default = "default_block_token_num")]
    pub block_token_num: usize,

    /// Initial pool size; overridden by `CalculateBlockNumber` when capacity
    /// sizing runs against live device memory.
    #[serde(default = "default_blocks_num")]
    pub blocks_num: usize,

    /// Fraction of device memory withheld from the pool, > 0.
    #[serde(default = "default_reserved_device_memory_ratio")]
    pub reserved_device_memory_ratio: f64,

    /// >= 0: use this fraction of total device memory. < 0: use all free
    /// memory minus the reserve.
    #[serde(default = "default_block_device_memory_ratio")]
    pub block_device_memory_ratio: f64,

    /// Host block pool size as a multiple of the device pool, > 1.
    #[serde(default = "default_block_host_memory_factor")]
    pub block_host_memory_factor: f64,

    /// Host block pool size reserved for LoRA adapters, as a multiple of the
    /// device pool, > 1.
    #[serde(default = "default_lora_host_memory_factor")]
    pub lora_host_memory_factor: f64,

    /// Number of devices per model replica.
    #[serde(default = "default_tensor_para_size")]
    pub tensor_para_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_token_len: default_max_token_len(),
            max_step_tokens: default_max_step_tokens(),
            max_waiting_queue_len: default_max_waiting_queue_len(),
            block_size: default_block_size(),
            block_token_num: default_block_token_num(),
            blocks_num: default_blocks_num(),
            reserved_device_memory_ratio: default_reserved_device_memory_ratio(),
            block_device_memory_ratio: default_block_device_memory_ratio(),
            block_host_memory_factor: default_block_host_memory_factor(),
            lora_host_memory_factor: default_lora_host_memory_factor(),
            tensor_para_size: default_tensor_para_size(),
        }
    }
}

impl EngineConfig {
    /// `AllocatorConfig` fields shared by every device and host allocator.
    pub fn block_token_bytes(&self) -> usize {
        self.block_size / self.block_token_num.max(1)
    }

    /// Blocks needed to hold `num_tokens`, rounded up.
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        (num_tokens + self.block_token_num - 1) / self.block_token_num
    }
}

fn default_max_batch_size() -> usize {
    32
}

fn default_max_token_len() -> usize {
    8192
}

fn default_max_step_tokens() -> usize {
    4096
}

fn default_max_waiting_queue_len() -> usize {
    256
}

fn default_block_size() -> usize {
    1024 * 1024
}

fn default_block_token_num() -> usize {
    16
}

fn default_blocks_num() -> usize {
    512
}

fn default_reserved_device_memory_ratio() -> f64 {
    0.05
}

fn default_block_device_memory_ratio() -> f64 {
    -1.0
}

fn default_block_host_memory_factor() -> f64 {
    4.0
}

fn default_lora_host_memory_factor() -> f64 {
    2.0
}

fn default_tensor_para_size() -> usize {
    1
}

/// Host-facing server configuration, grounded on the teacher's
/// `ServerConfig` (host/port/CORS knobs untouched by the scheduling domain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Transformer layer count for the deployed model. Weight loading and
    /// the kernels themselves are out of scope; this is the one model
    /// dimension the step driver needs to lay out `kv_list` per spec.
    #[serde(default = "default_num_layer")]
    pub num_layer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
            cors_origins: vec!["*".to_string()],
            num_layer: default_num_layer(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_num_layer() -> usize {
    32
}

fn default_cors_enabled() -> bool {
    true
}
