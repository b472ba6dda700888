mod config;
pub mod dataset;
mod digest;
mod fsutil;
pub mod thinking;

pub use config::{load_structured_file, ConfigError, InferenceConfig};
pub use dataset::{
    build_infer_messages, compute_record_id, key_string, load_dataset, ChatMessage, DatasetError,
    DatasetRecord,
};
pub use digest::{canonical_json_digest, canonicalize_json, sha256_bytes, sha256_file, sha256_text};
pub use fsutil::{
    append_json_line, atomic_write_bytes, atomic_write_json_pretty, ensure_dir, safe_name,
};
pub use thinking::{ThinkingAction, ThinkingRules, RESERVED_PAYLOAD_KEYS};
