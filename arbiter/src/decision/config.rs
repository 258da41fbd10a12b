// SPDX-License-Identifier: Apache-2.0

//! Decision-log configuration.

use crate::{
	decision::batch::BatchConfig,
	error::Error,
	util::duration::{serde_duration, serde_opt_duration},
};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

pub const DEFAULT_DROP_PATH: &str = "/system/log/drop";
pub const DEFAULT_MASK_PATH: &str = "/system/log/mask";

const DEFAULT_MEMORY_MAX_BYTES: u64 = 500 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DecisionLogConfig {
	/// Path in the policy data root evaluated to decide whether an
	/// event is dropped.
	#[serde(default = "default_drop_path")]
	pub drop_decision: String,

	/// Path in the policy data root evaluated for mask rules.
	#[serde(default = "default_mask_path")]
	pub mask_decision: String,

	#[serde(default)]
	pub buffer: BufferConfig,

	/// One or more sink outputs. At least one is required.
	pub output: Outputs,
}

fn default_drop_path() -> String {
	DEFAULT_DROP_PATH.to_owned()
}

fn default_mask_path() -> String {
	DEFAULT_MASK_PATH.to_owned()
}

/// A single tagged output or an array of tagged outputs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Outputs {
	One(Box<SinkConfig>),
	Many(Vec<SinkConfig>),
}

impl Outputs {
	pub fn as_slice(&self) -> &[SinkConfig] {
		match self {
			Outputs::One(one) => std::slice::from_ref(one),
			Outputs::Many(many) => many,
		}
	}
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BufferConfig {
	Unbuffered,
	Memory(MemoryBufferConfig),
	Disk(DiskBufferConfig),
}

impl Default for BufferConfig {
	fn default() -> Self {
		BufferConfig::Memory(MemoryBufferConfig::default())
	}
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MemoryBufferConfig {
	/// Backpressure threshold: producers block once this many bytes
	/// are buffered.
	#[serde(default = "default_memory_max_bytes")]
	pub max_bytes: u64,

	/// Forward buffered events downstream after this many are queued.
	/// Zero disables the count trigger.
	#[serde(default)]
	pub flush_at_count: usize,

	/// Forward buffered events downstream after this many bytes are
	/// queued. Zero disables the bytes trigger.
	#[serde(default)]
	pub flush_at_bytes: usize,

	#[serde(default = "default_flush_period", with = "serde_duration")]
	pub flush_at_period: Duration,
}

impl Default for MemoryBufferConfig {
	fn default() -> Self {
		MemoryBufferConfig {
			max_bytes: DEFAULT_MEMORY_MAX_BYTES,
			flush_at_count: 0,
			flush_at_bytes: 0,
			flush_at_period: default_flush_period(),
		}
	}
}

fn default_memory_max_bytes() -> u64 {
	DEFAULT_MEMORY_MAX_BYTES
}

fn default_flush_period() -> Duration {
	Duration::from_secs(1)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiskBufferConfig {
	/// Journal file path. The only persistent artifact this subsystem
	/// produces.
	pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
	Http(HttpSinkConfig),
	Console(ConsoleSinkConfig),
	Kafka(KafkaSinkConfig),
	Splunk(SplunkSinkConfig),
	S3(S3SinkConfig),
	Service(ServiceSinkConfig),
	Experimental(ExperimentalSinkConfig),
}

impl SinkConfig {
	pub fn kind(&self) -> &'static str {
		match self {
			SinkConfig::Http(_) => "http",
			SinkConfig::Console(_) => "console",
			SinkConfig::Kafka(_) => "kafka",
			SinkConfig::Splunk(_) => "splunk",
			SinkConfig::S3(_) => "s3",
			SinkConfig::Service(_) => "service",
			SinkConfig::Experimental(_) => "experimental",
		}
	}
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HttpSinkConfig {
	pub url: String,

	#[serde(default)]
	pub headers: BTreeMap<String, String>,

	#[serde(default)]
	pub batching: BatchConfig,

	#[serde(default)]
	pub retry: RetryConfig,

	#[serde(default)]
	pub rate_limit: Option<RateLimitConfig>,

	#[serde(default)]
	pub tls: Option<TlsClientConfig>,

	#[serde(default)]
	pub oauth2: Option<OAuth2Config>,

	#[serde(default)]
	pub compress: bool,

	/// Per-request timeout.
	#[serde(default, with = "serde_opt_duration")]
	pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConsoleSinkConfig {
	#[serde(default)]
	pub batching: BatchConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KafkaSinkConfig {
	pub brokers: Vec<String>,
	pub topic: String,

	#[serde(default)]
	pub security_protocol: Option<String>,

	#[serde(default)]
	pub sasl: Option<SaslConfig>,

	#[serde(default)]
	pub tls: Option<TlsClientConfig>,

	#[serde(default)]
	pub batching: BatchConfig,

	#[serde(default)]
	pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SaslConfig {
	pub mechanism: String,
	pub username: String,
	pub password: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SplunkSinkConfig {
	/// HEC endpoint URL.
	pub url: String,

	/// HEC token, sent as `Authorization: Splunk <token>`.
	pub token: String,

	#[serde(default)]
	pub batching: BatchConfig,

	#[serde(default)]
	pub retry: RetryConfig,

	#[serde(default)]
	pub rate_limit: Option<RateLimitConfig>,

	#[serde(default)]
	pub tls: Option<TlsClientConfig>,

	#[serde(default)]
	pub compress: bool,

	#[serde(default, with = "serde_opt_duration")]
	pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct S3SinkConfig {
	#[serde(default)]
	pub bucket: Option<String>,

	#[serde(default)]
	pub region: Option<String>,

	/// Non-AWS endpoints (minio and friends).
	#[serde(default)]
	pub endpoint: Option<String>,

	/// Object key prefix.
	#[serde(default)]
	pub prefix: String,

	#[serde(default)]
	pub batching: BatchConfig,

	#[serde(default)]
	pub retry: RetryConfig,

	#[serde(default)]
	pub compress: bool,
}

impl S3SinkConfig {
	/// Validate required options, producing the exact missing-config
	/// message contract.
	pub fn validate(&self) -> Result<(), Error> {
		let mut missing = Vec::new();
		if self.bucket.is_none() {
			missing.push("bucket");
		}
		if self.region.is_none() {
			missing.push("region");
		}
		if missing.is_empty() {
			return Ok(());
		}
		missing.sort_unstable();
		Err(Error::config(format!(
			"output S3 missing required configs: {}",
			missing.join(", ")
		)))
	}
}

/// Compatibility wrapper that resolves a named service reference into
/// an http output.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceSinkConfig {
	pub service: String,

	/// Path appended to the service URL.
	#[serde(default)]
	pub resource: Option<String>,

	#[serde(default)]
	pub batching: BatchConfig,

	#[serde(default)]
	pub retry: RetryConfig,

	#[serde(default)]
	pub rate_limit: Option<RateLimitConfig>,

	#[serde(default)]
	pub compress: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExperimentalSinkConfig {
	pub name: String,

	#[serde(default)]
	pub config: Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
	#[serde(default, with = "serde_opt_duration")]
	pub period: Option<Duration>,

	#[serde(default)]
	pub max_attempts: Option<u32>,

	#[serde(default, with = "serde_opt_duration")]
	pub max_backoff: Option<Duration>,

	#[serde(default)]
	pub backoff_on: Vec<u16>,

	#[serde(default)]
	pub drop_on: Vec<u16>,

	#[serde(default)]
	pub successful_on: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
	#[serde(default)]
	pub label: Option<String>,

	/// Events allowed per interval.
	pub count: u64,

	#[serde(with = "serde_duration")]
	pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TlsClientConfig {
	#[serde(default)]
	pub ca_cert_file: Option<PathBuf>,

	#[serde(default)]
	pub client_cert_file: Option<PathBuf>,

	#[serde(default)]
	pub client_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OAuth2Config {
	pub token_url: String,
	pub client_id: String,
	pub client_secret: String,

	#[serde(default)]
	pub scopes: Vec<String>,
}

impl DecisionLogConfig {
	/// Startup validation: at least one output, s3 required options,
	/// mask/drop paths parseable.
	pub fn validate(&self) -> Result<(), Error> {
		if self.output.as_slice().is_empty() {
			return Err(Error::config("decision_logs requires at least one output"));
		}
		for sink in self.output.as_slice() {
			if let SinkConfig::S3(s3) = sink {
				s3.validate()?;
			}
		}
		for path in [&self.drop_decision, &self.mask_decision] {
			crate::store::StorePath::parse(path)
				.map_err(|e| Error::config(format!("decision_logs: {}", e)))?;
		}
		if let BufferConfig::Memory(memory) = &self.buffer {
			if memory.max_bytes == 0 {
				return Err(Error::config(
					"decision_logs memory buffer max_bytes must be positive",
				));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_output_parses() {
		let raw = r#"
output:
  type: console
"#;
		let config: DecisionLogConfig = serde_yaml::from_str(raw).unwrap();
		assert_eq!(config.output.as_slice().len(), 1);
		assert_eq!(config.drop_decision, DEFAULT_DROP_PATH);
		assert_eq!(config.mask_decision, DEFAULT_MASK_PATH);
		assert!(matches!(config.buffer, BufferConfig::Memory(_)));
	}

	#[test]
	fn output_array_parses() {
		let raw = r#"
buffer:
  type: unbuffered
output:
  - type: console
  - type: http
    url: https://example.com/logs
"#;
		let config: DecisionLogConfig = serde_yaml::from_str(raw).unwrap();
		assert_eq!(config.output.as_slice().len(), 2);
		assert!(matches!(config.buffer, BufferConfig::Unbuffered));
	}

	#[test]
	fn memory_buffer_defaults() {
		let config = MemoryBufferConfig::default();
		assert_eq!(config.max_bytes, 500 * 1024 * 1024);
		assert_eq!(config.flush_at_period, Duration::from_secs(1));
	}

	#[test]
	fn retry_lists_parse() {
		let raw = r#"
output:
  type: http
  url: https://x/post
  retry:
    period: 5s
    max_attempts: 10
    max_backoff: 600s
    backoff_on: [400, 429]
    drop_on: [300]
    successful_on: [202]
"#;
		let config: DecisionLogConfig = serde_yaml::from_str(raw).unwrap();
		let SinkConfig::Http(http) = &config.output.as_slice()[0] else {
			panic!("expected http sink");
		};
		assert_eq!(http.retry.period, Some(Duration::from_secs(5)));
		assert_eq!(http.retry.max_attempts, Some(10));
		assert_eq!(http.retry.backoff_on, vec![400, 429]);
	}

	#[test]
	fn s3_missing_configs_message_is_exact() {
		let s3 = S3SinkConfig {
			bucket: None,
			region: None,
			endpoint: None,
			prefix: String::new(),
			batching: BatchConfig::default(),
			retry: RetryConfig::default(),
			compress: false,
		};
		let Error::Config(msg) = s3.validate().unwrap_err() else {
			panic!("expected config error");
		};
		assert_eq!(msg, "output S3 missing required configs: bucket, region");
	}

	#[test]
	fn disk_buffer_parses() {
		let raw = r#"
buffer:
  type: disk
  path: /var/lib/arbiter/dl.journal
output:
  type: console
"#;
		let config: DecisionLogConfig = serde_yaml::from_str(raw).unwrap();
		let BufferConfig::Disk(disk) = &config.buffer else {
			panic!("expected disk buffer");
		};
		assert_eq!(disk.path, PathBuf::from("/var/lib/arbiter/dl.journal"));
	}
}
