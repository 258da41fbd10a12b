// SPDX-License-Identifier: Apache-2.0

//! Crate-wide error type.
//!
//! Subsystems with a rich error surface (store, evaluator, decision
//! logging) define their own `thiserror` enums and convert into this
//! one at the boundary; everything else uses it directly.

use crate::{engine::EngineError, store::StoreError};
use std::result::Result as StdResult;

pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Engine(#[from] EngineError),

	#[error("invalid configuration: {0}")]
	Config(String),

	#[error("invalid path: {0}")]
	InvalidPath(String),

	#[error("decision log delivery failed: {0}")]
	DecisionLog(String),

	#[error("plugin \"{name}\" failed to start: {reason}")]
	PluginStart { name: String, reason: String },

	#[error("server error: {0}")]
	Server(String),

	#[error("i/o error")]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Shorthand for a configuration error with a formatted message.
	pub fn config<S: Into<String>>(msg: S) -> Self {
		Error::Config(msg.into())
	}
}
