// SPDX-License-Identifier: Apache-2.0

//! The external-data plugin framework.
//!
//! Hosts independent pollers that fetch external data and write it into
//! the store under a namespaced path they own. Each plugin claims its
//! path on start; the store rejects every other writer for that
//! subtree.

pub mod http;
pub mod parse;

use crate::{error::Error, supervisor::Manager, supervisor::PluginStatus};
use std::sync::Arc;

/// The contract every data plugin satisfies.
#[tonic::async_trait]
pub trait DataPlugin: Send + Sync {
	fn name(&self) -> &str;

	/// Acquire preparation, claim the owning path, launch the polling
	/// task.
	async fn start(&self) -> Result<(), Error>;

	/// Signal the polling task and wait for it to acknowledge.
	async fn stop(&self);

	/// Apply a new configuration. Equal-by-value configurations are a
	/// no-op; anything else is stop-then-start.
	async fn reconfigure(&self, config: serde_yaml::Value) -> Result<(), Error>;
}

/// The named plugins of one process, started in configuration order
/// and stopped in reverse.
pub struct DataPluginSet {
	manager: Arc<Manager>,
	plugins: Vec<Arc<dyn DataPlugin>>,
}

impl DataPluginSet {
	pub fn new(manager: Arc<Manager>) -> Self {
		DataPluginSet {
			manager,
			plugins: Vec::new(),
		}
	}

	pub fn add(&mut self, plugin: Arc<dyn DataPlugin>) {
		self.plugins.push(plugin);
	}

	pub fn plugins(&self) -> &[Arc<dyn DataPlugin>] {
		&self.plugins
	}

	pub async fn start_all(&self) -> Result<(), Error> {
		for plugin in &self.plugins {
			let status_name = format!("data.{}", plugin.name());
			self.manager
				.update_status(&status_name, PluginStatus::NotReady);
			match plugin.start().await {
				Ok(()) => self.manager.update_status(&status_name, PluginStatus::Ok),
				Err(e) => {
					self.manager.update_status(&status_name, PluginStatus::Err);
					return Err(Error::PluginStart {
						name: plugin.name().to_owned(),
						reason: e.to_string(),
					});
				}
			}
		}
		Ok(())
	}

	pub async fn stop_all(&self) {
		for plugin in self.plugins.iter().rev() {
			plugin.stop().await;
			self.manager
				.update_status(&format!("data.{}", plugin.name()), PluginStatus::NotReady);
		}
	}
}
