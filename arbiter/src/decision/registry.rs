// SPDX-License-Identifier: Apache-2.0

//! The processor registerer.
//!
//! Pipeline construction hands a `Registerer` to each processor; the
//! processor sends a registration message on construction, and the
//! pipeline blocks until the expected count has arrived before going
//! live. This replaces a process-wide mutable singleton with an
//! explicit message-passing handle valid for exactly one pipeline
//! instance at a time.

use std::sync::Arc;
use tokio::sync::mpsc;

/// A registration sent by a processor: its name and the callback the
/// supervisor invokes on compiler triggers.
pub struct Registration {
	pub name: String,
	pub on_compiler_change: Arc<dyn Fn() + Send + Sync>,
}

#[derive(Clone)]
pub struct Registerer {
	tx: mpsc::UnboundedSender<Registration>,
}

impl Registerer {
	pub fn register<F>(&self, name: &str, on_compiler_change: F)
	where
		F: Fn() + Send + Sync + 'static,
	{
		// The receiver only goes away when pipeline construction is
		// abandoned, in which case registration is moot.
		let _ = self.tx.send(Registration {
			name: name.to_owned(),
			on_compiler_change: Arc::new(on_compiler_change),
		});
	}
}

/// Create the registerer and the receiving half the pipeline waits on.
pub fn registerer() -> (Registerer, mpsc::UnboundedReceiver<Registration>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(Registerer { tx }, rx)
}

/// Collect exactly `expected` registrations.
pub async fn collect(
	rx: &mut mpsc::UnboundedReceiver<Registration>,
	expected: usize,
) -> Vec<Registration> {
	let mut registrations = Vec::with_capacity(expected);
	while registrations.len() < expected {
		match rx.recv().await {
			Some(registration) => registrations.push(registration),
			None => break,
		}
	}
	registrations
}
