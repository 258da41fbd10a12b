// SPDX-License-Identifier: Apache-2.0

//! The plugin supervisor.
//!
//! Owns the store and evaluator handles, process identity labels, the
//! optional metrics registry, the plugin status table, per-bundle write
//! roots, and the compiler-trigger observer set. Components receive an
//! `Arc<Manager>` and never reach for process-wide singletons.

use crate::{
	engine::{InterQueryCache, PolicyEngine, PrepareOpts},
	store::{Store, StoreError, StorePath, TxnParams, TxnSummary},
	version,
};
use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, RwLock, Weak,
	},
};
use uuid::Uuid;

/// Process identity attached to decision events and poller requests.
#[derive(Debug, Clone)]
pub struct Labels {
	pub id: String,
	pub app: String,
	pub version: String,
	pub extra: BTreeMap<String, String>,
}

impl Labels {
	pub fn new(app: &str, extra: BTreeMap<String, String>) -> Self {
		Labels {
			id: Uuid::new_v4().to_string(),
			app: app.to_owned(),
			version: version::version().to_owned(),
			extra,
		}
	}

	/// All labels as a string map, the shape decision events coerce
	/// into `map<string, any>`.
	pub fn as_map(&self) -> BTreeMap<String, String> {
		let mut map = self.extra.clone();
		map.insert("id".to_owned(), self.id.clone());
		map.insert("app".to_owned(), self.app.clone());
		map.insert("version".to_owned(), self.version.clone());
		map
	}
}

/// Lifecycle state reported per named plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
	NotReady,
	Ok,
	Err,
}

/// Token returned by compiler-trigger registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerToken(u64);

type TriggerFn = Arc<dyn Fn() + Send + Sync>;

pub struct Manager {
	store: Arc<dyn Store>,
	engine: Arc<dyn PolicyEngine>,
	labels: Labels,
	registry: Option<prometheus::Registry>,
	inter_query_cache: Arc<InterQueryCache>,
	bundle_roots: RwLock<BTreeMap<String, Vec<StorePath>>>,
	triggers: Mutex<Vec<(u64, TriggerFn)>>,
	next_trigger: AtomicU64,
	status: Mutex<BTreeMap<String, PluginStatus>>,
	enable_print: bool,
}

impl Manager {
	pub fn new(store: Arc<dyn Store>, engine: Arc<dyn PolicyEngine>, labels: Labels) -> Self {
		Manager {
			store,
			engine,
			labels,
			registry: None,
			inter_query_cache: Arc::new(InterQueryCache::new()),
			bundle_roots: RwLock::new(BTreeMap::new()),
			triggers: Mutex::new(Vec::new()),
			next_trigger: AtomicU64::new(0),
			status: Mutex::new(BTreeMap::new()),
			enable_print: false,
		}
	}

	pub fn with_registry(mut self, registry: prometheus::Registry) -> Self {
		self.registry = Some(registry);
		self
	}

	pub fn with_print_statements(mut self, enable: bool) -> Self {
		self.enable_print = enable;
		self
	}

	pub fn store(&self) -> &Arc<dyn Store> {
		&self.store
	}

	pub fn engine(&self) -> &Arc<dyn PolicyEngine> {
		&self.engine
	}

	pub fn labels(&self) -> &Labels {
		&self.labels
	}

	pub fn registry(&self) -> Option<&prometheus::Registry> {
		self.registry.as_ref()
	}

	pub fn inter_query_cache(&self) -> &Arc<InterQueryCache> {
		&self.inter_query_cache
	}

	/// Prepare options inherited by every subsystem that prepares
	/// queries.
	pub fn prepare_opts(&self) -> PrepareOpts {
		PrepareOpts {
			enable_print: self.enable_print,
		}
	}

	/// Register a callback invoked on every compiler change. Callbacks
	/// must be idempotent and safe to call under a read transaction.
	pub fn register_compiler_trigger<F>(&self, callback: F) -> TriggerToken
	where
		F: Fn() + Send + Sync + 'static,
	{
		let id = self.next_trigger.fetch_add(1, Ordering::SeqCst);
		self.triggers
			.lock()
			.expect("trigger lock poisoned")
			.push((id, Arc::new(callback)));
		TriggerToken(id)
	}

	pub fn unregister_compiler_trigger(&self, token: TriggerToken) {
		self.triggers
			.lock()
			.expect("trigger lock poisoned")
			.retain(|(id, _)| *id != token.0);
	}

	/// Attach the store commit hook that reinstalls the compiler
	/// snapshot and fans the change out whenever a transaction touches
	/// the policy set. The hook holds the supervisor weakly, so it
	/// never extends its lifetime.
	pub fn watch_policy_commits(self: &Arc<Self>) -> Result<(), StoreError> {
		let weak = Arc::downgrade(self);
		let txn = self.store.new_transaction(TxnParams::write())?;
		self.store.register_trigger(
			&txn,
			Arc::new(move |summary: &TxnSummary| {
				if !summary.policy_changed {
					return;
				}
				if let Some(manager) = weak.upgrade() {
					manager.reinstall_policies();
				}
			}),
		)?;
		self.store.commit(txn)?;
		Ok(())
	}

	/// Reload the committed module set, install it as the new compiler
	/// snapshot, and fan the compiler change out.
	fn reinstall_policies(&self) {
		let txn = match self.store.new_transaction(TxnParams::read()) {
			Ok(txn) => txn,
			Err(e) => {
				log::error!("failed to open txn for recompilation: {}", e);
				return;
			}
		};

		let ids = match self.store.list_policies(&txn) {
			Ok(ids) => ids,
			Err(e) => {
				self.store.abort(txn);
				log::error!("failed to list policies for recompilation: {}", e);
				return;
			}
		};
		let mut modules = BTreeMap::new();
		for id in ids {
			match self.store.get_policy(&txn, &id) {
				Ok(text) => {
					modules.insert(id, String::from_utf8_lossy(&text).into_owned());
				}
				Err(e) => log::warn!("skipping policy {}: {}", id, e),
			}
		}
		self.store.abort(txn);

		self.engine.install(modules);
		self.compiler_changed();
	}

	/// Fan a compiler change out to every interested subsystem. The
	/// inter-query builtin cache is cleared wholesale before callbacks
	/// run.
	pub fn compiler_changed(&self) {
		self.inter_query_cache.clear();

		let callbacks: Vec<TriggerFn> = self
			.triggers
			.lock()
			.expect("trigger lock poisoned")
			.iter()
			.map(|(_, cb)| Arc::clone(cb))
			.collect();

		log::debug!("compiler changed, notifying {} observers", callbacks.len());
		for callback in callbacks {
			callback();
		}
	}

	/// Replace the root set for a bundle.
	pub fn set_bundle_roots(&self, bundle: &str, roots: Vec<StorePath>) {
		self.bundle_roots
			.write()
			.expect("bundle roots lock poisoned")
			.insert(bundle.to_owned(), roots);
	}

	/// The bundle owning `path`, if any bundle root covers it.
	pub fn bundle_root_for(&self, path: &StorePath) -> Option<(String, StorePath)> {
		let roots = self.bundle_roots.read().expect("bundle roots lock poisoned");
		for (bundle, paths) in roots.iter() {
			for root in paths {
				if path.starts_with(root) {
					return Some((bundle.clone(), root.clone()));
				}
			}
		}
		None
	}

	pub fn update_status(&self, plugin: &str, status: PluginStatus) {
		log::debug!("plugin {} status -> {:?}", plugin, status);
		self.status
			.lock()
			.expect("status lock poisoned")
			.insert(plugin.to_owned(), status);
	}

	pub fn plugin_status(&self, plugin: &str) -> Option<PluginStatus> {
		self.status
			.lock()
			.expect("status lock poisoned")
			.get(plugin)
			.copied()
	}

	pub fn status(&self) -> BTreeMap<String, PluginStatus> {
		self.status.lock().expect("status lock poisoned").clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{engine::data::DataEngine, store::MemoryStore};
	use serde_json::json;
	use std::sync::atomic::AtomicUsize;

	fn manager() -> Manager {
		Manager::new(
			Arc::new(MemoryStore::new()),
			Arc::new(DataEngine::new()),
			Labels::new("arbiterd", BTreeMap::new()),
		)
	}

	#[test]
	fn triggers_fan_out_and_unregister() {
		let manager = manager();
		static CALLS: AtomicUsize = AtomicUsize::new(0);

		let token = manager.register_compiler_trigger(|| {
			CALLS.fetch_add(1, Ordering::SeqCst);
		});
		manager.compiler_changed();
		assert_eq!(CALLS.load(Ordering::SeqCst), 1);

		manager.unregister_compiler_trigger(token);
		manager.compiler_changed();
		assert_eq!(CALLS.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn compiler_change_clears_inter_query_cache() {
		let manager = manager();
		manager
			.inter_query_cache()
			.insert("k".to_owned(), json!(1));
		manager.compiler_changed();
		assert!(manager.inter_query_cache().is_empty());
	}

	#[test]
	fn bundle_roots_cover_descendants() {
		let manager = manager();
		manager.set_bundle_roots(
			"b1",
			vec![StorePath::parse("/bundle/data").unwrap()],
		);

		let hit = manager
			.bundle_root_for(&StorePath::parse("/bundle/data/x").unwrap())
			.unwrap();
		assert_eq!(hit.0, "b1");
		assert!(manager
			.bundle_root_for(&StorePath::parse("/other").unwrap())
			.is_none());
	}

	#[test]
	fn policy_commits_reinstall_and_fan_out() {
		use crate::store::WriteOp;

		let manager = Arc::new(manager());
		manager.watch_policy_commits().unwrap();

		let calls = Arc::new(AtomicUsize::new(0));
		let observed = Arc::clone(&calls);
		manager.register_compiler_trigger(move || {
			observed.fetch_add(1, Ordering::SeqCst);
		});

		let before = manager.engine().snapshot_id();
		let store = manager.store();
		let txn = store.new_transaction(TxnParams::write()).unwrap();
		store
			.upsert_policy(&txn, "/p", b"package p\n".to_vec())
			.unwrap();
		store.commit(txn).unwrap();

		// The commit trigger installed a new snapshot and notified
		// every observer before commit returned.
		assert!(manager.engine().snapshot_id() > before);
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		// Data-only commits leave the compiler alone.
		let txn = store.new_transaction(TxnParams::write()).unwrap();
		store
			.write(
				&txn,
				WriteOp::Add,
				&StorePath::parse("/d").unwrap(),
				json!(1),
			)
			.unwrap();
		store.commit(txn).unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn labels_include_identity() {
		let manager = manager();
		let labels = manager.labels().as_map();
		assert!(labels.contains_key("id"));
		assert_eq!(labels.get("app").unwrap(), "arbiterd");
		assert_eq!(labels.get("version").unwrap(), version::version());
	}
}
