// SPDX-License-Identifier: Apache-2.0

//! Buffer stages between the request path and the sink broker.
//!
//! The memory buffer applies backpressure to producers once its byte
//! budget is reached: producers block acquiring permits sized to the
//! serialized event. The disk buffer degrades to on-disk queueing — a
//! JSON-lines journal plus an offset sidecar — and survives restarts.

use crate::decision::{config::MemoryBufferConfig, event::DecisionEvent};
use std::{
	collections::VecDeque,
	fs::{File, OpenOptions},
	io::{BufRead as _, BufReader, Seek as _, SeekFrom, Write as _},
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
	time::Instant,
};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};

type QueuedEvent = (DecisionEvent, OwnedSemaphorePermit);

/// Producer handle for the memory buffer. Cloning shares the byte
/// budget and the queue.
#[derive(Clone)]
pub(crate) struct MemoryBuffer {
	tx: mpsc::Sender<QueuedEvent>,
	semaphore: Arc<Semaphore>,
	max_bytes: u64,
}

impl MemoryBuffer {
	/// Create the producer handle and the receiving half the buffer
	/// task drains.
	pub(crate) fn new(config: &MemoryBufferConfig) -> (Self, mpsc::Receiver<QueuedEvent>) {
		let (tx, rx) = mpsc::channel(1024);
		let permits = config.max_bytes.min(u32::MAX as u64) as usize;
		(
			MemoryBuffer {
				tx,
				semaphore: Arc::new(Semaphore::new(permits)),
				max_bytes: config.max_bytes,
			},
			rx,
		)
	}

	/// Enqueue an event, blocking while the buffer is at its byte
	/// budget.
	pub(crate) async fn push(&self, event: DecisionEvent) -> Result<(), ()> {
		let size = (event.estimated_bytes() as u64)
			.clamp(1, self.max_bytes.min(u32::MAX as u64)) as u32;
		let permit = Arc::clone(&self.semaphore)
			.acquire_many_owned(size)
			.await
			.map_err(|_| ())?;
		self.tx.send((event, permit)).await.map_err(|_| ())
	}
}

/// Drain the memory buffer: queue incoming events, and forward them
/// downstream on the count/bytes triggers or the period timer. Permits
/// are released once the event has been handed to the broker.
pub(crate) async fn run_memory_buffer<F, Fut>(
	config: MemoryBufferConfig,
	mut rx: mpsc::Receiver<QueuedEvent>,
	forward: F,
) where
	F: Fn(DecisionEvent) -> Fut,
	Fut: std::future::Future<Output = ()>,
{
	let mut queue: VecDeque<QueuedEvent> = VecDeque::new();
	let mut queued_bytes: usize = 0;
	let mut last_flush = Instant::now();

	loop {
		let deadline = tokio::time::Instant::from_std(last_flush + config.flush_at_period);

		tokio::select! {
			received = rx.recv() => match received {
				Some((event, permit)) => {
					queued_bytes += event.estimated_bytes();
					queue.push_back((event, permit));

					let count_due = config.flush_at_count > 0
						&& queue.len() >= config.flush_at_count;
					let bytes_due = config.flush_at_bytes > 0
						&& queued_bytes >= config.flush_at_bytes;
					if count_due || bytes_due {
						drain(&mut queue, &mut queued_bytes, &forward).await;
						last_flush = Instant::now();
					}
				}
				None => {
					drain(&mut queue, &mut queued_bytes, &forward).await;
					break;
				}
			},
			_ = tokio::time::sleep_until(deadline) => {
				drain(&mut queue, &mut queued_bytes, &forward).await;
				last_flush = Instant::now();
			}
		}
	}
}

async fn drain<F, Fut>(queue: &mut VecDeque<QueuedEvent>, queued_bytes: &mut usize, forward: &F)
where
	F: Fn(DecisionEvent) -> Fut,
	Fut: std::future::Future<Output = ()>,
{
	while let Some((event, permit)) = queue.pop_front() {
		forward(event).await;
		drop(permit);
	}
	*queued_bytes = 0;
}

/// The on-disk journal: JSON lines appended at the tail, a sidecar
/// recording the reader offset. When the reader catches up, both files
/// are reset so the journal does not grow without bound.
pub(crate) struct DiskQueue {
	journal_path: PathBuf,
	offset_path: PathBuf,
	state: Mutex<DiskState>,
	notify: Notify,
}

struct DiskState {
	writer: File,
	offset: u64,
}

impl DiskQueue {
	pub(crate) fn open(path: &Path) -> std::io::Result<Self> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let writer = OpenOptions::new().create(true).append(true).open(path)?;

		let offset_path = path.with_extension("offset");
		let offset = match std::fs::read_to_string(&offset_path) {
			Ok(raw) => raw.trim().parse().unwrap_or(0),
			Err(_) => 0,
		};

		Ok(DiskQueue {
			journal_path: path.to_path_buf(),
			offset_path,
			state: Mutex::new(DiskState { writer, offset }),
			notify: Notify::new(),
		})
	}

	pub(crate) fn append(&self, event: &DecisionEvent) -> std::io::Result<()> {
		let line = serde_json::to_vec(event)?;
		{
			let mut state = self.state.lock().expect("disk queue lock poisoned");
			state.writer.write_all(&line)?;
			state.writer.write_all(b"\n")?;
			state.writer.flush()?;
		}
		self.notify.notify_one();
		Ok(())
	}

	/// Read the next journal line past the offset. `None` means the
	/// reader has caught up.
	pub(crate) fn next(&self) -> std::io::Result<Option<(DecisionEvent, u64)>> {
		let offset = {
			let state = self.state.lock().expect("disk queue lock poisoned");
			state.offset
		};

		let mut reader = BufReader::new(File::open(&self.journal_path)?);
		reader.seek(SeekFrom::Start(offset))?;
		let mut line = String::new();
		let read = reader.read_line(&mut line)?;
		if read == 0 {
			return Ok(None);
		}

		match serde_json::from_str::<DecisionEvent>(line.trim_end()) {
			Ok(event) => Ok(Some((event, read as u64))),
			// A torn or corrupt line is skipped, not fatal.
			Err(_) => Ok(Some((corrupt_line_event(), read as u64))),
		}
	}

	/// Advance the reader offset, persisting it; resets the journal
	/// once fully drained.
	pub(crate) fn advance(&self, bytes: u64) -> std::io::Result<()> {
		let mut state = self.state.lock().expect("disk queue lock poisoned");
		state.offset += bytes;

		let journal_len = std::fs::metadata(&self.journal_path)?.len();
		if state.offset >= journal_len {
			state.writer = OpenOptions::new()
				.create(true)
				.write(true)
				.truncate(true)
				.open(&self.journal_path)?;
			state.offset = 0;
		}

		std::fs::write(&self.offset_path, state.offset.to_string())
	}

	pub(crate) async fn wait_for_data(&self) {
		self.notify.notified().await;
	}

	pub(crate) fn pending(&self) -> std::io::Result<bool> {
		let state = self.state.lock().expect("disk queue lock poisoned");
		Ok(std::fs::metadata(&self.journal_path)?.len() > state.offset)
	}
}

fn corrupt_line_event() -> DecisionEvent {
	let mut event = DecisionEvent::new(&Default::default(), "");
	event.error = Some("corrupt journal line".to_owned());
	event
}
