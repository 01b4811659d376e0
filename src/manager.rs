//! Worker pool and global room directory.
//!
//! `Manager` owns the round-robin `mediasoup` worker pool and the
//! `roomId -> RoomHandle` map. The map is guarded by a `parking_lot::Mutex`
//! that is never held across an `.await`. Room creation drops the lock
//! before spawning the room actor, which does await the media worker, so a
//! slow room creation never blocks lookups for unrelated rooms.

use crate::config::{self, Config};
use crate::error::{RoomError, RoomResult};
use crate::room::{self, RoomEventSink, RoomHandle};
use mediasoup::worker::{Worker, WorkerId};
use mediasoup::worker_manager::WorkerManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

enum RoomSlot {
    Creating,
    Ready(RoomHandle),
}

pub struct Manager {
    workers: Vec<Worker>,
    rooms: Mutex<HashMap<String, RoomSlot>>,
    next_worker_index: AtomicUsize,
    config: Arc<Config>,
    local_ip: String,
    sink: OnceCell<Arc<dyn RoomEventSink>>,
    reap_tx: mpsc::UnboundedSender<String>,
}

impl Manager {
    pub async fn new(config: Config) -> Result<Arc<Self>, BoxError> {
        let config = Arc::new(config);
        let local_ip = config::get_local_ip();
        tracing::info!(count = config.num_workers, "creating mediasoup workers");

        let worker_manager = WorkerManager::new();
        let mut workers = Vec::with_capacity(config.num_workers);

        for i in 0..config.num_workers {
            let worker = worker_manager
                .create_worker(config::worker_settings(&config))
                .await?;

            let worker_id: WorkerId = worker.id();
            worker
                .on_dead(move |_| {
                    // Short grace delay before exit.
                    tracing::error!(worker_id = %worker_id, "media worker died, exiting");
                    tokio::spawn(async {
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        std::process::exit(1);
                    });
                })
                .detach();

            tracing::info!(index = i, worker_id = %worker.id(), "worker ready");
            workers.push(worker);
        }

        let (reap_tx, mut reap_rx) = mpsc::unbounded_channel::<String>();

        let manager = Arc::new(Self {
            workers,
            rooms: Mutex::new(HashMap::new()),
            next_worker_index: AtomicUsize::new(0),
            config,
            local_ip,
            sink: OnceCell::new(),
            reap_tx,
        });

        let reaper = manager.clone();
        tokio::spawn(async move {
            while let Some(room_id) = reap_rx.recv().await {
                reaper.rooms.lock().remove(&room_id);
                tracing::info!(room_id, "room reaped");
            }
        });

        Ok(manager)
    }

    /// Bind the `RoomEventSink` (the signaling dispatcher) after both it and
    /// the manager have been constructed. Must be called exactly once, before
    /// any room is created.
    pub fn set_sink(&self, sink: Arc<dyn RoomEventSink>) {
        let _ = self.sink.set(sink);
    }

    fn next_worker(&self) -> &Worker {
        let index = self.next_worker_index.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    pub fn get_room(&self, room_id: &str) -> Option<RoomHandle> {
        match self.rooms.lock().get(room_id) {
            Some(RoomSlot::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Get the room if it exists, creating it otherwise. The worker is
    /// picked once here and never changes for the room's life.
    pub async fn get_or_create_room(&self, room_id: &str) -> RoomResult<RoomHandle> {
        let created_here = {
            let mut rooms = self.rooms.lock();
            match rooms.get(room_id) {
                Some(RoomSlot::Ready(handle)) => return Ok(handle.clone()),
                Some(RoomSlot::Creating) => false,
                None => {
                    rooms.insert(room_id.to_string(), RoomSlot::Creating);
                    true
                }
            }
        };

        if !created_here {
            // Another task on this connection raced us; poll for it to
            // finish rather than double-spawn a router for the same room.
            return self.await_room_ready(room_id).await;
        }

        let sink = self
            .sink
            .get()
            .cloned()
            .ok_or_else(|| RoomError::Fatal("room event sink not bound".into()))?;

        let worker = self.next_worker();
        let handle = room::spawn(
            room_id.to_string(),
            worker,
            self.config.clone(),
            sink,
            self.reap_tx.clone(),
        )
        .await?;

        self.rooms
            .lock()
            .insert(room_id.to_string(), RoomSlot::Ready(handle.clone()));

        tracing::info!(room_id, "room created");
        Ok(handle)
    }

    /// Poll for the racing creator to finish. Bounded by the same request
    /// timeout the caller will already be enforcing further up the stack, so
    /// this never blocks indefinitely.
    async fn await_room_ready(&self, room_id: &str) -> RoomResult<RoomHandle> {
        for _ in 0..200 {
            if let Some(handle) = self.get_room(room_id) {
                return Ok(handle);
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        Err(RoomError::Timeout)
    }

    pub fn max_peers_per_room(&self) -> usize {
        self.config.max_peers_per_room
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
