//! The thread-affinity pool of buffered segment writers.

use crate::error::{CoreError, CoreResult};
use crate::segment::writer::SegmentBufferWriter;
use crate::store::SegmentStore;
use crate::types::Generation;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// The rolling writer-id counter wraps after this many writers.
const WRITER_ID_WRAP: u16 = 10_000;

/// Supplies the generation new writers are created in.
pub type GenerationSupplier = Arc<dyn Fn() -> Generation + Send + Sync>;

#[derive(Default)]
struct PoolState {
    /// Writers idle and available for reuse by their owner thread.
    active: HashMap<ThreadId, SegmentBufferWriter>,
    /// Tokens of writers currently out on loan.
    borrowed: HashSet<u64>,
    /// Writers that still must be flushed but whose slot is gone.
    disposed: Vec<SegmentBufferWriter>,
    next_token: u64,
    writer_id_counter: u16,
}

/// A pool of [`SegmentBufferWriter`]s keyed by the borrowing thread.
///
/// Each thread reuses its own writer across operations, so writes to a
/// buffered segment are totally ordered by their single owner. A writer
/// whose generation has gone stale is retired on the next borrow.
///
/// Flushing is a two-lock protocol: a flush lock serializes flushes, and
/// the pool lock protects the tables. `flush` drains the idle writers,
/// waits until every borrowed writer has come back (they land in
/// `disposed` because their slot was cleared), then flushes everything
/// outside both locks: the store may re-enter, so no store call ever runs
/// under the pool lock.
pub struct SegmentBufferWriterPool {
    store: Arc<dyn SegmentStore>,
    name: String,
    generation: GenerationSupplier,
    max_segment_size: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
    flush_lock: Mutex<()>,
}

impl SegmentBufferWriterPool {
    /// Creates a pool writing segments of at most `max_segment_size` bytes.
    ///
    /// `name` prefixes the writer ids handed out by this pool; the
    /// generation supplier is consulted on every borrow.
    pub fn new(
        store: Arc<dyn SegmentStore>,
        name: impl Into<String>,
        generation: GenerationSupplier,
        max_segment_size: usize,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            generation,
            max_segment_size,
            state: Mutex::new(PoolState::default()),
            returned: Condvar::new(),
            flush_lock: Mutex::new(()),
        }
    }

    /// Returns the current generation new writers are created in.
    #[must_use]
    pub fn current_generation(&self) -> Generation {
        (self.generation)()
    }

    /// Runs `op` with the calling thread's writer, borrowing and returning
    /// it around the call. The writer is returned also when `op` fails.
    pub fn execute<T>(
        &self,
        op: impl FnOnce(&mut SegmentBufferWriter) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut writer = self.borrow();
        let result = op(&mut writer);
        self.return_writer(writer)?;
        result
    }

    /// Takes the calling thread's writer out of the pool, minting a fresh
    /// one if the thread has none or its writer's generation went stale.
    fn borrow(&self) -> SegmentBufferWriter {
        let key = thread::current().id();
        let generation = (self.generation)();
        let mut state = self.state.lock();

        let writer = match state.active.remove(&key) {
            Some(writer) if writer.generation() == generation => writer,
            Some(stale) => {
                state.disposed.push(stale);
                self.mint(&mut state, generation)
            }
            None => self.mint(&mut state, generation),
        };
        state.borrowed.insert(writer.token());
        writer
    }

    fn mint(&self, state: &mut PoolState, generation: Generation) -> SegmentBufferWriter {
        let serial = state.writer_id_counter;
        state.writer_id_counter = (state.writer_id_counter + 1) % WRITER_ID_WRAP;
        let token = state.next_token;
        state.next_token += 1;
        SegmentBufferWriter::new(
            Arc::clone(&self.store),
            format!("{}.{:04}", self.name, serial),
            generation,
            self.max_segment_size,
            token,
        )
    }

    /// Returns a writer to the pool.
    ///
    /// If a flush snapshot intervened while the writer was out on loan,
    /// its slot is gone and the writer is parked in `disposed` for that
    /// flush to pick up.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PoolViolation`] if the calling thread already
    /// has an active writer; the tables are inconsistent in that case.
    fn return_writer(&self, writer: SegmentBufferWriter) -> CoreResult<()> {
        let key = thread::current().id();
        let mut state = self.state.lock();

        if state.borrowed.remove(&writer.token()) {
            if let Some(previous) = state.active.insert(key, writer) {
                return Err(CoreError::pool_violation(format!(
                    "thread already owns active writer {}",
                    previous.writer_id()
                )));
            }
        } else {
            // A flush snapshot was taken while this writer was out on
            // loan; defer it to that flush.
            state.disposed.push(writer);
        }
        self.returned.notify_all();
        Ok(())
    }

    /// Flushes every writer that is active or borrowed at the time of the
    /// call, then recycles their buffers.
    ///
    /// Waits until all borrowed writers have been returned. Writers
    /// returned after the snapshot land in `disposed` and are flushed by
    /// this same call, never dropped. Once all in-flight writes have
    /// completed, a second `flush` submits nothing.
    ///
    /// # Errors
    ///
    /// Propagates the first store failure; writers not yet flushed remain
    /// in `disposed` for the next attempt.
    pub fn flush(&self) -> CoreResult<()> {
        let _flush_guard = self.flush_lock.lock();

        let (mut to_flush, awaited) = {
            let mut state = self.state.lock();
            let to_flush: Vec<SegmentBufferWriter> =
                state.active.drain().map(|(_, writer)| writer).collect();
            let awaited: Vec<u64> = state.borrowed.drain().collect();
            (to_flush, awaited)
        };

        {
            let mut state = self.state.lock();
            while !awaited
                .iter()
                .all(|token| state.disposed.iter().any(|w| w.token() == *token))
            {
                self.returned.wait(&mut state);
            }
            to_flush.append(&mut state.disposed);
        }

        // Flush outside the pool lock: the store may re-enter.
        let mut writers = to_flush.into_iter();
        while let Some(mut writer) = writers.next() {
            if let Err(e) = writer.flush() {
                let mut state = self.state.lock();
                state.disposed.push(writer);
                state.disposed.extend(writers);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SegmentBufferWriterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SegmentBufferWriterPool")
            .field("name", &self.name)
            .field("active", &state.active.len())
            .field("borrowed", &state.borrowed.len())
            .field("disposed", &state.disposed.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::RecordType;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    fn pool_with_generation(store: &Arc<Store>, generation: GenerationSupplier) -> SegmentBufferWriterPool {
        SegmentBufferWriterPool::new(
            Arc::clone(store) as Arc<dyn SegmentStore>,
            "w",
            generation,
            256 * 1024,
        )
    }

    fn pool(store: &Arc<Store>) -> SegmentBufferWriterPool {
        pool_with_generation(store, Arc::new(|| Generation::new(1)))
    }

    fn write_marker(writer: &mut SegmentBufferWriter, marker: u8) -> CoreResult<crate::RecordId> {
        let id = writer.prepare(RecordType::Block, 1, &[])?;
        writer.write_u8(marker)?;
        Ok(id)
    }

    #[test]
    fn execute_reuses_the_thread_writer() {
        let store = Arc::new(Store::memory());
        let pool = pool(&store);

        let first = pool.execute(|w| Ok(w.writer_id().to_string())).unwrap();
        let second = pool.execute(|w| Ok(w.writer_id().to_string())).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "w.0000");
    }

    #[test]
    fn writer_is_returned_on_failure() {
        let store = Arc::new(Store::memory());
        let pool = pool(&store);

        let result: CoreResult<()> =
            pool.execute(|_| Err(CoreError::invalid_operation("boom")));
        assert!(result.is_err());

        // The writer is back in the pool and reusable.
        pool.execute(|w| {
            write_marker(w, 1)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn flush_emits_active_writers() {
        let store = Arc::new(Store::memory());
        let pool = pool(&store);

        let id = pool.execute(|w| write_marker(w, 0x42)).unwrap();
        assert!(!store.contains_segment(id.segment_id()));

        pool.flush().unwrap();
        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_u8(id.number(), 0).unwrap(), 0x42);
    }

    #[test]
    fn flush_is_idempotent() {
        let store = Arc::new(Store::memory());
        let pool = pool(&store);

        pool.execute(|w| write_marker(w, 0x01)).unwrap();
        pool.flush().unwrap();

        let before = store.tracker().len();
        pool.flush().unwrap();
        pool.flush().unwrap();
        // No further writers were submitted, so no new ids were minted.
        assert_eq!(store.tracker().len(), before);
    }

    #[test]
    fn stale_generation_retires_the_writer() {
        let store = Arc::new(Store::memory());
        let generation = Arc::new(AtomicU32::new(1));
        let supplier: GenerationSupplier = {
            let generation = Arc::clone(&generation);
            Arc::new(move || Generation::new(generation.load(Ordering::SeqCst)))
        };
        let pool = pool_with_generation(&store, supplier);

        let id = pool.execute(|w| write_marker(w, 0x07)).unwrap();
        generation.store(2, Ordering::SeqCst);

        // The stale writer moves to disposed; the thread gets a fresh one.
        let fresh = pool
            .execute(|w| {
                assert_eq!(w.generation(), Generation::new(2));
                Ok(w.writer_id().to_string())
            })
            .unwrap();
        assert_eq!(fresh, "w.0001");

        // The disposed writer's records are still flushed, never dropped.
        pool.flush().unwrap();
        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_u8(id.number(), 0).unwrap(), 0x07);
    }

    #[test]
    fn writer_borrowed_during_flush_is_flushed_by_that_flush() {
        let store = Arc::new(Store::memory());
        let pool = Arc::new(pool(&store));

        let (borrowed_tx, borrowed_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let worker = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.execute(|w| {
                    let id = write_marker(w, 0x99)?;
                    borrowed_tx.send(id).unwrap();
                    // Hold the writer until the flusher has snapshotted.
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
            })
        };

        let id = borrowed_rx.recv().unwrap();

        let flusher = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.flush().unwrap())
        };

        // Give the flusher time to take its snapshot and start waiting,
        // then let the worker return its writer.
        thread::sleep(std::time::Duration::from_millis(50));
        release_tx.send(()).unwrap();

        worker.join().unwrap();
        flusher.join().unwrap();

        // The writer returned after the snapshot still got flushed.
        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_u8(id.number(), 0).unwrap(), 0x99);
    }

    #[test]
    fn concurrent_writers_all_reach_the_store() {
        let store = Arc::new(Store::memory());
        let pool = Arc::new(pool(&store));

        let mut handles = Vec::new();
        for marker in 0..8u8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                pool.execute(|w| write_marker(w, marker)).unwrap()
            }));
        }
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        pool.flush().unwrap();
        for (marker, id) in ids.iter().enumerate() {
            let segment = store.segment(id.segment_id()).unwrap();
            assert_eq!(segment.read_u8(id.number(), 0).unwrap(), marker as u8);
        }
    }

    #[test]
    fn writer_ids_roll_with_zero_padding() {
        let store = Arc::new(Store::memory());
        let generation = Arc::new(AtomicU32::new(0));
        let supplier: GenerationSupplier = {
            let generation = Arc::clone(&generation);
            Arc::new(move || Generation::new(generation.load(Ordering::SeqCst)))
        };
        let pool = pool_with_generation(&store, supplier);

        // Bumping the generation before each borrow forces a fresh writer.
        for expected in ["w.0000", "w.0001", "w.0002"] {
            generation.fetch_add(1, Ordering::SeqCst);
            let id = pool.execute(|w| Ok(w.writer_id().to_string())).unwrap();
            assert_eq!(id, expected);
        }
    }
}
