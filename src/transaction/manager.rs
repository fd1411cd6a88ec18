use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::error::{DbError, DbResult};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    StopNew,
    Checkpointing,
}

struct TmState {
    phase: Phase,
    active_write: Option<u64>,
    active_reads: HashSet<u64>,
    next_id: u64,
}

/// Single-writer/multi-reader transaction manager.
/// `stop_new_transactions_and_wait_until_all_read_transactions_leave`
/// bounds the window during which a checkpoint mutates the page files.
pub struct TransactionManager {
    state: Mutex<TmState>,
    cvar: Condvar,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TmState {
                phase: Phase::Running,
                active_write: None,
                active_reads: HashSet::new(),
                next_id: 1,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn begin_write(&self) -> DbResult<Transaction> {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Running {
            return Err(DbError::Transaction(
                "the database is closed to new transactions".to_string(),
            ));
        }
        if state.active_write.is_some() {
            return Err(DbError::Transaction(
                "another write transaction is active; only one write transaction may run at a time"
                    .to_string(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.active_write = Some(id);
        debug!("begin write {}", id);
        Ok(Transaction::new_write(id))
    }

    pub fn begin_read_only(&self) -> DbResult<Transaction> {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Running {
            return Err(DbError::Transaction(
                "the database is closed to new transactions".to_string(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.active_reads.insert(id);
        Ok(Transaction::new_read_only(id))
    }

    pub fn active_write_id(&self) -> Option<u64> {
        self.state.lock().unwrap().active_write
    }

    pub fn is_active_write(&self, tx: &Transaction) -> bool {
        tx.is_write() && self.state.lock().unwrap().active_write == Some(tx.id())
    }

    /// A read transaction leaves the system on commit or rollback.
    pub fn end_read(&self, tx: &Transaction) {
        let mut state = self.state.lock().unwrap();
        state.active_reads.remove(&tx.id());
        self.cvar.notify_all();
    }

    /// Transition to `StopNew` and block until the read set drains.
    pub fn stop_new_transactions_and_wait_until_all_read_transactions_leave(&self) {
        let mut state = self.state.lock().unwrap();
        state.phase = Phase::StopNew;
        while !state.active_reads.is_empty() {
            state = self.cvar.wait(state).unwrap();
        }
        state.phase = Phase::Checkpointing;
        debug!("all read transactions left; checkpointing");
    }

    pub fn allow_receiving_new_transactions(&self) {
        let mut state = self.state.lock().unwrap();
        state.phase = Phase::Running;
        self.cvar.notify_all();
    }

    pub fn clear_active_write_transaction(&self, tx: &Transaction) {
        let mut state = self.state.lock().unwrap();
        if state.active_write == Some(tx.id()) {
            state.active_write = None;
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_writer() {
        let tm = TransactionManager::new();
        let tx = tm.begin_write().unwrap();
        assert!(matches!(tm.begin_write(), Err(DbError::Transaction(_))));
        tm.clear_active_write_transaction(&tx);
        assert!(tm.begin_write().is_ok());
    }

    #[test]
    fn readers_coexist_with_one_writer() {
        let tm = TransactionManager::new();
        let _w = tm.begin_write().unwrap();
        let r1 = tm.begin_read_only().unwrap();
        let r2 = tm.begin_read_only().unwrap();
        assert!(r1.is_read_only() && r2.is_read_only());
        tm.end_read(&r1);
        tm.end_read(&r2);
    }

    #[test]
    fn stop_new_rejects_begin() {
        let tm = TransactionManager::new();
        tm.stop_new_transactions_and_wait_until_all_read_transactions_leave();
        assert!(matches!(tm.begin_read_only(), Err(DbError::Transaction(_))));
        assert!(matches!(tm.begin_write(), Err(DbError::Transaction(_))));
        tm.allow_receiving_new_transactions();
        assert!(tm.begin_read_only().is_ok());
    }

    #[test]
    fn quiescence_waits_for_readers() {
        use std::sync::Arc;
        let tm = Arc::new(TransactionManager::new());
        let reader = tm.begin_read_only().unwrap();
        let tm2 = tm.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            tm2.end_read(&reader);
        });
        // blocks until the spawned thread releases the reader
        tm.stop_new_transactions_and_wait_until_all_read_transactions_leave();
        handle.join().unwrap();
        tm.allow_receiving_new_transactions();
    }
}
