//! Recording backend for the scope tests.
//!
//! `LedgerResource` behaves like a tiny transactional store: writes outside a
//! frame land immediately, writes inside a frame are buffered per depth and
//! only reach `committed` when the outermost frame commits.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use parlor_types::error::{DriverError, ResourceKind, UnitOfWorkError};

use super::async_scope::AsyncUnitOfWork;
use super::backend::{AsyncResourceSource, AsyncTransactional, ResourceSource, Transactional};
use super::failure::ScopeFailure;
use super::handle::{AsyncHandle, SyncHandle};
use super::slot::{Bindings, TaskSlot, ThreadSlot};
use super::sync_scope::SyncUnitOfWork;

#[derive(Default)]
struct LedgerState {
    committed: Vec<String>,
    ops: Vec<String>,
    failing: HashSet<&'static str>,
}

#[derive(Clone, Default)]
pub(crate) struct Ledger {
    state: Arc<Mutex<LedgerState>>,
}

impl Ledger {
    pub(crate) fn fail_on(&self, op: &'static str) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub(crate) fn committed(&self) -> Vec<String> {
        self.state.lock().unwrap().committed.clone()
    }

    pub(crate) fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|recorded| recorded.as_str() == op)
            .count()
    }

    fn record(&self, op: &'static str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(op.to_string());
        if state.failing.contains(op) {
            Err(DriverError::other(format!("{op} failed")))
        } else {
            Ok(())
        }
    }

    fn land(&self, values: impl IntoIterator<Item = String>) {
        self.state.lock().unwrap().committed.extend(values);
    }
}

pub(crate) struct LedgerResource {
    ledger: Ledger,
    frames: Vec<Vec<String>>,
}

impl LedgerResource {
    pub(crate) fn write(&mut self, value: &str) {
        match self.frames.last_mut() {
            Some(frame) => frame.push(value.to_string()),
            None => self.ledger.land([value.to_string()]),
        }
    }
}

impl Transactional for LedgerResource {
    fn begin(&mut self) -> Result<(), DriverError> {
        self.ledger.record("begin")?;
        self.frames = vec![Vec::new()];
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.ledger.record("commit")?;
        let frames = std::mem::take(&mut self.frames);
        self.ledger.land(frames.into_iter().flatten());
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.frames.clear();
        self.ledger.record("rollback")
    }

    fn begin_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.ledger.record("begin_nested")?;
        self.frames.truncate(depth as usize - 1);
        self.frames.push(Vec::new());
        Ok(())
    }

    fn commit_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.ledger.record("commit_nested")?;
        let merged: Vec<String> = self.frames.drain(depth as usize - 1..).flatten().collect();
        if let Some(parent) = self.frames.last_mut() {
            parent.extend(merged);
        }
        Ok(())
    }

    fn rollback_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.ledger.record("rollback_nested")?;
        self.frames.truncate(depth as usize - 1);
        Ok(())
    }
}

impl AsyncTransactional for LedgerResource {
    async fn begin(&mut self) -> Result<(), DriverError> {
        Transactional::begin(self)
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        Transactional::commit(self)
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        Transactional::rollback(self)
    }

    async fn begin_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        Transactional::begin_nested(self, depth)
    }

    async fn commit_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        Transactional::commit_nested(self, depth)
    }

    async fn rollback_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        Transactional::rollback_nested(self, depth)
    }
}

pub(crate) struct LedgerSource {
    ledger: Ledger,
}

impl LedgerSource {
    fn open_resource(&self) -> Result<LedgerResource, DriverError> {
        self.ledger.record("open")?;
        Ok(LedgerResource {
            ledger: self.ledger.clone(),
            frames: Vec::new(),
        })
    }

    fn release_resource(&self, reusable: bool) {
        let _ = self
            .ledger
            .record(if reusable { "release" } else { "discard" });
    }
}

impl ResourceSource for LedgerSource {
    type Resource = LedgerResource;

    const KIND: ResourceKind = ResourceKind::Database;

    fn open(&self) -> Result<LedgerResource, DriverError> {
        self.open_resource()
    }

    fn release(&self, _resource: LedgerResource, reusable: bool) {
        self.release_resource(reusable);
    }
}

impl AsyncResourceSource for LedgerSource {
    type Resource = LedgerResource;

    const KIND: ResourceKind = ResourceKind::Database;

    async fn open(&self) -> Result<LedgerResource, DriverError> {
        tokio::task::yield_now().await;
        self.open_resource()
    }

    fn release(&self, _resource: LedgerResource, reusable: bool) {
        self.release_resource(reusable);
    }
}

thread_local! {
    static LEDGER_SESSION: RefCell<Bindings<SyncHandle<LedgerResource>>> = const { RefCell::new(Bindings::new()) };
}

tokio::task_local! {
    static LEDGER_TASK_SESSION: Bindings<AsyncHandle<LedgerResource>>;
}

pub(crate) fn blocking_unit(ledger: &Ledger) -> SyncUnitOfWork<LedgerSource> {
    SyncUnitOfWork::new(
        LedgerSource {
            ledger: ledger.clone(),
        },
        ThreadSlot::new(&LEDGER_SESSION),
    )
}

pub(crate) fn async_unit(ledger: &Ledger) -> AsyncUnitOfWork<LedgerSource> {
    AsyncUnitOfWork::new(
        LedgerSource {
            ledger: ledger.clone(),
        },
        TaskSlot::new(&LEDGER_TASK_SESSION),
    )
}

/// Error type of test bodies.
#[derive(Debug)]
pub(crate) enum TestError {
    UnitOfWork(UnitOfWorkError),
    Body(&'static str),
    WithRollback(Box<TestError>, UnitOfWorkError),
}

impl From<UnitOfWorkError> for TestError {
    fn from(err: UnitOfWorkError) -> Self {
        TestError::UnitOfWork(err)
    }
}

impl ScopeFailure for TestError {
    fn attach_rollback_failure(self, rollback: UnitOfWorkError) -> Self {
        TestError::WithRollback(Box::new(self), rollback)
    }
}
