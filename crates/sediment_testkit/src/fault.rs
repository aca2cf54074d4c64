//! Fault injection for directory operations.
//!
//! [`FaultyDirectory`] wraps another directory and fails chosen mutating
//! operations with [`StorageError::Injected`]. Tests use it to interrupt a
//! merge or a commit at a precise point and then check what a retry sees.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use sediment_storage::{Directory, InMemoryDirectory};
//! use sediment_testkit::fault::{FaultOp, FaultyDirectory};
//!
//! let dir = FaultyDirectory::new(Arc::new(InMemoryDirectory::new()));
//! dir.fail_next(FaultOp::Store, "segment_0/");
//! assert!(dir.store("segment_0/data", b"x").is_err());
//! assert!(dir.store("segment_0/data", b"x").is_ok());
//! ```

use parking_lot::Mutex;
use sediment_storage::{Directory, StorageError, StorageResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A mutating directory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// `make_directory`.
    MakeDirectory,
    /// `store`, including the temporary write of `commit`.
    Store,
    /// `append`.
    Append,
    /// `remove`.
    Remove,
    /// `rename`, including the publishing step of `commit`.
    Rename,
}

#[derive(Debug)]
struct FaultRule {
    op: FaultOp,
    fragment: String,
    /// Matching calls to let through before failing.
    skip: usize,
    /// Failures left; `None` fails forever.
    remaining: Option<usize>,
}

/// A directory that fails selected operations.
#[derive(Debug)]
pub struct FaultyDirectory {
    inner: Arc<dyn Directory>,
    rules: Mutex<Vec<FaultRule>>,
    injected: AtomicUsize,
}

impl FaultyDirectory {
    /// Wraps `inner` with no faults armed.
    pub fn new(inner: Arc<dyn Directory>) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
            injected: AtomicUsize::new(0),
        }
    }

    /// Fails the next `op` on a name containing `fragment`, once.
    pub fn fail_next(&self, op: FaultOp, fragment: &str) {
        self.fail_nth(op, fragment, 0);
    }

    /// Lets `skip` matching calls through, then fails the next one once.
    pub fn fail_nth(&self, op: FaultOp, fragment: &str, skip: usize) {
        self.rules.lock().push(FaultRule {
            op,
            fragment: fragment.to_string(),
            skip,
            remaining: Some(1),
        });
    }

    /// Fails every `op` on a name containing `fragment` until [`Self::clear`].
    pub fn fail_always(&self, op: FaultOp, fragment: &str) {
        self.rules.lock().push(FaultRule {
            op,
            fragment: fragment.to_string(),
            skip: 0,
            remaining: None,
        });
    }

    /// Disarms every fault.
    pub fn clear(&self) {
        self.rules.lock().clear();
    }

    /// Returns how many failures were injected so far.
    pub fn injected_count(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// Returns the wrapped directory.
    pub fn inner(&self) -> &Arc<dyn Directory> {
        &self.inner
    }

    fn check(&self, op: FaultOp, name: &str) -> StorageResult<()> {
        let mut rules = self.rules.lock();
        let Some(index) = rules.iter().position(|r| r.op == op && name.contains(&r.fragment)) else {
            return Ok(());
        };
        let rule = &mut rules[index];
        if rule.skip > 0 {
            rule.skip -= 1;
            return Ok(());
        }
        if let Some(remaining) = &mut rule.remaining {
            *remaining -= 1;
            if *remaining == 0 {
                rules.remove(index);
            }
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Injected(format!("{op:?} {name}")))
    }
}

impl Directory for FaultyDirectory {
    fn make_directory(&self, name: &str) -> StorageResult<()> {
        self.check(FaultOp::MakeDirectory, name)?;
        self.inner.make_directory(name)
    }

    fn store(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        self.check(FaultOp::Store, name)?;
        self.inner.store(name, data)
    }

    fn append(&self, name: &str, data: &[u8]) -> StorageResult<u64> {
        self.check(FaultOp::Append, name)?;
        self.inner.append(name, data)
    }

    fn load(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.inner.load(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.check(FaultOp::Remove, name)?;
        self.inner.remove(name)
    }

    fn list(&self, name: &str) -> StorageResult<Vec<String>> {
        self.inner.list(name)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.check(FaultOp::Rename, to)?;
        self.inner.rename(from, to)
    }

    fn size(&self, name: &str) -> StorageResult<u64> {
        self.inner.size(name)
    }
}
