//! Worktree pool: bounded, reusable isolated checkouts for concurrent runs.
//!
//! `acquire` behaves like a counting semaphore sized to the stage's
//! concurrency cap. A free checkout is reused when available; otherwise a new
//! one is created from the base revision on a fresh branch. Checkout I/O runs
//! outside the pool lock so one slow `git worktree add` never stalls other
//! members.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::domain::error::CheckoutError;
use crate::git;
use crate::obs;
use crate::retry::RetryPolicy;

/// Version-control operations the pool needs.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    /// Create a checkout at `path` on a new `branch`.
    async fn create(&self, path: &Path, branch: &str) -> Result<(), CheckoutError>;

    /// Move the checkout back to the base revision, discarding commits and
    /// every working-tree change.
    async fn reset(&self, path: &Path) -> Result<(), CheckoutError>;

    /// Remove the checkout and its branch.
    async fn remove(&self, path: &Path, branch: &str) -> Result<(), CheckoutError>;
}

/// `git worktree` based provider.
#[derive(Debug, Clone)]
pub struct GitCheckoutProvider {
    repo_dir: PathBuf,
    base_revision: String,
}

impl GitCheckoutProvider {
    pub fn new(repo_dir: impl Into<PathBuf>, base_revision: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            base_revision: base_revision.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }
}

fn path_str(path: &Path) -> Result<&str, CheckoutError> {
    path.to_str()
        .ok_or_else(|| CheckoutError::Fatal(format!("non UTF-8 path: {}", path.display())))
}

#[async_trait]
impl CheckoutProvider for GitCheckoutProvider {
    async fn create(&self, path: &Path, branch: &str) -> Result<(), CheckoutError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CheckoutError::Fatal(format!("create {}: {e}", parent.display())))?;
        }
        git::git(
            &self.repo_dir,
            &[
                "worktree",
                "add",
                "-b",
                branch,
                path_str(path)?,
                &self.base_revision,
            ],
        )
        .await?;
        Ok(())
    }

    async fn reset(&self, path: &Path) -> Result<(), CheckoutError> {
        git::git(path, &["reset", "--hard", &self.base_revision]).await?;
        git::git(path, &["clean", "-fdx"]).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path, branch: &str) -> Result<(), CheckoutError> {
        git::git(
            &self.repo_dir,
            &["worktree", "remove", "--force", path_str(path)?],
        )
        .await?;
        git::git(&self.repo_dir, &["branch", "-D", branch]).await?;
        Ok(())
    }
}

/// A checkout known to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub path: PathBuf,
    pub branch: String,
}

/// A claimed pool slot that has no checkout yet. Turn it into one with
/// [`WorktreePool::fill`].
#[derive(Debug)]
pub struct Slot {
    permit: OwnedSemaphorePermit,
}

/// A checkout on loan to one run. Hand it back with [`WorktreePool::release`].
#[derive(Debug)]
pub struct WorkingDir {
    checkout: Checkout,
    _permit: OwnedSemaphorePermit,
}

impl WorkingDir {
    pub fn path(&self) -> &Path {
        &self.checkout.path
    }

    pub fn branch(&self) -> &str {
        &self.checkout.branch
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Checkout>,
    retained: Vec<Checkout>,
    next_index: usize,
    created: usize,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory checkouts are created under.
    pub root: PathBuf,
    /// Branch names are `<branch_prefix>/<n>`.
    pub branch_prefix: String,
    /// Maximum number of checkouts on loan at once.
    pub capacity: usize,
    /// First `<n>` to hand out; lets several pools of one run share a prefix.
    pub first_index: usize,
    pub retry: RetryPolicy,
}

/// Bounded pool of isolated checkouts.
pub struct WorktreePool {
    provider: Arc<dyn CheckoutProvider>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl WorktreePool {
    pub fn new(provider: Arc<dyn CheckoutProvider>, config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        let state = PoolState {
            next_index: config.first_index,
            ..Default::default()
        };
        Self {
            provider,
            permits: Arc::new(Semaphore::new(capacity)),
            config,
            state: Mutex::new(state),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity.max(1)
    }

    /// Number of checkouts this pool has created.
    pub fn created(&self) -> usize {
        self.lock_state().created
    }

    /// Next unused checkout index; feed it to the next pool as `first_index`.
    pub fn next_index(&self) -> usize {
        self.lock_state().next_index
    }

    /// Checkouts kept on disk for inspection.
    pub fn retained(&self) -> Vec<Checkout> {
        self.lock_state().retained.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // A poisoned lock only means another task panicked mid-update; the
        // free list itself is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for a slot, then hand out a clean checkout.
    pub async fn acquire(&self) -> Result<WorkingDir, CheckoutError> {
        let slot = self.reserve().await?;
        self.fill(slot).await
    }

    /// Wait for a free slot. Safe to drop while waiting.
    pub async fn reserve(&self) -> Result<Slot, CheckoutError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CheckoutError::PoolClosed)?;
        Ok(Slot { permit })
    }

    /// Attach a checkout to `slot`, reusing a free one or creating one.
    ///
    /// Must run to completion: a checkout whose creation is abandoned halfway
    /// is unknown to the pool and never removed by [`WorktreePool::shutdown`].
    pub async fn fill(&self, slot: Slot) -> Result<WorkingDir, CheckoutError> {
        let Slot { permit } = slot;
        let reused = self.lock_state().free.pop();
        let checkout = match reused {
            Some(checkout) => {
                debug!(path = %checkout.path.display(), "reusing checkout");
                checkout
            }
            None => self.create_checkout().await?,
        };

        Ok(WorkingDir {
            checkout,
            _permit: permit,
        })
    }

    async fn create_checkout(&self) -> Result<Checkout, CheckoutError> {
        let index = {
            let mut state = self.lock_state();
            let index = state.next_index;
            state.next_index += 1;
            index
        };
        let checkout = Checkout {
            path: self.config.root.join(format!("wt-{index}")),
            branch: format!("{}/{}", self.config.branch_prefix, index),
        };

        let provider = Arc::clone(&self.provider);
        self.config
            .retry
            .run(
                "worktree create",
                CheckoutError::is_transient,
                || provider.create(&checkout.path, &checkout.branch),
            )
            .await?;

        self.lock_state().created += 1;
        obs::emit_worktree_created(&checkout.path, &checkout.branch);
        Ok(checkout)
    }

    /// Return a checkout to the pool.
    ///
    /// With `retain` the checkout and its branch stay on disk untouched and
    /// are never handed out again. Otherwise the checkout is reset; one that
    /// cannot be reset is removed instead of being reused dirty.
    pub async fn release(&self, dir: WorkingDir, retain: bool) {
        let WorkingDir { checkout, _permit } = dir;

        if retain {
            obs::emit_worktree_released(&checkout.path, true);
            self.lock_state().retained.push(checkout);
            return;
        }

        let reset = self
            .config
            .retry
            .run("worktree reset", CheckoutError::is_transient, || {
                self.provider.reset(&checkout.path)
            })
            .await;

        match reset {
            Ok(()) => {
                obs::emit_worktree_released(&checkout.path, false);
                self.lock_state().free.push(checkout);
            }
            Err(e) => {
                warn!(path = %checkout.path.display(), error = %e, "checkout reset failed; discarding it");
                if let Err(e) = self.provider.remove(&checkout.path, &checkout.branch).await {
                    warn!(path = %checkout.path.display(), error = %e, "failed to remove checkout");
                }
            }
        }
        // `_permit` drops here, waking the next waiter only once the checkout
        // is back on the free list.
    }

    /// Close the pool and remove every free checkout. Retained checkouts stay.
    ///
    /// Returns the number of checkouts removed.
    pub async fn shutdown(&self) -> usize {
        self.permits.close();
        let free = std::mem::take(&mut self.lock_state().free);
        let mut removed = 0;
        for checkout in free {
            match self
                .provider
                .remove(&checkout.path, &checkout.branch)
                .await
            {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %checkout.path.display(), error = %e, "failed to remove checkout")
                }
            }
        }
        debug!(removed, "worktree pool shut down");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::DirCheckoutProvider;
    use std::time::Duration;

    fn pool(provider: Arc<dyn CheckoutProvider>, root: &Path, capacity: usize) -> WorktreePool {
        WorktreePool::new(
            provider,
            PoolConfig {
                root: root.to_path_buf(),
                branch_prefix: "agentflow/test".into(),
                capacity,
                first_index: 1,
                retry: RetryPolicy {
                    max_retries: 3,
                    backoff_base_ms: 1,
                },
            },
        )
    }

    #[tokio::test]
    async fn acquire_blocks_at_capacity_until_release() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirCheckoutProvider::new());
        let pool = Arc::new(pool(provider, root.path(), 2));

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "third acquire must wait");

        let a_path = a.path().to_path_buf();
        pool.release(a, false).await;
        let c = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter wakes after release")
            .unwrap()
            .unwrap();
        assert_eq!(c.path(), a_path, "released checkout is reused");
        assert_eq!(pool.created(), 2);
    }

    #[tokio::test]
    async fn release_resets_checkout_contents() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirCheckoutProvider::new());
        let pool = pool(provider, root.path(), 1);

        let wd = pool.acquire().await.unwrap();
        std::fs::write(wd.path().join("scratch.txt"), "dirty").unwrap();
        pool.release(wd, false).await;

        let wd = pool.acquire().await.unwrap();
        assert!(!wd.path().join("scratch.txt").exists());
        pool.release(wd, false).await;
    }

    #[tokio::test]
    async fn retained_checkout_is_left_intact_and_not_reused() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirCheckoutProvider::new());
        let pool = pool(provider.clone(), root.path(), 1);

        let wd = pool.acquire().await.unwrap();
        let kept = wd.path().to_path_buf();
        std::fs::write(kept.join("debug.log"), "keep me").unwrap();
        pool.release(wd, true).await;

        let next = pool.acquire().await.unwrap();
        assert_ne!(next.path(), kept);
        pool.release(next, false).await;

        assert_eq!(pool.shutdown().await, 1);
        assert!(kept.join("debug.log").exists());
        assert_eq!(pool.retained().len(), 1);
    }

    #[tokio::test]
    async fn transient_create_failures_are_retried() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirCheckoutProvider::new().fail_creates(2));
        let pool = pool(provider.clone(), root.path(), 1);

        let wd = pool.acquire().await.unwrap();
        assert!(wd.path().exists());
        assert_eq!(provider.create_attempts(), 3);
    }

    #[tokio::test]
    async fn shutdown_closes_pool() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirCheckoutProvider::new());
        let pool = pool(provider, root.path(), 1);
        let wd = pool.acquire().await.unwrap();
        pool.release(wd, false).await;
        assert_eq!(pool.shutdown().await, 1);
        assert!(matches!(
            pool.acquire().await,
            Err(CheckoutError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn branch_names_use_prefix_and_index() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirCheckoutProvider::new());
        let pool = pool(provider, root.path(), 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(a.branch(), "agentflow/test/1");
        assert_eq!(b.branch(), "agentflow/test/2");
        assert_eq!(pool.next_index(), 3);
    }

    #[tokio::test]
    async fn reserve_waiting_is_cancellable() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirCheckoutProvider::new());
        let pool = pool(provider, root.path(), 1);

        let held = pool.acquire().await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), pool.reserve()).await;
        assert!(waited.is_err(), "no slot while the only checkout is on loan");

        pool.release(held, false).await;
        let slot = pool.reserve().await.unwrap();
        let wd = pool.fill(slot).await.unwrap();
        assert_eq!(pool.created(), 1, "the free checkout is reused");
        pool.release(wd, false).await;
        assert_eq!(pool.shutdown().await, 1);
    }

    #[tokio::test]
    async fn reused_git_checkout_drops_previous_commits() {
        use crate::git::test_support::{make_git_repo, run_git};

        let repo = make_git_repo();
        let trees = tempfile::tempdir().unwrap();
        let base = git::resolve_revision(repo.path(), "HEAD").await.unwrap();
        let provider = Arc::new(GitCheckoutProvider::new(repo.path(), base.clone()));
        let pool = pool(provider, trees.path(), 1);

        let wd = pool.acquire().await.unwrap();
        let first_path = wd.path().to_path_buf();
        std::fs::write(wd.path().join("agent_change.txt"), "run 1 work\n").unwrap();
        run_git(wd.path(), &["add", "agent_change.txt"]);
        run_git(wd.path(), &["commit", "-m", "run 1"]);
        assert_ne!(git::resolve_revision(wd.path(), "HEAD").await.unwrap(), base);
        pool.release(wd, false).await;

        let wd = pool.acquire().await.unwrap();
        assert_eq!(wd.path(), first_path);
        assert!(!wd.path().join("agent_change.txt").exists());
        assert_eq!(git::resolve_revision(wd.path(), "HEAD").await.unwrap(), base);
        assert!(git::status_porcelain(wd.path()).await.unwrap().is_empty());
        pool.release(wd, false).await;
        assert_eq!(pool.shutdown().await, 1);
    }

    #[tokio::test]
    async fn git_provider_creates_resets_and_removes() {
        use crate::git::test_support::{make_git_repo, run_git};

        let repo = make_git_repo();
        let trees = tempfile::tempdir().unwrap();
        let base = git::resolve_revision(repo.path(), "HEAD").await.unwrap();
        let provider = GitCheckoutProvider::new(repo.path(), base);
        let path = trees.path().join("wt-1");

        provider.create(&path, "agentflow/t/1").await.unwrap();
        assert!(path.join("README.md").exists());
        assert!(git::is_git_repo(&path).await);

        std::fs::write(path.join("README.md"), "changed\n").unwrap();
        std::fs::write(path.join("new.txt"), "untracked").unwrap();
        assert!(!git::status_porcelain(&path).await.unwrap().is_empty());
        provider.reset(&path).await.unwrap();
        assert!(git::status_porcelain(&path).await.unwrap().is_empty());

        provider.remove(&path, "agentflow/t/1").await.unwrap();
        assert!(!path.exists());
        run_git(repo.path(), &["worktree", "prune"]);
        let branches = git::git(repo.path(), &["branch", "--list", "agentflow/*"])
            .await
            .unwrap();
        assert!(branches.is_empty());
    }
}
