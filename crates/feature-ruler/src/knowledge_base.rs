//! 知识库缓存与加载协调
//!
//! 每个 `(name, version)` 对应一个独立的槽位 `RwLock<SlotState>`：
//!
//! - 评估持有槽位的读锁（[`KnowledgeBaseLease`]），多个评估可并发使用同一知识库。
//! - 重新加载持有写锁。写锁要等所有在途评估释放租约后才能获得；
//!   tokio 的 `RwLock` 写优先，排队中的重新加载会让新到的评估等待其完成。
//! - 拿到写锁后再次检查条目是否可用，保证并发请求同一个键时最多加载一次。
//! - 加载失败时记录失败结果；在该次加载期间到达的调用方直接返回同一结果，不再各自加载。
//! - 加载完成后写锁原子降级为读锁，发起加载的调用方直接持有新句柄。
//!
//! 不同键之间互不阻塞。取消或超时的调用在 drop 时释放其持有的锁。
//! 加载失败且无人等待的槽位会被移除，不存在的知识库名不会在缓存中累积。

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use ruler_shared::observability::metrics;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::engine::{CompiledKnowledgeBase, RuleEngine};
use crate::error::{Result, RulerError};
use crate::loader::{LoadError, RuleSheetLoader};
use crate::version::{VersionResolutionError, VersionResolver};

/// 符号版本，查询前先解析为具体版本
pub const LATEST: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KnowledgeBaseKey {
    pub name: String,
    pub version: String,
}

impl KnowledgeBaseKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// 数字版本不可变，缓存后永不过期
    pub fn is_pinned(&self) -> bool {
        self.version.parse::<u64>().is_ok()
    }
}

impl fmt::Display for KnowledgeBaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// 缓存条目，只在重新加载时被替换
#[derive(Debug)]
pub struct CacheEntry<K> {
    handle: Arc<K>,
    expires_at: Option<Instant>,
}

impl<K: CompiledKnowledgeBase> CacheEntry<K> {
    pub fn handle(&self) -> &Arc<K> {
        &self.handle
    }

    /// 固定版本返回 None
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    fn is_servable(&self, now: Instant) -> bool {
        self.handle.rule_count() > 0 && self.expires_at.is_none_or(|at| at > now)
    }
}

/// 一次失败加载的结果
#[derive(Debug, Clone)]
enum LoadFailure {
    NotFound,
    Failed(String),
}

impl LoadFailure {
    fn to_error(&self, key: &KnowledgeBaseKey) -> RulerError {
        match self {
            Self::NotFound => RulerError::not_found(&key.name, &key.version),
            Self::Failed(reason) => RulerError::load_failed(&key.name, &key.version, reason),
        }
    }
}

struct SlotState<K> {
    entry: Option<CacheEntry<K>>,
    last_failure: Option<LoadFailure>,
}

impl<K> Default for SlotState<K> {
    fn default() -> Self {
        Self {
            entry: None,
            last_failure: None,
        }
    }
}

impl<K: CompiledKnowledgeBase> SlotState<K> {
    fn is_servable(&self) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|entry| entry.is_servable(Instant::now()))
    }
}

/// 单个键的槽位
///
/// `attempts` 是已完成的加载次数，只在持有写锁时递增。
struct Slot<K> {
    attempts: AtomicU64,
    state: Arc<RwLock<SlotState<K>>>,
}

impl<K> Default for Slot<K> {
    fn default() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            state: Arc::new(RwLock::new(SlotState::default())),
        }
    }
}

/// 知识库状态，用于诊断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeBaseState {
    Idle,
    Loading,
    Ready,
}

/// 知识库租约
///
/// 持有期间该知识库不会被重新加载替换。评估结束后应尽快释放。
pub struct KnowledgeBaseLease<K: CompiledKnowledgeBase> {
    key: KnowledgeBaseKey,
    guard: OwnedRwLockReadGuard<SlotState<K>, CacheEntry<K>>,
}

impl<K: CompiledKnowledgeBase> KnowledgeBaseLease<K> {
    fn acquire(key: KnowledgeBaseKey, guard: OwnedRwLockReadGuard<SlotState<K>>) -> Result<Self> {
        match OwnedRwLockReadGuard::try_map(guard, |state| state.entry.as_ref()) {
            Ok(guard) => Ok(Self { key, guard }),
            Err(_) => Err(RulerError::not_found(&key.name, &key.version)),
        }
    }

    /// 解析后的具体键
    pub fn key(&self) -> &KnowledgeBaseKey {
        &self.key
    }

    pub fn handle(&self) -> Arc<K> {
        self.guard.handle.clone()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.guard.expires_at
    }
}

impl<K: CompiledKnowledgeBase> Deref for KnowledgeBaseLease<K> {
    type Target = K;

    fn deref(&self) -> &K {
        &self.guard.handle
    }
}

impl<K: CompiledKnowledgeBase> fmt::Debug for KnowledgeBaseLease<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBaseLease")
            .field("key", &self.key)
            .field("rules", &self.guard.handle.rule_count())
            .finish()
    }
}

pub struct KnowledgeBaseCache<E: RuleEngine> {
    engine: Arc<E>,
    loader: Arc<dyn RuleSheetLoader>,
    versions: Option<Arc<VersionResolver>>,
    ttl: Duration,
    slots: DashMap<KnowledgeBaseKey, Arc<Slot<E::KnowledgeBase>>>,
}

impl<E: RuleEngine> KnowledgeBaseCache<E> {
    pub fn new(engine: Arc<E>, loader: Arc<dyn RuleSheetLoader>, ttl: Duration) -> Self {
        Self {
            engine,
            loader,
            versions: None,
            ttl,
            slots: DashMap::new(),
        }
    }

    pub fn with_version_resolver(mut self, versions: Arc<VersionResolver>) -> Self {
        self.versions = Some(versions);
        self
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// 获取知识库，必要时加载
    ///
    /// `latest` 先经版本解析转换为具体版本。仓库中不存在可用版本、
    /// 规则表不存在或编译后为空时返回 [`RulerError::NotFound`]；
    /// 传输或编译失败返回 [`RulerError::LoadFailed`]。
    /// 同一次加载期间到达的调用方共享该次加载的结果。
    #[instrument(skip(self))]
    pub async fn get_or_load(
        &self,
        name: &str,
        version: &str,
    ) -> Result<KnowledgeBaseLease<E::KnowledgeBase>> {
        let key = self.resolve_key(name, version).await?;
        let slot = self.slot(&key);
        let observed = slot.attempts.load(Ordering::Acquire);

        let guard = slot.state.clone().read_owned().await;
        if guard.is_servable() {
            metrics::record_cache_hit(&key.name);
            return KnowledgeBaseLease::acquire(key, guard);
        }
        drop(guard);

        let mut guard = slot.state.clone().write_owned().await;
        if guard.is_servable() {
            // 等待写锁期间已被其他调用方加载
            metrics::record_cache_hit(&key.name);
            return KnowledgeBaseLease::acquire(key, guard.downgrade());
        }

        // 到达之后完成的加载失败了，直接复用其结果
        let settled = slot.attempts.load(Ordering::Acquire) != observed;
        let shared = guard
            .last_failure
            .as_ref()
            .filter(|_| settled)
            .map(|failure| failure.to_error(&key));
        let outcome = match shared {
            Some(err) => {
                debug!(key = %key, "复用并发加载的失败结果");
                Err(err)
            }
            None => self.reload(&key, &slot, &mut *guard).await,
        };

        match outcome {
            Ok(()) => KnowledgeBaseLease::acquire(key, guard.downgrade()),
            Err(e) => {
                drop(guard);
                self.evict_if_unused(&key, slot);
                Err(e)
            }
        }
    }

    /// 查询某个具体键的状态
    pub fn state(&self, name: &str, version: &str) -> KnowledgeBaseState {
        let key = KnowledgeBaseKey::new(name, version);
        let Some(slot) = self.slots.get(&key).map(|s| s.value().clone()) else {
            return KnowledgeBaseState::Idle;
        };
        match slot.state.try_read() {
            Err(_) => KnowledgeBaseState::Loading,
            Ok(state) if state.entry.is_some() => KnowledgeBaseState::Ready,
            Ok(_) => KnowledgeBaseState::Idle,
        }
    }

    async fn resolve_key(&self, name: &str, version: &str) -> Result<KnowledgeBaseKey> {
        if version != LATEST {
            return Ok(KnowledgeBaseKey::new(name, version));
        }

        let Some(versions) = &self.versions else {
            return Err(RulerError::load_failed(name, version, "未配置版本仓库，无法解析 latest"));
        };

        match versions.resolve_latest(name).await {
            Ok(concrete) => Ok(KnowledgeBaseKey::new(name, concrete)),
            Err(VersionResolutionError::NoEligibleVersion(_)) => {
                Err(RulerError::not_found(name, version))
            }
            Err(e) => Err(RulerError::load_failed(name, version, e)),
        }
    }

    fn slot(&self, key: &KnowledgeBaseKey) -> Arc<Slot<E::KnowledgeBase>> {
        self.slots.entry(key.clone()).or_default().value().clone()
    }

    /// 释放自己持有的槽位引用；没有其他持有者时移除该槽位
    fn evict_if_unused(&self, key: &KnowledgeBaseKey, slot: Arc<Slot<E::KnowledgeBase>>) {
        drop(slot);
        if self
            .slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1)
            .is_some()
        {
            debug!(key = %key, "移除加载失败的槽位");
        }
    }

    /// 在写锁内替换条目并记录本次加载结果
    async fn reload(
        &self,
        key: &KnowledgeBaseKey,
        slot: &Slot<E::KnowledgeBase>,
        state: &mut SlotState<E::KnowledgeBase>,
    ) -> Result<()> {
        if let Some(stale) = state.entry.take() {
            debug!(key = %key, rules = stale.handle.rule_count(), "移除过期规则");
        }

        let outcome = self.fetch(key).await;
        slot.attempts.fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok(entry) => {
                state.entry = Some(entry);
                state.last_failure = None;
                Ok(())
            }
            Err(failure) => {
                let err = failure.to_error(key);
                state.last_failure = Some(failure);
                Err(err)
            }
        }
    }

    async fn fetch(
        &self,
        key: &KnowledgeBaseKey,
    ) -> std::result::Result<CacheEntry<E::KnowledgeBase>, LoadFailure> {
        let source = match self.loader.load(&key.name, &key.version).await {
            Ok(source) => source,
            Err(LoadError::NotFound(location)) => {
                metrics::record_knowledge_base_load(&key.name, "not_found");
                warn!(key = %key, location = %location, "规则表不存在");
                return Err(LoadFailure::NotFound);
            }
            Err(LoadError::Transport(reason)) => {
                metrics::record_knowledge_base_load(&key.name, "failed");
                warn!(key = %key, reason = %reason, "规则表加载失败");
                return Err(LoadFailure::Failed(reason));
            }
        };

        let compiled = self
            .engine
            .compile(&key.name, &key.version, &source)
            .map_err(|e| {
                metrics::record_knowledge_base_load(&key.name, "compile_failed");
                LoadFailure::Failed(format!("编译失败: {e:#}"))
            })?;

        // 检查的是新编译的条目，而不是加载前的快照
        let rules = compiled.rule_count();
        if rules == 0 {
            metrics::record_knowledge_base_load(&key.name, "empty");
            return Err(LoadFailure::NotFound);
        }

        metrics::record_knowledge_base_load(&key.name, "success");
        info!(key = %key, rules, pinned = key.is_pinned(), "知识库已加载");
        Ok(CacheEntry {
            handle: Arc::new(compiled),
            expires_at: (!key.is_pinned()).then(|| Instant::now() + self.ttl),
        })
    }
}
