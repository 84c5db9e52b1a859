//! GC 单元
//!
//! `use_gc` 的值不直接持有负载，而是放在引用计数的 `GcCell` 中：
//! 拷贝共享同一单元，引用持有弱指针。最后一个强引用释放时负载随之释放。
//!
//! 引用计数无法回收强引用环，所以容器比较之前要做深度安全检查
//! （`calc_safe_depth_arr`），遇到环或超过深度上限时拒绝递归。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

use super::meta::VType;
use super::value::{Payload, ValueItem};
use crate::config::runtime_config;

// ============================================================================
// GC 统计信息
// ============================================================================

struct GcCounters {
    allocations: CachePadded<AtomicU64>,
    frees: CachePadded<AtomicU64>,
}

static GC_COUNTERS: GcCounters = GcCounters {
    allocations: CachePadded::new(AtomicU64::new(0)),
    frees: CachePadded::new(AtomicU64::new(0)),
};

/// GC 统计（进程级）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// 创建的单元数
    pub allocations: u64,
    /// 释放的单元数
    pub frees: u64,
}

impl GcStats {
    /// 存活单元数
    pub fn live(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

/// 获取 GC 统计
pub fn gc_stats() -> GcStats {
    GcStats {
        allocations: GC_COUNTERS.allocations.load(Ordering::Relaxed),
        frees: GC_COUNTERS.frees.load(Ordering::Relaxed),
    }
}

// ============================================================================
// GC 单元
// ============================================================================

/// 单元释放时计数
struct FreeGuard;

impl Drop for FreeGuard {
    fn drop(&mut self) {
        GC_COUNTERS.frees.fetch_add(1, Ordering::Relaxed);
    }
}

struct GcBox {
    value: RwLock<ValueItem>,
    _guard: FreeGuard,
}

/// 强引用
#[derive(Clone)]
pub struct GcCell(Arc<GcBox>);

/// 弱引用
#[derive(Clone)]
pub struct GcWeak(Weak<GcBox>);

impl GcCell {
    /// 把值放入新单元
    pub fn new(value: ValueItem) -> Self {
        GC_COUNTERS.allocations.fetch_add(1, Ordering::Relaxed);
        GcCell(Arc::new(GcBox { value: RwLock::new(value), _guard: FreeGuard }))
    }

    /// 只读访问
    ///
    /// 使用递归读锁：深度检查和比较会在持有外层读锁时再次读取同一单元
    pub fn read<R>(&self, f: impl FnOnce(&ValueItem) -> R) -> R {
        let guard = self.0.value.read_recursive();
        f(&guard)
    }

    /// 可写访问
    pub fn write<R>(&self, f: impl FnOnce(&mut ValueItem) -> R) -> R {
        let mut guard = self.0.value.write();
        f(&mut guard)
    }

    /// 内部值的标签
    pub fn vtype(&self) -> VType {
        self.read(|inner| inner.vtype())
    }

    pub fn downgrade(&self) -> GcWeak {
        GcWeak(Arc::downgrade(&self.0))
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// 单元地址（身份比较和哈希）
    pub fn as_ptr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &GcCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// 独占时取出内部值，否则原样返回
    pub fn try_unwrap(self) -> Result<ValueItem, GcCell> {
        match Arc::try_unwrap(self.0) {
            Ok(gc_box) => Ok(gc_box.value.into_inner()),
            Err(shared) => Err(GcCell(shared)),
        }
    }

    /// 深度安全检查（只对动态数组有意义，其余类型总是安全）
    pub fn depth_safety(&self) -> bool {
        match self.vtype() {
            VType::Uarr => {
                let mut path = vec![self.as_ptr()];
                self.read(|inner| walk_payload(inner, 0, runtime_config().safe_depth, &mut path))
            }
            _ => true,
        }
    }
}

impl GcWeak {
    pub fn upgrade(&self) -> Option<GcCell> {
        self.0.upgrade().map(GcCell)
    }

    /// 目标是否已释放
    pub fn is_deleted(&self) -> bool {
        self.0.strong_count() == 0
    }
}

// ============================================================================
// 深度安全检查
// ============================================================================

/// 检查容器是否可以安全递归
///
/// 沿当前路径记录经过的 GC 单元；路径上重复出现同一单元（环）
/// 或嵌套超过配置的深度上限时返回 false
pub fn calc_safe_depth_arr(item: &ValueItem) -> bool {
    let mut path = Vec::new();
    walk(item, 0, runtime_config().safe_depth, &mut path)
}

fn walk(item: &ValueItem, depth: usize, limit: usize, path: &mut Vec<usize>) -> bool {
    if depth > limit {
        return false;
    }
    let cell = match item.payload() {
        Payload::Gc(cell) => Some(cell.clone()),
        Payload::GcRef(weak) => weak.upgrade(),
        _ => None,
    };
    match cell {
        Some(cell) => {
            let key = cell.as_ptr();
            if path.contains(&key) {
                return false;
            }
            path.push(key);
            let safe = cell.read(|inner| walk_payload(inner, depth, limit, path));
            path.pop();
            safe
        }
        None => walk_payload(item, depth, limit, path),
    }
}

fn walk_payload(item: &ValueItem, depth: usize, limit: usize, path: &mut Vec<usize>) -> bool {
    let next = depth + 1;
    match item.payload() {
        Payload::Array(items) | Payload::StackArray(items) => {
            items.iter().all(|e| walk(e, next, limit, path))
        }
        Payload::FixedArray(items) => items.iter().all(|e| walk(e, next, limit, path)),
        Payload::Map(map) => map
            .iter()
            .all(|(k, v)| walk(k, next, limit, path) && walk(v, next, limit, path)),
        Payload::Set(set) => set.iter().all(|e| walk(e, next, limit, path)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_lifecycle() {
        let cell = GcCell::new(ValueItem::from(7i32));
        let weak = cell.downgrade();
        assert!(!weak.is_deleted());
        assert_eq!(cell.vtype(), VType::I32);

        let second = cell.clone();
        assert_eq!(cell.strong_count(), 2);
        assert!(second.ptr_eq(&cell));

        let cell = match cell.try_unwrap() {
            Ok(_) => panic!("shared cell must not unwrap"),
            Err(cell) => cell,
        };
        drop(second);
        let inner = cell.try_unwrap().ok().unwrap();
        assert_eq!(inner, ValueItem::from(7i32));
        assert!(weak.is_deleted());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_stats_count_cells() {
        let before = gc_stats();
        {
            let _a = GcCell::new(ValueItem::null());
            let _b = GcCell::new(ValueItem::null());
        }
        let after = gc_stats();
        // 其他测试线程也可能创建单元，只检查下限
        assert!(after.allocations - before.allocations >= 2);
        assert!(after.frees - before.frees >= 2);
    }

    #[test]
    fn test_depth_safety_detects_cycle() {
        let mut shared = ValueItem::gc(ValueItem::array(vec![ValueItem::from(1i32)])).unwrap();
        assert!(calc_safe_depth_arr(&shared));

        let self_ref = shared.reference().unwrap();
        shared.push(self_ref).unwrap();
        assert!(!calc_safe_depth_arr(&shared));

        let cell = match shared.payload() {
            Payload::Gc(cell) => cell.clone(),
            _ => unreachable!(),
        };
        assert!(!cell.depth_safety());
    }

    #[test]
    fn test_depth_limit() {
        let mut nested = ValueItem::array(vec![]);
        for _ in 0..(runtime_config().safe_depth + 2) {
            nested = ValueItem::array(vec![nested]);
        }
        assert!(!calc_safe_depth_arr(&nested));

        let shallow = ValueItem::array(vec![ValueItem::array(vec![])]);
        assert!(calc_safe_depth_arr(&shallow));
    }
}
