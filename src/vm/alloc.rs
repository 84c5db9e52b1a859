//! 通用分配 / 释放 / 拷贝原语
//!
//! 给定 `(槽位, 元数据)`，按标签分配默认负载、深拷贝、释放。
//! `universal_remove` 是唯一的释放入口：释放后槽位与元数据都被清零，
//! 保证“已释放即为空”。

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::gc::GcCell;
use super::meta::{VType, ValueMeta};
use super::structure::Structure;
use super::value::{copy_items, Payload, RawArray, ValueItem};
use crate::error::{ValueError, ValueResult};
use crate::runtime::async_result::AsyncResult;

// ============================================================================
// 分配统计
// ============================================================================

thread_local! {
    static ALLOCATIONS: Cell<u64> = const { Cell::new(0) };
    static FREES: Cell<u64> = const { Cell::new(0) };
}

/// 独占负载的分配统计（线程级）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub allocations: u64,
    pub frees: u64,
}

impl AllocStats {
    pub fn live(&self) -> i64 {
        self.allocations as i64 - self.frees as i64
    }
}

/// 当前线程的分配统计
pub fn alloc_stats() -> AllocStats {
    AllocStats {
        allocations: ALLOCATIONS.with(|c| c.get()),
        frees: FREES.with(|c| c.get()),
    }
}

#[inline]
pub(crate) fn note_alloc() {
    ALLOCATIONS.with(|c| c.set(c.get() + 1));
}

#[inline]
fn note_free() {
    FREES.with(|c| c.set(c.get() + 1));
}

/// 负载是否由该值独占且需要记账
#[inline]
pub(crate) fn counts_as_owned(val: &Payload, meta: ValueMeta) -> bool {
    !meta.as_ref()
        && !matches!(val, Payload::Empty | Payload::Gc(_) | Payload::GcRef(_))
        && need_alloc_type(meta.vtype())
}

// ============================================================================
// 分配判定
// ============================================================================

/// 标签是否需要堆分配
pub fn need_alloc_type(vtype: VType) -> bool {
    vtype.is_raw_array()
        || matches!(
            vtype,
            VType::Uarr
                | VType::String
                | VType::AsyncRes
                | VType::ExceptValue
                | VType::Faarr
                | VType::Function
        )
}

/// 元数据是否需要分配（GC 模式下标量也要包装）
pub fn need_alloc(meta: ValueMeta) -> bool {
    meta.use_gc() || need_alloc_type(meta.vtype())
}

// ============================================================================
// 分配
// ============================================================================

/// 按元数据为槽位分配默认负载
///
/// 槽位原有的值先被释放；`use_gc` 时负载包装进新的 GC 单元
pub fn universal_alloc(slot: &mut ValueItem, meta: ValueMeta) -> ValueResult<()> {
    universal_remove(slot)?;

    let vtype = meta.vtype();
    let len = meta.val_len() as usize;
    let val = match vtype {
        VType::Noting => Payload::Empty,
        VType::Boolean => Payload::Bool(false),
        VType::I8 => Payload::I8(0),
        VType::I16 => Payload::I16(0),
        VType::I32 => Payload::I32(0),
        VType::I64 => Payload::I64(0),
        VType::Ui8 => Payload::Ui8(0),
        VType::Ui16 => Payload::Ui16(0),
        VType::Ui32 => Payload::Ui32(0),
        VType::Ui64 => Payload::Ui64(0),
        VType::Flo => Payload::Flo(0.0),
        VType::Doub => Payload::Doub(0.0),
        VType::UndefinedPtr => Payload::UndefinedPtr(0),
        VType::TimePoint => Payload::TimePoint(0),
        VType::TypeIdentifier => Payload::TypeIdentifier(VType::Noting),
        t if t.is_raw_array() => {
            let element = t.raw_array_element().unwrap_or(VType::Ui8);
            Payload::RawArray(RawArray::zeroed(element, len)?)
        }
        VType::Uarr => Payload::Array(Vec::new()),
        VType::Faarr => Payload::FixedArray((0..len).map(|_| ValueItem::null()).collect()),
        VType::Saarr => {
            return Err(ValueError::InvalidOperation(
                "stack arrays cannot be heap allocated".to_string(),
            ))
        }
        VType::String => Payload::String(String::new()),
        VType::Map => Payload::Map(HashMap::new()),
        VType::Set => Payload::Set(HashSet::new()),
        VType::Function => {
            return Err(ValueError::InvalidArguments(
                "a function value requires an environment".to_string(),
            ))
        }
        VType::AsyncRes => Payload::Async(AsyncResult::ready(ValueItem::null())),
        VType::ExceptValue => Payload::Exception(Arc::new(ValueError::undefined_exception())),
        // 对象标签分配为空对象
        _ => Payload::Empty,
    };

    let mut stored = meta;
    stored.set_as_ref(false);
    if meta.use_gc() {
        let mut inner_meta = stored;
        inner_meta.set_use_gc(false);
        let inner = ValueItem::from_parts(val, inner_meta);
        slot.val = Payload::Gc(GcCell::new(inner));
    } else {
        if counts_as_owned(&val, stored) {
            note_alloc();
        }
        slot.val = val;
    }
    slot.meta = stored;
    Ok(())
}

// ============================================================================
// 释放
// ============================================================================

/// 按标签释放负载
///
/// 调用方负责检查 `as_ref`；对引用调用时只丢弃别名
pub fn universal_free(val: &mut Payload, meta: ValueMeta) -> ValueResult<()> {
    let owned = counts_as_owned(val, meta);
    let taken = std::mem::replace(val, Payload::Empty);
    if meta.as_ref() {
        return Ok(());
    }
    if owned {
        note_free();
    }
    match taken {
        Payload::Struct(handle) => Structure::destruct(&handle),
        Payload::StackArray(items) | Payload::Array(items) => {
            release_items(items);
            Ok(())
        }
        Payload::FixedArray(items) => {
            release_items(items.into_vec());
            Ok(())
        }
        // GC 单元、类对象等在最后一个句柄释放时自行清理
        other => {
            drop(other);
            Ok(())
        }
    }
}

/// 按声明顺序逐个释放元素
fn release_items(items: Vec<ValueItem>) {
    for mut item in items {
        if let Err(err) = universal_remove(&mut item) {
            tracing::warn!(error = %err, "failed to release array element");
        }
    }
}

/// 释放槽位并清零
///
/// 元数据未编码或槽位为空时什么也不做
pub fn universal_remove(slot: &mut ValueItem) -> ValueResult<()> {
    if !slot.meta.is_encoded() || matches!(slot.val, Payload::Empty) {
        slot.val = Payload::Empty;
        slot.meta = ValueMeta::default();
        return Ok(());
    }
    let meta = slot.meta;
    let result = universal_free(&mut slot.val, meta);
    slot.val = Payload::Empty;
    slot.meta = ValueMeta::default();
    result
}

// ============================================================================
// 拷贝
// ============================================================================

/// 深拷贝负载
///
/// 异步结果先解析（返回的元数据是结果的元数据）；引用原样别名；
/// GC 值共享单元；其余按标签深拷贝
pub fn copy_value(val: &Payload, meta: ValueMeta) -> ValueResult<(Payload, ValueMeta)> {
    if meta.as_ref() && !matches!(val, Payload::Async(_)) {
        return Ok((alias(val, meta)?, meta));
    }

    let copied = match val {
        Payload::Empty => Payload::Empty,
        Payload::Bool(v) => Payload::Bool(*v),
        Payload::I8(v) => Payload::I8(*v),
        Payload::I16(v) => Payload::I16(*v),
        Payload::I32(v) => Payload::I32(*v),
        Payload::I64(v) => Payload::I64(*v),
        Payload::Ui8(v) => Payload::Ui8(*v),
        Payload::Ui16(v) => Payload::Ui16(*v),
        Payload::Ui32(v) => Payload::Ui32(*v),
        Payload::Ui64(v) => Payload::Ui64(*v),
        Payload::Flo(v) => Payload::Flo(*v),
        Payload::Doub(v) => Payload::Doub(*v),
        Payload::UndefinedPtr(v) => Payload::UndefinedPtr(*v),
        Payload::TimePoint(v) => Payload::TimePoint(*v),
        Payload::TypeIdentifier(v) => Payload::TypeIdentifier(*v),
        Payload::RawArray(arr) => Payload::RawArray(arr.clone()),
        Payload::Array(items) => Payload::Array(copy_items(items)?),
        Payload::FixedArray(items) => Payload::FixedArray(copy_items(items)?.into_boxed_slice()),
        Payload::StackArray(items) => Payload::StackArray(copy_items(items)?),
        Payload::String(s) => Payload::String(s.clone()),
        Payload::Map(map) => {
            let mut copy = HashMap::with_capacity(map.len());
            for (k, v) in map {
                copy.insert(k.try_clone()?, v.try_clone()?);
            }
            Payload::Map(copy)
        }
        Payload::Set(set) => {
            let mut copy = HashSet::with_capacity(set.len());
            for v in set {
                copy.insert(v.try_clone()?);
            }
            Payload::Set(copy)
        }
        Payload::Function(f) => Payload::Function(Arc::clone(f)),
        Payload::Exception(e) => Payload::Exception(Arc::clone(e)),
        Payload::Struct(handle) => Payload::Struct(Structure::copy(handle)?),
        Payload::Class(handle) => {
            let copy = handle.lock().try_clone()?;
            Payload::Class(Arc::new(Mutex::new(copy)))
        }
        Payload::Morph(handle) => {
            let copy = handle.lock().try_clone()?;
            Payload::Morph(Arc::new(Mutex::new(copy)))
        }
        Payload::Proxy(handle) => {
            let copy = handle.lock().try_clone()?;
            Payload::Proxy(Arc::new(Mutex::new(copy)))
        }
        Payload::Gc(cell) => Payload::Gc(cell.clone()),
        Payload::GcRef(weak) => Payload::GcRef(weak.clone()),
        Payload::Async(res) => {
            let resolved = res.with_result(|inner| inner.try_clone())?;
            return Ok(resolved.into_parts());
        }
    };
    Ok((copied, meta))
}

/// 引用的拷贝：只复制别名
fn alias(val: &Payload, meta: ValueMeta) -> ValueResult<Payload> {
    Ok(match val {
        Payload::Empty => Payload::Empty,
        Payload::GcRef(weak) => Payload::GcRef(weak.clone()),
        Payload::Gc(cell) => Payload::GcRef(cell.downgrade()),
        Payload::Struct(h) => Payload::Struct(Arc::clone(h)),
        Payload::Class(h) => Payload::Class(Arc::clone(h)),
        Payload::Morph(h) => Payload::Morph(Arc::clone(h)),
        Payload::Proxy(h) => Payload::Proxy(Arc::clone(h)),
        Payload::Function(f) => Payload::Function(Arc::clone(f)),
        _ => {
            return Err(ValueError::NotImplemented(format!(
                "copying a reference to {}",
                meta.vtype()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_need_alloc() {
        assert!(need_alloc_type(VType::String));
        assert!(need_alloc_type(VType::RawArrDoub));
        assert!(need_alloc_type(VType::Function));
        assert!(!need_alloc_type(VType::I32));
        assert!(!need_alloc_type(VType::Struct));
        assert!(!need_alloc_type(VType::Saarr));
        assert!(need_alloc(ValueMeta::new(VType::I32, true, true)));
    }

    #[test]
    fn test_alloc_defaults() {
        let raw = ValueItem::alloc(ValueMeta::with_len(VType::RawArrI32, false, true, 4)).unwrap();
        assert_eq!(raw.len().unwrap(), 4);
        assert_eq!(raw.get(3).unwrap(), ValueItem::from(0i32));

        let fixed = ValueItem::alloc(ValueMeta::with_len(VType::Faarr, false, true, 2)).unwrap();
        assert_eq!(fixed.len().unwrap(), 2);
        assert!(fixed.get(0).unwrap().is_noting());

        let exception = ValueItem::alloc(ValueMeta::of(VType::ExceptValue)).unwrap();
        match exception.payload() {
            Payload::Exception(e) => assert_eq!(**e, ValueError::undefined_exception()),
            other => panic!("unexpected payload {:?}", other),
        }

        assert!(matches!(
            ValueItem::alloc(ValueMeta::of(VType::Saarr)),
            Err(ValueError::InvalidOperation(_))
        ));
        assert!(matches!(
            ValueItem::alloc(ValueMeta::of(VType::Function)),
            Err(ValueError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_alloc_gc_wraps_scalars() {
        let item = ValueItem::alloc(ValueMeta::new(VType::I64, true, true)).unwrap();
        assert!(matches!(item.payload(), Payload::Gc(_)));
        assert_eq!(item.vtype(), VType::I64);
        assert_eq!(item, ValueItem::from(0i64));
    }

    #[test]
    fn test_remove_zeroes_slot() {
        let before = alloc_stats();
        let mut item = ValueItem::from("text");
        universal_remove(&mut item).unwrap();
        assert!(matches!(item.payload(), Payload::Empty));
        assert!(!item.meta.is_encoded());
        // 再次释放是空操作
        universal_remove(&mut item).unwrap();
        let after = alloc_stats();
        assert_eq!(after.allocations - before.allocations, 1);
        assert_eq!(after.frees - before.frees, 1);
    }

    #[test]
    fn test_reference_free_is_noop() {
        let owner = ValueItem::gc(ValueItem::from("shared")).unwrap();
        let mut alias = owner.reference().unwrap();
        universal_remove(&mut alias).unwrap();
        assert_eq!(owner.to_script_string().unwrap(), "shared");
    }

    #[test]
    fn test_copy_resolves_async() {
        let pending = ValueItem::async_result(AsyncResult::ready(ValueItem::from(3u8)));
        let copy = pending.try_clone().unwrap();
        assert_eq!(copy.vtype(), VType::Ui8);
        assert_eq!(pending.vtype(), VType::AsyncRes);
    }
}
