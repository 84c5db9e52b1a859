//! 运行时值定义
//!
//! `ValueItem` 是一个带标签的联合体：负载 `Payload` 加上打包元数据 `ValueMeta`。
//!
//! 所有权规则：
//! - 非 `as_ref` 且需要分配的负载由 `ValueItem` 独占，释放恰好一次
//!   （析构、重新赋值或 `take` 转移所有权时）
//! - `use_gc` 的负载放在引用计数的 `GcCell` 中共享
//! - `as_ref` 的值只是别名：GC 单元用弱引用，对象句柄共享 `Arc`，
//!   自身的析构从不释放目标

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::alloc::{self, universal_remove};
use super::class::{ClassValue, MorphValue, ProxyClass};
use super::gc::{GcCell, GcWeak};
use super::meta::{VType, ValueMeta};
use super::structure::Structure;
use crate::error::{ValueError, ValueResult};
use crate::runtime::async_result::AsyncResult;
use crate::runtime::function::FuncEnvironment;

/// 结构体句柄
pub type StructHandle = Arc<Mutex<Structure>>;
/// 类对象句柄
pub type ClassHandle = Arc<Mutex<ClassValue>>;
/// 可变形对象句柄
pub type MorphHandle = Arc<Mutex<MorphValue>>;
/// 代理对象句柄
pub type ProxyHandle = Arc<Mutex<ProxyClass>>;

// ============================================================================
// 原始定长数组
// ============================================================================

/// 原始标量数组（拷贝时整体按字节复制）
#[derive(Debug, Clone, PartialEq)]
pub enum RawArray {
    I8(Box<[i8]>),
    I16(Box<[i16]>),
    I32(Box<[i32]>),
    I64(Box<[i64]>),
    Ui8(Box<[u8]>),
    Ui16(Box<[u16]>),
    Ui32(Box<[u32]>),
    Ui64(Box<[u64]>),
    Flo(Box<[f32]>),
    Doub(Box<[f64]>),
}

macro_rules! for_each_raw {
    ($value:expr, |$arr:ident| $body:expr) => {
        match $value {
            RawArray::I8($arr) => $body,
            RawArray::I16($arr) => $body,
            RawArray::I32($arr) => $body,
            RawArray::I64($arr) => $body,
            RawArray::Ui8($arr) => $body,
            RawArray::Ui16($arr) => $body,
            RawArray::Ui32($arr) => $body,
            RawArray::Ui64($arr) => $body,
            RawArray::Flo($arr) => $body,
            RawArray::Doub($arr) => $body,
        }
    };
}

macro_rules! map_raw {
    ($value:expr, |$arr:ident| $body:expr) => {
        match $value {
            RawArray::I8($arr) => RawArray::I8($body),
            RawArray::I16($arr) => RawArray::I16($body),
            RawArray::I32($arr) => RawArray::I32($body),
            RawArray::I64($arr) => RawArray::I64($body),
            RawArray::Ui8($arr) => RawArray::Ui8($body),
            RawArray::Ui16($arr) => RawArray::Ui16($body),
            RawArray::Ui32($arr) => RawArray::Ui32($body),
            RawArray::Ui64($arr) => RawArray::Ui64($body),
            RawArray::Flo($arr) => RawArray::Flo($body),
            RawArray::Doub($arr) => RawArray::Doub($body),
        }
    };
}

impl RawArray {
    /// 分配指定元素类型和长度的零值数组
    pub fn zeroed(element: VType, len: usize) -> ValueResult<Self> {
        Ok(match element {
            VType::I8 => RawArray::I8(vec![0; len].into_boxed_slice()),
            VType::I16 => RawArray::I16(vec![0; len].into_boxed_slice()),
            VType::I32 => RawArray::I32(vec![0; len].into_boxed_slice()),
            VType::I64 => RawArray::I64(vec![0; len].into_boxed_slice()),
            VType::Ui8 => RawArray::Ui8(vec![0; len].into_boxed_slice()),
            VType::Ui16 => RawArray::Ui16(vec![0; len].into_boxed_slice()),
            VType::Ui32 => RawArray::Ui32(vec![0; len].into_boxed_slice()),
            VType::Ui64 => RawArray::Ui64(vec![0; len].into_boxed_slice()),
            VType::Flo => RawArray::Flo(vec![0.0; len].into_boxed_slice()),
            VType::Doub => RawArray::Doub(vec![0.0; len].into_boxed_slice()),
            other => {
                return Err(ValueError::InvalidType(format!(
                    "{} is not a raw array element type",
                    other
                )))
            }
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        for_each_raw!(self, |arr| arr.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 元素标签
    pub fn element_type(&self) -> VType {
        match self {
            RawArray::I8(_) => VType::I8,
            RawArray::I16(_) => VType::I16,
            RawArray::I32(_) => VType::I32,
            RawArray::I64(_) => VType::I64,
            RawArray::Ui8(_) => VType::Ui8,
            RawArray::Ui16(_) => VType::Ui16,
            RawArray::Ui32(_) => VType::Ui32,
            RawArray::Ui64(_) => VType::Ui64,
            RawArray::Flo(_) => VType::Flo,
            RawArray::Doub(_) => VType::Doub,
        }
    }

    /// 数组自身的标签
    pub fn vtype(&self) -> VType {
        VType::raw_array_of(self.element_type()).unwrap_or(VType::Noting)
    }

    /// 读取元素（装箱为 `ValueItem`）
    pub fn get(&self, index: usize) -> Option<ValueItem> {
        for_each_raw!(self, |arr| arr.get(index).map(|v| ValueItem::from(*v)))
    }

    /// 写入元素（按元素类型转换）
    pub fn set(&mut self, index: usize, value: &ValueItem) -> ValueResult<()> {
        let len = self.len();
        for_each_raw!(self, |arr| {
            let slot = arr
                .get_mut(index)
                .ok_or_else(|| ValueError::OutOfRange(format!("index {} of {}", index, len)))?;
            *slot = super::cast::FromValue::from_value(value)?;
            Ok(())
        })
    }

    /// 复制 `[start, end)` 范围
    pub fn slice(&self, start: usize, end: usize) -> RawArray {
        map_raw!(self, |arr| arr[start..end].to_vec().into_boxed_slice())
    }

    /// 逐元素装箱
    pub fn items(&self) -> Vec<ValueItem> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }
}

macro_rules! impl_raw_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Box<[$t]>> for RawArray {
                fn from(arr: Box<[$t]>) -> Self {
                    RawArray::$variant(arr)
                }
            }
        )*
    };
}

impl_raw_from!(
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => Ui8, u16 => Ui16, u32 => Ui32, u64 => Ui64,
    f32 => Flo, f64 => Doub,
);

// ============================================================================
// 负载
// ============================================================================

/// 值负载
///
/// 变体必须与元数据中的 vtype 一致；`Gc` 与 `GcRef` 是叠在具体负载之下的
/// 共享层，`Empty` 表示无负载（`noting` 或被移走/释放后的状态，对象类标签
/// 下表示空对象）
pub enum Payload {
    Empty,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Ui8(u8),
    Ui16(u16),
    Ui32(u32),
    Ui64(u64),
    Flo(f32),
    Doub(f64),
    UndefinedPtr(usize),
    /// 自 UNIX 纪元起的纳秒数
    TimePoint(i64),
    TypeIdentifier(VType),
    RawArray(RawArray),
    Array(Vec<ValueItem>),
    FixedArray(Box<[ValueItem]>),
    StackArray(Vec<ValueItem>),
    String(String),
    Map(HashMap<ValueItem, ValueItem>),
    Set(HashSet<ValueItem>),
    Function(Arc<FuncEnvironment>),
    Struct(StructHandle),
    Proxy(ProxyHandle),
    Class(ClassHandle),
    Morph(MorphHandle),
    Async(AsyncResult),
    Exception(Arc<ValueError>),
    Gc(GcCell),
    GcRef(GcWeak),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::Bool(v) => write!(f, "Bool({})", v),
            Payload::I8(v) => write!(f, "I8({})", v),
            Payload::I16(v) => write!(f, "I16({})", v),
            Payload::I32(v) => write!(f, "I32({})", v),
            Payload::I64(v) => write!(f, "I64({})", v),
            Payload::Ui8(v) => write!(f, "Ui8({})", v),
            Payload::Ui16(v) => write!(f, "Ui16({})", v),
            Payload::Ui32(v) => write!(f, "Ui32({})", v),
            Payload::Ui64(v) => write!(f, "Ui64({})", v),
            Payload::Flo(v) => write!(f, "Flo({})", v),
            Payload::Doub(v) => write!(f, "Doub({})", v),
            Payload::UndefinedPtr(v) => write!(f, "UndefinedPtr(0x{:x})", v),
            Payload::TimePoint(v) => write!(f, "TimePoint({})", v),
            Payload::TypeIdentifier(v) => write!(f, "TypeIdentifier({})", v),
            Payload::RawArray(a) => write!(f, "RawArray({}, len={})", a.element_type(), a.len()),
            Payload::Array(v) => write!(f, "Array(len={})", v.len()),
            Payload::FixedArray(v) => write!(f, "FixedArray(len={})", v.len()),
            Payload::StackArray(v) => write!(f, "StackArray(len={})", v.len()),
            Payload::String(s) => write!(f, "String({:?})", s),
            Payload::Map(m) => write!(f, "Map(len={})", m.len()),
            Payload::Set(s) => write!(f, "Set(len={})", s.len()),
            Payload::Function(func) => write!(f, "Function({})", func.name()),
            Payload::Struct(_) => write!(f, "Struct(..)"),
            Payload::Proxy(_) => write!(f, "Proxy(..)"),
            Payload::Class(_) => write!(f, "Class(..)"),
            Payload::Morph(_) => write!(f, "Morph(..)"),
            Payload::Async(res) => write!(f, "Async(ready={})", res.is_ready()),
            Payload::Exception(e) => write!(f, "Exception({})", e),
            Payload::Gc(cell) => write!(f, "Gc(strong={})", cell.strong_count()),
            Payload::GcRef(weak) => write!(f, "GcRef(deleted={})", weak.is_deleted()),
        }
    }
}

// ============================================================================
// ValueItem
// ============================================================================

/// 动态值
pub struct ValueItem {
    pub(crate) val: Payload,
    pub(crate) meta: ValueMeta,
}

impl ValueItem {
    // ========== 构造函数 ==========

    /// 从负载和元数据组装（登记独占分配）
    pub(crate) fn from_parts(val: Payload, meta: ValueMeta) -> Self {
        if alloc::counts_as_owned(&val, meta) {
            alloc::note_alloc();
        }
        Self { val, meta }
    }

    /// 拆出负载和元数据（不释放）
    pub(crate) fn into_parts(mut self) -> (Payload, ValueMeta) {
        let val = std::mem::replace(&mut self.val, Payload::Empty);
        (val, self.meta)
    }

    /// 创建 noting 值
    #[inline]
    pub fn null() -> Self {
        Self { val: Payload::Empty, meta: ValueMeta::of(VType::Noting) }
    }

    /// 按元数据分配默认负载
    pub fn alloc(meta: ValueMeta) -> ValueResult<Self> {
        let mut item = Self::null();
        alloc::universal_alloc(&mut item, meta)?;
        Ok(item)
    }

    /// 创建原始数组值（接管所有权，不复制）
    pub fn raw_array(arr: RawArray) -> Self {
        let meta = ValueMeta::with_len(arr.vtype(), false, true, len_u32(arr.len()));
        Self::from_parts(Payload::RawArray(arr), meta)
    }

    /// 创建动态数组
    pub fn array(items: Vec<ValueItem>) -> Self {
        Self::from_parts(Payload::Array(items), ValueMeta::of(VType::Uarr))
    }

    /// 创建定长数组
    pub fn fixed_array(items: Vec<ValueItem>) -> Self {
        let meta = ValueMeta::with_len(VType::Faarr, false, true, len_u32(items.len()));
        Self::from_parts(Payload::FixedArray(items.into_boxed_slice()), meta)
    }

    /// 创建栈数组
    pub fn stack_array(items: Vec<ValueItem>) -> Self {
        let meta = ValueMeta::with_len(VType::Saarr, false, true, len_u32(items.len()));
        Self::from_parts(Payload::StackArray(items), meta)
    }

    /// 创建未定义指针
    pub fn undefined_ptr(ptr: usize) -> Self {
        Self::from_parts(Payload::UndefinedPtr(ptr), ValueMeta::of(VType::UndefinedPtr))
    }

    /// 创建时间点（纳秒）
    pub fn time_point(nanos: i64) -> Self {
        Self::from_parts(Payload::TimePoint(nanos), ValueMeta::of(VType::TimePoint))
    }

    /// 当前时间
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// 创建类型标识
    pub fn type_identifier(vtype: VType) -> Self {
        Self::from_parts(Payload::TypeIdentifier(vtype), ValueMeta::of(VType::TypeIdentifier))
    }

    /// 创建函数值
    pub fn function(func: Arc<FuncEnvironment>) -> Self {
        Self::from_parts(Payload::Function(func), ValueMeta::of(VType::Function))
    }

    /// 创建异常值
    pub fn exception(err: ValueError) -> Self {
        Self::from_parts(Payload::Exception(Arc::new(err)), ValueMeta::of(VType::ExceptValue))
    }

    /// 创建异步结果
    pub fn async_result(res: AsyncResult) -> Self {
        Self::from_parts(Payload::Async(res), ValueMeta::of(VType::AsyncRes))
    }

    /// 接管结构体（析构时销毁结构体）
    pub fn structure(handle: StructHandle) -> Self {
        Self::from_parts(Payload::Struct(handle), ValueMeta::of(VType::Struct))
    }

    /// 结构体引用（不拥有）
    pub fn struct_ref(handle: &StructHandle) -> Self {
        let mut meta = ValueMeta::of(VType::Struct);
        meta.set_as_ref(true);
        Self::from_parts(Payload::Struct(Arc::clone(handle)), meta)
    }

    /// 接管类对象
    pub fn class(value: ClassValue) -> Self {
        Self::from_parts(Payload::Class(Arc::new(Mutex::new(value))), ValueMeta::of(VType::Class))
    }

    /// 接管可变形对象
    pub fn morph(value: MorphValue) -> Self {
        Self::from_parts(Payload::Morph(Arc::new(Mutex::new(value))), ValueMeta::of(VType::Morph))
    }

    /// 接管代理对象
    pub fn proxy(value: ProxyClass) -> Self {
        Self::from_parts(Payload::Proxy(Arc::new(Mutex::new(value))), ValueMeta::of(VType::Proxy))
    }

    /// 创建 GC 包装的值
    pub fn gc(value: ValueItem) -> ValueResult<Self> {
        let mut value = value;
        value.make_gc()?;
        Ok(value)
    }

    /// 设置可编辑标记（构造链式调用）
    pub fn with_allow_edit(mut self, allow_edit: bool) -> Self {
        self.meta.set_allow_edit(allow_edit);
        self
    }

    // ========== 元数据 ==========

    /// 当前元数据（GC 层的标签取自单元内部）
    pub fn meta(&self) -> ValueMeta {
        let mut meta = self.meta;
        match &self.val {
            Payload::Gc(cell) => meta.set_vtype(cell.vtype()),
            Payload::GcRef(weak) => {
                let vtype = weak.upgrade().map(|cell| cell.vtype()).unwrap_or(VType::Noting);
                meta.set_vtype(vtype);
            }
            _ => {}
        }
        meta
    }

    #[inline]
    pub fn vtype(&self) -> VType {
        self.meta().vtype()
    }

    /// 原始负载（不穿透 GC / 引用 / 异步层）
    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.val
    }

    #[inline]
    pub fn is_noting(&self) -> bool {
        self.vtype() == VType::Noting
    }

    #[inline]
    pub fn is_gc(&self) -> bool {
        self.meta.use_gc()
    }

    #[inline]
    pub fn is_ref(&self) -> bool {
        self.meta.as_ref()
    }

    #[inline]
    pub fn allow_edit(&self) -> bool {
        self.meta.allow_edit()
    }

    #[inline]
    pub fn set_allow_edit(&mut self, allow_edit: bool) {
        self.meta.set_allow_edit(allow_edit);
    }

    /// 要求值可编辑
    #[inline]
    pub(crate) fn check_editable(&self) -> ValueResult<()> {
        if self.meta.is_encoded() && !self.meta.allow_edit() {
            Err(ValueError::UnmodifiableValue)
        } else {
            Ok(())
        }
    }

    // ========== 负载访问 ==========

    /// 穿透 GC、引用与异步层只读访问实际负载
    ///
    /// 异步结果会阻塞等待，但不会改写自身标签
    pub fn view<R>(&self, f: impl FnOnce(&Payload, ValueMeta) -> ValueResult<R>) -> ValueResult<R> {
        match &self.val {
            Payload::Gc(cell) => cell.read(|inner| inner.view(f)),
            Payload::GcRef(weak) => {
                let cell = weak.upgrade().ok_or_else(dangling_reference)?;
                cell.read(|inner| inner.view(f))
            }
            Payload::Async(res) => res.with_result(|inner| inner.view(f)),
            other => f(other, self.meta),
        }
    }

    /// 穿透 GC 与引用层可写访问实际负载
    ///
    /// 异步结果先就地解析
    pub fn view_mut<R>(
        &mut self,
        f: impl FnOnce(&mut Payload, &mut ValueMeta) -> ValueResult<R>,
    ) -> ValueResult<R> {
        self.get_async_result()?;
        let shared = match &self.val {
            Payload::Gc(cell) => Some(cell.clone()),
            Payload::GcRef(weak) => Some(weak.upgrade().ok_or_else(dangling_reference)?),
            _ => None,
        };
        if let Some(cell) = shared {
            return cell.write(|inner| inner.view_mut(f));
        }
        f(&mut self.val, &mut self.meta)
    }

    // ========== 异步解析 ==========

    /// 就地解析异步结果
    ///
    /// 标签为 async_res 时循环等待任务结果并以结果替换自身；
    /// 解析后再次调用不做任何事。任务失败时自身变为异常值并返回错误
    pub fn get_async_result(&mut self) -> ValueResult<()> {
        while let Payload::Async(res) = &self.val {
            let res = res.clone();
            tracing::trace!(ready = res.is_ready(), "resolving async result");
            match res.with_result(|value| value.try_clone()) {
                Ok(value) => {
                    *self = value;
                }
                Err(err) => {
                    *self = ValueItem::exception(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    // ========== 拷贝 / 移动 / 赋值 ==========

    /// 深拷贝（引用拷贝为别名，GC 值共享单元）
    pub fn try_clone(&self) -> ValueResult<ValueItem> {
        let (val, meta) = alloc::copy_value(&self.val, self.meta)?;
        Ok(Self::from_parts(val, meta))
    }

    /// 移出值，自身变为 noting
    ///
    /// 非引用的栈数组会被物化为定长数组
    pub fn take(&mut self) -> ValueItem {
        let meta = self.meta;
        let val = std::mem::replace(&mut self.val, Payload::Empty);
        let allow_edit = !meta.is_encoded() || meta.allow_edit();
        self.meta = ValueMeta::new(VType::Noting, false, allow_edit);

        match val {
            Payload::StackArray(items) if !meta.as_ref() => {
                let meta = ValueMeta::with_len(VType::Faarr, false, meta.allow_edit(), len_u32(items.len()));
                Self::from_parts(Payload::FixedArray(items.into_boxed_slice()), meta)
            }
            val => Self { val, meta },
        }
    }

    /// 拷贝赋值：先完成拷贝，再释放旧负载并装入新值
    pub fn assign(&mut self, other: &ValueItem) -> ValueResult<()> {
        self.check_editable()?;
        let copy = other.try_clone()?;
        self.install(copy)
    }

    /// 移动赋值
    pub fn assign_move(&mut self, other: &mut ValueItem) -> ValueResult<()> {
        self.check_editable()?;
        let moved = other.take();
        self.install(moved)
    }

    fn install(&mut self, value: ValueItem) -> ValueResult<()> {
        universal_remove(self)?;
        let (val, meta) = value.into_parts();
        self.val = val;
        self.meta = meta;
        Ok(())
    }

    // ========== GC / 引用转换 ==========

    /// 转为 GC 共享所有权
    pub fn make_gc(&mut self) -> ValueResult<()> {
        if self.meta.as_ref() {
            return Err(ValueError::InvalidOperation(
                "a reference cannot be moved into a gc cell".to_string(),
            ));
        }
        if matches!(self.val, Payload::Gc(_)) {
            return Ok(());
        }
        self.get_async_result()?;
        let allow_edit = !self.meta.is_encoded() || self.meta.allow_edit();
        let mut inner = self.take();
        inner.meta.set_use_gc(false);
        let vtype = inner.vtype();
        self.val = Payload::Gc(GcCell::new(inner));
        self.meta = ValueMeta::new(vtype, true, allow_edit);
        Ok(())
    }

    /// 脱离 GC：独占时移出负载，否则深拷贝
    pub fn ungc(&mut self) -> ValueResult<()> {
        let cell = match &self.val {
            Payload::Gc(cell) => cell.clone(),
            Payload::GcRef(weak) => weak.upgrade().ok_or_else(dangling_reference)?,
            _ => return Ok(()),
        };
        let allow_edit = self.meta.allow_edit();
        // 释放自身持有的那一份
        universal_remove(self)?;
        let inner = match cell.try_unwrap() {
            Ok(inner) => inner,
            Err(cell) => cell.read(|inner| inner.try_clone())?,
        };
        let (val, mut meta) = inner.into_parts();
        meta.set_use_gc(false);
        meta.set_as_ref(false);
        meta.set_allow_edit(allow_edit);
        self.val = val;
        self.meta = meta;
        Ok(())
    }

    /// 创建不拥有负载的引用
    ///
    /// 只有 GC 值和对象句柄（结构体、类、函数等）可以被引用
    pub fn reference(&self) -> ValueResult<ValueItem> {
        let val = match &self.val {
            Payload::Gc(cell) => Payload::GcRef(cell.downgrade()),
            Payload::GcRef(weak) => Payload::GcRef(weak.clone()),
            Payload::Struct(h) => Payload::Struct(Arc::clone(h)),
            Payload::Class(h) => Payload::Class(Arc::clone(h)),
            Payload::Morph(h) => Payload::Morph(Arc::clone(h)),
            Payload::Proxy(h) => Payload::Proxy(Arc::clone(h)),
            Payload::Function(f) => Payload::Function(Arc::clone(f)),
            _ => {
                return Err(ValueError::InvalidOperation(format!(
                    "cannot reference a {} value that is not gc-backed",
                    self.vtype()
                )))
            }
        };
        let mut meta = self.meta();
        meta.set_as_ref(true);
        Ok(Self::from_parts(val, meta))
    }

    // ========== 下标与切片 ==========

    /// 元素个数（字符串按字符计）
    pub fn len(&self) -> ValueResult<usize> {
        self.view(|val, meta| match val {
            Payload::RawArray(a) => Ok(a.len()),
            Payload::Array(v) | Payload::StackArray(v) => Ok(v.len()),
            Payload::FixedArray(v) => Ok(v.len()),
            Payload::String(s) => Ok(s.chars().count()),
            Payload::Map(m) => Ok(m.len()),
            Payload::Set(s) => Ok(s.len()),
            _ => Err(ValueError::InvalidType(format!("{} has no length", meta.vtype()))),
        })
    }

    /// 是否为空容器
    pub fn is_empty(&self) -> ValueResult<bool> {
        Ok(self.len()? == 0)
    }

    /// 读取元素副本
    pub fn get(&self, index: usize) -> ValueResult<ValueItem> {
        self.view(|val, meta| {
            let out_of_range = |len: usize| ValueError::OutOfRange(format!("index {} of {}", index, len));
            match val {
                Payload::RawArray(a) => a.get(index).ok_or_else(|| out_of_range(a.len())),
                Payload::Array(v) | Payload::StackArray(v) => {
                    v.get(index).ok_or_else(|| out_of_range(v.len()))?.try_clone()
                }
                Payload::FixedArray(v) => v.get(index).ok_or_else(|| out_of_range(v.len()))?.try_clone(),
                Payload::String(s) => s
                    .chars()
                    .nth(index)
                    .map(|c| ValueItem::from(c.to_string()))
                    .ok_or_else(|| out_of_range(s.chars().count())),
                _ => Err(ValueError::InvalidType(format!("{} is not indexable", meta.vtype()))),
            }
        })
    }

    /// 写入元素
    pub fn set(&mut self, index: usize, value: &ValueItem) -> ValueResult<()> {
        self.check_editable()?;
        let value = value.try_clone()?;
        self.view_mut(move |val, meta| {
            if !meta.allow_edit() {
                return Err(ValueError::UnmodifiableValue);
            }
            let out_of_range = |len: usize| ValueError::OutOfRange(format!("index {} of {}", index, len));
            match val {
                Payload::RawArray(a) => a.set(index, &value),
                Payload::Array(v) | Payload::StackArray(v) => {
                    let len = v.len();
                    let slot = v.get_mut(index).ok_or_else(|| out_of_range(len))?;
                    *slot = value;
                    Ok(())
                }
                Payload::FixedArray(v) => {
                    let len = v.len();
                    let slot = v.get_mut(index).ok_or_else(|| out_of_range(len))?;
                    *slot = value;
                    Ok(())
                }
                _ => Err(ValueError::InvalidType(format!("{} is not indexable", meta.vtype()))),
            }
        })
    }

    /// 追加到动态数组末尾
    pub fn push(&mut self, value: ValueItem) -> ValueResult<()> {
        self.check_editable()?;
        self.view_mut(move |val, meta| match val {
            Payload::Array(v) => {
                v.push(value);
                Ok(())
            }
            _ => Err(ValueError::InvalidType(format!("cannot push into {}", meta.vtype()))),
        })
    }

    /// 复制 `[start, end)` 范围为新值
    ///
    /// 动态数组切片仍是动态数组，定长/栈数组切片为定长数组
    pub fn slice(&self, start: usize, end: usize) -> ValueResult<ValueItem> {
        self.view(|val, meta| {
            let check = |len: usize| {
                if start > end || end > len {
                    Err(ValueError::OutOfRange(format!("slice {}..{} of {}", start, end, len)))
                } else {
                    Ok(())
                }
            };
            match val {
                Payload::RawArray(a) => {
                    check(a.len())?;
                    Ok(ValueItem::raw_array(a.slice(start, end)))
                }
                Payload::Array(v) => {
                    check(v.len())?;
                    Ok(ValueItem::array(copy_items(&v[start..end])?))
                }
                Payload::StackArray(v) => {
                    check(v.len())?;
                    Ok(ValueItem::fixed_array(copy_items(&v[start..end])?))
                }
                Payload::FixedArray(v) => {
                    check(v.len())?;
                    Ok(ValueItem::fixed_array(copy_items(&v[start..end])?))
                }
                Payload::String(s) => {
                    check(s.chars().count())?;
                    Ok(ValueItem::from(s.chars().skip(start).take(end - start).collect::<String>()))
                }
                _ => Err(ValueError::InvalidType(format!("{} cannot be sliced", meta.vtype()))),
            }
        })
    }

    /// 逐元素拷贝数组内容（任意数组标签）
    pub fn to_items(&self) -> ValueResult<Vec<ValueItem>> {
        self.view(|val, meta| match val {
            Payload::RawArray(a) => Ok(a.items()),
            Payload::Array(v) | Payload::StackArray(v) => copy_items(v),
            Payload::FixedArray(v) => copy_items(v),
            _ => Err(ValueError::InvalidType(format!("{} is not an array", meta.vtype()))),
        })
    }

    // ========== 对象访问 ==========

    /// 取出结构体句柄
    pub fn as_struct(&self) -> ValueResult<StructHandle> {
        self.view(|val, meta| match val {
            Payload::Struct(h) => Ok(Arc::clone(h)),
            _ => Err(ValueError::InvalidType(format!("expected struct, got {}", meta.vtype()))),
        })
    }

    /// 取出函数
    pub fn as_function(&self) -> ValueResult<Arc<FuncEnvironment>> {
        self.view(|val, meta| match val {
            Payload::Function(f) => Ok(Arc::clone(f)),
            _ => Err(ValueError::InvalidType(format!("expected function, got {}", meta.vtype()))),
        })
    }
}

/// 逐个拷贝元素
pub(crate) fn copy_items(items: &[ValueItem]) -> ValueResult<Vec<ValueItem>> {
    items.iter().map(ValueItem::try_clone).collect()
}

/// 对象句柄的引用（非对象负载返回 None）
pub(crate) fn object_ref(val: &Payload) -> Option<ValueItem> {
    let (val, vtype) = match val {
        Payload::Struct(h) => (Payload::Struct(Arc::clone(h)), VType::Struct),
        Payload::Class(h) => (Payload::Class(Arc::clone(h)), VType::Class),
        Payload::Morph(h) => (Payload::Morph(Arc::clone(h)), VType::Morph),
        Payload::Proxy(h) => (Payload::Proxy(Arc::clone(h)), VType::Proxy),
        _ => return None,
    };
    let mut meta = ValueMeta::of(vtype);
    meta.set_as_ref(true);
    Some(ValueItem { val, meta })
}

#[inline]
pub(crate) fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn dangling_reference() -> ValueError {
    ValueError::InvalidOperation("reference to a released value".to_string())
}

impl Drop for ValueItem {
    fn drop(&mut self) {
        if let Err(err) = universal_remove(self) {
            tracing::warn!(error = %err, "failed to release value");
        }
    }
}

impl Default for ValueItem {
    fn default() -> Self {
        ValueItem::null()
    }
}

impl fmt::Debug for ValueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueItem")
            .field("meta", &self.meta)
            .field("val", &self.val)
            .finish()
    }
}

impl fmt::Display for ValueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_script_string() {
            Ok(s) => f.write_str(&s),
            Err(err) => write!(f, "<{}>", err),
        }
    }
}

// ============================================================================
// From 构造
// ============================================================================

macro_rules! impl_from_scalar {
    ($($t:ty => $variant:ident, $vtype:ident;)*) => {
        $(
            impl From<$t> for ValueItem {
                #[inline]
                fn from(v: $t) -> Self {
                    ValueItem::from_parts(Payload::$variant(v), ValueMeta::of(VType::$vtype))
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool, Boolean;
    i8 => I8, I8;
    i16 => I16, I16;
    i32 => I32, I32;
    i64 => I64, I64;
    u8 => Ui8, Ui8;
    u16 => Ui16, Ui16;
    u32 => Ui32, Ui32;
    u64 => Ui64, Ui64;
    f32 => Flo, Flo;
    f64 => Doub, Doub;
    String => String, String;
    VType => TypeIdentifier, TypeIdentifier;
}

impl From<usize> for ValueItem {
    fn from(v: usize) -> Self {
        ValueItem::from(v as u64)
    }
}

impl From<&str> for ValueItem {
    fn from(s: &str) -> Self {
        ValueItem::from(s.to_string())
    }
}

impl From<Vec<ValueItem>> for ValueItem {
    fn from(items: Vec<ValueItem>) -> Self {
        ValueItem::array(items)
    }
}

impl From<HashMap<ValueItem, ValueItem>> for ValueItem {
    fn from(map: HashMap<ValueItem, ValueItem>) -> Self {
        ValueItem::from_parts(Payload::Map(map), ValueMeta::of(VType::Map))
    }
}

impl From<HashSet<ValueItem>> for ValueItem {
    fn from(set: HashSet<ValueItem>) -> Self {
        ValueItem::from_parts(Payload::Set(set), ValueMeta::of(VType::Set))
    }
}

impl From<Arc<FuncEnvironment>> for ValueItem {
    fn from(func: Arc<FuncEnvironment>) -> Self {
        ValueItem::function(func)
    }
}

impl From<ValueError> for ValueItem {
    fn from(err: ValueError) -> Self {
        ValueItem::exception(err)
    }
}

impl From<SystemTime> for ValueItem {
    fn from(time: SystemTime) -> Self {
        let nanos = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
        };
        ValueItem::time_point(nanos)
    }
}

impl From<RawArray> for ValueItem {
    fn from(arr: RawArray) -> Self {
        ValueItem::raw_array(arr)
    }
}

macro_rules! impl_from_raw {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<Box<[$t]>> for ValueItem {
                /// 接管数组，不复制
                fn from(arr: Box<[$t]>) -> Self {
                    ValueItem::raw_array(RawArray::from(arr))
                }
            }

            impl From<&[$t]> for ValueItem {
                /// 复制数组内容
                fn from(arr: &[$t]) -> Self {
                    ValueItem::raw_array(RawArray::from(arr.to_vec().into_boxed_slice()))
                }
            }
        )*
    };
}

impl_from_raw!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::alloc::alloc_stats;

    #[test]
    fn test_scalar_construction() {
        assert_eq!(ValueItem::from(5i32).vtype(), VType::I32);
        assert_eq!(ValueItem::from(5u8).vtype(), VType::Ui8);
        assert_eq!(ValueItem::from(1.5f64).vtype(), VType::Doub);
        assert_eq!(ValueItem::from("abc").vtype(), VType::String);
        assert_eq!(ValueItem::null().vtype(), VType::Noting);
        assert_eq!(ValueItem::undefined_ptr(0x10).vtype(), VType::UndefinedPtr);

        let raw = ValueItem::from(&[1u16, 2, 3][..]);
        assert_eq!(raw.vtype(), VType::RawArrUi16);
        assert_eq!(raw.meta().val_len(), 3);
    }

    #[test]
    fn test_copy_is_distinct() {
        let before = alloc_stats();
        {
            let original = ValueItem::from("hello");
            let mut copy = original.try_clone().unwrap();
            assert_eq!(copy, original);

            copy.set_allow_edit(true);
            crate::vm::ops::dyn_sum(&mut copy, &ValueItem::from(" world")).unwrap();
            assert_eq!(original.to_script_string().unwrap(), "hello");
            assert_eq!(copy.to_script_string().unwrap(), "hello world");
        }
        let after = alloc_stats();
        assert_eq!(after.allocations - before.allocations, after.frees - before.frees);
    }

    #[test]
    fn test_take_leaves_source_empty() {
        let mut a = ValueItem::array(vec![ValueItem::from(1i32)]);
        let b = a.take();
        assert!(a.is_noting());
        assert!(matches!(a.payload(), Payload::Empty));
        assert_eq!(b.len().unwrap(), 1);
    }

    #[test]
    fn test_stack_array_materializes_on_move() {
        let mut stack = ValueItem::stack_array(vec![ValueItem::from(1i32), ValueItem::from(2i32)]);
        let moved = stack.take();
        assert_eq!(moved.vtype(), VType::Faarr);
        assert_eq!(moved.meta().val_len(), 2);
        assert_eq!(moved.get(1).unwrap(), ValueItem::from(2i32));
        assert!(stack.is_noting());
    }

    #[test]
    fn test_assign_releases_previous() {
        let before = alloc_stats();
        {
            let mut target = ValueItem::from("old");
            let source = ValueItem::array(vec![ValueItem::from(1i32)]);
            target.assign(&source).unwrap();
            assert_eq!(target.vtype(), VType::Uarr);

            let mut readonly = ValueItem::from(1i32).with_allow_edit(false);
            assert_eq!(readonly.assign(&source), Err(ValueError::UnmodifiableValue));
            assert_eq!(readonly, ValueItem::from(1i32));
        }
        let after = alloc_stats();
        assert_eq!(after.allocations - before.allocations, after.frees - before.frees);
    }

    #[test]
    fn test_gc_sharing_and_references() {
        let shared = ValueItem::gc(ValueItem::from(10i32)).unwrap();
        assert!(shared.is_gc());
        assert_eq!(shared.vtype(), VType::I32);

        let mut alias = shared.reference().unwrap();
        assert!(alias.is_ref());
        crate::vm::ops::dyn_sum(&mut alias, &ValueItem::from(5i32)).unwrap();
        assert_eq!(shared, ValueItem::from(15i32));

        drop(shared);
        assert!(alias.get(0).is_err());
        assert_eq!(alias.vtype(), VType::Noting);
    }

    #[test]
    fn test_ungc_unique_and_shared() {
        let mut unique = ValueItem::gc(ValueItem::from("x")).unwrap();
        unique.ungc().unwrap();
        assert!(!unique.is_gc());
        assert_eq!(unique.vtype(), VType::String);

        let mut first = ValueItem::gc(ValueItem::array(vec![])).unwrap();
        let second = first.try_clone().unwrap();
        first.ungc().unwrap();
        first.push(ValueItem::from(1i32)).unwrap();
        assert_eq!(first.len().unwrap(), 1);
        assert_eq!(second.len().unwrap(), 0);
    }

    #[test]
    fn test_reference_requires_shared_storage() {
        let plain = ValueItem::from(3i32);
        assert!(matches!(plain.reference(), Err(ValueError::InvalidOperation(_))));
    }

    #[test]
    fn test_slice_and_index() {
        let arr = ValueItem::array((0..5).map(ValueItem::from).collect::<Vec<_>>());
        let part = arr.slice(1, 3).unwrap();
        assert_eq!(part.vtype(), VType::Uarr);
        assert_eq!(part.len().unwrap(), 2);
        assert_eq!(part.get(0).unwrap(), ValueItem::from(1i32));
        assert!(matches!(arr.slice(3, 9), Err(ValueError::OutOfRange(_))));

        let text = ValueItem::from("héllo");
        assert_eq!(text.slice(1, 3).unwrap().to_script_string().unwrap(), "él");

        let mut raw = ValueItem::from(&[1i64, 2, 3][..]);
        raw.set(0, &ValueItem::from(9i32)).unwrap();
        assert_eq!(raw.get(0).unwrap(), ValueItem::from(9i64));
        assert!(matches!(raw.get(3), Err(ValueError::OutOfRange(_))));
    }
}
