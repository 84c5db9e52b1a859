//! 结构体
//!
//! 结构体由字段描述（`Item`）、标量数据块和对象槽位组成：
//! - 标量字段（数值、布尔、时间点等）按小端存放在数据块中，整数和布尔字段可以按位打包
//! - 其他字段（字符串、数组、对象……）各占一个 `ValueItem` 槽位
//!
//! 字段布局在构造时确定，之后不再改变。
//!
//! 生命周期：Constructing → FullyConstructed → Destructing → Freed。
//! 只有到达 FullyConstructed 的结构体才会调用虚表的析构函数。

use std::sync::Arc;

use parking_lot::Mutex;

use super::alloc::universal_remove;
use super::compare::compare_arrays;
use super::meta::{VType, ValueMeta};
use super::value::{copy_items, StructHandle, ValueItem};
use super::vtable::{AttachADynamicVirtualTable, ClassAccess, VTableMode, VTableRef};
use crate::error::{ValueError, ValueResult};
use crate::runtime::function::FuncEnvironment;

// ============================================================================
// 字段描述
// ============================================================================

/// 字段描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub name: String,
    pub meta: ValueMeta,
    /// 数据块中的字节偏移（对象字段为 0）
    pub offset: usize,
    /// 位字段在首字节内的起始位
    pub bit_offset: u8,
    /// 位字段宽度，0 表示整字节存放
    pub bit_used: u8,
}

impl Item {
    pub fn new(name: impl Into<String>, meta: ValueMeta) -> Self {
        Self {
            name: name.into(),
            meta,
            offset: 0,
            bit_offset: 0,
            bit_used: 0,
        }
    }

    /// 位字段
    pub fn bits(name: impl Into<String>, meta: ValueMeta, bits: u8) -> Self {
        Self {
            bit_used: bits,
            ..Self::new(name, meta)
        }
    }

    /// 是否存放在数据块中
    #[inline]
    pub fn is_inline(&self) -> bool {
        self.meta.vtype().scalar_size().is_some()
    }
}

/// 结构体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructState {
    Constructing,
    FullyConstructed,
    Destructing,
    Freed,
}

// ============================================================================
// 结构体
// ============================================================================

pub struct Structure {
    items: Vec<Item>,
    data: Vec<u8>,
    objects: Vec<ValueItem>,
    vtable: VTableRef,
    state: StructState,
}

impl Structure {
    /// 计算字段布局，返回数据块大小
    ///
    /// 位字段从当前位置连续打包；整字节字段从下一个字节边界开始
    pub fn layout(items: &mut [Item]) -> ValueResult<usize> {
        let mut bit_pos = 0usize;
        for item in items.iter_mut() {
            let vtype = item.meta.vtype();
            let Some(size) = vtype.scalar_size() else {
                if item.bit_used != 0 {
                    return Err(ValueError::InvalidArguments(format!(
                        "field {} of type {} cannot be a bit field",
                        item.name, vtype
                    )));
                }
                item.offset = 0;
                item.bit_offset = 0;
                continue;
            };

            if item.bit_used > 0 {
                let packable = vtype.is_integer() || vtype == VType::Boolean;
                if !packable || item.bit_used as usize > size * 8 {
                    return Err(ValueError::InvalidArguments(format!(
                        "field {} cannot use {} bits as {}",
                        item.name, item.bit_used, vtype
                    )));
                }
                item.offset = bit_pos / 8;
                item.bit_offset = (bit_pos % 8) as u8;
                bit_pos += item.bit_used as usize;
            } else {
                let byte_pos = bit_pos.div_ceil(8);
                item.offset = byte_pos;
                item.bit_offset = 0;
                bit_pos = (byte_pos + size) * 8;
            }
        }
        Ok(bit_pos.div_ceil(8))
    }

    /// 构造没有虚表的结构体
    pub fn construct(items: Vec<Item>) -> ValueResult<StructHandle> {
        Self::construct_with_vtable(items, VTableRef::Disabled)
    }

    /// 构造结构体，字段置零，处于 Constructing 状态
    pub fn construct_with_vtable(mut items: Vec<Item>, vtable: VTableRef) -> ValueResult<StructHandle> {
        let size = Self::layout(&mut items)?;
        let mut objects = Vec::with_capacity(items.len());
        for item in &items {
            objects.push(default_field(item)?);
        }
        Ok(Arc::new(Mutex::new(Structure {
            items,
            data: vec![0; size],
            objects,
            vtable,
            state: StructState::Constructing,
        })))
    }

    /// 构造完成（之后销毁时会调用析构函数）
    pub fn set_fully_constructed(&mut self) {
        if self.state == StructState::Constructing {
            self.state = StructState::FullyConstructed;
        }
    }

    // ========== 查询 ==========

    pub fn state(&self) -> StructState {
        self.state
    }

    pub fn struct_size(&self) -> usize {
        self.data.len()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn vtable_mode(&self) -> VTableMode {
        self.vtable.mode()
    }

    pub fn vtable(&self) -> &VTableRef {
        &self.vtable
    }

    /// 可修改的动态虚表
    pub fn vtable_mut(&mut self) -> ValueResult<&mut AttachADynamicVirtualTable> {
        self.vtable.dynamic_mut()
    }

    /// 类型名（虚表名，没有虚表时为 "struct"）
    pub fn name(&self) -> String {
        self.vtable.name().unwrap_or("struct").to_string()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|i| i.name == name)
    }

    pub fn get_method(&self, name: &str, access: ClassAccess) -> Option<Arc<FuncEnvironment>> {
        self.vtable.table().and_then(|t| t.get_method(name, access))
    }

    fn check_alive(&self) -> ValueResult<()> {
        if self.state == StructState::Freed {
            Err(ValueError::InvalidOperation("structure already freed".to_string()))
        } else {
            Ok(())
        }
    }

    // ========== 字段访问 ==========

    /// 读取字段副本
    pub fn get_field(&self, index: usize) -> ValueResult<ValueItem> {
        self.check_alive()?;
        let item = self.item(index)?;
        if item.is_inline() {
            let raw = if item.bit_used > 0 {
                read_bits(&self.data, item.offset, item.bit_offset, item.bit_used)
            } else {
                read_bytes(&self.data, item.offset, item.meta.vtype().scalar_size().unwrap_or(0))
            };
            let width = if item.bit_used > 0 { item.bit_used as u32 } else { 64 };
            Ok(scalar_from_raw(item.meta.vtype(), raw, width).with_allow_edit(item.meta.allow_edit()))
        } else {
            self.objects[index].try_clone()
        }
    }

    pub fn get_field_by_name(&self, name: &str) -> ValueResult<ValueItem> {
        let index = self.named(name)?;
        self.get_field(index)
    }

    /// 写入字段，值按字段声明的类型转换
    ///
    /// 不可编辑的字段只能在构造阶段写入
    pub fn set_field(&mut self, index: usize, value: &ValueItem) -> ValueResult<()> {
        self.check_alive()?;
        let item = self.item(index)?.clone();
        if !item.meta.allow_edit() && self.state != StructState::Constructing {
            return Err(ValueError::UnmodifiableValue);
        }
        let vtype = item.meta.vtype();
        if item.is_inline() {
            let raw = raw_from_value(vtype, value)?;
            if item.bit_used > 0 {
                write_bits(&mut self.data, item.offset, item.bit_offset, item.bit_used, raw);
            } else {
                write_bytes(&mut self.data, item.offset, vtype.scalar_size().unwrap_or(0), raw);
            }
            return Ok(());
        }

        let copy = value.try_clone()?;
        let stored = if vtype == VType::Noting || copy.vtype() == vtype {
            copy
        } else {
            copy.convert_to(vtype)?
        };
        self.objects[index] = stored;
        Ok(())
    }

    pub fn set_field_by_name(&mut self, name: &str, value: &ValueItem) -> ValueResult<()> {
        let index = self.named(name)?;
        self.set_field(index, value)
    }

    /// 按名称写入字段，对象字段的类型转换在加锁之前完成
    ///
    /// 转换可能调用值自身的方法（例如 `to_string`），值引用的正是本结构体时不能持锁
    pub fn store_field(handle: &StructHandle, name: &str, value: &ValueItem) -> ValueResult<()> {
        let (index, item) = {
            let s = handle.lock();
            s.check_alive()?;
            let index = s.named(name)?;
            (index, s.item(index)?.clone())
        };
        let vtype = item.meta.vtype();
        if item.is_inline() || vtype == VType::Noting || value.vtype() == vtype {
            return handle.lock().set_field(index, value);
        }
        let converted = value.convert_to(vtype)?;
        handle.lock().set_field(index, &converted)
    }

    fn item(&self, index: usize) -> ValueResult<&Item> {
        self.items
            .get(index)
            .ok_or_else(|| ValueError::OutOfRange(format!("field {} of {}", index, self.items.len())))
    }

    fn named(&self, name: &str) -> ValueResult<usize> {
        self.field_index(name)
            .ok_or_else(|| ValueError::InvalidArguments(format!("{} has no field {}", self.name(), name)))
    }

    // ========== 生命周期 ==========

    /// 销毁结构体
    ///
    /// 已完全构造时先调用虚表析构函数（不持锁），然后按声明顺序释放字段，最后释放虚表。
    ///
    /// 未完成构造的结构体跳过自身的析构函数，但字段照常释放：
    /// 作为字段的嵌套结构体按它自己的状态决定是否调用析构函数
    pub fn destruct(handle: &StructHandle) -> ValueResult<()> {
        let destructor = {
            let mut s = handle.lock();
            if matches!(s.state, StructState::Destructing | StructState::Freed) {
                return Ok(());
            }
            let fully_constructed = s.state == StructState::FullyConstructed;
            s.state = StructState::Destructing;
            if fully_constructed {
                s.vtable.table().and_then(|t| t.slots().destructor.clone())
            } else {
                None
            }
        };

        let result = match destructor {
            Some(func) => func.sync_call(vec![ValueItem::struct_ref(handle)]).map(|_| ()),
            None => Ok(()),
        };

        let (objects, vtable) = {
            let mut s = handle.lock();
            s.state = StructState::Freed;
            (std::mem::take(&mut s.objects), std::mem::take(&mut s.vtable))
        };
        for mut object in objects {
            if let Err(err) = universal_remove(&mut object) {
                tracing::warn!(error = %err, "failed to release structure field");
            }
        }
        drop(vtable);
        result
    }

    /// 创建副本
    ///
    /// 无虚表时按字节复制数据块并深拷贝对象字段；有虚表时调用 copy 槽位
    pub fn copy(handle: &StructHandle) -> ValueResult<StructHandle> {
        let (copy, slot) = {
            let src = handle.lock();
            src.check_alive()?;
            match &src.vtable {
                VTableRef::Disabled => {
                    let copy = Structure {
                        items: src.items.clone(),
                        data: src.data.clone(),
                        objects: copy_items(&src.objects)?,
                        vtable: VTableRef::Disabled,
                        state: src.state,
                    };
                    return Ok(Arc::new(Mutex::new(copy)));
                }
                VTableRef::Foreign(name) => {
                    return Err(ValueError::NotImplemented(format!("copying foreign structure {}", name)))
                }
                vtable => {
                    let slot = vtable.table().and_then(|t| t.slots().copy.clone());
                    let copy = Structure::construct_with_vtable(src.items.clone(), vtable.clone())?;
                    (copy, slot)
                }
            }
        };
        let slot = slot.ok_or_else(|| missing_slot("copy", handle))?;
        slot.sync_call(vec![
            ValueItem::struct_ref(&copy),
            ValueItem::struct_ref(handle),
            ValueItem::from(true),
        ])?;
        copy.lock().set_fully_constructed();
        Ok(copy)
    }

    /// 把 `src` 复制到已存在的 `dst`
    pub fn copy_into(dst: &StructHandle, src: &StructHandle, at_construct: bool) -> ValueResult<()> {
        if Arc::ptr_eq(dst, src) {
            return Ok(());
        }
        match Self::raw_or_slot(dst, src, |t| t.copy.clone(), "copy")? {
            Some(slot) => call_pair(slot, dst, src, at_construct),
            None => {
                let (data, objects) = {
                    let s = src.lock();
                    (s.data.clone(), copy_items(&s.objects)?)
                };
                let mut d = dst.lock();
                d.data = data;
                d.objects = objects;
                Ok(())
            }
        }
    }

    /// 把 `src` 移动到 `dst`，`src` 的对象字段被移走
    pub fn move_into(dst: &StructHandle, src: &StructHandle, at_construct: bool) -> ValueResult<()> {
        if Arc::ptr_eq(dst, src) {
            return Ok(());
        }
        match Self::raw_or_slot(dst, src, |t| t.move_.clone(), "move")? {
            Some(slot) => call_pair(slot, dst, src, at_construct),
            None => {
                let (data, objects) = {
                    let mut s = src.lock();
                    let objects: Vec<ValueItem> = s.objects.iter_mut().map(ValueItem::take).collect();
                    (s.data.clone(), objects)
                };
                let mut d = dst.lock();
                d.data = data;
                d.objects = objects;
                Ok(())
            }
        }
    }

    /// 比较两个结构体，返回 `(相等, 小于)`
    pub fn compare(a: &StructHandle, b: &StructHandle) -> ValueResult<(bool, bool)> {
        if Arc::ptr_eq(a, b) {
            return Ok((true, false));
        }
        match Self::raw_or_slot(a, b, |t| t.compare.clone(), "compare")? {
            Some(slot) => {
                let result = slot
                    .sync_call(vec![ValueItem::struct_ref(a), ValueItem::struct_ref(b)])?
                    .unwrap_or_default();
                let order = result.cast::<i64>()?;
                Ok((order == 0, order < 0))
            }
            None => {
                let (data_a, objects_a) = Self::raw_contents(a)?.unwrap_or_default();
                let (data_b, objects_b) = Self::raw_contents(b)?.unwrap_or_default();
                if data_a != data_b {
                    return Ok((false, data_a < data_b));
                }
                Ok(compare_arrays(&objects_a, &objects_b))
            }
        }
    }

    /// 无虚表结构体的数据块和对象字段副本，有虚表时返回 None
    ///
    /// 比较和哈希都只看这两部分
    pub(crate) fn raw_contents(handle: &StructHandle) -> ValueResult<Option<(Vec<u8>, Vec<ValueItem>)>> {
        let s = handle.lock();
        s.check_alive()?;
        match s.vtable {
            VTableRef::Disabled => Ok(Some((s.data.clone(), copy_items(&s.objects)?))),
            _ => Ok(None),
        }
    }

    /// 检查两个结构体可以互相操作，返回需要调用的槽位（无虚表时为 None）
    fn raw_or_slot(
        a: &StructHandle,
        b: &StructHandle,
        pick: impl Fn(&super::vtable::VTableSlots) -> Option<Arc<FuncEnvironment>>,
        op: &str,
    ) -> ValueResult<Option<Arc<FuncEnvironment>>> {
        let (mode_a, size_a, count_a, slot) = {
            let s = a.lock();
            s.check_alive()?;
            let slot = s.vtable.table().and_then(|t| pick(t.slots()));
            (s.vtable.mode(), s.data.len(), s.items.len(), slot)
        };
        let (mode_b, size_b, count_b) = {
            let s = b.lock();
            s.check_alive()?;
            (s.vtable.mode(), s.data.len(), s.items.len())
        };
        if mode_a != mode_b {
            return Err(ValueError::InvalidArguments(format!(
                "cannot {} structures with vtable modes {:?} and {:?}",
                op, mode_a, mode_b
            )));
        }
        match mode_a {
            VTableMode::Disabled => {
                if size_a != size_b || count_a != count_b {
                    return Err(ValueError::InvalidArguments(format!(
                        "cannot {} structures of different layout",
                        op
                    )));
                }
                Ok(None)
            }
            VTableMode::Foreign => Err(ValueError::NotImplemented(format!("{} of foreign structures", op))),
            _ => slot.map(Some).ok_or_else(|| missing_slot(op, a)),
        }
    }

    // ========== 方法调用 ==========

    /// 调用方法，结构体以引用形式作为第一个参数
    pub fn invoke(
        handle: &StructHandle,
        name: &str,
        access: ClassAccess,
        args: Vec<ValueItem>,
    ) -> ValueResult<Option<ValueItem>> {
        let (method, type_name) = {
            let s = handle.lock();
            s.check_alive()?;
            (s.get_method(name, access), s.name())
        };
        let method = method.ok_or_else(|| {
            ValueError::NotImplemented(format!("{} has no accessible method {}", type_name, name))
        })?;
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(ValueItem::struct_ref(handle));
        call_args.extend(args);
        method.sync_call(call_args)
    }
}

fn missing_slot(op: &str, handle: &StructHandle) -> ValueError {
    ValueError::NotImplemented(format!("{} has no {} slot", handle.lock().name(), op))
}

fn call_pair(
    slot: Arc<FuncEnvironment>,
    dst: &StructHandle,
    src: &StructHandle,
    at_construct: bool,
) -> ValueResult<()> {
    slot.sync_call(vec![
        ValueItem::struct_ref(dst),
        ValueItem::struct_ref(src),
        ValueItem::from(at_construct),
    ])
    .map(|_| ())
}

/// 对象字段的初始值
fn default_field(item: &Item) -> ValueResult<ValueItem> {
    if item.is_inline() {
        return Ok(ValueItem::null());
    }
    match item.meta.vtype() {
        VType::Function | VType::Noting => Ok(ValueItem::null()),
        VType::Saarr => Err(ValueError::InvalidArguments(format!(
            "field {} cannot be a stack array",
            item.name
        ))),
        _ => {
            let mut meta = item.meta;
            meta.set_as_ref(false);
            ValueItem::alloc(meta)
        }
    }
}

// ============================================================================
// 标量编码
// ============================================================================

fn read_bytes(data: &[u8], offset: usize, size: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw[..size].copy_from_slice(&data[offset..offset + size]);
    u64::from_le_bytes(raw)
}

fn write_bytes(data: &mut [u8], offset: usize, size: usize, raw: u64) {
    data[offset..offset + size].copy_from_slice(&raw.to_le_bytes()[..size]);
}

fn read_bits(data: &[u8], offset: usize, bit_offset: u8, bit_used: u8) -> u64 {
    let nbytes = (bit_offset as usize + bit_used as usize).div_ceil(8);
    let mut word = 0u128;
    for i in 0..nbytes {
        word |= (data[offset + i] as u128) << (8 * i);
    }
    let mask = (1u128 << bit_used) - 1;
    ((word >> bit_offset) & mask) as u64
}

fn write_bits(data: &mut [u8], offset: usize, bit_offset: u8, bit_used: u8, raw: u64) {
    let nbytes = (bit_offset as usize + bit_used as usize).div_ceil(8);
    let mut word = 0u128;
    for i in 0..nbytes {
        word |= (data[offset + i] as u128) << (8 * i);
    }
    let mask = ((1u128 << bit_used) - 1) << bit_offset;
    word = (word & !mask) | (((raw as u128) << bit_offset) & mask);
    for i in 0..nbytes {
        data[offset + i] = (word >> (8 * i)) as u8;
    }
}

/// 有符号位字段做符号扩展
fn sign_extend(raw: u64, width: u32) -> i64 {
    let shift = 64 - width.min(64);
    ((raw << shift) as i64) >> shift
}

fn scalar_from_raw(vtype: VType, raw: u64, width: u32) -> ValueItem {
    match vtype {
        VType::Boolean => ValueItem::from(raw != 0),
        VType::I8 => ValueItem::from(sign_extend(raw, width.min(8)) as i8),
        VType::I16 => ValueItem::from(sign_extend(raw, width.min(16)) as i16),
        VType::I32 => ValueItem::from(sign_extend(raw, width.min(32)) as i32),
        VType::I64 => ValueItem::from(sign_extend(raw, width) as i64),
        VType::Ui8 => ValueItem::from(raw as u8),
        VType::Ui16 => ValueItem::from(raw as u16),
        VType::Ui32 => ValueItem::from(raw as u32),
        VType::Ui64 => ValueItem::from(raw),
        VType::Flo => ValueItem::from(f32::from_bits(raw as u32)),
        VType::Doub => ValueItem::from(f64::from_bits(raw)),
        VType::TimePoint => ValueItem::time_point(raw as i64),
        VType::UndefinedPtr => ValueItem::undefined_ptr(raw as usize),
        VType::TypeIdentifier => ValueItem::type_identifier(VType::from_u8(raw as u8).unwrap_or(VType::Noting)),
        _ => ValueItem::null(),
    }
}

fn raw_from_value(vtype: VType, value: &ValueItem) -> ValueResult<u64> {
    Ok(match vtype {
        VType::Boolean => value.cast::<bool>()? as u64,
        VType::I8 => value.cast::<i8>()? as u8 as u64,
        VType::I16 => value.cast::<i16>()? as u16 as u64,
        VType::I32 => value.cast::<i32>()? as u32 as u64,
        VType::I64 | VType::TimePoint => value.cast::<i64>()? as u64,
        VType::Ui8 => value.cast::<u8>()? as u64,
        VType::Ui16 => value.cast::<u16>()? as u64,
        VType::Ui32 => value.cast::<u32>()? as u64,
        VType::Ui64 => value.cast::<u64>()?,
        VType::Flo => value.cast::<f32>()?.to_bits() as u64,
        VType::Doub => value.cast::<f64>()?.to_bits(),
        VType::UndefinedPtr => value.cast::<usize>()? as u64,
        VType::TypeIdentifier => value.view(|val, meta| match val {
            super::value::Payload::TypeIdentifier(t) => Ok(*t as u8 as u64),
            _ => Err(ValueError::invalid_cast(meta.vtype(), VType::TypeIdentifier)),
        })?,
        other => return Err(ValueError::invalid_cast(value.vtype(), other)),
    })
}
