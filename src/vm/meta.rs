//! 值类型标签与打包元数据
//!
//! `ValueMeta` 布局（64 位）：
//! - 位 0..8   : vtype 标签
//! - 位 8      : use_gc
//! - 位 9      : allow_edit
//! - 位 10     : as_ref
//! - 位 11     : 已编码标记（区分默认零值和真正写入过的元数据）
//! - 位 32..64 : val_len（仅定长/原始数组有意义）

use std::fmt;

/// 值类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VType {
    Noting = 0,
    Boolean = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    Ui8 = 6,
    Ui16 = 7,
    Ui32 = 8,
    Ui64 = 9,
    Flo = 10,
    Doub = 11,
    RawArrI8 = 12,
    RawArrI16 = 13,
    RawArrI32 = 14,
    RawArrI64 = 15,
    RawArrUi8 = 16,
    RawArrUi16 = 17,
    RawArrUi32 = 18,
    RawArrUi64 = 19,
    RawArrFlo = 20,
    RawArrDoub = 21,
    /// 动态数组
    Uarr = 22,
    /// 定长数组（拷贝语义）
    Faarr = 23,
    /// 栈数组（不可独立搬移）
    Saarr = 24,
    String = 25,
    Map = 26,
    Set = 27,
    TimePoint = 28,
    TypeIdentifier = 29,
    Function = 30,
    Struct = 31,
    Proxy = 32,
    Class = 33,
    Morph = 34,
    AsyncRes = 35,
    ExceptValue = 36,
    UndefinedPtr = 37,
}

const ALL_TYPES: [VType; 38] = [
    VType::Noting,
    VType::Boolean,
    VType::I8,
    VType::I16,
    VType::I32,
    VType::I64,
    VType::Ui8,
    VType::Ui16,
    VType::Ui32,
    VType::Ui64,
    VType::Flo,
    VType::Doub,
    VType::RawArrI8,
    VType::RawArrI16,
    VType::RawArrI32,
    VType::RawArrI64,
    VType::RawArrUi8,
    VType::RawArrUi16,
    VType::RawArrUi32,
    VType::RawArrUi64,
    VType::RawArrFlo,
    VType::RawArrDoub,
    VType::Uarr,
    VType::Faarr,
    VType::Saarr,
    VType::String,
    VType::Map,
    VType::Set,
    VType::TimePoint,
    VType::TypeIdentifier,
    VType::Function,
    VType::Struct,
    VType::Proxy,
    VType::Class,
    VType::Morph,
    VType::AsyncRes,
    VType::ExceptValue,
    VType::UndefinedPtr,
];

impl VType {
    /// 从原始标签解码
    pub fn from_u8(tag: u8) -> Option<Self> {
        ALL_TYPES.get(tag as usize).copied()
    }

    /// 标签名称（也是 `TypeIdentifier` 的文本形式）
    pub fn name(self) -> &'static str {
        match self {
            VType::Noting => "noting",
            VType::Boolean => "boolean",
            VType::I8 => "i8",
            VType::I16 => "i16",
            VType::I32 => "i32",
            VType::I64 => "i64",
            VType::Ui8 => "ui8",
            VType::Ui16 => "ui16",
            VType::Ui32 => "ui32",
            VType::Ui64 => "ui64",
            VType::Flo => "flo",
            VType::Doub => "doub",
            VType::RawArrI8 => "raw_arr_i8",
            VType::RawArrI16 => "raw_arr_i16",
            VType::RawArrI32 => "raw_arr_i32",
            VType::RawArrI64 => "raw_arr_i64",
            VType::RawArrUi8 => "raw_arr_ui8",
            VType::RawArrUi16 => "raw_arr_ui16",
            VType::RawArrUi32 => "raw_arr_ui32",
            VType::RawArrUi64 => "raw_arr_ui64",
            VType::RawArrFlo => "raw_arr_flo",
            VType::RawArrDoub => "raw_arr_doub",
            VType::Uarr => "uarr",
            VType::Faarr => "faarr",
            VType::Saarr => "saarr",
            VType::String => "string",
            VType::Map => "map",
            VType::Set => "set",
            VType::TimePoint => "time_point",
            VType::TypeIdentifier => "type_identifier",
            VType::Function => "function",
            VType::Struct => "struct",
            VType::Proxy => "proxy",
            VType::Class => "class",
            VType::Morph => "morph",
            VType::AsyncRes => "async_res",
            VType::ExceptValue => "except_value",
            VType::UndefinedPtr => "undefined_ptr",
        }
    }

    /// 按名称查找标签
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_TYPES.iter().copied().find(|t| t.name() == name)
    }

    /// 是否是整数标签
    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            VType::I8
                | VType::I16
                | VType::I32
                | VType::I64
                | VType::Ui8
                | VType::Ui16
                | VType::Ui32
                | VType::Ui64
        )
    }

    /// 是否是有符号整数
    #[inline]
    pub fn is_signed(self) -> bool {
        matches!(self, VType::I8 | VType::I16 | VType::I32 | VType::I64)
    }

    /// 是否是浮点标签
    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, VType::Flo | VType::Doub)
    }

    /// 是否是数值标签（比较引擎按数值规则处理）
    ///
    /// `undefined_ptr`、`boolean` 与 `time_point` 按无符号整数处理
    #[inline]
    pub fn is_numeric(self) -> bool {
        self.is_integer()
            || self.is_float()
            || matches!(self, VType::UndefinedPtr | VType::Boolean | VType::TimePoint)
    }

    /// 是否是原始定长数组
    #[inline]
    pub fn is_raw_array(self) -> bool {
        (VType::RawArrI8 as u8..=VType::RawArrDoub as u8).contains(&(self as u8))
    }

    /// 是否是任意数组（动态、定长、栈、原始）
    #[inline]
    pub fn is_array(self) -> bool {
        self.is_raw_array() || matches!(self, VType::Uarr | VType::Faarr | VType::Saarr)
    }

    /// 是否是可通过接口调用方法的对象
    #[inline]
    pub fn is_object(self) -> bool {
        matches!(self, VType::Struct | VType::Class | VType::Morph | VType::Proxy)
    }

    /// 原始数组的元素标签
    pub fn raw_array_element(self) -> Option<VType> {
        Some(match self {
            VType::RawArrI8 => VType::I8,
            VType::RawArrI16 => VType::I16,
            VType::RawArrI32 => VType::I32,
            VType::RawArrI64 => VType::I64,
            VType::RawArrUi8 => VType::Ui8,
            VType::RawArrUi16 => VType::Ui16,
            VType::RawArrUi32 => VType::Ui32,
            VType::RawArrUi64 => VType::Ui64,
            VType::RawArrFlo => VType::Flo,
            VType::RawArrDoub => VType::Doub,
            _ => return None,
        })
    }

    /// 标量标签对应的原始数组标签
    pub fn raw_array_of(element: VType) -> Option<VType> {
        Some(match element {
            VType::I8 => VType::RawArrI8,
            VType::I16 => VType::RawArrI16,
            VType::I32 => VType::RawArrI32,
            VType::I64 => VType::RawArrI64,
            VType::Ui8 => VType::RawArrUi8,
            VType::Ui16 => VType::RawArrUi16,
            VType::Ui32 => VType::RawArrUi32,
            VType::Ui64 => VType::RawArrUi64,
            VType::Flo => VType::RawArrFlo,
            VType::Doub => VType::RawArrDoub,
            _ => return None,
        })
    }

    /// 可以直接放入结构体数据块的标量宽度（字节）
    pub fn scalar_size(self) -> Option<usize> {
        Some(match self {
            VType::Boolean | VType::I8 | VType::Ui8 => 1,
            VType::I16 | VType::Ui16 => 2,
            VType::I32 | VType::Ui32 | VType::Flo => 4,
            VType::I64 | VType::Ui64 | VType::Doub | VType::TimePoint => 8,
            VType::UndefinedPtr => std::mem::size_of::<usize>(),
            VType::TypeIdentifier => 1,
            _ => return None,
        })
    }
}

impl fmt::Display for VType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// 打包元数据
// ============================================================================

const VTYPE_MASK: u64 = 0xFF;
const USE_GC_BIT: u64 = 1 << 8;
const ALLOW_EDIT_BIT: u64 = 1 << 9;
const AS_REF_BIT: u64 = 1 << 10;
const ENCODED_BIT: u64 = 1 << 11;
const LEN_SHIFT: u32 = 32;

/// 值元数据（8 字节）
///
/// `encoded` 是唯一的持久形式，所有字段都是它的视图
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ValueMeta {
    encoded: u64,
}

impl ValueMeta {
    /// 创建元数据
    #[inline]
    pub const fn new(vtype: VType, use_gc: bool, allow_edit: bool) -> Self {
        Self::with_len(vtype, use_gc, allow_edit, 0)
    }

    /// 创建带长度的元数据
    #[inline]
    pub const fn with_len(vtype: VType, use_gc: bool, allow_edit: bool, len: u32) -> Self {
        let mut encoded = vtype as u64 | ENCODED_BIT | ((len as u64) << LEN_SHIFT);
        if use_gc {
            encoded |= USE_GC_BIT;
        }
        if allow_edit {
            encoded |= ALLOW_EDIT_BIT;
        }
        Self { encoded }
    }

    /// 普通可编辑元数据
    #[inline]
    pub const fn of(vtype: VType) -> Self {
        Self::new(vtype, false, true)
    }

    /// 原始编码字
    #[inline(always)]
    pub const fn encoded(self) -> u64 {
        self.encoded
    }

    /// 从原始编码字恢复
    #[inline(always)]
    pub const fn from_encoded(encoded: u64) -> Self {
        Self { encoded }
    }

    /// 是否已经写入过
    #[inline]
    pub const fn is_encoded(self) -> bool {
        self.encoded & ENCODED_BIT != 0
    }

    #[inline]
    pub fn vtype(self) -> VType {
        VType::from_u8((self.encoded & VTYPE_MASK) as u8).unwrap_or(VType::Noting)
    }

    #[inline]
    pub fn set_vtype(&mut self, vtype: VType) {
        self.encoded = (self.encoded & !VTYPE_MASK) | vtype as u64 | ENCODED_BIT;
    }

    #[inline]
    pub const fn use_gc(self) -> bool {
        self.encoded & USE_GC_BIT != 0
    }

    #[inline]
    pub fn set_use_gc(&mut self, value: bool) {
        self.set_bit(USE_GC_BIT, value);
    }

    #[inline]
    pub const fn allow_edit(self) -> bool {
        self.encoded & ALLOW_EDIT_BIT != 0
    }

    #[inline]
    pub fn set_allow_edit(&mut self, value: bool) {
        self.set_bit(ALLOW_EDIT_BIT, value);
    }

    #[inline]
    pub const fn as_ref(self) -> bool {
        self.encoded & AS_REF_BIT != 0
    }

    #[inline]
    pub fn set_as_ref(&mut self, value: bool) {
        self.set_bit(AS_REF_BIT, value);
    }

    #[inline]
    pub const fn val_len(self) -> u32 {
        (self.encoded >> LEN_SHIFT) as u32
    }

    #[inline]
    pub fn set_val_len(&mut self, len: u32) {
        self.encoded = (self.encoded & 0xFFFF_FFFF) | ((len as u64) << LEN_SHIFT) | ENCODED_BIT;
    }

    #[inline]
    fn set_bit(&mut self, bit: u64, value: bool) {
        if value {
            self.encoded |= bit;
        } else {
            self.encoded &= !bit;
        }
        self.encoded |= ENCODED_BIT;
    }
}

impl fmt::Debug for ValueMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueMeta")
            .field("vtype", &self.vtype())
            .field("use_gc", &self.use_gc())
            .field("allow_edit", &self.allow_edit())
            .field("as_ref", &self.as_ref())
            .field("val_len", &self.val_len())
            .finish()
    }
}

const _: () = assert!(std::mem::size_of::<ValueMeta>() == 8);
