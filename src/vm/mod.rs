//! 值系统模块
//!
//! 动态值的表示、分配、转换、运算、比较，以及用户对象（结构体、类）的布局与派发

pub mod meta;
pub mod gc;
pub mod alloc;
pub mod value;
pub mod ops;
pub mod cast;
pub mod parse;
pub mod hash;
pub mod compare;
pub mod vtable;
pub mod structure;
pub mod class;

pub use meta::{VType, ValueMeta};
pub use gc::{gc_stats, GcCell, GcStats, GcWeak};
pub use alloc::{alloc_stats, need_alloc, need_alloc_type, universal_alloc, universal_free, universal_remove, AllocStats};
pub use value::{ClassHandle, MorphHandle, Payload, ProxyHandle, RawArray, StructHandle, ValueItem};
pub use ops::{
    dyn_bit_and, dyn_bit_or, dyn_bit_shift_left, dyn_bit_shift_right, dyn_bit_xor, dyn_dec, dyn_div, dyn_inc,
    dyn_minus, dyn_mul, dyn_not, dyn_rest, dyn_sum, BinOp,
};
pub use cast::FromValue;
pub use parse::parse_value;
pub use hash::hash_value;
pub use compare::{compare_arrays, compare_value};
pub use vtable::{
    check_access, AttachADynamicVirtualTable, AttachAVirtualTable, ClassAccess, MethodInfo, VTableMode, VTableRef,
    VTableSlots, VirtualTable,
};
pub use structure::{Item, StructState, Structure};
pub use class::{ClassField, ClassValue, MorphValue, ProxyClass};
