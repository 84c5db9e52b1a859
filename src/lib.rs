//! AttachA 值系统
//!
//! 嵌入式脚本语言的动态值表示与 ABI 运行时：
//! - `vm`: 值元数据、动态值、分配、运算、比较、结构体与虚表
//! - `runtime`: 函数环境、符号表、异步调用、对象接口

pub mod config;
pub mod error;
pub mod runtime;
pub mod vm;

pub use config::{configure, runtime_config, RuntimeConfig};
pub use error::{ValueError, ValueResult};
pub use runtime::{FuncEnvironment, Interface, SymbolTable};
pub use vm::{ClassAccess, Structure, VType, ValueItem, ValueMeta};
