//! 调用运行时模块
//!
//! 核心组件：
//! - FuncEnvironment: 函数环境（原生、字节码、外部语言桩）
//! - SymbolTable: 全局符号表
//! - AsyncResult / TaskPool: 异步调用
//! - Interface: 按名字调用脚本对象的方法

pub mod function;
pub mod symbols;
pub mod async_result;
pub mod task_pool;
pub mod interface;

pub use function::{ArgumentTemplate, CodeBackend, FuncEnvironment, FuncKind, FunctionTemplate, NativeProc};
pub use symbols::SymbolTable;
pub use async_result::{AsyncResult, Completer};
pub use task_pool::TaskPool;
pub use interface::Interface;
