//! 配置常量模块
//!
//! 值系统使用的常量和运行时配置都在这里定义，便于后期修改

use std::sync::OnceLock;

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 容器深度安全检查的默认递归上限
pub const SAFE_DEPTH_LIMIT: usize = 256;

/// 任务队列默认容量
pub const TASK_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// 运算符和接口方法名
// ============================================================================

pub const OP_ADD_ASSIGN: &str = "operator+=";
pub const OP_SUB_ASSIGN: &str = "operator-=";
pub const OP_MUL_ASSIGN: &str = "operator*=";
pub const OP_DIV_ASSIGN: &str = "operator/=";
pub const OP_REM_ASSIGN: &str = "operator%=";
pub const OP_XOR_ASSIGN: &str = "operator^=";
pub const OP_AND_ASSIGN: &str = "operator&=";
pub const OP_OR_ASSIGN: &str = "operator|=";
pub const OP_SHL_ASSIGN: &str = "operator<<=";
pub const OP_SHR_ASSIGN: &str = "operator>>=";
pub const OP_INC: &str = "operator++";
pub const OP_DEC: &str = "operator--";
pub const OP_NOT: &str = "operator!";

/// 用户对象的字符串化方法
pub const METHOD_TO_STRING: &str = "to_string";
/// 用户对象的哈希方法
pub const METHOD_HASH: &str = "hash";
/// 用户对象的长度方法
pub const METHOD_SIZE: &str = "size";
/// 迭代协议：重置迭代
pub const METHOD_BEGIN: &str = "begin";
/// 迭代协议：取下一个元素
pub const METHOD_NEXT: &str = "next";
/// 下标读取
pub const METHOD_INDEX_GET: &str = "operator[]get";

// ============================================================================
// 运行时配置
// ============================================================================

/// 运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 任务池工作线程数（0 表示使用 CPU 核心数）
    pub task_workers: usize,
    /// 任务队列容量
    pub task_queue_capacity: usize,
    /// 容器比较和 GC 深度检查的递归上限
    pub safe_depth: usize,
}

impl RuntimeConfig {
    /// 实际使用的工作线程数
    pub fn worker_count(&self) -> usize {
        if self.task_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.task_workers
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_workers: 0,
            task_queue_capacity: TASK_QUEUE_CAPACITY,
            safe_depth: SAFE_DEPTH_LIMIT,
        }
    }
}

/// 全局配置单例
static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// 安装进程级配置
///
/// 只能在首次读取之前调用一次，否则返回被拒绝的配置
pub fn configure(config: RuntimeConfig) -> Result<(), RuntimeConfig> {
    CONFIG.set(config)
}

/// 获取进程级配置
pub fn runtime_config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::default)
}
