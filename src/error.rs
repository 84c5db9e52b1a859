//! 值系统错误定义
//!
//! 所有错误都直接传播给调用方（解释器循环或原生调用点），
//! 值系统内部不捕获

use std::sync::Arc;

/// 值系统错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    /// 类型标签与访问方式不匹配
    #[error("invalid type: {0}")]
    InvalidType(String),
    /// 转换失败
    #[error("invalid cast: {0}")]
    InvalidCast(String),
    /// 当前对象状态不允许该操作
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// 参数不合法
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// 组合合法但尚未实现
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// 数值转换丢失精度或符号
    #[error("numeric underflow: {0}")]
    NumericUnderflow(String),
    /// 修改了不可编辑的值
    #[error("unmodifiable value")]
    UnmodifiableValue,
    /// 下标或范围越界
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// 符号表冲突
    #[error("symbol error: {0}")]
    Symbol(String),
    /// 热替换冲突
    #[error("hot path error: {0}")]
    HotPath(String),
    /// 脚本层异常
    #[error("exception: {0}")]
    Exception(String),
    /// 异步任务失败后传播的错误
    #[error("async task failed: {0}")]
    AsyncFailed(Arc<ValueError>),
}

impl ValueError {
    /// 未指定内容的异常（异常值的默认负载）
    pub fn undefined_exception() -> Self {
        ValueError::Exception("Undefined exception".to_string())
    }

    /// 创建类型转换错误
    pub fn invalid_cast(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        ValueError::InvalidCast(format!("cannot convert {} to {}", from, to))
    }

    /// 创建运算不支持错误
    pub fn invalid_operator(op: &str, lhs: impl std::fmt::Display, rhs: impl std::fmt::Display) -> Self {
        ValueError::InvalidCast(format!("operator {} is not supported for {} and {}", op, lhs, rhs))
    }
}

/// 值系统结果类型
pub type ValueResult<T> = Result<T, ValueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ValueError::UnmodifiableValue.to_string(), "unmodifiable value");
        assert_eq!(
            ValueError::undefined_exception().to_string(),
            "exception: Undefined exception"
        );
        let err = ValueError::invalid_operator("+=", "map", "i32");
        assert!(err.to_string().contains("operator += is not supported for map and i32"));
    }
}
