//! 统一错误类型定义.
//!
//! 语法解析过程中的任何失败都会中止当前 slice (或 NAL 单元) 的解码,
//! 调用方可以选择跳到下一个 slice 起始码继续.

use thiserror::Error;

/// avcsyn 统一错误类型
#[derive(Debug, Error)]
pub enum AvcError {
    /// 比特源在读取途中耗尽
    #[error("码流数据耗尽: {0}")]
    StreamExhaustion(String),

    /// 要求等于固定常量的语法值不符合 (编码器不合规或解码失步)
    #[error("码流结构错误: {0}")]
    StructuralViolation(String),

    /// 一元/迭代二值化超过安全上限
    #[error("二值化循环超过上限: {element}, limit={limit}")]
    UnboundedLoopDetected {
        /// 语法元素名称
        element: &'static str,
        /// 触发的上限值
        limit: u32,
    },

    /// 不支持的码流特性 (CAVLC 等)
    #[error("不支持的特性: {0}")]
    UnsupportedFeature(String),

    /// 内部请求了没有定义推导规则的上下文偏移
    #[error("无效的上下文推导请求: ctxIdxOffset={ctx_idx_offset}, binIdx={bin_idx}")]
    InvalidDerivationRequest {
        /// 请求的 ctxIdxOffset
        ctx_idx_offset: u16,
        /// 请求的 binIdx
        bin_idx: u32,
    },

    /// 语法字段超出合法范围, 或引用的参数集不存在
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl AvcError {
    /// 是否允许调用方跳过当前 slice 继续解码
    ///
    /// 推导请求错误属于程序契约问题, I/O 错误属于外部环境问题, 两者都不可跳过.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AvcError::InvalidDerivationRequest { .. } | AvcError::Io(_)
        )
    }

    /// 错误分类名称, 用于日志和统计
    pub fn kind(&self) -> &'static str {
        match self {
            AvcError::StreamExhaustion(_) => "StreamExhaustion",
            AvcError::StructuralViolation(_) => "StructuralViolation",
            AvcError::UnboundedLoopDetected { .. } => "UnboundedLoopDetected",
            AvcError::UnsupportedFeature(_) => "UnsupportedFeature",
            AvcError::InvalidDerivationRequest { .. } => "InvalidDerivationRequest",
            AvcError::InvalidData(_) => "InvalidData",
            AvcError::Io(_) => "Io",
        }
    }
}

/// avcsyn 统一 Result 类型
pub type AvcResult<T> = Result<T, AvcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(AvcError::StreamExhaustion("x".into()).is_recoverable());
        assert!(
            AvcError::UnboundedLoopDetected {
                element: "mb_qp_delta",
                limit: 10
            }
            .is_recoverable()
        );
        assert!(
            !AvcError::InvalidDerivationRequest {
                ctx_idx_offset: 1,
                bin_idx: 0
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_error_message_contains_element() {
        let err = AvcError::UnboundedLoopDetected {
            element: "ref_idx",
            limit: 10_000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("ref_idx"), "错误信息应包含元素名, actual={}", msg);
        assert_eq!(err.kind(), "UnboundedLoopDetected");
    }
}
