//! # avcsyn
//!
//! 纯 Rust 实现的 H.264/AVC CABAC 语法解析器.
//!
//! 从 Annex B 或长度前缀码流中解析参数集、slice header 与 CABAC 编码的
//! slice_data, 逐宏块输出语法元素. 不做像素重建.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use avcsyn::syntax::{MacroblockInfo, ParserConfig, RbspParser};
//!
//! let data = std::fs::read("input.264").unwrap();
//! let mut parser = RbspParser::new(ParserConfig::default().with_skip_corrupt_slices(true));
//! parser
//!     .parse_annex_b(&data, &mut |mb: &MacroblockInfo| {
//!         println!("mb {} {:?} qp={}", mb.mb_addr, mb.mb_type, mb.qp_y);
//!     })
//!     .unwrap();
//! println!("{:?}", parser.summary());
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `avcsyn-core` | 错误分类、比特源与比特读写器 |
//! | `avcsyn-syntax` | NAL、参数集、slice header、CABAC 与宏块语法 |

/// 错误类型与比特流读写
pub use avcsyn_core as core;

/// H.264 语法解析
pub use avcsyn_syntax as syntax;

pub mod logging;
pub mod probe;

/// 获取 avcsyn 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
