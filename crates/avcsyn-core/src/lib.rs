//! # avcsyn-core
//!
//! avcsyn 核心库, 提供错误分类、比特源抽象和比特流读写器.

pub mod bitreader;
pub mod bitsource;
pub mod bitwriter;
pub mod error;

// 重导出常用类型
pub use bitreader::BitReader;
pub use bitsource::BitSource;
pub use bitwriter::BitWriter;
pub use error::{AvcError, AvcResult};
