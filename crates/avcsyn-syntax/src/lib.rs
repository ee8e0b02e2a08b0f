//! # avcsyn-syntax
//!
//! H.264 语法层: NAL 分帧、参数集与 slice header 解析, CABAC 熵解码与
//! slice_data 宏块语法.
//!
//! 解码只产出语法元素. 像素重建、运动补偿与去块滤波不在本 crate 范围内.
//!
//! ## 使用示例
//!
//! ```rust
//! use avcsyn_syntax::{MacroblockInfo, ParserConfig, RbspParser};
//!
//! let mut parser = RbspParser::new(ParserConfig::default());
//! let mut count = 0;
//! parser
//!     .parse_annex_b(&[], &mut |_: &MacroblockInfo| count += 1)
//!     .unwrap();
//! assert_eq!(count, 0);
//! ```

pub mod async_reader;
pub mod binarization;
pub mod cabac;
pub mod config;
pub mod derivation;
pub mod elements;
pub mod macroblock;
pub mod mb_layer;
pub mod mb_types;
pub mod nal;
pub mod neighbor;
pub mod parser;
pub mod pps;
pub mod residual;
pub mod slice_data;
pub mod slice_group;
pub mod slice_header;
pub mod sps;
#[cfg(any(test, feature = "test-util"))]
pub mod synth;

#[cfg(test)]
mod test_support;

// 重导出常用类型
pub use async_reader::{AsyncNalReader, Framing, parse_stream_async};
pub use cabac::{BinDecoder, CabacEncoder, CabacReader, ContextStore};
pub use config::ParserConfig;
pub use macroblock::{MacroblockInfo, ResidualData};
pub use mb_types::MbType;
pub use nal::{NalUnit, NalUnitType};
pub use neighbor::{NeighborStore, PictureMbStore};
pub use parser::{MacroblockSink, NalOutcome, RbspParser, StreamSummary};
pub use pps::Pps;
pub use slice_data::SliceStats;
pub use slice_header::{SliceHeader, SliceType};
pub use sps::Sps;
