//! CABAC 熵解码.
//!
//! - [`state`]: 64 状态概率状态机
//! - [`engine`]: 算术解码引擎
//! - [`context`]: 每 slice 一份的上下文存储
//! - [`encoder`]: 对应的算术编码器, 用于构造测试码流

pub mod context;
pub mod encoder;
pub mod engine;
pub(crate) mod init_tables;
pub mod state;

use avcsyn_core::{AvcResult, BitSource};

pub use context::ContextStore;
pub use encoder::CabacEncoder;
pub use engine::ArithmeticDecoder;
pub use init_tables::NUM_CTX;
pub use state::{ContextVariable, next_on_lps, next_on_mps};

/// bin 解码接口
///
/// 二值化与语法解析只依赖该接口, 便于用脚本化的 bin 序列做单元测试.
pub trait BinDecoder {
    /// 以 ctxIdx 指定的上下文解码一个 bin
    fn decode_decision(&mut self, ctx_idx: usize) -> AvcResult<u8>;

    /// 旁路解码一个 bin
    fn decode_bypass(&mut self) -> AvcResult<u8>;

    /// 终止模式解码一个 bin
    fn decode_terminate(&mut self) -> AvcResult<u8>;
}

/// 绑定比特源与上下文存储的 CABAC 读取器
pub struct CabacReader<'a, S: BitSource + ?Sized> {
    source: &'a mut S,
    engine: ArithmeticDecoder,
    contexts: ContextStore,
}

impl<'a, S: BitSource + ?Sized> CabacReader<'a, S> {
    /// 在 slice_data 起始位置初始化引擎
    pub fn new(source: &'a mut S, contexts: ContextStore) -> AvcResult<Self> {
        let engine = ArithmeticDecoder::init(source)?;
        Ok(Self {
            source,
            engine,
            contexts,
        })
    }

    /// 直接访问比特源 (I_PCM 样本读取)
    pub fn source_mut(&mut self) -> &mut S {
        &mut *self.source
    }

    /// I_PCM 样本之后重新初始化引擎, 上下文保持不变
    pub fn reinit(&mut self) -> AvcResult<()> {
        self.engine = ArithmeticDecoder::init(&mut *self.source)?;
        Ok(())
    }

    /// 当前上下文存储
    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    /// 当前引擎寄存器
    pub fn engine(&self) -> &ArithmeticDecoder {
        &self.engine
    }
}

impl<S: BitSource + ?Sized> BinDecoder for CabacReader<'_, S> {
    fn decode_decision(&mut self, ctx_idx: usize) -> AvcResult<u8> {
        let ctx = self.contexts.get_mut(ctx_idx)?;
        self.engine.decode_decision(&mut *self.source, ctx)
    }

    fn decode_bypass(&mut self) -> AvcResult<u8> {
        self.engine.decode_bypass(&mut *self.source)
    }

    fn decode_terminate(&mut self) -> AvcResult<u8> {
        self.engine.decode_terminate(&mut *self.source)
    }
}
