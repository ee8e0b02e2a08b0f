//! 上下文变量存储.
//!
//! 每个 slice 独占一份, 在 slice 开始时按 SliceQPY 与初始化表全部重置,
//! 上下文状态不会跨 slice 延续.

use avcsyn_core::{AvcError, AvcResult};

use super::init_tables::{NUM_CTX, luma_counterpart, select_table};
use super::state::ContextVariable;

/// 1024 个上下文变量
#[derive(Clone)]
pub struct ContextStore {
    vars: Box<[ContextVariable; NUM_CTX]>,
}

impl ContextStore {
    /// 为新 slice 初始化全部上下文
    ///
    /// `cabac_init_idc` 为 `None` 表示 I/SI slice.
    pub fn new_for_slice(cabac_init_idc: Option<u8>, slice_qp: i32) -> AvcResult<Self> {
        let table = select_table(cabac_init_idc).ok_or_else(|| {
            AvcError::InvalidData(format!(
                "H.264: cabac_init_idc 非法, value={:?}",
                cabac_init_idc
            ))
        })?;
        let mut vars = Box::new([ContextVariable::default(); NUM_CTX]);
        for (ctx_idx, var) in vars.iter_mut().enumerate() {
            let [m, n] = table
                .get(luma_counterpart(ctx_idx))
                .copied()
                .unwrap_or_default();
            *var = ContextVariable::from_init(i32::from(m), i32::from(n), slice_qp);
        }
        Ok(Self { vars })
    }

    /// 读取上下文变量
    pub fn get(&self, ctx_idx: usize) -> Option<&ContextVariable> {
        self.vars.get(ctx_idx)
    }

    /// 获取可变上下文变量, 越界返回 `InvalidDerivationRequest`
    pub fn get_mut(&mut self, ctx_idx: usize) -> AvcResult<&mut ContextVariable> {
        self.vars
            .get_mut(ctx_idx)
            .ok_or(AvcError::InvalidDerivationRequest {
                ctx_idx_offset: u16::try_from(ctx_idx).unwrap_or(u16::MAX),
                bin_idx: 0,
            })
    }

    /// 全部上下文变量
    pub fn as_slice(&self) -> &[ContextVariable] {
        self.vars.as_slice()
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("len", &self.vars.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_for_slice_known_state() {
        // ctx 0 (m=20, n=-15), qp=26: pre = (20*26>>4) - 15 = 17 → state 46, mps 0
        let store = ContextStore::new_for_slice(None, 26).expect("初始化失败");
        let var = store.get(0).copied().expect("ctx 0 应存在");
        assert_eq!(var, ContextVariable { state_idx: 46, mps: 0 });
    }

    #[test]
    fn test_extended_contexts_follow_luma() {
        let store = ContextStore::new_for_slice(Some(1), 30).expect("初始化失败");
        assert_eq!(store.get(460), store.get(85));
        assert_eq!(store.get(952), store.get(227));
        assert_eq!(store.get(1012), store.get(93));
        assert_eq!(store.as_slice().len(), NUM_CTX);
    }

    #[test]
    fn test_reset_is_independent_per_slice() {
        let mut first = ContextStore::new_for_slice(Some(0), 28).expect("初始化失败");
        first.get_mut(11).expect("ctx 11").apply(1);
        let second = ContextStore::new_for_slice(Some(0), 28).expect("初始化失败");
        let fresh = ContextStore::new_for_slice(Some(0), 28).expect("初始化失败");
        assert_eq!(second.as_slice(), fresh.as_slice());
    }

    #[test]
    fn test_invalid_init_idc_rejected() {
        let err = ContextStore::new_for_slice(Some(3), 26).expect_err("cabac_init_idc=3 应失败");
        let msg = format!("{err}");
        assert!(
            msg.contains("cabac_init_idc"),
            "错误信息应包含 cabac_init_idc, actual={}",
            msg
        );
    }

    #[test]
    fn test_get_mut_out_of_range() {
        let mut store = ContextStore::new_for_slice(None, 26).expect("初始化失败");
        assert!(matches!(
            store.get_mut(NUM_CTX),
            Err(AvcError::InvalidDerivationRequest { .. })
        ));
    }
}
