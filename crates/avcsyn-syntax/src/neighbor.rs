//! 相邻宏块信息与邻居位置推导 (H.264 6.4.9 ~ 6.4.13).
//!
//! 上下文推导只通过 [`NeighborStore`] 查询已解码宏块的摘要, 存储由调用方持有.

use bitflags::bitflags;

use crate::mb_types::MbType;

bitflags! {
    /// 宏块状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MbFlags: u8 {
        /// mb_skip_flag = 1
        const SKIP = 1 << 0;
        /// 场宏块 (MBAFF 场宏块对或场图像)
        const FIELD = 1 << 1;
        /// transform_size_8x8_flag = 1
        const TRANSFORM_8X8 = 1 << 2;
        /// I_PCM
        const PCM = 1 << 3;
        /// 帧内预测
        const INTRA = 1 << 4;
        /// B_Skip / B_Direct_16x16
        const DIRECT = 1 << 5;
    }
}

/// 已解码宏块的邻居摘要
///
/// 只保存 CABAC 上下文推导需要的字段.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborInfo {
    /// 所属 slice 的全局序号
    pub slice_num: u32,
    pub mb_type: MbType,
    pub flags: MbFlags,
    /// 低 4 位为亮度 CBP, bit 4..5 为色度 CBP
    pub cbp: u8,
    pub intra_chroma_pred_mode: u8,
    /// 每个 8x8 分区的参考索引, -1 表示不使用该列表
    pub ref_idx: [[i8; 4]; 2],
    /// 每个 4x4 块的 |mvd| (水平, 垂直)
    pub abs_mvd: [[[u16; 2]; 16]; 2],
    /// 每个分量的 coded_block_flag: bit 0..15 为 4x4 块, bit 16 为 DC
    pub cbf: [u32; 3],
}

/// DC 块在 `cbf` 中的位
pub const CBF_DC_BIT: u32 = 16;

impl NeighborInfo {
    /// 某个 slice 中尚未解析任何语法的宏块
    pub fn empty(slice_num: u32) -> Self {
        Self {
            slice_num,
            mb_type: MbType::default(),
            flags: MbFlags::empty(),
            cbp: 0,
            intra_chroma_pred_mode: 0,
            ref_idx: [[-1; 4]; 2],
            abs_mvd: [[[0; 2]; 16]; 2],
            cbf: [0; 3],
        }
    }

    pub fn is_field(&self) -> bool {
        self.flags.contains(MbFlags::FIELD)
    }

    pub fn is_skip(&self) -> bool {
        self.flags.contains(MbFlags::SKIP)
    }

    pub fn is_intra(&self) -> bool {
        self.flags.contains(MbFlags::INTRA)
    }

    pub fn is_pcm(&self) -> bool {
        self.flags.contains(MbFlags::PCM)
    }

    pub fn cbp_luma(&self) -> u8 {
        self.cbp & 0x0F
    }

    pub fn cbp_chroma(&self) -> u8 {
        (self.cbp >> 4) & 0x03
    }

    /// 读取某分量某个块的 coded_block_flag 位
    pub fn cbf_bit(&self, plane: usize, bit: u32) -> bool {
        self.cbf.get(plane).is_some_and(|v| v & (1 << bit) != 0)
    }
}

// ============================================================
// 存储
// ============================================================

/// 相邻宏块信息存储
pub trait NeighborStore {
    /// 新 slice 开始前调用, 保证可容纳整幅图像的宏块
    fn prepare(&mut self, pic_size_in_mbs: u32);

    /// 查询宏块摘要, 从未写入的地址返回 `None`
    fn get(&self, mb_addr: u32) -> Option<&NeighborInfo>;

    /// 写入 (或覆盖) 宏块摘要
    fn put(&mut self, mb_addr: u32, info: NeighborInfo);
}

/// 按图像大小分配的默认存储
///
/// 条目按 slice 序号区分, 旧图像残留的条目不会被当作可用邻居.
#[derive(Debug, Default, Clone)]
pub struct PictureMbStore {
    entries: Vec<Option<NeighborInfo>>,
}

impl PictureMbStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清空全部条目
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    pub fn capacity_mbs(&self) -> usize {
        self.entries.len()
    }
}

impl NeighborStore for PictureMbStore {
    fn prepare(&mut self, pic_size_in_mbs: u32) {
        let size = pic_size_in_mbs as usize;
        if self.entries.len() != size {
            self.entries = vec![None; size];
        }
    }

    fn get(&self, mb_addr: u32) -> Option<&NeighborInfo> {
        self.entries.get(mb_addr as usize).and_then(Option::as_ref)
    }

    fn put(&mut self, mb_addr: u32, info: NeighborInfo) {
        if let Some(slot) = self.entries.get_mut(mb_addr as usize) {
            *slot = Some(info);
        }
    }
}

// ============================================================
// 邻居位置
// ============================================================

/// 图像的宏块几何
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbGeometry {
    pub width_mbs: u32,
    pub height_mbs: u32,
    pub mbaff: bool,
}

/// 相邻宏块方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    A,
    B,
    C,
    D,
}

/// 邻居位置推导结果: 宏块地址与其内部坐标 (xW, yW)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborLoc {
    pub mb_addr: u32,
    pub x: i32,
    pub y: i32,
}

impl MbGeometry {
    pub fn pic_size_in_mbs(&self) -> u32 {
        self.width_mbs * self.height_mbs
    }

    /// 非 MBAFF 时为相邻宏块地址, MBAFF 时为相邻宏块对的顶宏块地址 (6.4.9, 6.4.10)
    ///
    /// 只做几何判断, 可用性由调用方结合 slice 序号确定.
    pub fn neighbor_addr(&self, cur_addr: u32, dir: Direction) -> Option<u32> {
        let w = self.width_mbs;
        let (unit, scale) = if self.mbaff {
            (cur_addr / 2, 2)
        } else {
            (cur_addr, 1)
        };
        let at_left = unit % w == 0;
        let at_right = (unit + 1) % w == 0;
        let n = match dir {
            Direction::A if !at_left => unit.checked_sub(1),
            Direction::B => unit.checked_sub(w),
            Direction::C if !at_right => (unit + 1).checked_sub(w),
            Direction::D if !at_left => unit.checked_sub(w + 1),
            _ => None,
        }?;
        Some(n * scale)
    }

    /// 亮度/色度位置 (xN, yN) 的邻居位置 (6.4.12)
    ///
    /// `field_of(addr)` 返回可用宏块的场标志, 不可用时返回 `None`.
    /// MBAFF 下以宏块对顶宏块地址查询.
    pub fn neighbor_location<F>(
        &self,
        cur_addr: u32,
        cur_field: bool,
        (xn, yn): (i32, i32),
        (max_w, max_h): (i32, i32),
        field_of: F,
    ) -> Option<NeighborLoc>
    where
        F: Fn(u32) -> Option<bool>,
    {
        if yn > max_h - 1 || (xn > max_w - 1 && yn >= 0) {
            return None;
        }
        let (mb_addr, ym) = if self.mbaff {
            self.locate_mbaff(cur_addr, cur_field, (xn, yn), (max_w, max_h), &field_of)?
        } else {
            let addr = self.locate_frame(cur_addr, xn, yn, max_w)?;
            if addr != cur_addr {
                field_of(addr)?;
            }
            (addr, yn)
        };
        Some(NeighborLoc {
            mb_addr,
            x: (xn + max_w).rem_euclid(max_w),
            y: (ym + max_h).rem_euclid(max_h),
        })
    }

    fn locate_frame(&self, cur_addr: u32, xn: i32, yn: i32, max_w: i32) -> Option<u32> {
        match (xn < 0, yn < 0, xn > max_w - 1) {
            (true, true, _) => self.neighbor_addr(cur_addr, Direction::D),
            (true, false, _) => self.neighbor_addr(cur_addr, Direction::A),
            (false, true, false) => self.neighbor_addr(cur_addr, Direction::B),
            (false, false, false) => Some(cur_addr),
            (false, true, true) => self.neighbor_addr(cur_addr, Direction::C),
            (false, false, true) => None,
        }
    }

    /// 表 6-4
    fn locate_mbaff<F>(
        &self,
        cur_addr: u32,
        cur_field: bool,
        (xn, yn): (i32, i32),
        (max_w, max_h): (i32, i32),
        field_of: &F,
    ) -> Option<(u32, i32)>
    where
        F: Fn(u32) -> Option<bool>,
    {
        let is_top = cur_addr % 2 == 0;
        let pair = |dir: Direction| -> Option<(u32, bool)> {
            let top = self.neighbor_addr(cur_addr, dir)?;
            field_of(top).map(|field| (top, field))
        };

        if xn >= 0 && yn >= 0 {
            // 当前宏块内部
            return Some((cur_addr, yn));
        }

        if xn < 0 && yn < 0 {
            return match (cur_field, is_top) {
                (false, true) => pair(Direction::D).map(|(d, _)| (d + 1, yn)),
                (false, false) => {
                    let (a, a_field) = pair(Direction::A)?;
                    if a_field {
                        Some((a + 1, (yn + max_h) >> 1))
                    } else {
                        Some((a, yn))
                    }
                }
                (true, true) => {
                    let (d, d_field) = pair(Direction::D)?;
                    if d_field { Some((d, yn)) } else { Some((d + 1, 2 * yn)) }
                }
                (true, false) => pair(Direction::D).map(|(d, _)| (d + 1, yn)),
            };
        }

        if xn < 0 {
            let (a, a_field) = pair(Direction::A)?;
            let odd = (yn & 1) as u32;
            return Some(match (cur_field, is_top, a_field) {
                (false, true, false) => (a, yn),
                (false, true, true) => (a + odd, yn >> 1),
                (false, false, false) => (a + 1, yn),
                (false, false, true) => (a + odd, (yn + max_h) >> 1),
                (true, true, false) => {
                    if yn < max_h / 2 {
                        (a, yn << 1)
                    } else {
                        (a + 1, (yn << 1) - max_h)
                    }
                }
                (true, false, false) => {
                    if yn < max_h / 2 {
                        (a, (yn << 1) + 1)
                    } else {
                        (a + 1, (yn << 1) + 1 - max_h)
                    }
                }
                (true, true, true) => (a, yn),
                (true, false, true) => (a + 1, yn),
            });
        }

        // yN < 0, xN 在当前宏块宽度内 (B) 或右侧 (C)
        let dir = if xn < max_w { Direction::B } else { Direction::C };
        match (cur_field, is_top) {
            (false, true) => pair(dir).map(|(n, _)| (n + 1, yn)),
            (false, false) => match dir {
                Direction::B => Some((cur_addr - 1, yn)),
                _ => None,
            },
            (true, true) => {
                let (n, n_field) = pair(dir)?;
                if n_field { Some((n, yn)) } else { Some((n + 1, 2 * yn)) }
            }
            (true, false) => pair(dir).map(|(n, _)| (n + 1, yn)),
        }
    }
}

// ============================================================
// 块索引
// ============================================================

/// 亮度 4x4 块索引 (6.4.13.1)
pub fn luma4x4_blk_idx(x: i32, y: i32) -> usize {
    (8 * (y / 8) + 4 * (x / 8) + 2 * ((y % 8) / 4) + (x % 8) / 4) as usize
}

/// 亮度 4x4 块左上角坐标 (6.4.3)
pub fn luma4x4_blk_pos(idx: usize) -> (i32, i32) {
    let idx = idx as i32;
    (
        (idx / 4 % 2) * 8 + (idx % 4 % 2) * 4,
        (idx / 4 / 2) * 8 + (idx % 4 / 2) * 4,
    )
}

/// 亮度 8x8 块索引 (6.4.13.2)
pub fn luma8x8_blk_idx(x: i32, y: i32) -> usize {
    (2 * (y / 8) + x / 8) as usize
}

pub fn luma8x8_blk_pos(idx: usize) -> (i32, i32) {
    let idx = idx as i32;
    ((idx % 2) * 8, (idx / 2) * 8)
}

/// 色度 4x4 块索引 (6.4.13.2, 4:2:0 / 4:2:2)
pub fn chroma4x4_blk_idx(x: i32, y: i32) -> usize {
    (2 * (y / 4) + x / 4) as usize
}

pub fn chroma4x4_blk_pos(idx: usize) -> (i32, i32) {
    let idx = idx as i32;
    ((idx % 2) * 4, (idx / 2) * 4)
}
