//! Slice group (FMO) 参数与宏块到 slice group 的映射 (H.264 8.2.2).

use avcsyn_core::{AvcError, AvcResult, BitSource};

use crate::pps::Pps;
use crate::sps::Sps;

/// 随 slice_group_change_cycle 变化的映射形状 (类型 3~5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolvingShape {
    /// 类型 3: box-out
    BoxOut,
    /// 类型 4: 光栅扫描
    RasterScan,
    /// 类型 5: 擦除
    Wipe,
}

/// slice_group_map_type 及其参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceGroupMapType {
    /// 类型 0: 交织, 每组 run_length_minus1 + 1
    Interleaved {
        /// run_length_minus1 + 1
        run_length: Vec<u32>,
    },
    /// 类型 1: 分散
    Dispersed,
    /// 类型 2: 前景矩形加背景
    Foreground {
        /// 每个前景组的左上角地图单元
        top_left: Vec<u32>,
        /// 每个前景组的右下角地图单元
        bottom_right: Vec<u32>,
    },
    /// 类型 3~5
    Evolving {
        /// 映射形状
        shape: EvolvingShape,
        /// slice_group_change_direction_flag
        change_direction: bool,
        /// SliceGroupChangeRate
        change_rate: u32,
    },
    /// 类型 6: 显式指定
    Explicit {
        /// 每个地图单元的 slice_group_id
        slice_group_id: Vec<u8>,
    },
}

/// PPS 中的 slice group 参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceGroupParams {
    /// num_slice_groups_minus1 + 1
    pub num_slice_groups: u32,
    /// 映射类型
    pub map_type: SliceGroupMapType,
}

impl SliceGroupParams {
    /// 解析 num_slice_groups_minus1 之后的 slice group 语法
    pub fn parse<S: BitSource + ?Sized>(br: &mut S, num_slice_groups_minus1: u32) -> AvcResult<Self> {
        let num_slice_groups = num_slice_groups_minus1 + 1;
        let slice_group_map_type = br.read_ue()?;
        let map_type = match slice_group_map_type {
            0 => {
                let mut run_length = Vec::with_capacity(num_slice_groups as usize);
                for _ in 0..num_slice_groups {
                    run_length.push(br.read_ue()?.saturating_add(1));
                }
                SliceGroupMapType::Interleaved { run_length }
            }
            1 => SliceGroupMapType::Dispersed,
            2 => {
                let mut top_left = Vec::new();
                let mut bottom_right = Vec::new();
                for group in 0..num_slice_groups_minus1 {
                    let tl = br.read_ue()?;
                    let br_unit = br.read_ue()?;
                    if tl > br_unit {
                        return Err(AvcError::InvalidData(format!(
                            "H.264: slice group 前景矩形非法, group={}, top_left={}, bottom_right={}",
                            group, tl, br_unit
                        )));
                    }
                    top_left.push(tl);
                    bottom_right.push(br_unit);
                }
                SliceGroupMapType::Foreground {
                    top_left,
                    bottom_right,
                }
            }
            3..=5 => {
                let change_direction = br.read_flag()?;
                let change_rate = br.read_ue()?.saturating_add(1);
                let shape = match slice_group_map_type {
                    3 => EvolvingShape::BoxOut,
                    4 => EvolvingShape::RasterScan,
                    _ => EvolvingShape::Wipe,
                };
                SliceGroupMapType::Evolving {
                    shape,
                    change_direction,
                    change_rate,
                }
            }
            6 => {
                let pic_size_in_map_units = br.read_ue()?.saturating_add(1);
                if pic_size_in_map_units > 1 << 20 {
                    return Err(AvcError::InvalidData(format!(
                        "H.264: pic_size_in_map_units_minus1 超出范围, value={}",
                        pic_size_in_map_units - 1
                    )));
                }
                let bits = ceil_log2(num_slice_groups);
                let mut slice_group_id = Vec::with_capacity(pic_size_in_map_units as usize);
                for _ in 0..pic_size_in_map_units {
                    let id = br.read_bits(bits)?;
                    if id >= num_slice_groups {
                        return Err(AvcError::InvalidData(format!(
                            "H.264: slice_group_id 超出范围, value={}, num_slice_groups={}",
                            id, num_slice_groups
                        )));
                    }
                    slice_group_id.push(id as u8);
                }
                SliceGroupMapType::Explicit { slice_group_id }
            }
            _ => {
                return Err(AvcError::InvalidData(format!(
                    "H.264: slice_group_map_type 非法, value={}",
                    slice_group_map_type
                )));
            }
        };
        Ok(Self {
            num_slice_groups,
            map_type,
        })
    }

    /// 类型 3~5 的 SliceGroupChangeRate
    pub fn change_rate(&self) -> Option<u32> {
        match self.map_type {
            SliceGroupMapType::Evolving { change_rate, .. } => Some(change_rate),
            _ => None,
        }
    }
}

/// Ceil(Log2(n))
pub(crate) fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        u32::BITS - (n - 1).leading_zeros()
    }
}

/// slice_group_change_cycle 的位数: Ceil(Log2(PicSizeInMapUnits ÷ SliceGroupChangeRate + 1))
pub fn change_cycle_bits(pic_size_in_map_units: u32, change_rate: u32) -> u32 {
    let rate = u64::from(change_rate.max(1));
    let target = u64::from(pic_size_in_map_units) + rate;
    let mut bits = 0u32;
    while (rate << bits) < target {
        bits += 1;
    }
    bits
}

/// 当前图像的宏块到 slice group 映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceGroupMap {
    mb_to_group: Vec<u8>,
}

impl SliceGroupMap {
    /// 单一 slice group 的映射
    pub fn single(pic_size_in_mbs: u32) -> Self {
        Self {
            mb_to_group: vec![0; pic_size_in_mbs as usize],
        }
    }

    /// 按 8.2.2 生成映射
    pub fn build(
        sps: &Sps,
        pps: &Pps,
        field_pic: bool,
        slice_group_change_cycle: u32,
    ) -> AvcResult<Self> {
        let width = sps.pic_width_in_mbs;
        let pic_height_in_mbs = sps.frame_height_in_mbs() / if field_pic { 2 } else { 1 };
        let pic_size_in_mbs = width * pic_height_in_mbs;
        let Some(groups) = pps.slice_groups.as_ref() else {
            return Ok(Self::single(pic_size_in_mbs));
        };

        let map_units = map_unit_to_slice_group(
            groups,
            width,
            sps.pic_height_in_map_units,
            slice_group_change_cycle,
        )?;
        let mbaff = sps.mb_adaptive_frame_field && !field_pic;
        let mb_to_group = (0..pic_size_in_mbs as usize)
            .map(|i| {
                let unit = if sps.frame_mbs_only || field_pic {
                    i
                } else if mbaff {
                    i / 2
                } else {
                    let w = width as usize;
                    (i / (2 * w)) * w + i % w
                };
                map_units.get(unit).copied().unwrap_or(0)
            })
            .collect();
        Ok(Self { mb_to_group })
    }

    /// 宏块数
    pub fn len(&self) -> u32 {
        self.mb_to_group.len() as u32
    }

    /// 是否为空映射
    pub fn is_empty(&self) -> bool {
        self.mb_to_group.is_empty()
    }

    /// 宏块所在的 slice group
    pub fn group_of(&self, mb_addr: u32) -> Option<u8> {
        self.mb_to_group.get(mb_addr as usize).copied()
    }

    /// NextMbAddress: 同一 slice group 中的下一个宏块地址, 越界时返回 len()
    pub fn next_mb_addr(&self, mb_addr: u32) -> u32 {
        let Some(group) = self.group_of(mb_addr) else {
            return self.len();
        };
        let start = mb_addr as usize + 1;
        self.mb_to_group
            .get(start..)
            .and_then(|rest| rest.iter().position(|&g| g == group))
            .map_or(self.len(), |offset| (start + offset) as u32)
    }
}

/// mapUnitToSliceGroupMap (8.2.2.1 ~ 8.2.2.7)
fn map_unit_to_slice_group(
    groups: &SliceGroupParams,
    width: u32,
    height_in_map_units: u32,
    change_cycle: u32,
) -> AvcResult<Vec<u8>> {
    let size = (width * height_in_map_units) as usize;
    let w = width as usize;
    let n = groups.num_slice_groups as usize;
    let mut map = vec![0u8; size];

    match &groups.map_type {
        SliceGroupMapType::Interleaved { run_length } => {
            let mut i = 0usize;
            while i < size {
                for (group, &run) in run_length.iter().enumerate() {
                    if i >= size {
                        break;
                    }
                    let end = (i + run as usize).min(size);
                    map[i..end].fill(group as u8);
                    i = end;
                }
            }
        }
        SliceGroupMapType::Dispersed => {
            for (i, slot) in map.iter_mut().enumerate() {
                *slot = (((i % w) + (((i / w) * n) / 2)) % n) as u8;
            }
        }
        SliceGroupMapType::Foreground {
            top_left,
            bottom_right,
        } => {
            map.fill((n - 1) as u8);
            for group in (0..top_left.len()).rev() {
                let (tl, br) = (top_left[group] as usize, bottom_right[group] as usize);
                if br >= size {
                    return Err(AvcError::InvalidData(format!(
                        "H.264: slice group 前景矩形越界, group={}, bottom_right={}",
                        group, br
                    )));
                }
                for y in tl / w..=br / w {
                    for x in tl % w..=br % w {
                        map[y * w + x] = group as u8;
                    }
                }
            }
        }
        SliceGroupMapType::Evolving {
            shape,
            change_direction,
            change_rate,
        } => {
            let units_in_group0 = (u64::from(change_cycle) * u64::from(*change_rate))
                .min(size as u64) as usize;
            let flag = usize::from(*change_direction);
            let upper_left = if *change_direction {
                size - units_in_group0
            } else {
                units_in_group0
            };
            match shape {
                EvolvingShape::BoxOut => box_out(
                    &mut map,
                    w,
                    height_in_map_units as usize,
                    *change_direction,
                    units_in_group0,
                ),
                EvolvingShape::RasterScan => {
                    for (i, slot) in map.iter_mut().enumerate() {
                        *slot = (if i < upper_left { flag } else { 1 - flag }) as u8;
                    }
                }
                EvolvingShape::Wipe => {
                    let h = height_in_map_units as usize;
                    let mut k = 0usize;
                    for x in 0..w {
                        for y in 0..h {
                            map[y * w + x] = (if k < upper_left { flag } else { 1 - flag }) as u8;
                            k += 1;
                        }
                    }
                }
            }
        }
        SliceGroupMapType::Explicit { slice_group_id } => {
            if slice_group_id.len() != size {
                return Err(AvcError::InvalidData(format!(
                    "H.264: pic_size_in_map_units 与 SPS 不一致, pps={}, sps={}",
                    slice_group_id.len(),
                    size
                )));
            }
            map.copy_from_slice(slice_group_id);
        }
    }
    Ok(map)
}

/// box-out 螺旋 (8.2.2.4)
fn box_out(map: &mut [u8], w: usize, h: usize, change_direction: bool, units_in_group0: usize) {
    map.fill(1);
    let dir = i64::from(change_direction);
    let (w_i, h_i) = (w as i64, h as i64);
    let mut x = (w_i - dir) / 2;
    let mut y = (h_i - dir) / 2;
    let (mut left, mut top, mut right, mut bottom) = (x, y, x, y);
    let (mut x_dir, mut y_dir) = (dir - 1, dir);

    let mut k = 0usize;
    while k < units_in_group0 {
        let idx = (y * w_i + x) as usize;
        let vacant = map[idx] == 1;
        if vacant {
            map[idx] = 0;
        }
        if x_dir == -1 && x == left {
            left = (left - 1).max(0);
            x = left;
            x_dir = 0;
            y_dir = 2 * dir - 1;
        } else if x_dir == 1 && x == right {
            right = (right + 1).min(w_i - 1);
            x = right;
            x_dir = 0;
            y_dir = 1 - 2 * dir;
        } else if y_dir == -1 && y == top {
            top = (top - 1).max(0);
            y = top;
            x_dir = 1 - 2 * dir;
            y_dir = 0;
        } else if y_dir == 1 && y == bottom {
            bottom = (bottom + 1).min(h_i - 1);
            y = bottom;
            x_dir = 2 * dir - 1;
            y_dir = 0;
        } else {
            x += x_dir;
            y += y_dir;
        }
        if vacant {
            k += 1;
        }
    }
}
