//! Immutable tuning tables.
//!
//! These are opaque encoder tuning data: search window presets, per-QP mode
//! and motion-vector costs, skip thresholds, search paths and the rate
//! control QP-adjust table. They are built at compile time and never
//! mutated; callers index them by `(frame type, QP)` or preset number.

use kp_common::config::MAX_QP;

/// Number of QP values (0..=51).
pub const NUM_QP: usize = MAX_QP as usize + 1;

// ---------------------------------------------------------------------------
// Search windows
// ---------------------------------------------------------------------------

/// Reference search window and search-path length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SearchWindow {
    pub width: u8,
    pub height: u8,
    pub path_len: u8,
}

/// Window presets 1..=8; index 0 means "explicit" and holds no values.
pub static SEARCH_WINDOW_PRESETS: [SearchWindow; 9] = [
    SearchWindow { width: 0, height: 0, path_len: 0 },
    SearchWindow { width: 24, height: 24, path_len: 4 },
    SearchWindow { width: 28, height: 28, path_len: 9 },
    SearchWindow { width: 48, height: 40, path_len: 16 },
    SearchWindow { width: 48, height: 40, path_len: 32 },
    SearchWindow { width: 48, height: 40, path_len: 48 },
    SearchWindow { width: 64, height: 32, path_len: 16 },
    SearchWindow { width: 64, height: 32, path_len: 32 },
    SearchWindow { width: 64, height: 32, path_len: 48 },
];

/// Presets that run an exhaustive search instead of a diamond pattern.
pub const FULL_SEARCH_PRESETS: [u8; 2] = [5, 8];

// ---------------------------------------------------------------------------
// Mode / MV costs
// ---------------------------------------------------------------------------

/// Macroblock mode and motion-vector costs for one (frame type, QP).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModeCosts {
    pub intra_16x16: u8,
    pub intra_8x8: u8,
    pub intra_4x4: u8,
    pub inter_16x16: u8,
    pub inter_16x8: u8,
    pub inter_8x8: u8,
    pub ref_id: u8,
    pub mv: [u8; 8],
}

impl ModeCosts {
    pub const ZERO: Self = Self {
        intra_16x16: 0,
        intra_8x8: 0,
        intra_4x4: 0,
        inter_16x16: 0,
        inter_16x8: 0,
        inter_8x8: 0,
        ref_id: 0,
        mv: [0; 8],
    };

    /// Packed 16-byte form written into parameter blocks.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0] = self.intra_16x16;
        out[1] = self.intra_8x8;
        out[2] = self.intra_4x4;
        out[3] = self.inter_16x16;
        out[4] = self.inter_16x8;
        out[5] = self.inter_8x8;
        out[6] = self.ref_id;
        out[8..16].copy_from_slice(&self.mv);
        out
    }
}

const fn cap(v: u32) -> u8 {
    if v > 0xFF {
        0xFF
    } else {
        v as u8
    }
}

const fn build_mode_costs() -> [[ModeCosts; NUM_QP]; 3] {
    let mut table = [[ModeCosts::ZERO; NUM_QP]; 3];
    // Per frame type: intra bias, inter bias.
    let bias: [(u32, u32); 3] = [(0x1a, 0x00), (0x2a, 0x09), (0x3a, 0x0f)];
    let mut ft = 0;
    while ft < 3 {
        let (intra, inter) = bias[ft];
        let mut qp = 0;
        while qp < NUM_QP {
            let q = qp as u32;
            let mut mv = [0u8; 8];
            let mut i = 0;
            while i < 8 {
                mv[i] = cap(i as u32 * 0x10 + q / 2);
                i += 1;
            }
            table[ft][qp] = ModeCosts {
                intra_16x16: cap(intra + q / 4),
                intra_8x8: cap(intra + 0x10 + q / 3),
                intra_4x4: cap(intra + 0x20 + q / 2),
                inter_16x16: cap(inter + q / 8),
                inter_16x8: cap(inter + 0x08 + q / 6),
                inter_8x8: cap(inter + 0x10 + q / 4),
                ref_id: cap(if ft == 0 { 0 } else { 0x04 + q / 8 }),
                mv,
            };
            qp += 1;
        }
        ft += 1;
    }
    table
}

/// Mode/MV costs indexed `[frame type (I, P, B)][QP]`.
pub static MODE_MV_COSTS: [[ModeCosts; NUM_QP]; 3] = build_mode_costs();

// ---------------------------------------------------------------------------
// Skip thresholds
// ---------------------------------------------------------------------------

const fn build_skip_thresholds() -> [[u16; NUM_QP]; 2] {
    let mut table = [[0u16; NUM_QP]; 2];
    let mut qp = 0;
    while qp < NUM_QP {
        let q = qp as u32;
        // Grows roughly with the square of the quantizer step.
        let p = 2 + (q * q) / 4;
        let b = 4 + (q * q) / 3;
        table[0][qp] = if p > 0xFFFF { 0xFFFF } else { p as u16 };
        table[1][qp] = if b > 0xFFFF { 0xFFFF } else { b as u16 };
        qp += 1;
    }
    table
}

/// Skip thresholds indexed `[P/B][QP]`.
pub static SKIP_THRESHOLDS: [[u16; NUM_QP]; 2] = build_skip_thresholds();

// ---------------------------------------------------------------------------
// Search paths
// ---------------------------------------------------------------------------

/// Search path encoding length.
pub const SEARCH_PATH_BYTES: usize = 16;

const fn build_search_paths() -> [[[u8; SEARCH_PATH_BYTES]; 8]; 2] {
    let mut table = [[[0u8; SEARCH_PATH_BYTES]; 8]; 2];
    let mut b = 0;
    while b < 2 {
        let mut method = 0;
        while method < 8 {
            let mut i = 0;
            while i < SEARCH_PATH_BYTES {
                // Low nibble dx, high nibble dy, spiral outward by method.
                let step = (i + method + b) as u8;
                let dx = step % 4;
                let dy = (step / 4) % 4;
                table[b][method][i] = (dy << 4) | dx;
                i += 1;
            }
            method += 1;
        }
        b += 1;
    }
    table
}

/// Search paths indexed `[is B][ME method]`.
pub static SEARCH_PATHS: [[[u8; SEARCH_PATH_BYTES]; 8]; 2] = build_search_paths();

// ---------------------------------------------------------------------------
// Rate control
// ---------------------------------------------------------------------------

/// Deviation bins per frame class (eight thresholds split nine bins).
pub const DEVIATION_BINS: usize = 9;

/// QP delta per deviation bin, indexed `[class (P/B, VBR, I)][bin]`.
/// Bin 0 is "far below target", bin 8 "far above target".
pub static BRC_QP_ADJUST: [[i8; DEVIATION_BINS]; 3] = [
    [-3, -2, -1, 0, 0, 0, 1, 2, 3],
    [-3, -2, -1, 0, 0, 0, 1, 2, 4],
    [-2, -1, -1, 0, 0, 0, 1, 1, 2],
];

/// Initial value of the per-reference QP lists in the constant data buffer.
pub const REF_QP_UNSET: u8 = 0xFF;

/// Layout of the BRC constant data buffer (bytes).
pub const BRC_CONST_QP_ADJUST_OFFSET: usize = 0;
pub const BRC_CONST_QP_ADJUST_SIZE: usize = 32;
pub const BRC_CONST_SKIP_OFFSET: usize = BRC_CONST_QP_ADJUST_OFFSET + BRC_CONST_QP_ADJUST_SIZE;
pub const BRC_CONST_SKIP_SIZE: usize = NUM_QP * 2;
pub const BRC_CONST_REF_QP_OFFSET: usize = BRC_CONST_SKIP_OFFSET + BRC_CONST_SKIP_SIZE;
pub const BRC_CONST_REF_QP_SIZE: usize = 2 * 32;
pub const BRC_CONST_MODE_COST_OFFSET: usize = BRC_CONST_REF_QP_OFFSET + BRC_CONST_REF_QP_SIZE;
pub const BRC_CONST_MODE_COST_SIZE: usize = NUM_QP * 16;
pub const BRC_CONSTANT_DATA_SIZE: usize = BRC_CONST_MODE_COST_OFFSET + BRC_CONST_MODE_COST_SIZE;
