use rayon::prelude::*;

/// Lookup table of the NF4 data type, used when a checkpoint omits its `quant_map`.
pub(crate) const NF4_CODE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// Lookup table of the FP4 (e2m1) data type normalized to `[-1, 1]`.
pub(crate) const FP4_CODE: [f32; 16] = [
    0.0,
    0.0625 / 12.0,
    8.0 / 12.0,
    1.0,
    4.0 / 12.0,
    6.0 / 12.0,
    2.0 / 12.0,
    3.0 / 12.0,
    -0.0,
    -0.0625 / 12.0,
    -8.0 / 12.0,
    -1.0,
    -4.0 / 12.0,
    -6.0 / 12.0,
    -2.0 / 12.0,
    -3.0 / 12.0,
];

/// Expand packed 4-bit codes (high nibble first) into `numel` values.
/// Element `i` is `code[nibble] * absmax[i / blocksize]`.
pub(crate) fn dequantize_4bit(
    packed: &[u8],
    code: &[f32],
    absmax: &[f32],
    blocksize: usize,
    numel: usize,
) -> Vec<f32> {
    let mut out = vec![0f32; numel];
    out.par_chunks_mut(blocksize)
        .zip(absmax.par_iter())
        .enumerate()
        .for_each(|(block, (chunk, scale))| {
            let base = block * blocksize;
            for (j, value) in chunk.iter_mut().enumerate() {
                let i = base + j;
                let byte = packed[i / 2];
                let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
                *value = code[nibble as usize] * scale;
            }
        });
    out
}

/// Blockwise 8-bit dequantization: `code[q[i]] * absmax[i / blocksize] + offset`.
pub(crate) fn dequantize_8bit(
    codes: &[u8],
    code: &[f32],
    absmax: &[f32],
    blocksize: usize,
    offset: f32,
) -> Vec<f32> {
    let mut out = vec![0f32; codes.len()];
    out.par_chunks_mut(blocksize)
        .zip(codes.par_chunks(blocksize))
        .zip(absmax.par_iter())
        .for_each(|((chunk, qs), scale)| {
            for (value, q) in chunk.iter_mut().zip(qs) {
                *value = code[*q as usize] * scale + offset;
            }
        });
    out
}

/// LLM.int8 row-wise dequantization of a `(rows, cols)` matrix: `w[r, c] * scb[r] / 127`.
pub(crate) fn dequantize_int8_rows(weight: &[i8], scb: &[f32], cols: usize) -> Vec<f32> {
    let mut out = vec![0f32; weight.len()];
    out.par_chunks_mut(cols.max(1))
        .zip(weight.par_chunks(cols.max(1)))
        .zip(scb.par_iter())
        .for_each(|((row, qs), scale)| {
            for (value, q) in row.iter_mut().zip(qs) {
                *value = *q as f32 * scale / 127.0;
            }
        });
    out
}
