//! Transport filters for push/pull value payloads.
//!
//! Values cross the wire as a [`ValueChunk`]: raw little-endian f32 when
//! `fixed_bytes == 0`, or fixed-point signed integers of 1, 2 or 4 bytes
//! scaled by the chunk's `scale`. Either form may additionally be
//! zlib-compressed. Key vectors carry an FNV-1a signature so an identical
//! vector can be replaced by its signature on subsequent calls (key
//! caching).

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use sparsefleet_core::{Error, FeaId, Result};
use sparsefleet_proto::ValueChunk;

/// FNV-1a over the little-endian key bytes. Stable across processes, which
/// the key cache requires.
pub fn key_signature(keys: &[FeaId]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET;
    for key in keys {
        for b in key.to_le_bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(PRIME);
        }
    }
    h
}

/// Largest representable magnitude for a `bytes`-wide signed fixed-point
/// value.
fn int_max(bytes: u32) -> i64 {
    (1i64 << (8 * bytes - 1)) - 1
}

/// Encodes `values` with the requested quantization width and compression.
pub fn encode_values(values: &[f32], fixed_bytes: u32, compress: bool) -> Result<ValueChunk> {
    let mut data = match fixed_bytes {
        0 => {
            let mut out = Vec::with_capacity(values.len() * 4);
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
            out
        }
        1 | 2 | 4 => {
            let imax = int_max(fixed_bytes);
            let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let scale = if max_abs > 0.0 {
                max_abs / imax as f32
            } else {
                0.0
            };
            let mut out = Vec::with_capacity(values.len() * fixed_bytes as usize);
            for &v in values {
                let q = if scale > 0.0 {
                    ((v / scale).round() as i64).clamp(-imax, imax)
                } else {
                    0
                };
                out.extend_from_slice(&q.to_le_bytes()[..fixed_bytes as usize]);
            }
            let mut chunk = finish_chunk(out, values.len(), fixed_bytes, compress)?;
            chunk.scale = scale;
            return Ok(chunk);
        }
        other => {
            return Err(Error::config(format!(
                "fixed_bytes must be one of 0, 1, 2, 4, got {other}"
            )))
        }
    };

    if compress {
        data = deflate(&data)?;
    }
    Ok(ValueChunk {
        data,
        fixed_bytes: 0,
        scale: 0.0,
        compressed: compress,
        count: values.len() as u32,
    })
}

fn finish_chunk(
    mut data: Vec<u8>,
    count: usize,
    fixed_bytes: u32,
    compress: bool,
) -> Result<ValueChunk> {
    if compress {
        data = deflate(&data)?;
    }
    Ok(ValueChunk {
        data,
        fixed_bytes,
        scale: 0.0,
        compressed: compress,
        count: count as u32,
    })
}

/// Decodes a chunk back into f32 values.
pub fn decode_values(chunk: &ValueChunk) -> Result<Vec<f32>> {
    let data = if chunk.compressed {
        inflate(&chunk.data)?
    } else {
        chunk.data.clone()
    };
    let count = chunk.count as usize;

    match chunk.fixed_bytes {
        0 => {
            if data.len() != count * 4 {
                return Err(Error::LengthMismatch {
                    expected: count * 4,
                    actual: data.len(),
                });
            }
            Ok(data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect())
        }
        b @ (1 | 2 | 4) => {
            let width = b as usize;
            if data.len() != count * width {
                return Err(Error::LengthMismatch {
                    expected: count * width,
                    actual: data.len(),
                });
            }
            Ok(data
                .chunks_exact(width)
                .map(|c| {
                    // Sign-extend the little-endian fixed-point value.
                    let mut buf = if c[width - 1] & 0x80 != 0 {
                        [0xffu8; 8]
                    } else {
                        [0u8; 8]
                    };
                    buf[..width].copy_from_slice(c);
                    i64::from_le_bytes(buf) as f32 * chunk.scale
                })
                .collect())
        }
        other => Err(Error::config(format!(
            "unsupported fixed_bytes on the wire: {other}"
        ))),
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)
        .and_then(|_| enc.finish())
        .map_err(|e| Error::Transport(format!("compress: {e}")))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Transport(format!("decompress: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        let values = vec![0.0f32, -1.5, 3.25, f32::MIN_POSITIVE];
        let chunk = encode_values(&values, 0, false).unwrap();
        assert_eq!(decode_values(&chunk).unwrap(), values);
    }

    #[test]
    fn test_compressed_round_trip() {
        let values: Vec<f32> = (0..500).map(|i| (i % 7) as f32 * 0.125).collect();
        let chunk = encode_values(&values, 0, true).unwrap();
        assert!(chunk.compressed);
        // Repetitive payloads shrink.
        assert!(chunk.data.len() < values.len() * 4);
        assert_eq!(decode_values(&chunk).unwrap(), values);
    }

    #[test]
    fn test_quantized_round_trip_within_scale() {
        for bytes in [1u32, 2, 4] {
            let values = vec![0.5f32, -0.25, 1.0, 0.0, -1.0];
            let chunk = encode_values(&values, bytes, false).unwrap();
            let back = decode_values(&chunk).unwrap();
            let tolerance = chunk.scale.max(f32::EPSILON);
            for (v, b) in values.iter().zip(&back) {
                assert!(
                    (v - b).abs() <= tolerance,
                    "{bytes} bytes: {v} -> {b} (scale {})",
                    chunk.scale
                );
            }
        }
    }

    #[test]
    fn test_quantized_all_zero() {
        let chunk = encode_values(&[0.0, 0.0, 0.0], 1, false).unwrap();
        assert_eq!(chunk.scale, 0.0);
        assert_eq!(decode_values(&chunk).unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_quantized_compressed_combo() {
        let values: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        let chunk = encode_values(&values, 2, true).unwrap();
        let back = decode_values(&chunk).unwrap();
        for (v, b) in values.iter().zip(&back) {
            assert!((v - b).abs() <= chunk.scale);
        }
    }

    #[test]
    fn test_signature_is_order_sensitive_and_stable() {
        let a = key_signature(&[1, 2, 3]);
        let b = key_signature(&[3, 2, 1]);
        assert_ne!(a, b);
        assert_eq!(a, key_signature(&[1, 2, 3]));
        assert_ne!(a, key_signature(&[1, 2]));
    }

    #[test]
    fn test_length_mismatch_detected() {
        let mut chunk = encode_values(&[1.0, 2.0], 0, false).unwrap();
        chunk.count = 3;
        assert!(matches!(
            decode_values(&chunk),
            Err(Error::LengthMismatch { .. })
        ));
    }
}
