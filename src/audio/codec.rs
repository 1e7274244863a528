//! PCM 编解码工具
//!
//! 归一化 f32 样本与 16-bit 交织 PCM 字节之间的无状态转换，以及按声道增益缩放。
//!
//! 转换一律截断（向零取整），不做舍入：格式敏感的下游需要逐位一致。

use thiserror::Error;

/// 16-bit 有符号最大值，作为归一化缩放系数
const PCM_SCALE: f32 = i16::MAX as f32;

/// 一个立体声 16-bit 帧的字节数
const STEREO_FRAME_BYTES: usize = 4;

/// 编解码参数错误
///
/// 属于调用约定违规，而不是运行时状况
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// 将归一化样本转换为 little-endian 16-bit PCM
///
/// 要求 `dst.len() == 2 * src.len()`。每个样本乘以 `i16::MAX` 后截断。
/// 超出 [-1, 1] 的输入在 i16 边界饱和，调用方应先 clamp。
pub fn normalized_to_device_bytes(dst: &mut [u8], src: &[f32]) -> Result<(), CodecError> {
    if dst.len() != 2 * src.len() {
        return Err(CodecError::InvalidArgument(format!(
            "destination holds {} bytes, expected {} for {} samples",
            dst.len(),
            2 * src.len(),
            src.len()
        )));
    }

    for (chunk, &sample) in dst.chunks_exact_mut(2).zip(src) {
        // `as` 向零截断
        let val = (sample * PCM_SCALE) as i16;
        chunk.copy_from_slice(&val.to_le_bytes());
    }
    Ok(())
}

/// `normalized_to_device_bytes` 的逆变换
///
/// 要求 `src.len() == 2 * dst.len()`
pub fn device_bytes_to_normalized(dst: &mut [f32], src: &[u8]) -> Result<(), CodecError> {
    if src.len() != 2 * dst.len() {
        return Err(CodecError::InvalidArgument(format!(
            "source holds {} bytes, expected {} for {} samples",
            src.len(),
            2 * dst.len(),
            dst.len()
        )));
    }

    for (sample, chunk) in dst.iter_mut().zip(src.chunks_exact(2)) {
        let val = i16::from_le_bytes([chunk[0], chunk[1]]);
        *sample = val as f32 / PCM_SCALE;
    }
    Ok(())
}

/// 按声道增益原地缩放 16-bit 立体声 PCM
///
/// 以 4 字节立体声帧为单位处理 `samples[offset..offset + length]`。
/// 每个声道样本按高字节在前组装，乘以对应增益后截断、饱和到 i16，
/// 再以高字节在前写回。
pub fn adjust_volume(
    samples: &mut [u8],
    offset: usize,
    length: usize,
    left_gain: f64,
    right_gain: f64,
) -> Result<(), CodecError> {
    let end = offset
        .checked_add(length)
        .filter(|&end| end <= samples.len())
        .ok_or_else(|| {
            CodecError::InvalidArgument(format!(
                "range {}+{} exceeds buffer of {} bytes",
                offset,
                length,
                samples.len()
            ))
        })?;
    if length % STEREO_FRAME_BYTES != 0 {
        return Err(CodecError::InvalidArgument(format!(
            "length {} is not a whole number of stereo frames",
            length
        )));
    }

    for frame in samples[offset..end].chunks_exact_mut(STEREO_FRAME_BYTES) {
        scale_be_sample(&mut frame[0..2], left_gain);
        scale_be_sample(&mut frame[2..4], right_gain);
    }
    Ok(())
}

#[inline]
fn scale_be_sample(bytes: &mut [u8], gain: f64) {
    let sample = i16::from_be_bytes([bytes[0], bytes[1]]);
    // f64 → i16 的 `as` 截断并饱和
    let scaled = (sample as f64 * gain) as i16;
    bytes.copy_from_slice(&scaled.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_mismatch_rejected() {
        let src = [0.0f32; 4];
        let mut dst = [0u8; 7];
        assert!(matches!(
            normalized_to_device_bytes(&mut dst, &src),
            Err(CodecError::InvalidArgument(_))
        ));

        let mut back = [0.0f32; 3];
        assert!(device_bytes_to_normalized(&mut back, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_full_scale_values() {
        let src = [1.0f32, -1.0, 0.0, 0.5];
        let mut dst = [0u8; 8];
        normalized_to_device_bytes(&mut dst, &src).unwrap();

        assert_eq!(i16::from_le_bytes([dst[0], dst[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([dst[2], dst[3]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([dst[4], dst[5]]), 0);
        // 0.5 * 32767 = 16383.5 → 截断为 16383
        assert_eq!(i16::from_le_bytes([dst[6], dst[7]]), 16383);
    }

    #[test]
    fn test_truncation_toward_zero() {
        // -0.5 * 32767 = -16383.5 → -16383（不是 -16384）
        let src = [-0.5f32];
        let mut dst = [0u8; 2];
        normalized_to_device_bytes(&mut dst, &src).unwrap();
        assert_eq!(i16::from_le_bytes([dst[0], dst[1]]), -16383);
    }

    #[test]
    fn test_roundtrip_within_one_lsb() {
        let lsb = 1.0 / PCM_SCALE;
        let src: Vec<f32> = (0..=2000).map(|i| i as f32 / 1000.0 - 1.0).collect();
        let mut bytes = vec![0u8; src.len() * 2];
        normalized_to_device_bytes(&mut bytes, &src).unwrap();

        let mut back = vec![0.0f32; src.len()];
        device_bytes_to_normalized(&mut back, &bytes).unwrap();

        for (orig, decoded) in src.iter().zip(&back) {
            assert!(
                (orig - decoded).abs() <= lsb * 1.0001,
                "{} decoded as {}",
                orig,
                decoded
            );
            // 截断：幅度只会变小
            assert!(decoded.abs() <= orig.abs() + f32::EPSILON);
        }
    }

    #[test]
    fn test_adjust_volume_per_channel() {
        // 一个立体声帧：L = 1000, R = -2000，高字节在前
        let mut frame = Vec::new();
        frame.extend_from_slice(&1000i16.to_be_bytes());
        frame.extend_from_slice(&(-2000i16).to_be_bytes());

        adjust_volume(&mut frame, 0, 4, 0.5, 0.25).unwrap();

        assert_eq!(i16::from_be_bytes([frame[0], frame[1]]), 500);
        assert_eq!(i16::from_be_bytes([frame[2], frame[3]]), -500);
    }

    #[test]
    fn test_adjust_volume_saturates_and_respects_range() {
        let mut buf = Vec::new();
        for _ in 0..3 {
            buf.extend_from_slice(&20000i16.to_be_bytes());
            buf.extend_from_slice(&(-20000i16).to_be_bytes());
        }

        // 只处理中间一帧
        adjust_volume(&mut buf, 4, 4, 2.0, 2.0).unwrap();

        assert_eq!(i16::from_be_bytes([buf[0], buf[1]]), 20000);
        assert_eq!(i16::from_be_bytes([buf[4], buf[5]]), i16::MAX);
        assert_eq!(i16::from_be_bytes([buf[6], buf[7]]), i16::MIN);
        assert_eq!(i16::from_be_bytes([buf[8], buf[9]]), 20000);
    }

    #[test]
    fn test_adjust_volume_invalid_ranges() {
        let mut buf = [0u8; 8];
        assert!(adjust_volume(&mut buf, 4, 8, 1.0, 1.0).is_err());
        assert!(adjust_volume(&mut buf, 0, 6, 1.0, 1.0).is_err());
        assert!(adjust_volume(&mut buf, usize::MAX, 4, 1.0, 1.0).is_err());
    }
}
