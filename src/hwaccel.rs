use crate::config::HwAccelMode;
use crate::mosaic::VideoEncoder;
use std::path::Path;
use tokio::process::Command;
use tracing::{error, info};

/// 检测 Intel QuickSync H.264 编码能力
///
/// 需要 /dev/dri 存在且 vainfo 输出同时包含 VAEntrypointEncSlice 和 H.264
pub async fn detect_quick_sync() -> bool {
    if !Path::new("/dev/dri").exists() {
        error!("No /dev/dri found, QSV unavailable");
        return false;
    }

    match Command::new("vainfo").output().await {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if supports_h264_encode(&stdout) {
                info!("Intel QuickSync H.264 encoding detected");
                return true;
            }
            error!("vainfo reports no QSV H.264 support: {}", stdout.trim());
            false
        }
        Ok(output) => {
            error!(
                "vainfo failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            error!("Error running vainfo: {}", e);
            false
        }
    }
}

fn supports_h264_encode(vainfo: &str) -> bool {
    vainfo.contains("VAEntrypointEncSlice") && vainfo.contains("H.264")
}

/// 根据配置选择视频编码器
pub async fn select_encoder(mode: HwAccelMode) -> VideoEncoder {
    let encoder = match mode {
        HwAccelMode::On => VideoEncoder::QuickSync,
        HwAccelMode::Off => VideoEncoder::Software,
        HwAccelMode::Auto if detect_quick_sync().await => VideoEncoder::QuickSync,
        HwAccelMode::Auto => VideoEncoder::Software,
    };
    info!("Using video codec: {}", encoder.codec());
    encoder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vainfo_output_matching() {
        let ok = "VAProfileH264Main : VAEntrypointEncSlice\nH.264 encoder";
        assert!(supports_h264_encode(ok));
        assert!(!supports_h264_encode("VAProfileH264Main : VAEntrypointVLD"));
        assert!(!supports_h264_encode("VAProfileHEVCMain : VAEntrypointEncSlice"));
    }

    #[tokio::test]
    async fn forced_modes_skip_detection() {
        assert_eq!(select_encoder(HwAccelMode::On).await, VideoEncoder::QuickSync);
        assert_eq!(select_encoder(HwAccelMode::Off).await, VideoEncoder::Software);
    }
}
