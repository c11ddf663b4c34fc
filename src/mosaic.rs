use crate::config::{AppConfig, LayoutStyle, OutputConfig};
use crate::error::StreamError;

/// 画面最多四宫格，多余的频道直接丢弃
pub const MAX_INPUTS: usize = 4;

/// 视频编码器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoder {
    Software,
    /// Intel QuickSync
    QuickSync,
}

impl VideoEncoder {
    pub fn codec(self) -> &'static str {
        match self {
            VideoEncoder::Software => "libx264",
            VideoEncoder::QuickSync => "h264_qsv",
        }
    }

    pub fn preset(self) -> &'static str {
        match self {
            VideoEncoder::Software => "fast",
            VideoEncoder::QuickSync => "medium",
        }
    }
}

/// 画面格位置，按 左上 / 右上 / 左下 / 右下 的顺序填充
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

const CELLS: [Cell; MAX_INPUTS] = [
    Cell::TopLeft,
    Cell::TopRight,
    Cell::BottomLeft,
    Cell::BottomRight,
];

impl Cell {
    /// xstack 的 layout 表达式
    fn xstack_position(self) -> &'static str {
        match self {
            Cell::TopLeft => "0_0",
            Cell::TopRight => "w0_0",
            Cell::BottomLeft => "0_h0",
            Cell::BottomRight => "w0_h0",
        }
    }

    /// overlay 的像素偏移
    fn offset(self, cell_width: u32, cell_height: u32) -> (u32, u32) {
        match self {
            Cell::TopLeft => (0, 0),
            Cell::TopRight => (cell_width, 0),
            Cell::BottomLeft => (0, cell_height),
            Cell::BottomRight => (cell_width, cell_height),
        }
    }
}

/// 由输入数量决定的画面布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MosaicLayout {
    pub cells: Vec<Cell>,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl MosaicLayout {
    pub fn new(inputs: usize, width: u32, height: u32, style: LayoutStyle) -> Self {
        let inputs = inputs.clamp(1, MAX_INPUTS);
        // 背景画布上的单路画面铺满整帧，其余情况均为四分之一格
        let (cell_width, cell_height) = if inputs == 1 && style == LayoutStyle::Overlay {
            (width, height)
        } else {
            (width / 2, height / 2)
        };
        Self {
            cells: CELLS[..inputs].to_vec(),
            cell_width,
            cell_height,
        }
    }
}

/// 一次推流所需的全部转码参数
#[derive(Debug, Clone)]
pub struct TranscodeProfile {
    pub ffmpeg_binary: String,
    pub url_template: String,
    pub dvr_host: String,
    pub dvr_port: u16,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub layout: LayoutStyle,
    pub background: Option<String>,
    pub encoder: VideoEncoder,
    pub sink: OutputConfig,
}

impl TranscodeProfile {
    pub fn from_config(config: &AppConfig, encoder: VideoEncoder) -> Self {
        Self {
            ffmpeg_binary: config.server.ffmpeg_binary.clone(),
            url_template: config.dvr.channel_url_template.clone(),
            dvr_host: config.dvr.host.clone(),
            dvr_port: config.dvr.port,
            width: config.mosaic.width,
            height: config.mosaic.height,
            fps: config.mosaic.fps,
            video_bitrate: config.mosaic.video_bitrate.clone(),
            audio_bitrate: config.mosaic.audio_bitrate.clone(),
            layout: config.mosaic.layout,
            background: config.mosaic.background.clone(),
            encoder,
            sink: config.output.clone(),
        }
    }

    pub fn channel_url(&self, channel: &str) -> String {
        self.url_template
            .replace("{host}", &self.dvr_host)
            .replace("{port}", &self.dvr_port.to_string())
            .replace("{channel}", channel)
    }
}

/// 构建完成的转码命令，构建后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct TranscoderCommand {
    program: String,
    args: Vec<String>,
    channels: Vec<String>,
    sink: OutputConfig,
}

impl TranscoderCommand {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        channels: Vec<String>,
        sink: OutputConfig,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            channels,
            sink,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn sink(&self) -> &OutputConfig {
        &self.sink
    }

    pub fn filter_graph(&self) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == "-filter_complex")
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// 按 输入 -> 滤镜 -> 输出 三个阶段拼装 ffmpeg 参数
struct MosaicBuilder<'a> {
    profile: &'a TranscodeProfile,
    channels: &'a [String],
    layout: MosaicLayout,
    args: Vec<String>,
}

impl<'a> MosaicBuilder<'a> {
    fn push<S: Into<String>>(&mut self, items: impl IntoIterator<Item = S>) {
        self.args.extend(items.into_iter().map(Into::into));
    }

    fn input_stage(&mut self) {
        let profile = self.profile;
        // hwupload 需要一个硬件设备，必须在第一个 -i 之前声明
        if profile.encoder == VideoEncoder::QuickSync {
            self.push(["-init_hw_device", "qsv=hw", "-filter_hw_device", "hw"]);
        }
        for ch in self.channels {
            self.push(["-i".to_string(), profile.channel_url(ch)]);
        }

        // overlay 布局的背景输入排在所有频道之后
        if profile.layout == LayoutStyle::Overlay {
            match &profile.background {
                Some(image) => {
                    self.push(["-loop", "1", "-i", image.as_str()]);
                }
                None => {
                    let canvas = format!(
                        "color=c=black:s={}x{}:r={}",
                        profile.width, profile.height, profile.fps
                    );
                    self.push(["-f".to_string(), "lavfi".into(), "-i".into(), canvas]);
                }
            }
        }
    }

    fn filter_stage(&mut self) {
        let p = self.profile;
        let layout = &self.layout;
        let mut parts: Vec<String> = (0..layout.cells.len())
            .map(|i| {
                format!(
                    "[{i}:v]fps={},scale={}:{},setsar=1[v{i}]",
                    p.fps, layout.cell_width, layout.cell_height
                )
            })
            .collect();

        let composite_out = match p.encoder {
            VideoEncoder::Software => "v",
            VideoEncoder::QuickSync => "mosaic",
        };

        match p.layout {
            LayoutStyle::Grid => parts.push(grid_expression(layout, p, composite_out)),
            LayoutStyle::Overlay => parts.extend(overlay_chain(layout, p, composite_out)),
        }

        if p.encoder == VideoEncoder::QuickSync {
            parts.push(format!(
                "[{composite_out}]hwupload=extra_hw_frames=64,format=qsv[v]"
            ));
        }

        self.push([
            "-filter_complex".to_string(),
            parts.join(";"),
            "-map".into(),
            "[v]".into(),
        ]);
    }

    fn output_stage(&mut self) {
        let channels = self.channels;
        for (i, ch) in channels.iter().enumerate() {
            self.push([
                "-map".to_string(),
                format!("{i}:a:0"),
                format!("-metadata:s:a:{i}"),
                format!("title=Ch {ch} Audio"),
            ]);
        }

        let p = self.profile;
        let encoder = p.encoder;
        let params = [
            "-c:v".to_string(),
            encoder.codec().into(),
            "-b:v".into(),
            p.video_bitrate.clone(),
            "-preset".into(),
            encoder.preset().into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            p.audio_bitrate.clone(),
            "-f".into(),
            "mpegts".into(),
            p.sink.target(),
        ];
        self.push(params);
    }
}

fn grid_expression(layout: &MosaicLayout, p: &TranscodeProfile, out: &str) -> String {
    let n = layout.cells.len();
    let labels: String = (0..n).map(|i| format!("[v{i}]")).collect();
    if n == 1 {
        // xstack 至少需要两路输入，单路时用 pad 放到左上格
        return format!("{labels}pad={}:{}:0:0[{out}]", p.width, p.height);
    }
    let positions: Vec<&str> = layout.cells.iter().map(|c| c.xstack_position()).collect();
    format!(
        "{labels}xstack=inputs={n}:layout={}[{out}]",
        positions.join("|")
    )
}

fn overlay_chain(layout: &MosaicLayout, p: &TranscodeProfile, out: &str) -> Vec<String> {
    let n = layout.cells.len();
    let mut parts = vec![format!(
        "[{n}:v]scale={}:{},fps={},setsar=1[bg]",
        p.width, p.height, p.fps
    )];
    let mut base = "bg".to_string();
    for (i, cell) in layout.cells.iter().enumerate() {
        let (x, y) = cell.offset(layout.cell_width, layout.cell_height);
        let next = if i + 1 == n {
            out.to_string()
        } else {
            format!("o{i}")
        };
        parts.push(format!("[{base}][v{i}]overlay={x}:{y}:shortest=1[{next}]"));
        base = next;
    }
    parts
}

/// 根据频道列表构建 ffmpeg 命令
///
/// 空白频道号会被忽略；超过四路时只取前四路。
pub fn build_command(
    profile: &TranscodeProfile,
    channels: &[String],
) -> Result<TranscoderCommand, StreamError> {
    let channels: Vec<String> = channels
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .take(MAX_INPUTS)
        .map(str::to_string)
        .collect();
    if channels.is_empty() {
        return Err(StreamError::NoChannels);
    }

    let mut builder = MosaicBuilder {
        profile,
        channels: &channels,
        layout: MosaicLayout::new(channels.len(), profile.width, profile.height, profile.layout),
        args: ["-hide_banner", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect(),
    };
    builder.input_stage();
    builder.filter_stage();
    builder.output_stage();
    let args = builder.args;

    Ok(TranscoderCommand::new(
        profile.ffmpeg_binary.clone(),
        args,
        channels,
        profile.sink.clone(),
    ))
}
