use crate::error::StreamError;
use crate::mosaic::TranscoderCommand;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 进程终止策略：先发送 SIGTERM，超时后强制 SIGKILL
#[derive(Debug, Clone, Copy)]
pub struct TerminationPolicy {
    pub term_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// 当前唯一的转码进程
struct ActiveStream {
    /// FFmpeg 子进程句柄
    process: Child,
    pid: Option<u32>,
    /// 每次启动递增，用于识别过期的看门狗和转发任务
    generation: u64,
    channels: Vec<String>,
    started_at: Instant,
    /// 流结束时取消，通知附属任务退出
    cancel: CancellationToken,
}

/// start 返回给调用方的句柄
pub struct StartedStream {
    pub generation: u64,
    pub pid: Option<u32>,
    /// 仅 pipe 输出时存在
    pub stdout: Option<ChildStdout>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped {
        pid: Option<u32>,
        channels: Vec<String>,
    },
    /// 进程在 stop 之前已自行退出，只做了回收
    Exited {
        pid: Option<u32>,
        channels: Vec<String>,
        status: String,
    },
    NothingToStop,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub pid: Option<u32>,
    pub generation: u64,
    pub channels: Vec<String>,
    pub uptime_seconds: u64,
    /// 进程已自行退出时的退出状态，仍在运行时为空
    pub exit_status: Option<String>,
}

impl StreamStatus {
    pub fn is_running(&self) -> bool {
        self.exit_status.is_none()
    }
}

/// 转码进程管理器
///
/// 所有对活动流的读写都经过同一把异步锁，终止旧进程的等待也在锁内完成，
/// 因此并发的 start / stop 不会留下两个进程。
pub struct Engine {
    slot: Mutex<Option<ActiveStream>>,
    next_generation: AtomicU64,
    policy: TerminationPolicy,
    /// 0 表示不检查
    min_free_memory_kb: u64,
}

impl Engine {
    pub fn new(policy: TerminationPolicy, min_free_memory_kb: u64) -> Self {
        Self {
            slot: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            policy,
            min_free_memory_kb,
        }
    }

    /// 启动新的转码进程，已有的进程会先被完全终止
    ///
    /// # 错误处理
    /// - 内存不足时返回错误
    /// - FFmpeg 启动失败时返回错误，此时不存在活动流
    pub async fn start(&self, command: &TranscoderCommand) -> Result<StartedStream, StreamError> {
        let mut slot = self.slot.lock().await;

        // 1. 终止旧进程 (回收后才允许启动新进程)
        if let Some(previous) = slot.take() {
            info!(
                "Replacing transcoder [{}] (channels: {})",
                pid_label(previous.pid),
                previous.channels.join(", ")
            );
            terminate(previous, self.policy).await;
        }

        // 2. 检查系统内存是否足够
        check_memory(self.min_free_memory_kb)?;

        // 3. 启动子进程
        let mut cmd = Command::new(command.program());
        cmd.args(command.args());
        cmd.stdin(Stdio::null());
        cmd.stdout(if command.sink().is_pipe() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn transcoder {}: {}", command.program(), e);
            StreamError::Launch {
                program: command.program().to_string(),
                source: e,
            }
        })?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, pid));
        }
        let stdout = child.stdout.take();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        info!(
            "Transcoder [{}] started for channels: {}",
            pid_label(pid),
            command.channels().join(", ")
        );

        // 4. 登记为新的活动流
        *slot = Some(ActiveStream {
            process: child,
            pid,
            generation,
            channels: command.channels().to_vec(),
            started_at: Instant::now(),
            cancel: cancel.clone(),
        });

        Ok(StartedStream {
            generation,
            pid,
            stdout,
            cancel,
        })
    }

    /// 停止当前活动流，没有活动流时返回 NothingToStop
    pub async fn stop(&self) -> StopOutcome {
        self.stop_matching(None).await
    }

    /// 仅当活动流仍是指定的那一代时才停止
    pub async fn stop_generation(&self, generation: u64) -> StopOutcome {
        self.stop_matching(Some(generation)).await
    }

    async fn stop_matching(&self, generation: Option<u64>) -> StopOutcome {
        let mut slot = self.slot.lock().await;
        let stream = match slot.take() {
            Some(s) if generation.map_or(true, |g| g == s.generation) => s,
            other => {
                *slot = other;
                return StopOutcome::NothingToStop;
            }
        };

        let pid = stream.pid;
        let channels = stream.channels.clone();
        match terminate(stream, self.policy).await {
            Some(status) => StopOutcome::Exited {
                pid,
                channels,
                status,
            },
            None => {
                info!("Transcoder [{}] stopped.", pid_label(pid));
                StopOutcome::Stopped { pid, channels }
            }
        }
    }

    pub async fn is_current(&self, generation: u64) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    /// 推流到 UDP / 文件时没有读取方，进程自行退出只能在这里发现
    pub async fn status(&self) -> Option<StreamStatus> {
        let mut slot = self.slot.lock().await;
        let s = slot.as_mut()?;
        let exit_status = match s.process.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => {
                warn!("Transcoder [{}] status check failed: {}", pid_label(s.pid), e);
                None
            }
        };
        Some(StreamStatus {
            pid: s.pid,
            generation: s.generation,
            channels: s.channels.clone(),
            uptime_seconds: s.started_at.elapsed().as_secs(),
            exit_status,
        })
    }
}

fn pid_label(pid: Option<u32>) -> String {
    match pid {
        Some(pid) => format!("pid {}", pid),
        None => "pid ?".to_string(),
    }
}

fn check_memory(min_free_kb: u64) -> Result<(), StreamError> {
    if min_free_kb == 0 {
        return Ok(());
    }
    match sys_info::mem_info() {
        Ok(mem) if mem.avail < min_free_kb => Err(StreamError::InsufficientMemory {
            available_kb: mem.avail,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            // 无法获取内存信息时只记录警告，不阻断启动
            warn!("Failed to check memory usage: {}", e);
            Ok(())
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!("Transcoder [{}]: {}", pid_label(pid), line),
            Ok(None) => break,
            Err(e) => {
                warn!("Transcoder [{}] stderr read failed: {}", pid_label(pid), e);
                break;
            }
        }
    }
}

/// 两阶段终止：SIGTERM -> 等待 -> SIGKILL -> 等待
///
/// 任何失败都只记录日志，调用后一律视为已停止。
/// 进程此前已自行退出时返回其退出状态。
async fn terminate(mut stream: ActiveStream, policy: TerminationPolicy) -> Option<String> {
    stream.cancel.cancel();
    let label = pid_label(stream.pid);

    match stream.process.try_wait() {
        Ok(Some(status)) => {
            info!("Transcoder [{}] already exited with: {}", label, status);
            return Some(status.to_string());
        }
        Ok(None) => {}
        Err(e) => warn!("Transcoder [{}] status check failed: {}", label, e),
    }

    info!("Terminating transcoder [{}]", label);
    send_terminate(&mut stream.process);

    match timeout(policy.term_grace, stream.process.wait()).await {
        Ok(Ok(status)) => {
            info!("Transcoder [{}] terminated ({})", label, status);
            return None;
        }
        Ok(Err(e)) => {
            warn!("Error waiting for transcoder [{}]: {}", label, e);
            return None;
        }
        Err(_) => warn!(
            "Transcoder [{}] did not terminate gracefully, forcing kill",
            label
        ),
    }

    if let Err(e) = stream.process.start_kill() {
        warn!("Failed to kill transcoder [{}]: {}", label, e);
    }
    match timeout(policy.kill_grace, stream.process.wait()).await {
        Ok(Ok(status)) => info!("Transcoder [{}] killed ({})", label, status),
        Ok(Err(e)) => warn!("Error waiting for transcoder [{}]: {}", label, e),
        Err(_) => error!("Transcoder [{}] still running after SIGKILL", label),
    }
    None
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // 子进程尚未回收，pid 不会被复用
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("SIGTERM to [pid {}] failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop transcoder: {}", e);
    }
}
