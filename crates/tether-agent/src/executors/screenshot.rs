use crate::error::CommandError;
use crate::executor::{ExecutionContext, Executor};
use crate::process;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_JPEG_QUALITY: u8 = 85;

/// A full virtual-screen raster
pub type CapturedImage = DynamicImage;

/// Screen capture backend
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Capture the screen; must stop promptly when `cancel` fires
    async fn capture(&self, cancel: &CancellationToken) -> Result<CapturedImage, CommandError>;
}

/// Captures the screen by running the platform capture tool
///
/// macOS uses `screencapture`, Wayland `grim`, X11 `import` and Windows
/// PowerShell. A host with no display or no tool reports
/// [`CommandError::CapabilityUnavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCapture;

#[async_trait]
impl ScreenCapture for CommandCapture {
    async fn capture(&self, cancel: &CancellationToken) -> Result<CapturedImage, CommandError> {
        let file = tempfile::Builder::new()
            .prefix("tether-capture-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| CommandError::Execution(format!("Failed to create capture file: {}", e)))?;

        let (program, args) = capture_tool(file.path())?;
        run_tool(&program, &args, cancel).await?;

        tokio::task::spawn_blocking(move || {
            let decoded = image::open(file.path());
            drop(file);
            decoded
        })
        .await
        .map_err(|e| CommandError::Execution(format!("Capture decode task failed: {}", e)))?
        .map_err(|e| CommandError::Execution(format!("Failed to decode capture: {}", e)))
    }
}

#[cfg(target_os = "macos")]
fn capture_tool(path: &Path) -> Result<(String, Vec<String>), CommandError> {
    Ok((
        "screencapture".to_string(),
        vec!["-x".into(), "-t".into(), "png".into(), path.display().to_string()],
    ))
}

#[cfg(windows)]
fn capture_tool(path: &Path) -> Result<(String, Vec<String>), CommandError> {
    let script = format!(
        "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
         $b = [System.Windows.Forms.SystemInformation]::VirtualScreen; \
         $bmp = New-Object System.Drawing.Bitmap $b.Width, $b.Height; \
         $g = [System.Drawing.Graphics]::FromImage($bmp); \
         $g.CopyFromScreen($b.Left, $b.Top, 0, 0, $bmp.Size); \
         $bmp.Save('{}', [System.Drawing.Imaging.ImageFormat]::Png)",
        path.display()
    );
    Ok((
        "powershell".to_string(),
        vec!["-NoProfile".into(), "-NonInteractive".into(), "-Command".into(), script],
    ))
}

#[cfg(not(any(target_os = "macos", windows)))]
fn capture_tool(path: &Path) -> Result<(String, Vec<String>), CommandError> {
    let wayland = std::env::var_os("WAYLAND_DISPLAY").is_some();
    let x11 = std::env::var_os("DISPLAY").is_some();
    let target = path.display().to_string();
    match select_unix_tool(wayland, x11) {
        Some("grim") => Ok(("grim".to_string(), vec![target])),
        Some(tool) => Ok((tool.to_string(), vec!["-window".into(), "root".into(), target])),
        None => Err(CommandError::CapabilityUnavailable(
            "no display available for screen capture".to_string(),
        )),
    }
}

#[cfg(not(any(target_os = "macos", windows)))]
fn select_unix_tool(wayland: bool, x11: bool) -> Option<&'static str> {
    if wayland {
        Some("grim")
    } else if x11 {
        Some("import")
    } else {
        None
    }
}

async fn run_tool(program: &str, args: &[String], cancel: &CancellationToken) -> Result<(), CommandError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    process::isolate(&mut command);

    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            CommandError::CapabilityUnavailable(format!("capture tool '{}' not installed", program))
        }
        _ => CommandError::Execution(format!("Failed to start {}: {}", program, e)),
    })?;
    let pid = child.id();

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let Some(status) = status else {
        process::kill_tree(&mut child, pid).await;
        return Err(CommandError::Cancelled);
    };

    let status =
        status.map_err(|e| CommandError::Execution(format!("Failed to wait for {}: {}", program, e)))?;
    if !status.success() {
        return Err(CommandError::CapabilityUnavailable(format!(
            "{} exited with {}",
            program, status
        )));
    }
    debug!("{} captured the screen", program);
    Ok(())
}

/// Captures the screen and returns it base64-encoded as PNG or JPEG
#[derive(Clone)]
pub struct ScreenshotExecutor {
    backend: Arc<dyn ScreenCapture>,
}

impl Default for ScreenshotExecutor {
    fn default() -> Self {
        Self::with_backend(CommandCapture)
    }
}

impl ScreenshotExecutor {
    /// Use a custom capture backend
    pub fn with_backend(backend: impl ScreenCapture + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }
}

impl std::fmt::Debug for ScreenshotExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenshotExecutor").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ScreenshotParams {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    quality: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Png,
    Jpeg { quality: u8 },
}

impl Encoding {
    fn name(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg { .. } => "jpeg",
        }
    }
}

impl TryFrom<ScreenshotParams> for Encoding {
    type Error = CommandError;

    fn try_from(params: ScreenshotParams) -> Result<Self, Self::Error> {
        let quality = match params.quality {
            None => DEFAULT_JPEG_QUALITY,
            Some(q) => u8::try_from(q)
                .ok()
                .filter(|q| (1..=100).contains(q))
                .ok_or_else(|| {
                    CommandError::InvalidParams(format!("quality must be between 1 and 100, got {}", q))
                })?,
        };

        let format = params.format.unwrap_or_else(|| "png".to_string());
        match format.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg { quality }),
            other => Err(CommandError::InvalidParams(format!(
                "unsupported image format '{}', expected png or jpeg",
                other
            ))),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotOutput {
    image_base64: String,
    width: u32,
    height: u32,
    format: &'static str,
    size_bytes: usize,
}

fn encode(image: &CapturedImage, encoding: Encoding) -> Result<Vec<u8>, CommandError> {
    let mut bytes = Vec::new();
    let result = match encoding {
        Encoding::Png => image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png),
        Encoding::Jpeg { quality } => {
            JpegEncoder::new_with_quality(&mut bytes, quality).encode_image(&image.to_rgb8())
        }
    };
    result.map_err(|e| CommandError::Execution(format!("Failed to encode {}: {}", encoding.name(), e)))?;
    Ok(bytes)
}

#[async_trait]
impl Executor for ScreenshotExecutor {
    async fn execute(&self, params: Value, ctx: ExecutionContext) -> Result<Value, CommandError> {
        let params: ScreenshotParams = serde_json::from_value(params)?;
        let encoding = Encoding::try_from(params)?;

        let image = self.backend.capture(&ctx.cancel).await?;
        let (width, height) = (image.width(), image.height());

        let bytes = tokio::task::spawn_blocking(move || encode(&image, encoding))
            .await
            .map_err(|e| CommandError::Execution(format!("Encode task failed: {}", e)))??;
        debug!(
            "Encoded screenshot for command {}: {}x{} {} ({} bytes)",
            ctx.command_id,
            width,
            height,
            encoding.name(),
            bytes.len()
        );

        let output = ScreenshotOutput {
            image_base64: STANDARD.encode(&bytes),
            width,
            height,
            format: encoding.name(),
            size_bytes: bytes.len(),
        };
        Ok(serde_json::to_value(output)?)
    }
}
