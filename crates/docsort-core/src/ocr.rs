//! OCR 网关：本地引擎 / 云端引擎的统一接口
//!
//! - 本地：逐页调用外部 OCR 命令（stdout 即文本），只会产生 success / transient。
//! - 云端：调用时才解析后端地址与 API Key，并将提供方响应翻译为
//!   success / rateLimited / quotaExhausted / transient / auth。
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::error::OcrError;
use crate::options::EngineKind;
use crate::validate::list_page_files;

/// OCR 引擎统一接口（可跨线程共享）
pub trait OcrEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// 识别一个文件夹（一份文档）内所有页面，按页序拼接文本
    fn extract_text(&self, folder: &Path) -> Result<String, OcrError>;
}

fn folder_pages(folder: &Path) -> Result<Vec<PathBuf>, OcrError> {
    let pages = list_page_files(folder)
        .map_err(|e| OcrError::Transient(format!("cannot list pages of {}: {e}", folder.display())))?;
    if pages.is_empty() {
        return Err(OcrError::Transient(format!("no pages in {}", folder.display())));
    }
    Ok(pages)
}

/// 本地 OCR 引擎：`program args...`，参数中的 `{page}` 替换为页面路径
#[derive(Debug, Clone)]
pub struct OfflineEngine {
    pub program: String,
    pub args: Vec<String>,
}

impl OfflineEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    fn page_text(&self, page: &Path) -> Result<String, OcrError> {
        // 已是文本的页面直接读取
        if page.extension().map_or(false, |e| e.eq_ignore_ascii_case("txt")) {
            return std::fs::read_to_string(page)
                .map_err(|e| OcrError::Transient(format!("read {}: {e}", page.display())));
        }
        let page_str = page.to_string_lossy();
        let mut args: Vec<String> = self.args.iter().map(|a| a.replace("{page}", &page_str)).collect();
        if !self.args.iter().any(|a| a.contains("{page}")) { args.push(page_str.to_string()); }

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| OcrError::Transient(format!("spawn {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Transient(format!("{} exited with {}: {}", self.program, output.status, stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for OfflineEngine {
    fn default() -> Self {
        Self::new("tesseract", ["{page}", "stdout", "-l", "vie"].iter().map(|s| s.to_string()).collect())
    }
}

impl OcrEngine for OfflineEngine {
    fn kind(&self) -> EngineKind { EngineKind::Offline }

    fn extract_text(&self, folder: &Path) -> Result<String, OcrError> {
        let pages = folder_pages(folder)?;
        let mut texts = Vec::with_capacity(pages.len());
        for page in &pages {
            texts.push(self.page_text(page)?);
        }
        debug!(folder = ?folder, pages = pages.len(), "offline ocr done");
        Ok(texts.join("\n"))
    }
}

/// 云端凭据（不透明秘密，调用时解析）
pub trait Credentials: Send + Sync {
    fn backend_url(&self) -> Option<String>;
    fn api_key(&self) -> Option<String>;
}

/// 从环境变量读取 API Key，后端地址来自配置
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    pub backend_url: Option<String>,
    pub api_key_var: String,
}

impl Credentials for EnvCredentials {
    fn backend_url(&self) -> Option<String> { self.backend_url.clone() }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_var).ok().filter(|k| !k.trim().is_empty())
    }
}

/// 固定凭据（嵌入方自行管理秘密时使用）
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
}

impl Credentials for StaticCredentials {
    fn backend_url(&self) -> Option<String> { self.backend_url.clone() }
    fn api_key(&self) -> Option<String> { self.api_key.clone() }
}

/// 单页请求载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PagePayload {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

/// 发往云端的请求
#[derive(Debug, Clone, Serialize)]
pub struct CloudRequest {
    #[serde(skip)]
    pub endpoint: String,
    #[serde(skip)]
    pub api_key: String,
    pub pages: Vec<PagePayload>,
}

/// 提供方原始响应（状态码 + Retry-After + 正文）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// 云端传输层；网络错误应翻译为 `OcrError::Transient`
pub trait CloudTransport: Send + Sync {
    fn send(&self, request: &CloudRequest) -> Result<ProviderResponse, OcrError>;
}

/// 基于 reqwest 阻塞客户端的传输层
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl CloudTransport for HttpTransport {
    fn send(&self, request: &CloudRequest) -> Result<ProviderResponse, OcrError> {
        let resp = self
            .client
            .post(&request.endpoint)
            .bearer_auth(&request.api_key)
            .json(request)
            .send()
            .map_err(|e| OcrError::Transient(format!("request failed: {e}")))?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().map_err(|e| OcrError::Transient(format!("read response: {e}")))?;
        Ok(ProviderResponse { status, retry_after, body })
    }
}

/// 云端 OCR 引擎
pub struct CloudEngine {
    transport: Box<dyn CloudTransport>,
    credentials: Arc<dyn Credentials>,
}

impl CloudEngine {
    pub fn new(transport: Box<dyn CloudTransport>, credentials: Arc<dyn Credentials>) -> Self {
        Self { transport, credentials }
    }

    fn build_request(&self, folder: &Path) -> Result<CloudRequest, OcrError> {
        let endpoint = self
            .credentials
            .backend_url()
            .ok_or_else(|| OcrError::Auth("cloud backend url is not configured".to_string()))?;
        let api_key = self
            .credentials
            .api_key()
            .ok_or_else(|| OcrError::Auth("api key is not configured".to_string()))?;

        let mut pages = Vec::new();
        for page in folder_pages(folder)? {
            let bytes = std::fs::read(&page).map_err(|e| OcrError::Transient(format!("read {}: {e}", page.display())))?;
            let name = page.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            pages.push(PagePayload { mime_type: mime_for(&page).to_string(), name, data: BASE64.encode(bytes) });
        }
        Ok(CloudRequest { endpoint, api_key, pages })
    }
}

impl OcrEngine for CloudEngine {
    fn kind(&self) -> EngineKind { EngineKind::Cloud }

    fn extract_text(&self, folder: &Path) -> Result<String, OcrError> {
        let request = self.build_request(folder)?;
        let response = self.transport.send(&request)?;
        debug!(folder = ?folder, status = response.status, "cloud ocr response");
        translate_response(&response)
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// 成功响应正文：`{"text": ...}` 或 `{"pages": [{"text": ...}]}`
#[derive(Debug, Deserialize)]
struct OcrResponseBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    pages: Option<Vec<OcrPageBody>>,
}

#[derive(Debug, Deserialize)]
struct OcrPageBody {
    #[serde(default)]
    text: String,
}

/// 将提供方响应翻译为 OCR 结果
pub fn translate_response(resp: &ProviderResponse) -> Result<String, OcrError> {
    match resp.status {
        200..=299 => {
            let body: OcrResponseBody = serde_json::from_str(&resp.body)
                .map_err(|e| OcrError::Transient(format!("malformed provider response: {e}")))?;
            match (body.text, body.pages) {
                (Some(text), _) => Ok(text),
                (None, Some(pages)) => Ok(pages.into_iter().map(|p| p.text).collect::<Vec<_>>().join("\n")),
                (None, None) => Err(OcrError::Transient("provider response has no text".to_string())),
            }
        }
        402 => Err(OcrError::QuotaExhausted),
        401 | 403 if is_quota_message(&resp.body) => Err(OcrError::QuotaExhausted),
        401 | 403 => Err(OcrError::Auth(format!("provider returned {}: {}", resp.status, snippet(&resp.body)))),
        429 if is_quota_message(&resp.body) => Err(OcrError::QuotaExhausted),
        429 => Err(OcrError::RateLimited { retry_after: resp.retry_after.or_else(|| retry_hint(&resp.body)) }),
        status => Err(OcrError::Transient(format!("provider returned {status}: {}", snippet(&resp.body)))),
    }
}

fn snippet(body: &str) -> String {
    body.trim().chars().take(200).collect()
}

fn quota_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)per[ _-]?day|daily|quota[ _-]?exhausted|insufficient[ _-]?quota|exceeded your current quota").ok()
    })
    .as_ref()
}

fn minute_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)per[ _-]?minute").ok()).as_ref()
}

fn retry_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r#"(?i)"retryDelay"\s*:\s*"([0-9]+(?:\.[0-9]+)?)s""#,
            r"(?i)retry (?:in|after) ([0-9]+(?:\.[0-9]+)?)\s*s",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 每日/账单配额耗尽（每分钟限流不算）
fn is_quota_message(body: &str) -> bool {
    let quota = quota_pattern().map_or(false, |re| re.is_match(body));
    let minute = minute_pattern().map_or(false, |re| re.is_match(body));
    quota && !minute
}

/// 从提供方消息中提取重试等待时间（如 "Please retry in 37.5s"）
fn retry_hint(body: &str) -> Option<Duration> {
    retry_patterns().iter().find_map(|re| {
        let caps = re.captures(body)?;
        let secs: f64 = caps.get(1)?.as_str().parse().ok()?;
        // 超出 Duration 范围的提示直接丢弃，改用计算出的退避时间
        Duration::try_from_secs_f64(secs).ok()
    })
}
