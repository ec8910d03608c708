//! 请求/响应文本帧
//!
//! 一个连接只承载一个请求：请求行 + 请求头 + 由 Content-Length 决定长度的请求体，
//! 响应写完后关闭连接。

use crate::core::file_state::{wire, FileKey};
use crate::error::{Result, SyncError};
use crate::storage::{ByteStream, CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_END: &[u8] = b"\r\n\r\n";

/// 路由
pub mod route {
    pub const REGISTER: &str = "/register";
    pub const PING: &str = "/ping";
    pub const SYNC_LIST: &str = "/sync-list";
    pub const UPLOAD: &str = "/upload";
    pub const DOWNLOAD: &str = "/download";
    pub const DELETE: &str = "/delete";
    pub const NOTIFY: &str = "/notify";
}

/// 协议头
pub mod header {
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONNECTION: &str = "Connection";
    pub const FILE_PATH: &str = "X-File-Path";
    pub const FILE_VERSION: &str = "X-File-Version";
    pub const FILE_TYPE: &str = "X-File-Type";
    pub const FILE_ROOT_INDEX: &str = "X-File-Root-Index";
    pub const SYNC_MODE: &str = "X-Sync-Mode";
}

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const APPLICATION_JSON: &str = "application/json";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// 请求头集合，名称大小写不敏感，保留插入顺序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        let value = value.to_string();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 缺省为 0
    pub fn content_length(&self) -> Result<usize> {
        match self.get(header::CONTENT_LENGTH) {
            None => Ok(0),
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| SyncError::protocol(format!("无效的 Content-Length: {}", v))),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            // 由编码函数统一写入
            if name.eq_ignore_ascii_case(header::CONTENT_LENGTH)
                || name.eq_ignore_ascii_case(header::CONNECTION)
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SyncError::protocol(format!("无效的请求头: {}", line)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::protocol(format!("无效的请求头: {}", line)));
        }
        self.insert(name, value.trim());
        Ok(())
    }
}

/// 查找头部结束位置
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
}

/// 缓冲区中已有完整头部时将其切出（含结束符），剩余部分留作消息体
pub fn split_head(buf: &mut BytesMut, max_header_bytes: usize) -> Result<Option<Bytes>> {
    match find_header_end(buf) {
        Some(pos) => Ok(Some(buf.split_to(pos + HEADER_END.len()).freeze())),
        None if buf.len() > max_header_bytes => Err(SyncError::protocol(format!(
            "请求头超过 {} 字节",
            max_header_bytes
        ))),
        None => Ok(None),
    }
}

/// 拆分首行与请求头
fn parse_head_lines(head: &[u8]) -> Result<(String, Headers)> {
    let text = std::str::from_utf8(head).map_err(|_| SyncError::protocol("请求头不是有效的 UTF-8"))?;
    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| SyncError::protocol("缺少请求行"))?;

    let mut headers = Headers::new();
    for line in lines.filter(|l| !l.is_empty()) {
        headers.parse_line(line)?;
    }
    Ok((first.to_string(), headers))
}

fn decode_component(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|_| SyncError::protocol(format!("无效的 URL 编码: {}", raw)))
}

/// 头部中的路径以 URL 编码传输
pub fn encode_path_header(path: &str) -> String {
    urlencoding::encode(path).into_owned()
}

pub fn decode_path_header(raw: &str) -> Result<String> {
    decode_component(raw)
}

/// 请求
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query: BTreeMap::new(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: &str) -> Self {
        Self::new("POST", path)
    }

    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>, content_type: &str) -> Self {
        self.body = body.into();
        self.headers.insert(header::CONTENT_TYPE, content_type);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// 请求目标（路径 + 查询串）
    pub fn target(&self) -> String {
        let mut target = self.path.clone();
        let mut sep = '?';
        for (name, value) in &self.query {
            target.push(sep);
            target.push_str(&urlencoding::encode(name));
            target.push('=');
            target.push_str(&urlencoding::encode(value));
            sep = '&';
        }
        target
    }

    pub fn encode_head(&self, content_length: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.target()).as_bytes());
        out.extend_from_slice(b"Host: peersync\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(format!("Content-Length: {}\r\n", content_length).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_head(self.body.len() as u64);
        out.extend_from_slice(&self.body);
        out
    }

    /// 解析请求行与请求头，消息体为空
    pub fn parse_head(head: &[u8]) -> Result<Self> {
        let (line, headers) = parse_head_lines(head)?;
        let mut parts = line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| SyncError::protocol("缺少请求方法"))?;
        let target = parts
            .next()
            .ok_or_else(|| SyncError::protocol(format!("无效的请求行: {}", line)))?;

        let (raw_path, raw_query) = target.split_once('?').unwrap_or((target, ""));
        let mut query = BTreeMap::new();
        for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(decode_component(name)?, decode_component(value)?);
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            path: decode_component(raw_path)?,
            query,
            headers,
            body: Bytes::new(),
        })
    }
}

/// 读取请求时的大小限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_header_bytes: usize,
    /// 需要整体读入内存的消息体上限，上传不受此限制
    pub max_body_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// 只读取请求头，返回请求（消息体为空）与已读入的消息体前缀；
/// 对端未发送任何数据就关闭时返回 None
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_header_bytes: usize,
) -> Result<Option<(Request, BytesMut)>> {
    let mut buf = BytesMut::with_capacity(4096);
    let head = loop {
        if let Some(head) = split_head(&mut buf, max_header_bytes)? {
            break head;
        }
        if reader.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(SyncError::transport("请求头未完整到达连接已关闭"));
        }
    };
    Ok(Some((Request::parse_head(&head)?, buf)))
}

/// 把 Content-Length 声明的消息体整体读入内存
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    request: &mut Request,
    mut buf: BytesMut,
    max_body_bytes: usize,
) -> Result<()> {
    let length = request.headers.content_length()?;
    if length > max_body_bytes {
        return Err(SyncError::protocol(format!(
            "请求体过大: {} 字节 (上限 {})",
            length, max_body_bytes
        )));
    }
    while buf.len() < length {
        buf.reserve((length - buf.len()).min(CHUNK_SIZE));
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(SyncError::transport(format!(
                "请求体不完整: {}/{} 字节",
                buf.len(),
                length
            )));
        }
    }
    buf.truncate(length);
    request.body = buf.freeze();
    Ok(())
}

/// 读取一个完整请求，消息体全部到达后才返回；对端未发送任何数据就关闭时返回 None
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    limits: FrameLimits,
) -> Result<Option<Request>> {
    let Some((mut request, buf)) = read_request_head(reader, limits.max_header_bytes).await? else {
        return Ok(None);
    };
    read_body(reader, &mut request, buf, limits.max_body_bytes).await?;
    Ok(Some(request))
}

/// 消息体流：先吐出已读入的前缀，再逐块读取，读满 length 为止；每次读取受 timeout 约束
pub fn body_stream<'a, R>(
    reader: R,
    prefix: BytesMut,
    length: u64,
    timeout: Duration,
) -> ByteStream<'a>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    struct State<R> {
        reader: R,
        prefix: Option<Bytes>,
        remaining: u64,
        timeout: Duration,
    }

    let mut prefix = prefix.freeze();
    if prefix.len() as u64 > length {
        prefix.truncate(length as usize);
    }
    let state = State {
        remaining: length - prefix.len() as u64,
        prefix: Some(prefix).filter(|p| !p.is_empty()),
        reader,
        timeout,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        if let Some(prefix) = state.prefix.take() {
            return Some((Ok(prefix), state));
        }
        if state.remaining == 0 {
            return None;
        }

        let want = state.remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = BytesMut::with_capacity(want);
        let read = tokio::time::timeout(
            state.timeout,
            (&mut state.reader).take(want as u64).read_buf(&mut buf),
        )
        .await;
        match read {
            Ok(Ok(0)) => {
                let err = io::Error::new(io::ErrorKind::UnexpectedEof, "数据不完整，连接已关闭");
                state.remaining = 0;
                Some((Err(err), state))
            }
            Ok(Ok(n)) => {
                state.remaining -= n as u64;
                Some((Ok(buf.freeze()), state))
            }
            Ok(Err(e)) => {
                state.remaining = 0;
                Some((Err(e), state))
            }
            Err(_) => {
                state.remaining = 0;
                Some((Err(io::Error::new(io::ErrorKind::TimedOut, "读取超时")), state))
            }
        }
    }))
}

/// 标准原因短语
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// 响应
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(header::CONTENT_TYPE, TEXT_PLAIN);
        response.body = Bytes::from(body.into());
        response
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::text(200, body)
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let mut response = Self::new(200);
        response.headers.insert(header::CONTENT_TYPE, APPLICATION_JSON);
        response.body = Bytes::from(serde_json::to_vec(value)?);
        Ok(response)
    }

    pub fn from_error(err: &SyncError) -> Self {
        let (status, reason) = err.status();
        let mut response = Self::text(status, err.to_string());
        response.reason = reason.to_string();
        response
    }

    pub fn with_header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn encode_head(&self, content_length: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        self.headers.write_to(&mut out);
        out.extend_from_slice(format!("Content-Length: {}\r\n", content_length).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_head(self.body.len() as u64);
        out.extend_from_slice(&self.body);
        out
    }

    /// 解析状态行与响应头，消息体为空
    pub fn parse_head(head: &[u8]) -> Result<Self> {
        let (line, headers) = parse_head_lines(head)?;
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(SyncError::protocol(format!("无效的状态行: {}", line)));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| SyncError::protocol(format!("无效的状态码: {}", line)))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        Ok(Self {
            status,
            reason,
            headers,
            body: Bytes::new(),
        })
    }
}

/// 服务器推送给客户端的变化通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyMessage {
    pub path: String,
    #[serde(default, deserialize_with = "wire::index")]
    pub root_index: usize,
    #[serde(default)]
    pub deleted: bool,
}

impl NotifyMessage {
    pub fn changed(key: &FileKey) -> Self {
        Self {
            path: key.path.clone(),
            root_index: key.root_index,
            deleted: false,
        }
    }

    pub fn removed(key: &FileKey) -> Self {
        Self {
            deleted: true,
            ..Self::changed(key)
        }
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(self.root_index, self.path.clone())
    }
}
