use crate::{
    config::Config,
    credential::Credential,
    dot::{DotType, Dotter},
    error::{Error, ErrorKind, Result},
    host_selector::{HostSelector, DEFAULT_UPDATE_INTERVAL},
    http::{HttpCaller, Request, Response, ResponseBody, UreqCaller},
    query::Queryer,
    retry::{try_hosts, TryError},
};
use http::{
    header::{HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    StatusCode,
};
use log::{debug, info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::{
    fs::{File, OpenOptions},
    io::{copy, Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Seek, SeekFrom},
    path::Path,
    sync::Arc,
    time::Duration,
};

/// 单次下载请求的 API 名
pub const API_IO_GET_FILE: &str = "io_getfile";
/// 下载到文件操作的 API 名
pub const API_DOWNLOAD_FILE: &str = "download_file";
/// 下载为字节流操作的 API 名
pub const API_DOWNLOAD_READER: &str = "download_reader";
/// 下载到内存操作的 API 名
pub const API_DOWNLOAD_BYTES: &str = "download_bytes";
/// 范围下载操作的 API 名
pub const API_DOWNLOAD_RANGE_BYTES: &str = "download_range_bytes";

const DEFAULT_DOWNLOAD_TRIES: usize = 5;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// 对象键的转义字符集，未保留字符之外全部转义
const KEY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// 下载器
///
/// 下载整个对象、字节范围或可恢复的字节流。所有操作自动在
/// IO 主机池上重试，并向打点器上报结果。
#[derive(Debug, Clone)]
pub struct Downloader {
    bucket: String,
    credential: Credential,
    io_selector: HostSelector,
    dotter: Dotter,
    tries: usize,
    http_caller: Arc<dyn HttpCaller>,
}

impl Downloader {
    /// 根据配置创建下载器
    pub fn new(config: &Config) -> Self {
        Self::with_http_caller(
            config,
            Arc::new(UreqCaller::with_timeouts(
                config.dial_timeout(),
                DOWNLOAD_TIMEOUT,
            )),
        )
    }

    /// 根据配置与注入的 HTTP 客户端创建下载器
    pub fn with_http_caller(config: &Config, http_caller: Arc<dyn HttpCaller>) -> Self {
        let dotter = Dotter::new(config, http_caller.to_owned()).unwrap_or_else(|err| {
            warn!("dotter is disabled: {}", err);
            Dotter::disabled()
        });
        let queryer = if config.uc_hosts.is_empty() {
            None
        } else {
            Some(Queryer::new(config, http_caller.to_owned()))
        };
        let io_selector = {
            let mut builder = HostSelector::builder(config.io_hosts.to_owned())
                .punish_duration(config.punish_duration())
                .update_interval(DEFAULT_UPDATE_INTERVAL);
            if let Some(queryer) = queryer {
                builder = builder.update_func(move || queryer.query_io_hosts(false));
            }
            builder.build()
        };
        let tries = if config.retry == 0 {
            DEFAULT_DOWNLOAD_TRIES
        } else {
            config.retry
        };
        Self {
            bucket: config.bucket.to_owned(),
            credential: Credential::new(config.ak.to_owned(), config.sk.to_owned()),
            io_selector,
            dotter,
            tries,
            http_caller,
        }
    }

    /// 下载对象到本地文件
    ///
    /// 本地文件已存在时从其末尾断点续传，服务端返回 416 表示
    /// 本地内容已完整，直接返回句柄。成功后句柄游标回到开头。
    pub fn download_file(&self, key: &str, path: impl AsRef<Path>) -> Result<File> {
        self.with_dot(API_DOWNLOAD_FILE, || {
            try_hosts(&self.io_selector, &self.dotter, API_IO_GET_FILE, self.tries, |host| {
                // 本地文件错误不反映主机健康状况
                self.download_file_inner(host, key, path.as_ref())
                    .map_err(|err| {
                        if err.kind() == ErrorKind::LocalIo {
                            TryError::skip(err)
                        } else {
                            err.into()
                        }
                    })
            })
        })
    }

    /// 下载对象为可恢复的字节流
    ///
    /// 返回的读取器记录累计偏移，传输中断时自动带
    /// `Range` 重连继续读。
    pub fn download_reader(&self, key: &str) -> Result<ObjectReader> {
        self.with_dot(API_DOWNLOAD_READER, || {
            try_hosts(&self.io_selector, &self.dotter, API_IO_GET_FILE, self.tries, |host| {
                let mut reader = ObjectReader {
                    url: self.object_url(host, key),
                    http_caller: self.http_caller.to_owned(),
                    dotter: self.dotter.to_owned(),
                    tries: self.tries,
                    response: None,
                    offset: 0,
                    closed: false,
                };
                reader.connect()?;
                Ok(reader)
            })
        })
    }

    /// 下载整个对象到内存
    pub fn download_bytes(&self, key: &str) -> Result<Vec<u8>> {
        self.with_dot(API_DOWNLOAD_BYTES, || {
            try_hosts(&self.io_selector, &self.dotter, API_IO_GET_FILE, self.tries, |host| {
                self.download_bytes_inner(host, key).map_err(Into::into)
            })
        })
    }

    /// 下载对象的指定字节范围，返回对象总长度与数据
    ///
    /// `offset` 为 `-1` 时表示下载末尾 `size` 个字节。
    /// 要求服务端返回 206 与合法的 `Content-Range`。
    pub fn download_range_bytes(&self, key: &str, offset: i64, size: u64) -> Result<(u64, Vec<u8>)> {
        self.with_dot(API_DOWNLOAD_RANGE_BYTES, || {
            try_hosts(&self.io_selector, &self.dotter, API_IO_GET_FILE, self.tries, |host| {
                self.download_range_bytes_inner(host, key, offset, size)
                    .map_err(Into::into)
            })
        })
    }

    fn with_dot<T>(&self, api_name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = f();
        self.dotter.dot(DotType::Sdk, api_name, result.is_ok());
        result
    }

    fn object_url(&self, host: &str, key: &str) -> String {
        let key = key.strip_prefix('/').unwrap_or(key);
        format!(
            "{}/getfile/{}/{}/{}",
            host,
            self.credential.access_key(),
            self.bucket,
            utf8_percent_encode(key, KEY_ESCAPE)
        )
    }

    fn download_file_inner(&self, host: &str, key: &str, path: &Path) -> Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let resume_from = file.seek(SeekFrom::End(0))?;

        debug!("download file with remote key {}", key);
        let mut request = Request::get(self.object_url(host, key))
            .header(ACCEPT_ENCODING, HeaderValue::from_static(""));
        if resume_from != 0 {
            let range = format!("bytes={}-", resume_from);
            info!("continue download {} with range {}", key, range);
            request = request.header(RANGE, header_value(&range));
        }

        let response = self.http_caller.call(request)?;
        let status = response.status_code();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(file);
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::from_status(status));
        }
        let content_length = header_u64(&response, CONTENT_LENGTH);
        let mut body = response.into_body();
        let copied =
            copy(&mut body, &mut file).map_err(|err| Error::new(ErrorKind::Transport, err))?;
        if let Some(content_length) = content_length {
            if content_length != copied {
                warn!(
                    "download {} content length {} does not match actual {}",
                    key, content_length, copied
                );
            }
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    fn download_bytes_inner(&self, host: &str, key: &str) -> Result<Vec<u8>> {
        let response = self.http_caller.call(Request::get(self.object_url(host, key)))?;
        if response.status_code() != StatusCode::OK {
            return Err(Error::from_status(response.status_code()));
        }
        response.into_bytes()
    }

    fn download_range_bytes_inner(
        &self,
        host: &str,
        key: &str,
        offset: i64,
        size: u64,
    ) -> Result<(u64, Vec<u8>)> {
        let request = Request::get(self.object_url(host, key))
            .header(RANGE, header_value(&generate_range(offset, size)));
        let response = self.http_caller.call(request)?;
        if response.status_code() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::from_status(response.status_code()));
        }
        let total_length = response
            .header(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .map(total_length_of)
            .transpose()?
            .ok_or_else(|| Error::with_msg(ErrorKind::RangeProtocol, "no content range"))?;
        let body = response.into_bytes()?;
        Ok((total_length, body))
    }
}

fn generate_range(offset: i64, size: u64) -> String {
    if offset == -1 {
        format!("bytes=-{}", size)
    } else {
        format!("bytes={}-{}", offset, offset + size as i64)
    }
}

fn total_length_of(content_range: &str) -> Result<u64> {
    let mut parts = content_range.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(total), None) => total
            .trim()
            .parse()
            .map_err(|err| Error::new(ErrorKind::RangeProtocol, err)),
        _ => Err(Error::with_msg(
            ErrorKind::RangeProtocol,
            format!("wrong content range {}", content_range),
        )),
    }
}

fn header_u64(response: &Response, name: http::header::HeaderName) -> Option<u64> {
    response
        .header(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap()
}

/// 对象内容的可恢复读取器
///
/// 懒惰地保持一条到固定下载地址的连接，读取中断时从
/// 累计偏移处重新发起带 `Range` 的请求，单次 `read` 最多重连
/// 尝试预算次。EOF 与 416 都表示内容读完。
#[must_use]
#[derive(Debug)]
pub struct ObjectReader {
    url: String,
    http_caller: Arc<dyn HttpCaller>,
    dotter: Dotter,
    tries: usize,
    response: Option<ResponseBody>,
    offset: u64,
    closed: bool,
}

impl ObjectReader {
    /// 已经交付给调用方的字节数
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn connect(&mut self) -> Result<()> {
        let mut request = Request::get(self.url.to_owned())
            .header(ACCEPT_ENCODING, HeaderValue::from_static(""));
        if self.offset != 0 {
            let range = format!("bytes={}-", self.offset);
            info!("continue download {} from offset {}", self.url, self.offset);
            request = request.header(RANGE, header_value(&range));
        }
        match self.http_caller.call(request) {
            Err(err) => {
                self.dotter.dot(DotType::Http, API_IO_GET_FILE, false);
                Err(err)
            }
            Ok(response) => {
                let status = response.status_code();
                if status == StatusCode::RANGE_NOT_SATISFIABLE {
                    self.dotter.dot(DotType::Http, API_IO_GET_FILE, true);
                    self.closed = true;
                    Ok(())
                } else if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
                    self.dotter.dot(DotType::Http, API_IO_GET_FILE, false);
                    Err(Error::from_status(status))
                } else {
                    self.dotter.dot(DotType::Http, API_IO_GET_FILE, true);
                    self.response = Some(response.into_body());
                    Ok(())
                }
            }
        }
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if self.closed {
            return Ok(0);
        }
        let mut last_err = None;
        for _ in 0..self.tries.max(1) {
            if self.response.is_none() {
                self.connect().map_err(IoError::from)?;
                if self.closed {
                    return Ok(0);
                }
            }
            let body = match self.response.as_mut() {
                Some(body) => body,
                None => return Ok(0),
            };
            match body.read(buf) {
                Ok(0) => {
                    self.response = None;
                    self.closed = true;
                    return Ok(0);
                }
                Ok(have_read) => {
                    self.offset += have_read as u64;
                    return Ok(have_read);
                }
                Err(err) => {
                    warn!(
                        "download read interrupted at offset {}: {}",
                        self.offset, err
                    );
                    self.response = None;
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| IoError::new(IoErrorKind::Other, "download retries exhausted")))
    }
}
