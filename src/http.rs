use crate::error::{Error, ErrorKind, Result};
use http::{
    header::{HeaderMap, HeaderName, HeaderValue, IntoHeaderName},
    Method, StatusCode,
};
use std::{
    fmt::{self, Debug},
    io::{Read, Result as IoResult},
    time::Duration,
};
use ureq::{Agent, AgentBuilder, Error as UreqError, Response as UreqResponse};

/// HTTP 请求
///
/// 只描述本库需要的最小请求形态：方法、完整 URL、请求头、
/// 内存请求体与可选的单请求超时。
#[must_use]
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Vec<u8>,
    timeout: Option<Duration>,
}

impl Request {
    /// 创建 GET 请求
    #[inline]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// 创建 POST 请求
    #[inline]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// 创建指定方法的请求
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Default::default(),
            body: Default::default(),
            timeout: None,
        }
    }

    /// 设置请求头
    #[inline]
    pub fn header(mut self, name: impl IntoHeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// 设置请求体
    #[inline]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// 设置单请求超时，覆盖客户端级别的超时
    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 获取请求方法
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// 获取请求 URL
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// 获取请求头
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// 获取请求体
    #[inline]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }
}

/// HTTP 响应体，一个阻塞的字节流
#[must_use]
pub struct ResponseBody(Box<dyn Read + Send>);

impl ResponseBody {
    /// 从阻塞字节流创建响应体
    #[inline]
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self(Box::new(reader))
    }

    /// 从内存字节创建响应体
    #[inline]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Box::new(std::io::Cursor::new(bytes)))
    }
}

impl Read for ResponseBody {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.0.read(buf)
    }
}

impl Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResponseBody").finish()
    }
}

/// HTTP 响应
#[must_use]
#[derive(Debug)]
pub struct Response {
    status_code: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    /// 创建响应
    #[inline]
    pub fn new(status_code: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status_code,
            headers,
            body,
        }
    }

    /// 获取响应状态码
    #[inline]
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    /// 获取指定响应头
    #[inline]
    pub fn header(&self, name: HeaderName) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// 提取响应体
    #[inline]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// 读取完整响应体
    ///
    /// 读取过程中的错误属于传输层错误。
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut body = self.body;
        body.read_to_end(&mut buf)
            .map_err(|err| Error::new(ErrorKind::Transport, err))?;
        Ok(buf)
    }
}

/// HTTP 客户端接口
///
/// 每个组件都持有自己的客户端实例，测试中可以注入桩实现。
/// 任何 HTTP 状态码都作为正常响应返回，由调用方分类；
/// 只有传输层失败才返回错误。
pub trait HttpCaller: Debug + Send + Sync {
    /// 阻塞发出请求
    fn call(&self, request: Request) -> Result<Response>;
}

/// 基于 Ureq 的默认 HTTP 客户端
#[derive(Debug, Clone)]
pub struct UreqCaller {
    agent: Agent,
}

impl UreqCaller {
    /// 从现成的 Ureq Agent 创建客户端
    #[inline]
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }

    /// 按连接超时与总超时创建客户端
    pub fn with_timeouts(connect_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            agent: AgentBuilder::new()
                .timeout_connect(connect_timeout)
                .timeout(total_timeout)
                .build(),
        }
    }
}

impl Default for UreqCaller {
    #[inline]
    fn default() -> Self {
        Self {
            agent: ureq::agent(),
        }
    }
}

impl HttpCaller for UreqCaller {
    fn call(&self, request: Request) -> Result<Response> {
        let mut ureq_request = self.agent.request(request.method().as_str(), request.url());
        for (name, value) in request.headers() {
            let value = value.to_str().map_err(|err| {
                Error::new(ErrorKind::LocalIo, format!("invalid header value: {}", err))
            })?;
            ureq_request = ureq_request.set(name.as_str(), value);
        }
        if let Some(timeout) = request.timeout {
            ureq_request = ureq_request.timeout(timeout);
        }
        let result = if request.body_bytes().is_empty() {
            ureq_request.call()
        } else {
            ureq_request.send_bytes(request.body_bytes())
        };
        match result {
            Ok(response) => make_response(response),
            Err(UreqError::Status(_, response)) => make_response(response),
            Err(UreqError::Transport(transport)) => {
                Err(Error::new(ErrorKind::Transport, transport))
            }
        }
    }
}

fn make_response(response: UreqResponse) -> Result<Response> {
    let status_code = StatusCode::from_u16(response.status())
        .map_err(|err| Error::new(ErrorKind::Transport, err))?;
    let mut headers = HeaderMap::new();
    for name in response.headers_names() {
        if let Some(value) = response.header(&name) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }
    Ok(Response::new(
        status_code,
        headers,
        ResponseBody::from_reader(response.into_reader()),
    ))
}
