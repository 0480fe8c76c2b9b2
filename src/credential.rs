use crate::error::{Error, ErrorKind, Result};
use hmac::{Hmac, Mac, NewMac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// 认证信息
///
/// AccessKey 与 SecretKey 的只读配对。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    access_key: String,
    secret_key: String,
}

impl Credential {
    /// 创建认证信息
    #[inline]
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// 获取 AccessKey
    #[inline]
    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// 获取 SecretKey
    #[inline]
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// 对数据签名
    pub fn sign(&self, data: &[u8]) -> String {
        self.access_key.to_owned() + ":" + &base64ed_hmac_digest(&self.secret_key, data)
    }

    /// 对数据签名，并同时携带原数据
    pub fn sign_with_data(&self, data: &[u8]) -> String {
        let encoded_data = base64::encode_config(data, base64::URL_SAFE);
        self.sign(encoded_data.as_bytes()) + ":" + &encoded_data
    }

    /// 对 HTTP 请求按 V1 算法签名，返回 Authorization 的值
    ///
    /// 仅当请求体为表单时参与签名。
    pub fn authorization_v1_for_request(
        &self,
        url: &Url,
        content_type: &str,
        body: &[u8],
    ) -> String {
        let mut data_to_sign = Vec::with_capacity(1024);
        data_to_sign.extend_from_slice(url.path().as_bytes());
        if let Some(query) = url.query() {
            if !query.is_empty() {
                data_to_sign.extend_from_slice(b"?");
                data_to_sign.extend_from_slice(query.as_bytes());
            }
        }
        data_to_sign.extend_from_slice(b"\n");
        if !content_type.is_empty() && !body.is_empty() && will_push_body_v1(content_type) {
            data_to_sign.extend_from_slice(body);
        }
        "QBox ".to_owned() + &self.sign(&data_to_sign)
    }

    /// 按上传策略生成上传凭证
    ///
    /// 凭证可直接用于 `Authorization: UpToken <token>`。
    pub fn upload_token(&self, policy: &PutPolicy) -> Result<String> {
        let policy_json = serde_json::to_vec(policy)
            .map_err(|err| Error::new(ErrorKind::LocalIo, err))?;
        Ok(self.sign_with_data(&policy_json))
    }
}

/// 上传策略
///
/// 只携带本库需要的两个字段：授权范围与过期时间。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutPolicy {
    /// 授权范围，`<bucket>` 或 `<bucket>:<key>`
    pub scope: String,
    /// 过期时间，Unix 时间戳（秒）
    pub deadline: u64,
}

impl PutPolicy {
    /// 创建从现在起指定有效期的上传策略
    pub fn new(scope: impl Into<String>, lifetime: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default();
        Self {
            scope: scope.into(),
            deadline: now + lifetime.as_secs(),
        }
    }
}

fn base64ed_hmac_digest(secret_key: &str, data: &[u8]) -> String {
    let mut hmac = Hmac::<Sha1>::new_from_slice(secret_key.as_bytes())
        .expect("HMAC accepts keys of any size");
    hmac.update(data);
    base64::encode_config(hmac.finalize().into_bytes(), base64::URL_SAFE)
}

const FORM_MIME: &str = "application/x-www-form-urlencoded";

#[inline]
fn will_push_body_v1(content_type: &str) -> bool {
    content_type == FORM_MIME
}
