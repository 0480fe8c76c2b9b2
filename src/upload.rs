use crate::{
    config::{Clusters, Config, ConfigRouter},
    credential::{Credential, PutPolicy},
    error::{Error, ErrorKind, Result},
    http::{HttpCaller, UreqCaller},
    query::Queryer,
};
use log::info;
use std::{
    fmt::Debug,
    fs::File,
    io::{BufRead, BufReader, Cursor, Read, Seek, SeekFrom},
    path::Path,
    sync::Arc,
    time::Duration,
};

const SMALL_UPLOAD_TRIES: usize = 3;
const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 3600);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// 可随机访问的上传数据源
pub trait UploadSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> UploadSource for T {}

/// 一次上传的目标参数
#[derive(Debug, Clone)]
pub struct UploadTarget<'a> {
    /// 候选上传主机
    pub up_hosts: &'a [String],
    /// 上传凭证
    pub token: &'a str,
    /// 对象键
    pub key: &'a str,
    /// 分片大小，字节
    pub part_size: u64,
    /// 分片并行度，`0` 表示由引擎决定
    pub concurrency: usize,
}

/// 线上传输引擎接口
///
/// 分片上传的线级实现（分片切分、并行度、断点记录）由
/// 外部引擎承担，本库只负责凭证、主机解析与调用编排。
pub trait UploadEngine: Debug + Send + Sync {
    /// 单请求直传不超过分片大小的数据
    fn put(&self, target: &UploadTarget<'_>, data: &mut dyn Read, size: u64) -> Result<()>;

    /// 分片上传可随机访问的数据源，每个分片完成时回调分片号与校验值
    fn upload_parts(
        &self,
        target: &UploadTarget<'_>,
        source: &mut dyn UploadSource,
        size: u64,
        on_part: &mut dyn FnMut(usize, &str),
    ) -> Result<()>;

    /// 流式分片上传不可回退的数据源
    fn stream_upload(
        &self,
        target: &UploadTarget<'_>,
        reader: &mut dyn Read,
        on_part: &mut dyn FnMut(usize, &str),
    ) -> Result<()>;
}

/// 上传器
///
/// 单集群配置直接上传，多集群配置按对象键路由到所属集群。
/// 路由不到的对象键返回 [`ErrorKind::UndefinedConfig`]。
#[derive(Debug, Clone)]
pub struct Uploader {
    clusters: Clusters,
    engine: Arc<dyn UploadEngine>,
    http_caller: Arc<dyn HttpCaller>,
    single: Option<SingleClusterUploader>,
}

impl Uploader {
    /// 根据单集群配置创建上传器
    pub fn new(config: &Config, engine: Arc<dyn UploadEngine>) -> Self {
        let http_caller = Arc::new(UreqCaller::with_timeouts(
            config.dial_timeout(),
            UPLOAD_TIMEOUT,
        ));
        Self::with_clusters(Clusters::Single(config.to_owned()), engine, http_caller)
    }

    /// 根据集群形态与注入的 HTTP 客户端创建上传器
    pub fn with_clusters(
        clusters: Clusters,
        engine: Arc<dyn UploadEngine>,
        http_caller: Arc<dyn HttpCaller>,
    ) -> Self {
        let single = match &clusters {
            Clusters::Single(config) => Some(SingleClusterUploader::new(
                config,
                engine.to_owned(),
                http_caller.to_owned(),
            )),
            Clusters::KeyRouted(_) => None,
        };
        Self {
            clusters,
            engine,
            http_caller,
            single,
        }
    }

    /// 上传内存数据到指定对象
    pub fn upload_data(&self, data: &[u8], key: &str) -> Result<()> {
        self.for_key(key)?.upload_data(data, key)
    }

    /// 从可随机访问的数据源上传指定大小的数据到指定对象
    pub fn upload_data_reader(
        &self,
        reader: impl Read + Seek + Send,
        size: u64,
        key: &str,
    ) -> Result<()> {
        self.for_key(key)?.upload_data_reader(reader, size, key)
    }

    /// 上传本地文件到指定对象
    pub fn upload_file(&self, path: impl AsRef<Path>, key: &str) -> Result<()> {
        self.for_key(key)?.upload_file(path.as_ref(), key)
    }

    /// 读完整个数据流并上传到指定对象
    pub fn upload_reader(&self, reader: impl Read, key: &str) -> Result<()> {
        self.for_key(key)?.upload_reader(reader, key)
    }

    fn for_key(&self, key: &str) -> Result<SingleClusterUploader> {
        if let Some(single) = &self.single {
            return Ok(single.to_owned());
        }
        match &self.clusters {
            Clusters::Single(config) => Ok(SingleClusterUploader::new(
                config,
                self.engine.to_owned(),
                self.http_caller.to_owned(),
            )),
            Clusters::KeyRouted(router) => router
                .for_key(key)
                .map(|config| {
                    SingleClusterUploader::new(
                        &config,
                        self.engine.to_owned(),
                        self.http_caller.to_owned(),
                    )
                })
                .ok_or_else(|| {
                    Error::with_msg(
                        ErrorKind::UndefinedConfig,
                        format!("no config routed for key {}", key),
                    )
                }),
        }
    }
}

#[derive(Debug, Clone)]
struct SingleClusterUploader {
    bucket: String,
    up_hosts: Vec<String>,
    credential: Credential,
    part_size: u64,
    up_concurrency: usize,
    queryer: Option<Queryer>,
    engine: Arc<dyn UploadEngine>,
}

impl SingleClusterUploader {
    fn new(config: &Config, engine: Arc<dyn UploadEngine>, http_caller: Arc<dyn HttpCaller>) -> Self {
        let queryer = if config.uc_hosts.is_empty() {
            None
        } else {
            Some(Queryer::new(config, http_caller))
        };
        Self {
            bucket: config.bucket.to_owned(),
            up_hosts: config.up_hosts.to_owned(),
            credential: Credential::new(config.ak.to_owned(), config.sk.to_owned()),
            part_size: config.part_size_bytes(),
            up_concurrency: config.up_concurrency,
            queryer,
            engine,
        }
    }

    fn make_token(&self, key: &str) -> Result<String> {
        let policy = PutPolicy::new(format!("{}:{}", self.bucket, key), TOKEN_LIFETIME);
        self.credential.upload_token(&policy)
    }

    fn resolve_up_hosts(&self) -> Vec<String> {
        if let Some(queryer) = &self.queryer {
            let fresh = queryer.query_up_hosts(false);
            if !fresh.is_empty() {
                return fresh;
            }
        }
        self.up_hosts.to_owned()
    }

    fn upload_data(&self, data: &[u8], key: &str) -> Result<()> {
        let key = key.strip_prefix('/').unwrap_or(key);
        let token = self.make_token(key)?;
        let up_hosts = self.resolve_up_hosts();
        let target = self.target(&up_hosts, &token, key);
        self.put_with_retries(&target, |engine, target| {
            engine.put(target, &mut Cursor::new(data), data.len() as u64)
        })
    }

    fn upload_data_reader(
        &self,
        mut reader: impl Read + Seek + Send,
        size: u64,
        key: &str,
    ) -> Result<()> {
        let key = key.strip_prefix('/').unwrap_or(key);
        let token = self.make_token(key)?;
        let up_hosts = self.resolve_up_hosts();
        let target = self.target(&up_hosts, &token, key);
        self.put_with_retries(&target, |engine, target| {
            reader.seek(SeekFrom::Start(0))?;
            engine.put(target, &mut reader, size)
        })
    }

    fn upload_file(&self, path: &Path, key: &str) -> Result<()> {
        let key = key.strip_prefix('/').unwrap_or(key);
        let token = self.make_token(key)?;
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let up_hosts = self.resolve_up_hosts();
        let target = self.target(&up_hosts, &token, key);

        if size <= self.part_size {
            return self.put_with_retries(&target, |engine, target| {
                file.seek(SeekFrom::Start(0))?;
                engine.put(target, &mut file, size)
            });
        }

        self.put_with_retries(&target, |engine, target| {
            file.seek(SeekFrom::Start(0))?;
            engine.upload_parts(target, &mut file, size, &mut |part_index, etag| {
                info!("part {} uploaded with etag {}", part_index, etag);
            })
        })
    }

    fn upload_reader(&self, reader: impl Read, key: &str) -> Result<()> {
        let key = key.strip_prefix('/').unwrap_or(key);
        let token = self.make_token(key)?;
        let up_hosts = self.resolve_up_hosts();
        let target = self.target(&up_hosts, &token, key);

        let mut buf_reader = BufReader::new(reader);
        let mut first_part = Vec::new();
        (&mut buf_reader)
            .take(self.part_size)
            .read_to_end(&mut first_part)
            .map_err(|err| Error::new(ErrorKind::LocalIo, err))?;

        let small_upload = if (first_part.len() as u64) < self.part_size {
            true
        } else {
            // 读满一个分片后探一个字节，确认数据流是否就此结束
            buf_reader
                .fill_buf()
                .map_err(|err| Error::new(ErrorKind::LocalIo, err))?
                .is_empty()
        };

        if small_upload {
            return self.put_with_retries(&target, |engine, target| {
                engine.put(
                    target,
                    &mut Cursor::new(&first_part),
                    first_part.len() as u64,
                )
            });
        }

        let mut chained = Cursor::new(first_part.as_slice()).chain(buf_reader);
        self.engine
            .stream_upload(&target, &mut chained, &mut |part_index, etag| {
                info!("part {} uploaded with etag {}", part_index, etag);
            })
    }

    fn target<'a>(&self, up_hosts: &'a [String], token: &'a str, key: &'a str) -> UploadTarget<'a> {
        UploadTarget {
            up_hosts,
            token,
            key,
            part_size: self.part_size,
            concurrency: self.up_concurrency,
        }
    }

    fn put_with_retries(
        &self,
        target: &UploadTarget<'_>,
        mut attempt: impl FnMut(&dyn UploadEngine, &UploadTarget<'_>) -> Result<()>,
    ) -> Result<()> {
        let mut result = Ok(());
        for i in 0..SMALL_UPLOAD_TRIES {
            match attempt(self.engine.as_ref(), target) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    info!("upload try {} for {} failed: {}", i, target.key, err);
                    result = Err(err);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Mutex,
    };

    #[derive(Debug)]
    enum EngineCall {
        Put { key: String, size: u64, data: Vec<u8> },
        UploadParts { key: String, size: u64, part_size: u64 },
        StreamUpload { key: String, data_len: usize },
    }

    #[derive(Debug)]
    struct MockEngine {
        calls: Mutex<Vec<EngineCall>>,
        fail_first: AtomicUsize,
    }

    impl MockEngine {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }

        fn should_fail(&self) -> bool {
            loop {
                let left = self.fail_first.load(Relaxed);
                if left == 0 {
                    return false;
                }
                if self
                    .fail_first
                    .compare_exchange(left, left - 1, Relaxed, Relaxed)
                    .is_ok()
                {
                    return true;
                }
            }
        }

        fn transient(&self) -> Error {
            Error::with_msg(ErrorKind::Transport, "simulated upload failure")
        }
    }

    impl UploadEngine for MockEngine {
        fn put(&self, target: &UploadTarget<'_>, data: &mut dyn Read, size: u64) -> Result<()> {
            let mut buf = Vec::new();
            data.read_to_end(&mut buf)
                .map_err(|err| Error::new(ErrorKind::LocalIo, err))?;
            self.calls.lock().unwrap().push(EngineCall::Put {
                key: target.key.to_owned(),
                size,
                data: buf,
            });
            if self.should_fail() {
                return Err(self.transient());
            }
            Ok(())
        }

        fn upload_parts(
            &self,
            target: &UploadTarget<'_>,
            _source: &mut dyn UploadSource,
            size: u64,
            on_part: &mut dyn FnMut(usize, &str),
        ) -> Result<()> {
            self.calls.lock().unwrap().push(EngineCall::UploadParts {
                key: target.key.to_owned(),
                size,
                part_size: target.part_size,
            });
            if self.should_fail() {
                return Err(self.transient());
            }
            on_part(1, "fake-etag");
            Ok(())
        }

        fn stream_upload(
            &self,
            target: &UploadTarget<'_>,
            reader: &mut dyn Read,
            _on_part: &mut dyn FnMut(usize, &str),
        ) -> Result<()> {
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .map_err(|err| Error::new(ErrorKind::LocalIo, err))?;
            self.calls.lock().unwrap().push(EngineCall::StreamUpload {
                key: target.key.to_owned(),
                data_len: buf.len(),
            });
            if self.should_fail() {
                return Err(self.transient());
            }
            Ok(())
        }
    }

    fn uploader(engine: Arc<MockEngine>) -> Uploader {
        let mut config = Config::new("test-ak", "test-sk", "test-bucket");
        config.up_hosts = vec!["http://up-1.example.com".to_owned()];
        Uploader::new(&config, engine)
    }

    #[test]
    fn test_upload_data_strips_leading_slash() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        uploader(engine.to_owned()).upload_data(b"payload", "/a/b")?;
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            EngineCall::Put { key, size, data } => {
                assert_eq!(key, "a/b");
                assert_eq!(*size, 7);
                assert_eq!(data, b"payload");
            }
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_small_upload_retries_three_times() {
        let engine = MockEngine::failing(3);
        let err = uploader(engine.to_owned())
            .upload_data(b"payload", "key")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(engine.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_small_upload_recovers_after_failure() -> anyhow::Result<()> {
        let engine = MockEngine::failing(1);
        uploader(engine.to_owned()).upload_data(b"payload", "key")?;
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        // 重试重新读取数据源
        match &calls[1] {
            EngineCall::Put { data, .. } => assert_eq!(data, b"payload"),
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_large_file_goes_through_parts_engine() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("large.bin");
        let payload = vec![7u8; 5 * 1024 * 1024];
        std::fs::write(&path, &payload)?;

        let engine = MockEngine::new();
        uploader(engine.to_owned()).upload_file(&path, "large")?;
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            EngineCall::UploadParts { key, size, part_size } => {
                assert_eq!(key, "large");
                assert_eq!(*size, payload.len() as u64);
                assert_eq!(*part_size, 4 * 1024 * 1024);
            }
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_small_file_uses_single_put() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("small.bin");
        std::fs::write(&path, b"tiny")?;

        let engine = MockEngine::new();
        uploader(engine.to_owned()).upload_file(&path, "small")?;
        let calls = engine.calls.lock().unwrap();
        match &calls[0] {
            EngineCall::Put { size, .. } => assert_eq!(*size, 4),
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_short_stream_uses_single_put() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        uploader(engine.to_owned()).upload_reader(Cursor::new(b"short stream".to_vec()), "key")?;
        let calls = engine.calls.lock().unwrap();
        match &calls[0] {
            EngineCall::Put { data, .. } => assert_eq!(data, b"short stream"),
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_long_stream_uses_stream_upload_with_buffered_prefix() -> anyhow::Result<()> {
        let payload = vec![3u8; 4 * 1024 * 1024 + 123];
        let engine = MockEngine::new();
        uploader(engine.to_owned()).upload_reader(Cursor::new(payload.to_owned()), "key")?;
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            EngineCall::StreamUpload { key, data_len } => {
                assert_eq!(key, "key");
                assert_eq!(*data_len, payload.len());
            }
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_exact_part_size_stream_is_small_upload() -> anyhow::Result<()> {
        let payload = vec![1u8; 4 * 1024 * 1024];
        let engine = MockEngine::new();
        uploader(engine.to_owned()).upload_reader(Cursor::new(payload.to_owned()), "key")?;
        let calls = engine.calls.lock().unwrap();
        match &calls[0] {
            EngineCall::Put { size, .. } => assert_eq!(*size, payload.len() as u64),
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_upload_data_reader_rewinds_between_retries() -> anyhow::Result<()> {
        let engine = MockEngine::failing(1);
        uploader(engine.to_owned()).upload_data_reader(
            Cursor::new(b"rewound".to_vec()),
            7,
            "key",
        )?;
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        match &calls[1] {
            EngineCall::Put { data, .. } => assert_eq!(data, b"rewound"),
            other => panic!("unexpected call {:?}", other),
        }
        Ok(())
    }

    #[derive(Debug)]
    struct TableRouter {
        config: Config,
    }

    impl ConfigRouter for TableRouter {
        fn for_key(&self, key: &str) -> Option<Config> {
            key.starts_with("cluster-a/").then(|| self.config.to_owned())
        }
    }

    #[test]
    fn test_key_routed_clusters() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        let mut config = Config::new("test-ak", "test-sk", "cluster-a-bucket");
        config.up_hosts = vec!["http://up-a.example.com".to_owned()];
        let uploader = Uploader::with_clusters(
            Clusters::KeyRouted(Arc::new(TableRouter { config })),
            engine.to_owned(),
            Arc::new(UreqCaller::default()),
        );

        uploader.upload_data(b"data", "cluster-a/key")?;
        assert_eq!(engine.calls.lock().unwrap().len(), 1);

        let err = uploader.upload_data(b"data", "cluster-b/key").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UndefinedConfig);
        Ok(())
    }
}
