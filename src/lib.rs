#![deny(
    absolute_paths_not_starting_with_crate,
    anonymous_parameters,
    explicit_outlives_requirements,
    keyword_idents,
    macro_use_extern_crate,
    meta_variable_misuse,
    non_ascii_idents,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_extern_crates,
    unused_import_braces,
    unused_lifetimes
)]

//! # kodo-operation
//!
//! Kodo 风格对象存储服务的客户端核心。
//!
//! 面向一个命名的存储空间提供对象操作：下载（完整对象、字节范围、
//! 可恢复字节流）、上传（内存数据、文件、数据流）、元信息变更
//! （重命名、移动、复制、删除）、批量元信息查询与前缀列举。
//!
//! 每类服务有多台等价主机，可达性事先未知，核心机制围绕这一点展开：
//!
//! - [`HostSelector`]：主机间轮转负载，失败的主机进入惩罚窗口，
//!   窗口过后自动恢复，主机集合可由发现服务定期刷新；
//! - [`Queryer`]：向 UC 服务查询各类主机的当前列表，带有效期缓存；
//! - [`Dotter`]：按 API 记录调用成败，缓冲在多进程共享的磁盘文件里，
//!   文件锁保证同一时刻只有一个上报在进行，对调用方即发即忘；
//! - [`Downloader`] / [`Uploader`] / [`Lister`]：对象操作门面，
//!   自动重试并向打点器上报。
//!
//! 凭证签名由 [`Credential`] 提供，分片上传的线级传输由外部引擎
//! （[`UploadEngine`]）承担，RS / RSF 的单次操作通过
//! [`BucketApiClient`] 抽象，默认实现为 [`KodoBucketClient`]。
//!
//! ### 代码示例
//!
//! ```no_run
//! use kodo_operation::{Config, Downloader};
//!
//! # fn example() -> kodo_operation::Result<()> {
//! let mut config = Config::new("ak", "sk", "bucket");
//! config.io_hosts = vec!["http://io-1.example.com".to_owned()];
//! let downloader = Downloader::new(&config);
//! let data = downloader.download_bytes("dir/object.bin")?;
//! # let _ = data;
//! # Ok(())
//! # }
//! ```

mod config;
mod credential;
mod dot;
mod download;
mod error;
mod host_selector;
mod http;
mod list;
mod pool;
mod query;
mod retry;
mod spawn;
mod upload;

pub use config::{Clusters, Config, ConfigRouter};
pub use credential::{Credential, PutPolicy};
pub use dot::{DotType, Dotter, API_MONITOR_V1_STAT};
pub use download::{
    Downloader, ObjectReader, API_DOWNLOAD_BYTES, API_DOWNLOAD_FILE, API_DOWNLOAD_RANGE_BYTES,
    API_DOWNLOAD_READER, API_IO_GET_FILE,
};
pub use error::{Error, ErrorKind, Result};
pub use host_selector::{HostSelector, HostSelectorBuilder};
pub use http::{HttpCaller, Request, Response, ResponseBody, UreqCaller};
pub use list::{
    BatchStatResult, BucketApiClient, FileStat, KodoBucketClient, ListPage, Lister, StatData,
};
pub use query::Queryer;
pub use upload::{UploadEngine, UploadSource, UploadTarget, Uploader};
