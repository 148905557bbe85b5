// 持久化层：主存储、二级索引与串行写入服务
pub mod index;
pub mod service;
pub mod store;

pub use index::{key_of_by_name, KeyFn, LogIndex};
pub use service::{LogService, WriterReport};
pub use store::{LogStore, ScanIter};
